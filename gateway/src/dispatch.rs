//! Hands a parsed batch to the event publisher.
//!
//! Every canonical event is published exactly once, messages first and then
//! status updates, each group in payload order. A failed or timed-out
//! publish is logged and counted; the rest of the batch still goes out.

use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::channel::Channel;
use crate::process::ParsedBatch;
use crate::queue::EventPublisher;

/// Outcome of publishing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub published: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.published + self.failed
    }

    /// Events were attempted and none reached the bus.
    pub fn all_failed(&self) -> bool {
        self.attempted() > 0 && self.published == 0
    }
}

pub async fn publish_batch(
    publisher: &dyn EventPublisher,
    channel: &Channel,
    batch: &ParsedBatch,
    deadline: Instant,
) -> DispatchReport {
    let mut report = DispatchReport::default();

    for message in &batch.messages {
        let outcome = timeout_at(deadline, publisher.publish_inbound(message)).await;
        record(&mut report, channel, &message.external_id, "inbound", outcome);
    }

    for update in &batch.statuses {
        let outcome = timeout_at(deadline, publisher.publish_status_update(update)).await;
        record(&mut report, channel, &update.external_id, "status", outcome);
    }

    info!(
        channel_id = %channel.id,
        channel_type = %channel.channel_type,
        published = report.published,
        failed = report.failed,
        item_failures = batch.failures.len(),
        "webhook_batch_dispatched"
    );
    report
}

fn record(
    report: &mut DispatchReport,
    channel: &Channel,
    external_id: &str,
    kind: &'static str,
    outcome: Result<anyhow::Result<()>, tokio::time::error::Elapsed>,
) {
    match outcome {
        Ok(Ok(())) => report.published += 1,
        Ok(Err(e)) => {
            report.failed += 1;
            warn!(
                channel_id = %channel.id,
                external_id = %external_id,
                kind,
                error = %e,
                "event_publish_failed"
            );
        }
        Err(_) => {
            report.failed += 1;
            warn!(
                channel_id = %channel.id,
                external_id = %external_id,
                kind,
                "event_publish_timed_out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::channel::ChannelType;
    use crate::process::test_support::{channel, parse};
    use crate::queue::{InboundMessage, StatusUpdate};

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<String>>,
        fail_ids: Vec<String>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish_inbound(&self, message: &InboundMessage) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_ids.contains(&message.external_id) {
                bail!("broker rejected {}", message.external_id);
            }
            self.published.lock().unwrap().push(message.external_id.clone());
            Ok(())
        }

        async fn publish_status_update(&self, update: &StatusUpdate) -> anyhow::Result<()> {
            if self.fail_ids.contains(&update.external_id) {
                bail!("broker rejected {}", update.external_id);
            }
            self.published.lock().unwrap().push(format!("status:{}", update.external_id));
            Ok(())
        }
    }

    fn whatsapp_batch() -> ParsedBatch {
        let body = json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "WABA", "changes": [{"field": "messages", "value": {
                "messaging_product": "whatsapp",
                "metadata": {"display_phone_number": "1555", "phone_number_id": "PN"},
                "messages": [
                    {"id": "w1", "from": "1", "timestamp": "1700000000", "type": "text", "text": {"body": "a"}},
                    {"id": "w2", "from": "1", "timestamp": "1700000001", "type": "text", "text": {"body": "b"}},
                    {"id": 12, "from": ["bad"], "type": 7},
                    {"id": "w3", "from": "1", "timestamp": "1700000002", "type": "text", "text": {"body": "c"}}
                ],
                "statuses": [{"id": "out-1", "status": "read", "timestamp": "1700000003", "recipient_id": "1"}]
            }}]}]
        });
        parse(&channel(ChannelType::WhatsappOfficial), body.to_string().as_bytes()).unwrap()
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_valid_items_published_in_order_despite_malformed_sibling() {
        let batch = whatsapp_batch();
        assert_eq!(batch.failures.len(), 1);

        let publisher = RecordingPublisher::default();
        let target = channel(ChannelType::WhatsappOfficial);
        let report = publish_batch(&publisher, &target, &batch, deadline()).await;

        assert_eq!(report, DispatchReport { published: 4, failed: 0 });
        assert_eq!(
            *publisher.published.lock().unwrap(),
            vec!["w1", "w2", "w3", "status:out-1"]
        );
    }

    #[tokio::test]
    async fn test_one_failed_publish_does_not_stop_the_rest() {
        let batch = whatsapp_batch();
        let publisher = RecordingPublisher {
            fail_ids: vec!["w2".to_string()],
            ..Default::default()
        };
        let target = channel(ChannelType::WhatsappOfficial);
        let report = publish_batch(&publisher, &target, &batch, deadline()).await;

        assert_eq!(report, DispatchReport { published: 3, failed: 1 });
        assert!(!report.all_failed());
    }

    #[tokio::test]
    async fn test_all_failed() {
        let batch = whatsapp_batch();
        let publisher = RecordingPublisher {
            fail_ids: vec!["w1".into(), "w2".into(), "w3".into(), "out-1".into()],
            ..Default::default()
        };
        let target = channel(ChannelType::WhatsappOfficial);
        let report = publish_batch(&publisher, &target, &batch, deadline()).await;

        assert!(report.all_failed());
        assert!(!DispatchReport::default().all_failed());
    }

    #[tokio::test]
    async fn test_deadline_counts_as_failure() {
        let batch = whatsapp_batch();
        let publisher = RecordingPublisher {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let target = channel(ChannelType::WhatsappOfficial);
        let started = std::time::Instant::now();
        let report = publish_batch(
            &publisher,
            &target,
            &batch,
            Instant::now() + Duration::from_millis(50),
        )
        .await;

        assert_eq!(report.failed, 3);
        assert_eq!(report.published, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
