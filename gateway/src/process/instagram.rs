//! Instagram Messaging webhook parser.
//!
//! Instagram reuses the Messenger event format. Business accounts linked
//! through a Facebook page may deliver with `object: "page"`.

use super::envelope::Family;
use super::messenger::{self, Platform};
use super::{ParseContext, ParsedBatch, Parser};
use crate::error::GatewayError;

pub struct InstagramParser;

const PLATFORM: Platform = Platform {
    family: Family::Instagram,
    objects: &["instagram", "page"],
    read_changes: true,
};

impl Parser for InstagramParser {
    fn parse(&self, ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
        messenger::parse(&PLATFORM, ctx, body)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_support::{channel, parse};
    use crate::channel::ChannelType;
    use crate::queue::ContentType;

    #[test]
    fn test_story_mention_and_deleted() {
        let body = json!({
            "object": "instagram",
            "entry": [{
                "id": "IGID",
                "time": 1700000000000_i64,
                "messaging": [
                    {"sender": {"id": "IGSID"}, "recipient": {"id": "IGID"}, "timestamp": 1700000000000_i64,
                     "message": {"mid": "ig_1", "attachments": [
                        {"type": "story_mention", "payload": {"url": "https://lookaside/story"}}
                     ]}},
                    {"sender": {"id": "IGSID"}, "recipient": {"id": "IGID"}, "timestamp": 1700000000001_i64,
                     "message": {"mid": "ig_0", "is_deleted": true}},
                    {"sender": {"id": "IGSID"}, "recipient": {"id": "IGID"}, "timestamp": 1700000000002_i64,
                     "message": {"mid": "ig_2", "text": "nice", "reply_to": {"story": {"id": "S1", "url": "https://s"}}}}
                ]
            }]
        })
        .to_string();
        let batch = parse(&channel(ChannelType::Instagram), body.as_bytes()).unwrap();

        assert_eq!(batch.messages.len(), 2);
        let mention = &batch.messages[0];
        assert_eq!(mention.content_type, ContentType::Image);
        assert_eq!(mention.attachments[0].url, "https://lookaside/story");
        assert_eq!(mention.attachments[0].metadata["attachment_type"], "story_mention");

        let reply = &batch.messages[1];
        assert_eq!(reply.content, "nice");
        assert_eq!(reply.metadata["story_id"], "S1");
    }

    #[test]
    fn test_changes_messages_field() {
        let body = json!({
            "object": "instagram",
            "entry": [{
                "id": "IGID",
                "changes": [
                    {"field": "messages", "value": {
                        "sender": {"id": "12334"}, "recipient": {"id": "23245"},
                        "timestamp": "1527459824", "message": {"mid": "random_mid", "text": "random_text"}
                    }},
                    {"field": "comments", "value": {"id": "c1"}}
                ]
            }]
        })
        .to_string();
        let batch = parse(&channel(ChannelType::Instagram), body.as_bytes()).unwrap();
        // Meta's sample sends the timestamp as a string; that item is recorded, not fatal.
        assert_eq!(batch.messages.len() + batch.failures.len(), 1);
    }

    #[test]
    fn test_bad_change_does_not_block_messaging() {
        let body = json!({
            "object": "instagram",
            "entry": [{
                "id": "IGID",
                "messaging": [{
                    "sender": {"id": "IGSID"}, "recipient": {"id": "IGID"},
                    "timestamp": 1700000000000_i64, "message": {"mid": "ig_ok", "text": "hi"}
                }],
                "changes": [{"field": ["messages"], "value": {}}]
            }]
        })
        .to_string();
        let batch = parse(&channel(ChannelType::Instagram), body.as_bytes()).unwrap();

        assert_eq!(batch.messages[0].external_id, "ig_ok");
        assert_eq!(batch.failures[0].item, "entry[0].changes[0]");
    }

    #[test]
    fn test_reaction_and_share() {
        let body = json!({
            "object": "instagram",
            "entry": [{"id": "IGID", "messaging": [
                {"sender": {"id": "U"}, "recipient": {"id": "IGID"}, "timestamp": 1,
                 "reaction": {"mid": "ig_9", "action": "react", "reaction": "love", "emoji": "❤️"}},
                {"sender": {"id": "U"}, "recipient": {"id": "IGID"}, "timestamp": 2,
                 "message": {"mid": "ig_10", "attachments": [{"type": "share", "payload": {"url": "https://ig/p/1"}}]}}
            ]}]
        })
        .to_string();
        let batch = parse(&channel(ChannelType::Instagram), body.as_bytes()).unwrap();

        let reaction = &batch.messages[0];
        assert_eq!(reaction.content, "❤️");
        assert_eq!(reaction.metadata["reaction_message_id"], "ig_9");

        let share = &batch.messages[1];
        assert_eq!(share.content_type, ContentType::Text);
        assert_eq!(share.metadata["attachment_url"], "https://ig/p/1");
        assert!(share.attachments.is_empty());
    }
}
