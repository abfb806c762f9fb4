//! Facebook Messenger webhook parser.

use super::envelope::Family;
use super::messenger::{self, Platform};
use super::{ParseContext, ParsedBatch, Parser};
use crate::error::GatewayError;

pub struct FacebookParser;

const PLATFORM: Platform = Platform {
    family: Family::Messenger,
    objects: &["page"],
    read_changes: false,
};

impl Parser for FacebookParser {
    fn parse(&self, ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
        messenger::parse(&PLATFORM, ctx, body)
    }
}
