//! Document and container formats understood by the harvester.
//!
//! - [`archive`] - tar containers and single-stream compression
//! - [`index`] - catalog index page
//! - [`detail`] - per-package detail page

pub mod archive;
mod consts;
pub mod detail;
pub mod index;

use serde::{Deserialize, Serialize};

use crate::model::ParsedDocument;

/// Parser applied to the payloads of a job, chosen when the job is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParserMode {
    Index,
    Detail,
}

impl ParserMode {
    /// Runs the selected parser. Both parsers are total.
    pub fn parse(self, bytes: &[u8]) -> ParsedDocument {
        match self {
            ParserMode::Index => ParsedDocument::Index(index::parse_index(bytes)),
            ParserMode::Detail => ParsedDocument::Detail(detail::parse_detail(bytes)),
        }
    }
}
