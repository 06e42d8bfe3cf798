//! Catalog index page parser.

use scraper::Html;
use std::collections::HashSet;
use tracing::{debug, error};

use super::consts;
use crate::traits::ParseError;

/// Extracts package names from the anchors under the body container, in
/// document order and without duplicates.
///
/// # Errors
///
/// Returns [`ParseError::IndexUnavailable`] when the document has no body
/// content. The HTML parser always synthesizes a `<body>`, so an empty one
/// is what "absent" looks like.
pub fn try_parse_index(bytes: &[u8]) -> Result<Vec<String>, ParseError> {
    let html = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&html);

    let body = document
        .select(&consts::BODY_SELECTOR)
        .next()
        .filter(|body| body.has_children())
        .ok_or(ParseError::IndexUnavailable)?;

    let mut seen = HashSet::new();
    let mut packages = Vec::new();
    for anchor in body.select(&consts::ANCHOR_SELECTOR) {
        let name = anchor.text().collect::<String>().trim().to_string();
        if !name.is_empty() && seen.insert(name.clone()) {
            packages.push(name);
        }
    }

    debug!(packages = packages.len(), "Parsed catalog index");
    Ok(packages)
}

/// Total variant of [`try_parse_index`]: an unavailable index is logged and
/// yields no packages, so the run continues.
pub fn parse_index(bytes: &[u8]) -> Vec<String> {
    try_parse_index(bytes).unwrap_or_else(|e| {
        error!(error = %e, "Catalog index returned no packages");
        Vec::new()
    })
}
