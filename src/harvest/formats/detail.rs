//! Package detail page parser.
//!
//! A detail page carries two structures of interest:
//!
//! - the last `table.list` whose first header cell mentions `File`, one row
//!   per release file (header and trailing summary rows excluded);
//! - a `ul.nodot` list of labelled metadata items. The page may start with a
//!   download-count list of the same class, in which case the second list is
//!   the metadata one.

use scraper::{ElementRef, Html};
use std::collections::BTreeMap;
use tracing::warn;

use super::consts;
use crate::model::{FileRecord, InfoBlock, InfoValue, PackageDetail, CATEGORIES_LABEL};
use crate::traits::ParseError;

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// `"Home Page:"` → `"Home Page"`
fn normalize_label(label: &str) -> String {
    label.trim().trim_end_matches(':').trim_end().to_string()
}

/// Parses a detail page.
///
/// # Errors
///
/// Returns [`ParseError`] on the first structural anomaly; no partial result
/// is kept.
pub fn try_parse_detail(bytes: &[u8]) -> Result<PackageDetail, ParseError> {
    let html = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&html);

    Ok(PackageDetail {
        files: parse_files(&document)?,
        info: parse_info(&document)?,
    })
}

/// Total variant of [`try_parse_detail`]. A malformed page is logged and
/// yields the empty detail, which downstream treats as "skip".
pub fn parse_detail(bytes: &[u8]) -> PackageDetail {
    try_parse_detail(bytes).unwrap_or_else(|e| {
        warn!(error = %e, "There was an error during parsing, ignoring this package");
        PackageDetail::default()
    })
}

fn parse_files(document: &Html) -> Result<Vec<FileRecord>, ParseError> {
    let Some(table) = document.select(&consts::FILE_TABLE_SELECTOR).last() else {
        return Ok(Vec::new());
    };

    let header = table
        .select(&consts::HEADER_CELL_SELECTOR)
        .next()
        .ok_or_else(|| ParseError::MissingElement("file table header".to_string()))?;
    if !text_of(header).contains("File") {
        return Ok(Vec::new());
    }

    let rows: Vec<_> = table.select(&consts::ROW_SELECTOR).collect();
    if rows.len() <= 2 {
        return Ok(Vec::new());
    }

    rows[1..rows.len() - 1]
        .iter()
        .enumerate()
        .map(|(i, row)| parse_file_row(i + 1, *row))
        .collect()
}

fn parse_file_row(row: usize, element: ElementRef<'_>) -> Result<FileRecord, ParseError> {
    let malformed = |reason: &str| ParseError::MalformedRow {
        row,
        reason: reason.to_string(),
    };

    let cells: Vec<_> = element.select(&consts::CELL_SELECTOR).collect();
    if cells.len() <= consts::SIZE_COLUMN {
        return Err(malformed("too few cells"));
    }

    let href = cells[consts::FILE_COLUMN]
        .select(&consts::ANCHOR_SELECTOR)
        .next()
        .and_then(|a| a.value().attr("href"))
        .ok_or_else(|| malformed("file cell has no link"))?;

    let mut parts = href.split('#');
    let url = parts.next().unwrap_or_default().to_string();
    let fragment = parts
        .next()
        .ok_or_else(|| malformed("file link has no checksum fragment"))?;
    let content_hash = fragment.chars().skip(consts::HASH_PREFIX_LEN).collect();

    Ok(FileRecord {
        url,
        content_hash,
        release_type: text_of(cells[consts::TYPE_COLUMN]),
        runtime_tag: text_of(cells[consts::RUNTIME_COLUMN]),
        uploaded_at: text_of(cells[consts::UPLOADED_COLUMN]),
        size: text_of(cells[consts::SIZE_COLUMN]),
    })
}

fn parse_info(document: &Html) -> Result<InfoBlock, ParseError> {
    let lists: Vec<_> = document.select(&consts::INFO_LIST_SELECTOR).collect();
    let Some(first) = lists.first().copied() else {
        return Ok(InfoBlock::new());
    };

    let first_label = first
        .select(&consts::LABEL_SELECTOR)
        .next()
        .ok_or_else(|| ParseError::MissingElement("label of the first info list".to_string()))?;
    let list = if text_of(first_label).contains(consts::ALL_VERSIONS_HEADER) {
        lists.get(1).copied().ok_or_else(|| {
            ParseError::MissingElement("info list after the download summary".to_string())
        })?
    } else {
        first
    };

    let mut info = InfoBlock::new();
    for item in list
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == "li")
    {
        let Some(label) = item
            .select(&consts::LABEL_SELECTOR)
            .next()
            .map(|strong| normalize_label(&text_of(strong)))
            .filter(|label| !label.is_empty())
        else {
            continue;
        };

        if label == CATEGORIES_LABEL {
            add_categories(&mut info, item);
            continue;
        }

        if let Some(value) = item.select(&consts::VALUE_SELECTOR).next() {
            info.insert(label, InfoValue::Text(text_of(value)));
            continue;
        }

        if let Some(href) = item
            .select(&consts::ANCHOR_SELECTOR)
            .next()
            .and_then(|a| a.value().attr("href"))
        {
            info.insert(label, InfoValue::Text(href.to_string()));
        }
    }

    Ok(info)
}

/// Appends each `Group :: value :: value` anchor to its group.
fn add_categories(info: &mut InfoBlock, item: ElementRef<'_>) {
    let slot = info
        .entry(CATEGORIES_LABEL.to_string())
        .or_insert_with(|| InfoValue::Categories(BTreeMap::new()));
    if let InfoValue::Text(_) = slot {
        *slot = InfoValue::Categories(BTreeMap::new());
    }
    let InfoValue::Categories(groups) = slot else {
        return;
    };

    for anchor in item.select(&consts::ANCHOR_SELECTOR) {
        let text = text_of(anchor);
        let mut parts = text.split(consts::CATEGORY_SEPARATOR).map(str::trim);
        let Some(group) = parts.next().filter(|g| !g.is_empty()) else {
            continue;
        };
        groups
            .entry(group.to_string())
            .or_default()
            .extend(parts.map(str::to_string));
    }
}
