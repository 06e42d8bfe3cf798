use scraper::Selector;
use std::sync::LazyLock;

macro_rules! selector {
    ($name:ident, $css:expr) => {
        pub(crate) static $name: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse($css).unwrap());
    };
}

// Index page
selector!(BODY_SELECTOR, "body");
selector!(ANCHOR_SELECTOR, "a");

// Detail page: release files
selector!(FILE_TABLE_SELECTOR, "table.list");
selector!(HEADER_CELL_SELECTOR, "th");
selector!(ROW_SELECTOR, "tr");
selector!(CELL_SELECTOR, "td");

// Detail page: metadata lists
selector!(INFO_LIST_SELECTOR, "ul.nodot");
selector!(LABEL_SELECTOR, "strong");
selector!(VALUE_SELECTOR, "span");

/// Header of the download-count list that precedes the metadata list.
pub(crate) const ALL_VERSIONS_HEADER: &str = "Downloads (All Versions):";

/// Separator inside a category anchor, e.g. `License :: OSI Approved :: MIT License`.
pub(crate) const CATEGORY_SEPARATOR: &str = " :: ";

// Fixed column positions of a file row.
pub(crate) const FILE_COLUMN: usize = 0;
pub(crate) const TYPE_COLUMN: usize = 1;
pub(crate) const RUNTIME_COLUMN: usize = 2;
pub(crate) const UPLOADED_COLUMN: usize = 3;
pub(crate) const SIZE_COLUMN: usize = 4;

/// Characters of the fragment (`md5=`) that precede the checksum.
pub(crate) const HASH_PREFIX_LEN: usize = 4;
