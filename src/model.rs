//! Data model shared by the parsers, the pipeline and the record normalizer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Release type label the catalog uses for source distributions.
pub const SOURCE_RELEASE_TYPE: &str = "Source";

/// Info label whose value is the explicit download location.
pub const DOWNLOAD_URL_LABEL: &str = "Download URL";

/// Info label whose value is the project home page.
pub const HOME_PAGE_LABEL: &str = "Home Page";

/// Info label that fans out into grouped category values.
pub const CATEGORIES_LABEL: &str = "Categories";

/// One `(package, version)` pair discovered in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub package: String,
    pub version: String,
}

impl CatalogEntry {
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
        }
    }

    /// Label under which the detail page for this entry is fetched and reported.
    pub fn label(&self) -> String {
        format!("{}-{}", self.package, self.version)
    }
}

/// One distributable artifact listed on a detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Download location with the fragment stripped
    pub url: String,

    /// Checksum carried in the link fragment (after the `md5=` style prefix)
    pub content_hash: String,

    /// Release type as displayed, e.g. `Source` or `Python Wheel`
    pub release_type: String,

    /// Runtime tag as displayed, e.g. `py2.py3`
    pub runtime_tag: String,

    /// Upload date as displayed
    pub uploaded_at: String,

    /// Size as displayed, e.g. `12KB`
    pub size: String,
}

impl FileRecord {
    pub fn is_source(&self) -> bool {
        self.release_type == SOURCE_RELEASE_TYPE
    }
}

/// Value attached to an info label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InfoValue {
    Text(String),
    /// Category group name → values, in page order
    Categories(BTreeMap<String, Vec<String>>),
}

impl InfoValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            InfoValue::Text(text) => Some(text),
            InfoValue::Categories(_) => None,
        }
    }

    pub fn as_categories(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        match self {
            InfoValue::Categories(groups) => Some(groups),
            InfoValue::Text(_) => None,
        }
    }
}

pub type InfoBlock = BTreeMap<String, InfoValue>;

/// Parsed result of one detail page.
///
/// The empty value is a valid outcome and means "skip this package".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDetail {
    pub files: Vec<FileRecord>,
    pub info: InfoBlock,
}

impl PackageDetail {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.info.is_empty()
    }

    pub fn info_text(&self, label: &str) -> Option<&str> {
        self.info.get(label).and_then(InfoValue::as_text)
    }

    pub fn categories(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        self.info.get(CATEGORIES_LABEL).and_then(InfoValue::as_categories)
    }

    /// First file whose release type is exactly the source marker.
    pub fn first_source_file(&self) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.is_source())
    }
}

/// Entries discovered in the catalog, each with its description.
pub type Catalog = BTreeMap<CatalogEntry, String>;

/// Authoritative map of parsed detail pages. Written by the aggregator only.
pub type AggregateStore = BTreeMap<CatalogEntry, PackageDetail>;

/// Output of a parser, tagged by the mode that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedDocument {
    Index(Vec<String>),
    Detail(PackageDetail),
}

/// Identity of a persisted package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageId {
    pub category: String,
    pub name: String,
    pub version: String,
}

/// Final normalized record handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Name filtered to the safe character set
    pub name: String,

    /// Version, or a `YYYYMMDD` pseudo-version when the original fails the grammar
    pub version: String,

    pub real_name: String,
    pub real_version: String,
    pub description: String,
    pub long_description: String,
    pub homepage: String,
    pub license: String,
    pub source_uri: String,

    /// Checksum of the source artifact; only set when `source_uri` came from it
    pub content_hash: Option<String>,

    /// Runtime compatibility expression, e.g. `(python{2_7,3_4})`
    pub python_compat: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintainer {
    pub email: String,
    pub name: String,
}

/// Data shared by every package of a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonData {
    pub eclasses: Vec<String>,
    pub maintainer: Vec<Maintainer>,
    pub dependencies: Vec<String>,
}

impl Default for CommonData {
    fn default() -> Self {
        Self {
            eclasses: vec!["g-sorcery".to_string(), "gs-pypi".to_string()],
            maintainer: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}
