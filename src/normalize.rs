//! Record normalization: from parsed detail pages to [`CanonicalRecord`]s.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::debug;

use crate::config::HarvestConfig;
use crate::model::{
    AggregateStore, CanonicalRecord, Catalog, CatalogEntry, PackageDetail, PackageId,
    DOWNLOAD_URL_LABEL, HOME_PAGE_LABEL,
};
use crate::traits::LicenseNormalizer;

/// Prefix of every runtime tag in the compatibility expression.
pub const RUNTIME_PREFIX: &str = "python";

/// Tags assumed when no language category maps to any.
pub const DEFAULT_RUNTIME_TAGS: &[&str] = &["2_7", "3_3", "3_4", "3_5"];

const LICENSES_TABLE: &str = "licenses";
const LICENSE_GROUP: &str = "License";
const LANGUAGE_GROUP: &str = "Programming Language";

static STRICT_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[0-9]+[a-z]?|[0-9][0-9.]+[0-9][a-z]?)$").unwrap()
});

/// Runtime tags implied by one `Programming Language` category value.
fn tags_for(marker: &str) -> &'static [&'static str] {
    match marker {
        "2" | "2.6" | "2.7" => &["2_7"],
        "3" => &["3_3", "3_4", "3_5"],
        "3.2" | "3.3" => &["3_3"],
        "3.4" => &["3_4"],
        "3.5" => &["3_5"],
        _ => &[],
    }
}

/// Maps language category values to runtime tags, first-seen order, no
/// duplicates. Falls back to [`DEFAULT_RUNTIME_TAGS`].
pub fn runtime_tags<S: AsRef<str>>(markers: &[S]) -> Vec<&'static str> {
    let mut tags: Vec<&'static str> = Vec::new();
    for tag in markers.iter().flat_map(|m| tags_for(m.as_ref())) {
        if !tags.contains(tag) {
            tags.push(tag);
        }
    }
    if tags.is_empty() {
        tags.extend_from_slice(DEFAULT_RUNTIME_TAGS);
    }
    tags
}

/// `(python2_7)` for one tag, `(python{2_7,3_4})` for several.
pub fn compat_expression(tags: &[&str]) -> String {
    match tags {
        [] => format!("({RUNTIME_PREFIX}{{{}}})", DEFAULT_RUNTIME_TAGS.join(",")),
        [single] => format!("({RUNTIME_PREFIX}{single})"),
        many => format!("({RUNTIME_PREFIX}{{{}}})", many.join(",")),
    }
}

/// Keeps ASCII letters, digits and `+ _ -`.
pub fn filter_package_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '-'))
        .collect()
}

/// Keeps the package-name set plus space and `. ( ) [ ] { } ,`.
pub fn filter_description(description: &str) -> String {
    description
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || matches!(
                    c,
                    '+' | '_' | '-' | ' ' | '.' | '(' | ')' | '[' | ']' | '{' | '}' | ','
                )
        })
        .collect()
}

pub fn is_strict_version(version: &str) -> bool {
    STRICT_VERSION.is_match(version)
}

/// `YYYYMMDD` of the run date.
pub fn pseudo_version(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Walks the aggregate once and builds the final records.
pub struct RecordNormalizer<'a> {
    config: &'a HarvestConfig,
    licenses: &'a dyn LicenseNormalizer,
    pseudo_version: String,
}

impl<'a> RecordNormalizer<'a> {
    pub fn new(
        config: &'a HarvestConfig,
        licenses: &'a dyn LicenseNormalizer,
        run_date: NaiveDate,
    ) -> Self {
        Self {
            config,
            licenses,
            pseudo_version: pseudo_version(run_date),
        }
    }

    /// Normalizes one entry, or `None` when it must be dropped: empty detail,
    /// or no usable source location.
    pub fn normalize(
        &self,
        entry: &CatalogEntry,
        description: &str,
        detail: &PackageDetail,
    ) -> Option<CanonicalRecord> {
        if detail.is_empty() {
            return None;
        }

        let (source_uri, content_hash) = match detail.info_text(DOWNLOAD_URL_LABEL) {
            Some(url) if !url.is_empty() => (url.to_string(), None),
            _ => {
                let file = detail.first_source_file()?;
                if file.url.is_empty() {
                    return None;
                }
                (file.url.clone(), Some(file.content_hash.clone()))
            }
        };

        let categories = detail.categories();
        let raw_license = categories
            .and_then(|groups| groups.get(LICENSE_GROUP))
            .and_then(|values| values.last())
            .map(String::as_str)
            .unwrap_or_default();
        let license = self
            .licenses
            .normalize(self.config, LICENSES_TABLE, raw_license);

        let languages: &[String] = categories
            .and_then(|groups| groups.get(LANGUAGE_GROUP))
            .map(Vec::as_slice)
            .unwrap_or_default();
        let python_compat = compat_expression(&runtime_tags(languages));

        let version = if is_strict_version(&entry.version) {
            entry.version.clone()
        } else {
            self.pseudo_version.clone()
        };
        let description = filter_description(description);

        Some(CanonicalRecord {
            name: filter_package_name(&entry.package),
            version,
            real_name: entry.package.clone(),
            real_version: entry.version.clone(),
            long_description: description.clone(),
            description,
            homepage: detail
                .info_text(HOME_PAGE_LABEL)
                .unwrap_or_default()
                .to_string(),
            license,
            source_uri,
            content_hash,
            python_compat,
        })
    }

    /// One pass over the catalog; entries without a stored detail or that
    /// normalize to nothing are skipped.
    pub fn normalize_all(
        &self,
        catalog: &Catalog,
        store: &AggregateStore,
    ) -> Vec<(PackageId, CanonicalRecord)> {
        let mut records = Vec::new();
        for (entry, description) in catalog {
            let Some(detail) = store.get(entry) else {
                continue;
            };
            let Some(record) = self.normalize(entry, description, detail) else {
                debug!(package = %entry.package, version = %entry.version, "Skipping entry without source");
                continue;
            };
            let id = PackageId {
                category: self.config.category.clone(),
                name: record.name.clone(),
                version: record.version.clone(),
            };
            records.push((id, record));
        }
        records
    }
}
