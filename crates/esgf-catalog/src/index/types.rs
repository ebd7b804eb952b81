//! Record types shared by all index drivers.
//!
//! Drivers normalize backend responses into [`DatasetRecord`]s (one per
//! published dataset) and [`FileInfo`]s (one per logical file). Parsing of
//! dataset ids, `%(facet)s` directory templates, and filename time extents
//! lives here because every backend speaks the same id grammar.

use crate::projects::Project;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// A search query: facet name to accepted values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    facets: BTreeMap<String, Vec<String>>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accepted values of a facet, replacing any previous entry.
    /// Empty-string values are dropped; a facet with no remaining values is
    /// removed.
    pub fn facet(mut self, key: impl Into<String>, values: impl IntoFacetValues) -> Self {
        self.insert(key, values);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, values: impl IntoFacetValues) {
        let key = key.into();
        let values: Vec<String> = values
            .into_facet_values()
            .into_iter()
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            self.facets.remove(&key);
        } else {
            self.facets.insert(key, values);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.facets.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.facets.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.facets.get(key).map(|v| v.as_slice())
    }

    /// The first value of a facet, if present.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.facets.get(key)?.first().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.facets.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.facets.is_empty()
    }
}

/// Conversion into a list of facet values.
pub trait IntoFacetValues {
    fn into_facet_values(self) -> Vec<String>;
}

impl IntoFacetValues for &str {
    fn into_facet_values(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoFacetValues for String {
    fn into_facet_values(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoFacetValues for bool {
    fn into_facet_values(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoFacetValues for Vec<String> {
    fn into_facet_values(self) -> Vec<String> {
        self
    }
}

impl<const N: usize> IntoFacetValues for [&str; N] {
    fn into_facet_values(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl IntoFacetValues for &[String] {
    fn into_facet_values(self) -> Vec<String> {
        self.to_vec()
    }
}

/// One row of the catalog: a logical dataset published by one or more nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    /// Project tag, e.g. `CMIP6`.
    pub project: String,
    /// Master-id facets (plus any configured extra columns).
    pub facets: HashMap<String, String>,
    /// Dataset version, e.g. `20190429`.
    pub version: String,
    /// Publishing node; cleared by reconciliation, which folds it into `ids`.
    pub data_node: Option<String>,
    /// Fully qualified dataset identifiers, one per replica.
    pub ids: Vec<String>,
}

impl DatasetRecord {
    /// Values of the given facets in order, empty string where missing.
    pub fn group_values(&self, facets: &[&str]) -> Vec<String> {
        facets
            .iter()
            .map(|f| self.facets.get(*f).cloned().unwrap_or_default())
            .collect()
    }
}

/// One logical file and every way to reach it.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// Qualified id of the dataset this file belongs to.
    pub dataset_id: String,
    /// Catalog key of the owning row; assigned at plan time.
    pub key: String,
    /// Archive-relative path, never absolute.
    pub path: PathBuf,
    /// Size in bytes if the index reports one.
    pub size: Option<u64>,
    /// Checksum and its algorithm name; either both present or both absent.
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    /// Direct download URLs in index order.
    pub http_urls: Vec<String>,
    /// OPeNDAP streaming URLs.
    pub opendap_urls: Vec<String>,
    /// Virtual zarr streaming URLs.
    pub virtual_zarr_urls: Vec<String>,
    /// Bulk transfer links, `globus:{endpoint-uuid}/{relative path}`.
    pub globus_links: Vec<String>,
    /// Time extent parsed from the filename, when parseable.
    pub file_start: Option<NaiveDate>,
    pub file_end: Option<NaiveDate>,
}

impl FileInfo {
    /// Whether this file's extent overlaps `[start, end]`. Files without a
    /// parsed extent always pass.
    pub fn overlaps(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> bool {
        match (self.file_start, self.file_end) {
            (Some(fs), Some(fe)) => {
                start.map(|s| fe >= s).unwrap_or(true) && end.map(|e| fs <= e).unwrap_or(true)
            }
            _ => true,
        }
    }

    /// Fold another record for the same path into this one: list fields are
    /// unioned, scalar fields keep their first non-null value.
    pub fn merge(&mut self, other: FileInfo) {
        for (mine, theirs) in [
            (&mut self.http_urls, other.http_urls),
            (&mut self.opendap_urls, other.opendap_urls),
            (&mut self.virtual_zarr_urls, other.virtual_zarr_urls),
            (&mut self.globus_links, other.globus_links),
        ] {
            for url in theirs {
                if !mine.contains(&url) {
                    mine.push(url);
                }
            }
        }
        if self.size.is_none() {
            self.size = other.size;
        }
        if self.checksum.is_none() {
            self.checksum = other.checksum;
            self.checksum_type = other.checksum_type;
        }
        if self.file_start.is_none() {
            self.file_start = other.file_start;
            self.file_end = other.file_end;
        }
    }
}

/// Parse a qualified dataset id into facets, version and data node.
///
/// Ids have the shape `facet1.facet2.….vVERSION|data_node`, with the facet
/// ordering given by the project.
pub fn parse_dataset_id(
    project: Project,
    id: &str,
) -> Option<(HashMap<String, String>, String, String)> {
    let (master, data_node) = id.split_once('|')?;
    let parts: Vec<&str> = master.split('.').collect();
    let facet_names = project.master_id_facets();
    if parts.len() != facet_names.len() + 1 {
        return None;
    }
    let version = parts.last()?.trim_start_matches('v').to_string();
    let facets = facet_names
        .iter()
        .zip(parts.iter())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    Some((facets, version, data_node.to_string()))
}

/// Suffix-parse the version out of a qualified dataset id.
pub fn version_from_id(id: &str) -> Option<String> {
    let master = id.split('|').next()?;
    let last = master.rsplit('.').next()?;
    last.strip_prefix('v').map(|v| v.to_string())
}

static TEMPLATE_FACET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%\((\w+)\)s").expect("static regex"));

/// Facet names referenced by a `%(facet)s`-style template, in order.
pub fn template_facets(template: &str) -> Vec<String> {
    TEMPLATE_FACET
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Render a directory template to an archive-relative path.
///
/// The `%(root)s/` prefix is dropped; every other `%(facet)s` is substituted
/// from `values`. Returns `None` when a referenced facet has no value.
pub fn render_directory_template(
    template: &str,
    values: &HashMap<String, String>,
) -> Option<PathBuf> {
    let template = template
        .strip_prefix("%(root)s/")
        .unwrap_or(template)
        .to_string();
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for caps in TEMPLATE_FACET.captures_iter(&template) {
        let m = caps.get(0).expect("capture 0 always present");
        rendered.push_str(&template[last..m.start()]);
        rendered.push_str(values.get(&caps[1])?);
        last = m.end();
    }
    rendered.push_str(&template[last..]);
    Some(PathBuf::from(rendered))
}

static FILE_TIME_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{8}|\d{6})-(\d{8}|\d{6})").expect("static regex"));

fn parse_extent(raw: &str) -> Option<NaiveDate> {
    let (year, rest) = raw.split_at(4);
    let year: i32 = year.parse().ok()?;
    let month: u32 = rest[..2].parse().ok()?;
    let day: u32 = if rest.len() > 2 {
        rest[2..].parse().ok()?
    } else {
        1
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse a `YYYYMM[DD]-YYYYMM[DD]` extent from a filename.
pub fn extract_time_range(filename: &str) -> Option<(NaiveDate, NaiveDate)> {
    let caps = FILE_TIME_RANGE.captures(filename)?;
    let start = parse_extent(&caps[1])?;
    let end = parse_extent(&caps[2])?;
    Some((start, end))
}

static VARIANT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"r(\d+)i(\d+)p(\d+)(?:f(\d+))?").expect("static regex"));

/// Parse a variant label like `r1i1p1f1` into its integer tuple.
///
/// CMIP5-era labels omit the forcing index; it parses as zero so the
/// ordering stays total.
pub fn variant_tuple(label: &str) -> Option<(u32, u32, u32, u32)> {
    let caps = VARIANT.captures(label)?;
    let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok());
    Some((part(1)?, part(2)?, part(3)?, part(4).unwrap_or(0)))
}
