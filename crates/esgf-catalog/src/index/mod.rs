//! Index drivers.
//!
//! Three backend shapes publish ESGF-style records: offset-paginated Solr
//! REST endpoints, Globus Search indices, and STAC catalogs. Each driver
//! normalizes its wire format into the shared record types; the federator
//! fans a request out across every enabled driver.

pub mod federator;
pub mod globus;
pub mod solr;
pub mod stac;
pub mod types;

use crate::error::{EsgfError, Result};
use crate::projects::{self, Project};
use async_trait::async_trait;
use std::collections::HashMap;
use types::{DatasetRecord, FileInfo, Query};

/// The capability contract every index backend implements.
#[async_trait]
pub trait IndexDriver: Send + Sync {
    /// A readable name for logs, e.g. `SolrIndex('esgf-node.ornl.gov')`.
    fn name(&self) -> String;

    /// Search for dataset records matching the query facets.
    async fn search(&self, project: Project, query: &Query) -> Result<Vec<DatasetRecord>>;

    /// Look up dataset records by per-file tracking ids.
    async fn from_tracking_ids(&self, tracking_ids: &[String]) -> Result<Vec<DatasetRecord>>;

    /// Resolve dataset ids to file information records.
    async fn get_file_info(&self, dataset_ids: &[String], facets: &Query)
        -> Result<Vec<FileInfo>>;

    /// Enumerate the values a facet takes, for free-text variable search.
    /// Backends without facet buckets report `Unsupported`.
    async fn facet_counts(
        &self,
        _project: Project,
        _facets: &[&str],
    ) -> Result<HashMap<String, Vec<String>>> {
        Err(EsgfError::Unsupported {
            driver: self.name(),
            operation: "facet_counts".to_string(),
        })
    }
}

/// First string value of a document field that may be a string or a list.
pub(crate) fn str_field(doc: &serde_json::Value, key: &str) -> Option<String> {
    match doc.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => items.first()?.as_str().map(|s| s.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// All string values of a document field that may be a string or a list.
pub(crate) fn list_field(doc: &serde_json::Value, key: &str) -> Vec<String> {
    match doc.get(key) {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Integer value of a document field that may be a number or numeric string.
pub(crate) fn u64_field(doc: &serde_json::Value, key: &str) -> Option<u64> {
    match doc.get(key)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Split a `link|mime|KIND` (or `link|KIND`) url entry into link and kind.
///
/// OPeNDAP links are published with an `.html` landing suffix which is
/// stripped so the link opens as a data URL.
pub(crate) fn split_url_kind(entry: &str) -> Option<(String, String)> {
    let mut parts = entry.split('|');
    let link = parts.next()?;
    let kind = parts.next_back()?;
    if link == kind {
        return None;
    }
    let link = match kind {
        "OPENDAP" => link.strip_suffix(".html").unwrap_or(link),
        _ => link,
    };
    Some((link.to_string(), kind.to_string()))
}

/// Route a typed url onto the matching [`FileInfo`] list.
pub(crate) fn assign_url(info: &mut FileInfo, link: String, kind: &str) {
    match kind {
        "HTTPServer" => info.http_urls.push(link),
        "OPENDAP" => info.opendap_urls.push(link),
        "VirtualZarr" => info.virtual_zarr_urls.push(link),
        "Globus" => info.globus_links.push(link),
        _ => {}
    }
}

/// Build a dataset record from a qualified id and its id template.
///
/// Template segments are matched positionally against the dot-separated id;
/// literal segments (like the `cmip5` prefix) contribute no facet. Without a
/// template the project's master facets are assumed.
pub(crate) fn synthesize_record(
    project: Project,
    id: &str,
    template: Option<&str>,
    doc: &serde_json::Value,
    extra_cols: &[String],
) -> Option<DatasetRecord> {
    let (master, data_node) = id.split_once('|')?;
    let parts: Vec<&str> = master.split('.').collect();
    let segments: Vec<String> = match template {
        Some(template) => template.split('.').map(|s| s.to_string()).collect(),
        None => project
            .master_id_facets()
            .iter()
            .map(|f| format!("%({f})s"))
            .collect(),
    };
    if parts.len() != segments.len() + 1 {
        return None;
    }
    let version = parts.last()?.trim_start_matches('v').to_string();
    let mut facets = HashMap::new();
    for (segment, part) in segments.iter().zip(parts.iter()) {
        let Some(name) = segment
            .strip_prefix("%(")
            .and_then(|s| s.strip_suffix(")s"))
        else {
            continue;
        };
        // CMIP5 templates name the institute facet `valid_institute`
        let name = if name == "valid_institute" {
            "institute"
        } else {
            name
        };
        facets.insert(name.to_string(), part.to_string());
    }
    for col in extra_cols {
        if let Some(value) = str_field(doc, col) {
            facets.insert(col.clone(), value);
        }
    }
    Some(DatasetRecord {
        project: project.as_str().to_string(),
        facets,
        version,
        data_node: Some(data_node.to_string()),
        ids: vec![id.to_string()],
    })
}

/// Build a [`FileInfo`] from a file document shared by the Solr and Globus
/// backends: checksum/size scalars, typed `url` entries, a directory
/// template, and a time extent recoverable from the title.
pub(crate) fn file_info_from_doc(doc: &serde_json::Value) -> Option<FileInfo> {
    let dataset_id = str_field(doc, "dataset_id")?;
    let title = str_field(doc, "title")?;
    let path = doc_path(doc, &dataset_id, &title)?;
    let mut info = FileInfo {
        dataset_id,
        path,
        size: u64_field(doc, "size"),
        checksum: str_field(doc, "checksum"),
        checksum_type: str_field(doc, "checksum_type").map(|t| t.to_lowercase()),
        ..Default::default()
    };
    if let Some((start, end)) = types::extract_time_range(&title) {
        info.file_start = Some(start);
        info.file_end = Some(end);
    }
    for entry in list_field(doc, "url") {
        if let Some((link, kind)) = split_url_kind(&entry) {
            assign_url(&mut info, link, &kind);
        }
    }
    Some(info)
}

/// Render the archive-relative path of a file document.
///
/// The template's version field is the raw publication integer; the path
/// uses the `v`-prefixed version parsed from the dataset id instead.
pub(crate) fn doc_path(
    doc: &serde_json::Value,
    dataset_id: &str,
    title: &str,
) -> Option<std::path::PathBuf> {
    let template = str_field(doc, "directory_format_template_")?;
    let mut values: HashMap<String, String> = doc
        .as_object()?
        .keys()
        .filter_map(|key| str_field(doc, key).map(|v| (key.clone(), v)))
        .collect();
    values.insert(
        "version".to_string(),
        format!("v{}", types::version_from_id(dataset_id)?),
    );
    Some(types::render_directory_template(&template, &values)?.join(title))
}

/// Parse a qualified dataset id against every registered project, returning
/// the best fit. Used when the project is not known up front (tracking-id
/// lookups).
pub(crate) fn parse_any_project(
    id: &str,
) -> Option<(Project, HashMap<String, String>, String, String)> {
    let mut candidates = Vec::new();
    for project in projects::ALL {
        if let Some((facets, version, node)) = types::parse_dataset_id(project, id) {
            candidates.push((project, facets, version, node));
        }
    }
    // Prefer a candidate whose own tag shows up among its facet values
    // (CMIP6 ids carry mip_era=CMIP6, input4MIPs ids carry the activity).
    let tagged = candidates.iter().position(|(project, facets, _, _)| {
        facets
            .values()
            .any(|v| v.eq_ignore_ascii_case(project.as_str()))
    });
    match tagged {
        Some(i) => Some(candidates.swap_remove(i)),
        None => candidates.into_iter().next(),
    }
}

/// Expand a dataset record that spans several variables into one record per
/// variable.
///
/// Some CMIP5-era backends publish one dataset per (variant, table) tuple
/// containing many variables. Consumers want one row per variable, so the
/// record is replicated across the declared variables intersected with any
/// searched ones.
pub(crate) fn expand_variables(
    record: DatasetRecord,
    variable_facet: &str,
    declared: &[String],
    searched: Option<&[String]>,
) -> Vec<DatasetRecord> {
    let keep: Vec<&String> = match searched {
        Some(wanted) => declared.iter().filter(|v| wanted.contains(v)).collect(),
        None => declared.iter().collect(),
    };
    keep.into_iter()
        .map(|variable| {
            let mut expanded = record.clone();
            expanded
                .facets
                .insert(variable_facet.to_string(), variable.clone());
            expanded
        })
        .collect()
}
