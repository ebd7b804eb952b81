//! The Globus Search index driver.
//!
//! ESGF2 indices live behind the Globus Search API: queries are posted as a
//! set of `match_any` filters and results scroll with offset pagination.
//! Record synthesis is shared with the Solr driver; only the wire shape
//! differs.

use super::types::{DatasetRecord, FileInfo, Query};
use super::{
    expand_variables, file_info_from_doc, list_field, parse_any_project, str_field,
    synthesize_record, IndexDriver,
};
use crate::cache::CachedSession;
use crate::error::{EsgfError, Result};
use crate::logging::Log;
use crate::projects::Project;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::warn;

/// Entries fetched per scroll page.
const PAGE_LIMIT: usize = 1000;

/// Result counts above this emit a one-shot user-visible warning.
const LARGE_RESULT_WARNING: usize = 20_000;

/// Well-known index ids addressable by a short label.
const GLOBUS_INDEX_IDS: [(&str, &str); 2] = [
    ("anl-dev", "d927e2d9-ccdb-48e4-b05d-adbc3d97bbc5"),
    ("ornl-dev", "ea4595f4-7b71-4da7-a1f0-e3f5d8f7f062"),
];

#[derive(Deserialize)]
struct GlobusResponse {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    has_next_page: bool,
    #[serde(default)]
    gmeta: Vec<GlobusEntry>,
}

#[derive(Deserialize)]
struct GlobusEntry {
    subject: String,
    #[serde(default)]
    entries: Vec<GlobusContent>,
}

#[derive(Deserialize)]
struct GlobusContent {
    #[serde(default)]
    content: serde_json::Value,
}

/// Driver for a Globus Search (ESGF2) index.
pub struct GlobusIndex {
    repr: String,
    url: String,
    session: CachedSession,
    log: Log,
    warned_large: AtomicBool,
}

impl GlobusIndex {
    pub fn new(index_id: &str, session: CachedSession, log: Log) -> Self {
        let uuid = GLOBUS_INDEX_IDS
            .iter()
            .find(|(label, _)| *label == index_id)
            .map(|(_, uuid)| *uuid)
            .unwrap_or(index_id);
        Self {
            repr: format!("GlobusIndex('{index_id}')"),
            url: format!("https://search.api.globus.org/v1/index/{uuid}/search"),
            session,
            log,
            warned_large: AtomicBool::new(false),
        }
    }

    fn filters_from(query: &Query) -> Vec<serde_json::Value> {
        query
            .iter()
            .map(|(field, values)| {
                json!({
                    "type": "match_any",
                    "field_name": field,
                    "values": values,
                })
            })
            .collect()
    }

    /// Scroll the index until every matching entry is fetched.
    async fn scroll(&self, filters: Vec<serde_json::Value>) -> Result<Vec<GlobusEntry>> {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        loop {
            let body = json!({
                "q": "",
                "filters": filters.clone(),
                "facets": [],
                "sort": [],
                "limit": PAGE_LIMIT,
                "offset": offset,
            });
            let response = self.session.post_json(&self.url, &body).await?;
            let page: GlobusResponse = serde_json::from_value(response)?;
            if page.total > LARGE_RESULT_WARNING && !self.warned_large.swap(true, Ordering::SeqCst)
            {
                warn!(
                    "{} matched {} records; consider narrowing the search",
                    self.repr, page.total
                );
            }
            let fetched = page.gmeta.len();
            entries.extend(page.gmeta);
            offset += fetched;
            if fetched == 0 || !page.has_next_page {
                break;
            }
        }
        if entries.is_empty() {
            return Err(EsgfError::NoSearchResults);
        }
        Ok(entries)
    }
}

#[async_trait]
impl IndexDriver for GlobusIndex {
    fn name(&self) -> String {
        self.repr.clone()
    }

    async fn search(&self, project: Project, query: &Query) -> Result<Vec<DatasetRecord>> {
        let response_time = Instant::now();
        let mut query = query.clone();
        query.insert("type", "Dataset");
        let entries = self.scroll(Self::filters_from(&query)).await?;
        let extra_cols = crate::config::get().additional_df_cols;
        let searched_variables = query.get(project.variable_facet()).map(|v| v.to_vec());
        let null = serde_json::Value::Null;
        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            let content = entry.entries.first().map(|e| &e.content).unwrap_or(&null);
            let template = str_field(content, "dataset_id_template_");
            let Some(record) = synthesize_record(
                project,
                &entry.subject,
                template.as_deref(),
                content,
                &extra_cols,
            ) else {
                continue;
            };
            if !record.facets.contains_key(project.variable_facet()) {
                let declared = list_field(content, project.variable_facet());
                records.extend(expand_variables(
                    record,
                    project.variable_facet(),
                    &declared,
                    searched_variables.as_deref(),
                ));
            } else {
                records.push(record);
            }
        }
        self.log.info(format!(
            "└─{} results={} response_time={:.2}",
            self.repr,
            records.len(),
            response_time.elapsed().as_secs_f64()
        ))?;
        Ok(records)
    }

    async fn from_tracking_ids(&self, tracking_ids: &[String]) -> Result<Vec<DatasetRecord>> {
        let filters = vec![json!({
            "type": "match_any",
            "field_name": "tracking_id",
            "values": tracking_ids,
        })];
        let entries = self.scroll(filters).await?;
        let mut records = Vec::new();
        for entry in &entries {
            let Some(content) = entry.entries.first().map(|e| &e.content) else {
                continue;
            };
            let Some(dataset_id) = str_field(content, "dataset_id") else {
                continue;
            };
            let Some((project, facets, version, data_node)) = parse_any_project(&dataset_id)
            else {
                continue;
            };
            records.push(DatasetRecord {
                project: project.as_str().to_string(),
                facets,
                version,
                data_node: Some(data_node),
                ids: vec![dataset_id],
            });
        }
        self.log
            .info(format!("└─{} results={}", self.repr, records.len()))?;
        Ok(records)
    }

    async fn get_file_info(
        &self,
        dataset_ids: &[String],
        facets: &Query,
    ) -> Result<Vec<FileInfo>> {
        let response_time = Instant::now();
        let mut query = facets.clone();
        query.insert("type", "File");
        query.insert("dataset_id", dataset_ids.to_vec());
        let entries = self.scroll(Self::filters_from(&query)).await?;
        let infos: Vec<FileInfo> = entries
            .iter()
            .filter_map(|entry| entry.entries.first())
            .filter_map(|e| file_info_from_doc(&e.content))
            .collect();
        self.log.info(format!(
            "└─{} results={} response_time={:.2}",
            self.repr,
            infos.len(),
            response_time.elapsed().as_secs_f64()
        ))?;
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_label_resolves_to_uuid() {
        let session = CachedSession::uncached().unwrap();
        let index = GlobusIndex::new("anl-dev", session.clone(), Log::in_memory());
        assert!(index
            .url
            .contains("d927e2d9-ccdb-48e4-b05d-adbc3d97bbc5"));
        assert_eq!(index.name(), "GlobusIndex('anl-dev')");

        // raw uuids pass through
        let index = GlobusIndex::new(
            "0fa9c3c9-661b-4b63-a6bc-0e0a4e7b3f9f",
            session,
            Log::in_memory(),
        );
        assert!(index.url.contains("0fa9c3c9"));
    }

    #[test]
    fn test_filters_are_match_any() {
        let query = Query::new()
            .facet("variable_id", ["gpp", "mrso"])
            .facet("experiment_id", "historical");
        let filters = GlobusIndex::filters_from(&query);
        assert_eq!(filters.len(), 2);
        for filter in &filters {
            assert_eq!(filter["type"], "match_any");
        }
        let variable = filters
            .iter()
            .find(|f| f["field_name"] == "variable_id")
            .unwrap();
        assert_eq!(variable["values"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_response_shape_parses() {
        let body = serde_json::json!({
            "total": 1,
            "has_next_page": false,
            "gmeta": [{
                "subject": "CMIP6.CMIP.CCCma.CanESM5.historical.r1i1p1f1.Amon.gpp.gn.v20190429|esgf.ceda.ac.uk",
                "entries": [{"content": {"retracted": false}}],
            }],
        });
        let response: GlobusResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.gmeta.len(), 1);
        assert!(response.gmeta[0].subject.starts_with("CMIP6."));
    }
}
