//! The STAC index driver.
//!
//! STAC catalogs publish one item per dataset with the archive facets
//! namespaced under a project prefix (`cmip6:variable_id`) and the file
//! access options carried in the item assets. File information therefore
//! comes from the items fetched at search time, which are held in a TTL
//! cache keyed by qualified dataset id until `get_file_info` runs.

use super::types::{extract_time_range, DatasetRecord, FileInfo, Query};
use super::{str_field, IndexDriver};
use crate::cache::CachedSession;
use crate::error::{EsgfError, Result};
use crate::logging::Log;
use crate::projects::Project;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Items fetched per page.
const PAGE_LIMIT: usize = 1000;

/// Upper bound on followed pagination links.
const MAX_PAGES: usize = 20;

/// Facets that steer the search pipeline but are not STAC item properties.
const NON_PROPERTY_FACETS: [&str; 4] = ["type", "project", "latest", "retracted"];

/// Driver for a STAC API index.
pub struct StacIndex {
    repr: String,
    host: String,
    url: String,
    session: CachedSession,
    log: Log,
    items: mini_moka::sync::Cache<String, Arc<serde_json::Value>>,
}

impl StacIndex {
    pub fn new(host: &str, session: CachedSession, log: Log) -> Self {
        Self {
            repr: format!("StacIndex('{host}')"),
            host: host.to_string(),
            url: format!("https://{host}/search"),
            session,
            log,
            items: mini_moka::sync::Cache::builder()
                .max_capacity(16_384)
                .time_to_live(Duration::from_secs(3600))
                .build(),
        }
    }

    /// Build the CQL2 `and`-of-`in` filter for the query facets.
    fn cql2_filter(project: Project, query: &Query) -> Option<serde_json::Value> {
        let prefix = project.as_str().to_lowercase();
        let args: Vec<serde_json::Value> = query
            .iter()
            .filter(|(facet, _)| !NON_PROPERTY_FACETS.contains(facet))
            .map(|(facet, values)| {
                json!({
                    "op": "in",
                    "args": [
                        {"property": format!("properties.{prefix}:{facet}")},
                        values,
                    ],
                })
            })
            .collect();
        if args.is_empty() {
            return None;
        }
        Some(json!({"op": "and", "args": args}))
    }

    async fn item_search(
        &self,
        project: Project,
        query: &Query,
    ) -> Result<Vec<serde_json::Value>> {
        let mut body = json!({
            "collections": [project.as_str().to_lowercase()],
            "limit": PAGE_LIMIT,
        });
        if let Some(filter) = Self::cql2_filter(project, query) {
            body["filter-lang"] = json!("cql2-json");
            body["filter"] = filter;
        }
        let mut features = Vec::new();
        for _ in 0..MAX_PAGES {
            let response = self.session.post_json(&self.url, &body).await?;
            if let Some(page) = response.get("features").and_then(|f| f.as_array()) {
                features.extend(page.iter().cloned());
            }
            // follow POST pagination when the backend offers it
            let next = response
                .get("links")
                .and_then(|l| l.as_array())
                .and_then(|links| {
                    links
                        .iter()
                        .find(|l| l.get("rel").and_then(|r| r.as_str()) == Some("next"))
                })
                .and_then(|l| l.get("body"))
                .cloned();
            match next {
                Some(next_body) => body = next_body,
                None => break,
            }
        }
        if features.is_empty() {
            return Err(EsgfError::NoSearchResults);
        }
        Ok(features)
    }

    /// Item properties with the project namespace prefix stripped.
    fn stripped_properties(project: Project, item: &serde_json::Value) -> HashMap<String, String> {
        let prefix = format!("{}:", project.as_str().to_lowercase());
        let mut props = HashMap::new();
        if let Some(object) = item.get("properties").and_then(|p| p.as_object()) {
            for key in object.keys() {
                if let Some(value) = str_field(&item["properties"], key) {
                    props.insert(key.strip_prefix(&prefix).unwrap_or(key).to_string(), value);
                }
            }
        }
        props
    }

    fn record_from_item(
        &self,
        project: Project,
        item: &serde_json::Value,
    ) -> Option<DatasetRecord> {
        let item_id = item.get("id")?.as_str()?;
        let props = Self::stripped_properties(project, item);
        let id_parts: Vec<&str> = item_id.split('.').collect();
        let names = project.master_id_facets();
        let mut facets = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            if let Some(value) = props.get(*name) {
                facets.insert(name.to_string(), value.clone());
            } else if id_parts.len() == names.len() + 1 {
                // id grammar mirrors the facet order with a version suffix
                facets.insert(name.to_string(), id_parts[i].to_string());
            }
        }
        // CMIP6 items publish the variant under `variant_label`
        if let Some(variant) = project.variant_facet() {
            if !facets.contains_key(variant) {
                if let Some(value) = props.get("variant_label") {
                    facets.insert(variant.to_string(), value.clone());
                }
            }
        }
        if facets.len() != names.len() {
            return None;
        }
        let version = item_id
            .rsplit('.')
            .next()
            .and_then(|v| v.strip_prefix('v'))
            .map(|v| v.to_string())
            .or_else(|| props.get("version").cloned())?;
        let qualified = format!("{item_id}|{}", self.host);
        self.items.insert(qualified.clone(), Arc::new(item.clone()));
        Some(DatasetRecord {
            project: project.as_str().to_string(),
            facets,
            version,
            data_node: Some(self.host.clone()),
            ids: vec![qualified],
        })
    }

    /// Build file records from an item's assets.
    ///
    /// Data assets become one file each, merged by filename; a virtual-zarr
    /// reference asset applies to the whole dataset and is attached to every
    /// file as a streaming alternative. Missing checksum and size never
    /// block the download path.
    fn file_infos_from_item(dataset_id: &str, item: &serde_json::Value) -> Vec<FileInfo> {
        let base: PathBuf = item
            .get("id")
            .and_then(|v| v.as_str())
            .map(|id| id.split('.').collect())
            .unwrap_or_default();
        let Some(assets) = item.get("assets").and_then(|a| a.as_object()) else {
            return Vec::new();
        };
        let mut by_name: HashMap<String, FileInfo> = HashMap::new();
        let mut zarr_urls = Vec::new();
        for (key, asset) in assets {
            let Some(href) = asset.get("href").and_then(|h| h.as_str()) else {
                continue;
            };
            let media_type = asset.get("type").and_then(|t| t.as_str()).unwrap_or("");
            if key == "reference_file" || media_type.contains("zarr") || key.contains("zarr") {
                zarr_urls.push(href.to_string());
                continue;
            }
            let filename = href
                .split('/')
                .next_back()
                .unwrap_or(href)
                .trim_end_matches(".html")
                .to_string();
            if !filename.ends_with(".nc") {
                continue;
            }
            let info = by_name.entry(filename.clone()).or_insert_with(|| {
                let mut info = FileInfo {
                    dataset_id: dataset_id.to_string(),
                    path: base.join(&filename),
                    size: asset.get("file:size").and_then(|s| s.as_u64()),
                    ..Default::default()
                };
                if let Some((start, end)) = extract_time_range(&filename) {
                    info.file_start = Some(start);
                    info.file_end = Some(end);
                }
                info
            });
            if href.starts_with("globus:") {
                info.globus_links.push(href.to_string());
            } else if href.contains("/dodsC/") || key.contains("opendap") {
                info.opendap_urls
                    .push(href.trim_end_matches(".html").to_string());
            } else if href.starts_with("http") {
                info.http_urls.push(href.to_string());
            }
        }
        let mut infos: Vec<FileInfo> = by_name.into_values().collect();
        for info in &mut infos {
            info.virtual_zarr_urls.extend(zarr_urls.iter().cloned());
        }
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        infos
    }
}

#[async_trait]
impl IndexDriver for StacIndex {
    fn name(&self) -> String {
        self.repr.clone()
    }

    async fn search(&self, project: Project, query: &Query) -> Result<Vec<DatasetRecord>> {
        let total_time = Instant::now();
        let features = self.item_search(project, query).await?;
        let records: Vec<DatasetRecord> = features
            .iter()
            .filter_map(|item| self.record_from_item(project, item))
            .collect();
        self.log.info(format!(
            "└─{} results={} total_time={:.2}",
            self.repr,
            records.len(),
            total_time.elapsed().as_secs_f64()
        ))?;
        Ok(records)
    }

    async fn from_tracking_ids(&self, _tracking_ids: &[String]) -> Result<Vec<DatasetRecord>> {
        Err(EsgfError::Unsupported {
            driver: self.name(),
            operation: "from_tracking_ids".to_string(),
        })
    }

    async fn get_file_info(
        &self,
        dataset_ids: &[String],
        _facets: &Query,
    ) -> Result<Vec<FileInfo>> {
        let mut infos = Vec::new();
        for dataset_id in dataset_ids {
            let Some(item) = self.items.get(dataset_id) else {
                continue;
            };
            infos.extend(Self::file_infos_from_item(dataset_id, &item));
        }
        if infos.is_empty() {
            return Err(EsgfError::NoSearchResults);
        }
        self.log
            .info(format!("└─{} results={}", self.repr, infos.len()))?;
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item() -> serde_json::Value {
        json!({
            "id": "CMIP6.CMIP.CCCma.CanESM5.historical.r1i1p1f1.Amon.gpp.gn.v20190429",
            "collection": "cmip6",
            "properties": {
                "cmip6:mip_era": "CMIP6",
                "cmip6:activity_drs": "CMIP",
                "cmip6:institution_id": "CCCma",
                "cmip6:source_id": "CanESM5",
                "cmip6:experiment_id": "historical",
                "cmip6:variant_label": "r1i1p1f1",
                "cmip6:table_id": "Amon",
                "cmip6:variable_id": "gpp",
                "cmip6:grid_label": "gn",
            },
            "assets": {
                "data0001": {
                    "href": "https://dap.ceda.ac.uk/esg/gpp_Amon_CanESM5_historical_r1i1p1f1_gn_185001-201412.nc",
                    "type": "application/netcdf",
                },
                "reference_file": {
                    "href": "https://dap.ceda.ac.uk/kerchunk/gpp_Amon_CanESM5.json",
                    "type": "application/zstd",
                },
            },
        })
    }

    fn driver() -> StacIndex {
        StacIndex::new(
            "api.stac.ceda.ac.uk",
            CachedSession::uncached().unwrap(),
            Log::in_memory(),
        )
    }

    #[test]
    fn test_record_strips_namespace_and_qualifies_id() {
        let stac = driver();
        let record = stac.record_from_item(Project::Cmip6, &item()).unwrap();
        assert_eq!(record.facets["variable_id"], "gpp");
        assert_eq!(record.facets["member_id"], "r1i1p1f1");
        assert_eq!(record.version, "20190429");
        assert_eq!(
            record.ids,
            vec![
                "CMIP6.CMIP.CCCma.CanESM5.historical.r1i1p1f1.Amon.gpp.gn.v20190429|api.stac.ceda.ac.uk"
            ]
        );
    }

    #[test]
    fn test_item_cache_feeds_file_info() {
        let stac = driver();
        let record = stac.record_from_item(Project::Cmip6, &item()).unwrap();
        let cached = stac.items.get(&record.ids[0]).unwrap();
        let infos = StacIndex::file_infos_from_item(&record.ids[0], &cached);
        assert_eq!(infos.len(), 1);
        let info = &infos[0];
        assert_eq!(info.http_urls.len(), 1);
        assert_eq!(info.virtual_zarr_urls.len(), 1);
        // no checksum from this backend; download must still be possible
        assert!(info.checksum.is_none());
        assert!(info.file_start.is_some());
        assert!(info
            .path
            .ends_with("v20190429/gpp_Amon_CanESM5_historical_r1i1p1f1_gn_185001-201412.nc"));
    }

    #[test]
    fn test_cql2_filter_shape() {
        let query = Query::new()
            .facet("variable_id", ["gpp", "mrso"])
            .facet("latest", "true");
        let filter = StacIndex::cql2_filter(Project::Cmip6, &query).unwrap();
        assert_eq!(filter["op"], "and");
        let args = filter["args"].as_array().unwrap();
        // `latest` is not an item property and is skipped
        assert_eq!(args.len(), 1);
        assert_eq!(
            args[0]["args"][0]["property"],
            "properties.cmip6:variable_id"
        );
    }
}
