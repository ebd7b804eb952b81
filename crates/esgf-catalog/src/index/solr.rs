//! The Solr REST index driver.
//!
//! ESGF1-era nodes expose `esg-search/search`, a Solr facade queried with
//! `field=value` parameters and offset/limit pagination. Dataset documents
//! declare their own id grammar through a `%(facet)s` template, which this
//! driver uses to recover facet columns from each id.

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
use std::collections::HashMap;
use std::time::Instant;

/// Documents fetched per page.
const PAGE_LIMIT: usize = 1000;

#[derive(Deserialize)]
struct SolrEnvelope {
    response: SolrResponse,
}

#[derive(Deserialize)]
struct SolrResponse {
    #[serde(rename = "numFound")]
    num_found: usize,
    #[serde(default)]
    docs: Vec<serde_json::Value>,
}

/// Driver for a paginated REST (Solr) index node.
pub struct SolrIndex {
    repr: String,
    url: String,
    distrib: bool,
    session: CachedSession,
    log: Log,
}

impl SolrIndex {
    pub fn new(index_node: &str, distrib: bool, session: CachedSession, log: Log) -> Self {
        Self {
            repr: format!(
                "SolrIndex('{index_node}'{})",
                if distrib { ",distrib=true" } else { "" }
            ),
            url: format!("https://{index_node}/esg-search/search"),
            distrib,
            session,
            log,
        }
    }

    /// Fetch every page of documents matching `params`.
    async fn paged_docs(&self, mut params: Vec<(String, String)>) -> Result<Vec<serde_json::Value>> {
        params.push(("format".to_string(), "application/solr+json".to_string()));
        params.push(("limit".to_string(), PAGE_LIMIT.to_string()));
        params.push(("distrib".to_string(), self.distrib.to_string()));
        let mut docs = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut page = params.clone();
            page.push(("offset".to_string(), offset.to_string()));
            let body = self.session.get_json(&self.url, &page).await?;
            let envelope: SolrEnvelope = serde_json::from_value(body)?;
            let fetched = envelope.response.docs.len();
            docs.extend(envelope.response.docs);
            offset += fetched;
            if fetched == 0 || offset >= envelope.response.num_found {
                break;
            }
        }
        if docs.is_empty() {
            return Err(EsgfError::NoSearchResults);
        }
        Ok(docs)
    }

    /// Build a dataset record from a document's id and id template.
    fn record_from_doc(
        project: Project,
        doc: &serde_json::Value,
        extra_cols: &[String],
    ) -> Option<DatasetRecord> {
        let id = str_field(doc, "id")?;
        let template = str_field(doc, "dataset_id_template_");
        synthesize_record(project, &id, template.as_deref(), doc, extra_cols)
    }
}

#[async_trait]
impl IndexDriver for SolrIndex {
    fn name(&self) -> String {
        self.repr.clone()
    }

    async fn search(&self, project: Project, query: &Query) -> Result<Vec<DatasetRecord>> {
        let total_time = Instant::now();
        let mut params = vec![("type".to_string(), "Dataset".to_string())];
        for (facet, values) in query.iter() {
            params.push((facet.to_string(), values.join(",")));
        }
        let extra_cols = crate::config::get().additional_df_cols;
        let docs = self.paged_docs(params).await?;
        let searched_variables = query.get(project.variable_facet()).map(|v| v.to_vec());
        let mut records = Vec::with_capacity(docs.len());
        for doc in &docs {
            let Some(record) = Self::record_from_doc(project, doc, &extra_cols) else {
                continue;
            };
            // CMIP5-era templates omit the variable facet; those records span
            // several variables and are expanded to one row each.
            if !record.facets.contains_key(project.variable_facet()) {
                let declared = list_field(doc, project.variable_facet());
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
            "└─{} results={} total_time={:.2}",
            self.repr,
            records.len(),
            total_time.elapsed().as_secs_f64()
        ))?;
        Ok(records)
    }

    async fn from_tracking_ids(&self, tracking_ids: &[String]) -> Result<Vec<DatasetRecord>> {
        let params = vec![
            ("type".to_string(), "File".to_string()),
            ("tracking_id".to_string(), tracking_ids.join(",")),
        ];
        let docs = self.paged_docs(params).await?;
        let mut records = Vec::new();
        for doc in &docs {
            let Some(dataset_id) = str_field(doc, "dataset_id") else {
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
        let mut params = vec![
            ("type".to_string(), "File".to_string()),
            ("dataset_id".to_string(), dataset_ids.join(",")),
        ];
        for (facet, values) in facets.iter() {
            params.push((facet.to_string(), values.join(",")));
        }
        let docs = self.paged_docs(params).await?;
        let infos: Vec<FileInfo> = docs.iter().filter_map(file_info_from_doc).collect();
        self.log.info(format!(
            "└─{} results={} response_time={:.2}",
            self.repr,
            infos.len(),
            response_time.elapsed().as_secs_f64()
        ))?;
        Ok(infos)
    }

    async fn facet_counts(
        &self,
        project: Project,
        facets: &[&str],
    ) -> Result<HashMap<String, Vec<String>>> {
        let params = vec![
            ("type".to_string(), "Dataset".to_string()),
            ("project".to_string(), project.as_str().to_string()),
            ("limit".to_string(), "0".to_string()),
            ("format".to_string(), "application/solr+json".to_string()),
            ("facets".to_string(), facets.join(",")),
        ];
        let body = self.session.get_json(&self.url, &params).await?;
        let mut counts = HashMap::new();
        if let Some(fields) = body
            .pointer("/facet_counts/facet_fields")
            .and_then(|v| v.as_object())
        {
            for (facet, values) in fields {
                // Solr facet fields alternate value and count
                let names: Vec<String> = values
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .step_by(2)
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                counts.insert(facet.clone(), names);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn cmip6_doc() -> serde_json::Value {
        json!({
            "id": "CMIP6.CMIP.CCCma.CanESM5.historical.r1i1p1f1.Amon.gpp.gn.v20190429|esgf.ceda.ac.uk",
            "dataset_id_template_": ["%(mip_era)s.%(activity_drs)s.%(institution_id)s.%(source_id)s.%(experiment_id)s.%(member_id)s.%(table_id)s.%(variable_id)s.%(grid_label)s"],
            "retracted": false
        })
    }

    #[test]
    fn test_record_from_doc_uses_template() {
        let doc = cmip6_doc();
        let record = SolrIndex::record_from_doc(Project::Cmip6, &doc, &[]).unwrap();
        assert_eq!(record.facets["source_id"], "CanESM5");
        assert_eq!(record.facets["variable_id"], "gpp");
        assert_eq!(record.version, "20190429");
        assert_eq!(record.data_node.as_deref(), Some("esgf.ceda.ac.uk"));
    }

    #[test]
    fn test_record_falls_back_to_project_facets() {
        let mut doc = cmip6_doc();
        doc.as_object_mut().unwrap().remove("dataset_id_template_");
        let record = SolrIndex::record_from_doc(Project::Cmip6, &doc, &[]).unwrap();
        assert_eq!(record.facets["experiment_id"], "historical");
    }

    #[test]
    fn test_cmip5_record_without_variable_facet() {
        let doc = json!({
            "id": "cmip5.output1.CCCma.CanESM2.historical.mon.atmos.Amon.r1i1p1.v20120718|aims3.llnl.gov",
            "dataset_id_template_": ["cmip5.%(product)s.%(valid_institute)s.%(model)s.%(experiment)s.%(time_frequency)s.%(realm)s.%(cmor_table)s.%(ensemble)s"],
            "variable": ["clw", "tas", "pr"],
        });
        let record = SolrIndex::record_from_doc(Project::Cmip5, &doc, &[]).unwrap();
        // literal `cmip5` segment contributes nothing; valid_institute aliases
        assert_eq!(record.facets["institute"], "CCCma");
        assert_eq!(record.facets["model"], "CanESM2");
        assert_eq!(record.facets["ensemble"], "r1i1p1");
        assert_eq!(record.version, "20120718");
        // the template omits the variable, so the record is expanded later
        assert!(!record.facets.contains_key("variable"));
        let declared = list_field(&doc, "variable");
        let searched = vec!["clw".to_string()];
        let rows = expand_variables(record, "variable", &declared, Some(&searched));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].facets["variable"], "clw");
    }

    #[test]
    fn test_file_info_from_doc() {
        let doc = json!({
            "dataset_id": "CMIP6.CMIP.CCCma.CanESM5.historical.r1i1p1f1.Amon.gpp.gn.v20190429|esgf.ceda.ac.uk",
            "title": "gpp_Amon_CanESM5_historical_r1i1p1f1_gn_185001-201412.nc",
            "checksum": ["abc123"],
            "checksum_type": ["SHA256"],
            "size": 123456,
            "directory_format_template_": ["%(root)s/%(mip_era)s/%(activity_drs)s/%(institution_id)s/%(source_id)s/%(experiment_id)s/%(member_id)s/%(table_id)s/%(variable_id)s/%(grid_label)s/%(version)s"],
            "mip_era": ["CMIP6"],
            "activity_drs": ["CMIP"],
            "institution_id": ["CCCma"],
            "source_id": ["CanESM5"],
            "experiment_id": ["historical"],
            "member_id": ["r1i1p1f1"],
            "table_id": ["Amon"],
            "variable_id": ["gpp"],
            "grid_label": ["gn"],
            "version": "20190429",
            "url": [
                "https://esgf.ceda.ac.uk/thredds/fileServer/f.nc|application/netcdf|HTTPServer",
                "https://esgf.ceda.ac.uk/thredds/dodsC/f.nc.html|application/opendap-html|OPENDAP"
            ],
        });
        let info = file_info_from_doc(&doc).unwrap();
        assert_eq!(info.checksum_type.as_deref(), Some("sha256"));
        assert_eq!(info.size, Some(123456));
        assert_eq!(
            info.path,
            PathBuf::from("CMIP6/CMIP/CCCma/CanESM5/historical/r1i1p1f1/Amon/gpp/gn/v20190429")
                .join("gpp_Amon_CanESM5_historical_r1i1p1f1_gn_185001-201412.nc")
        );
        assert_eq!(info.http_urls.len(), 1);
        assert_eq!(
            info.opendap_urls,
            vec!["https://esgf.ceda.ac.uk/thredds/dodsC/f.nc"]
        );
        assert!(info.file_start.is_some());
    }
}
