//! The federated dataset catalog.
//!
//! A [`Catalog`] fans searches out across every enabled index, reconciles
//! the per-index records into one deduplicated table, lets the user narrow
//! it (`remove_incomplete`, `remove_ensembles`), and finally materializes
//! the selection into local paths or streaming URLs keyed by a synthesized
//! dataset key.

use crate::cache::CachedSession;
use crate::config;
use crate::database::{RateStore, RateWindow};
use crate::download::Downloader;
use crate::error::{EsgfError, Result};
use crate::index::federator::federate;
use crate::index::types::{
    variant_tuple, version_from_id, DatasetRecord, FileInfo, Query,
};
use crate::index::{globus::GlobusIndex, solr::SolrIndex, stac::StacIndex, IndexDriver};
use crate::logging::Log;
use crate::planner::{AccessPlanner, PathOrUrl};
use crate::projects::{self, Project};
use crate::transfer::{BulkCoordinator, TransferClient};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Row counts per model group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelGroup {
    pub model: String,
    pub variant: Option<String>,
    pub grid: Option<String>,
    pub count: usize,
}

/// One variable matched by a free-text [`Catalog::variable_info`] query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub variable: String,
    /// The project's variable-description facets and their values.
    pub facets: BTreeMap<String, String>,
}

/// Options for [`Catalog::to_path_dict`].
#[derive(Clone)]
pub struct PathDictOptions {
    /// Resolve to streaming URLs where a live one exists.
    pub prefer_streaming: bool,
    /// Destination endpoint for bulk transfers; enables the bulk class.
    pub bulk_endpoint: Option<String>,
    /// Destination-relative path for bulk transfers.
    pub bulk_path: Option<String>,
    /// Build keys from the minimal distinguishing facet subset.
    pub minimal_keys: bool,
    /// Facets excluded from key synthesis.
    pub ignore_facets: Vec<String>,
    /// Separator between key facets.
    pub separator: String,
    /// Keep only files overlapping this window, when their extent is known.
    pub file_start: Option<NaiveDate>,
    pub file_end: Option<NaiveDate>,
}

impl Default for PathDictOptions {
    fn default() -> Self {
        Self {
            prefer_streaming: false,
            bulk_endpoint: None,
            bulk_path: None,
            minimal_keys: true,
            ignore_facets: Vec::new(),
            separator: ".".to_string(),
            file_start: None,
            file_end: None,
        }
    }
}

type ConfirmFn = dyn Fn(usize, f64) -> bool + Send + Sync;

/// A federated catalog over the configured index drivers.
pub struct Catalog {
    drivers: Vec<Arc<dyn IndexDriver>>,
    session: CachedSession,
    log: Log,
    db: RateStore,
    esg_dataroot: Vec<PathBuf>,
    local_cache: Vec<PathBuf>,
    /// First writable cache root; downloads land here.
    primary_cache: PathBuf,
    df: Vec<DatasetRecord>,
    project: Option<Project>,
    last_search: Query,
    session_time: DateTime<Utc>,
    num_threads: usize,
    confirm: Option<Arc<ConfirmFn>>,
}

impl Catalog {
    /// Build a catalog from the process-wide configuration.
    pub fn new() -> Result<Self> {
        let conf = config::get();
        let session = CachedSession::open(
            &Self::requests_cache_path(&conf)?,
            conf.requests_cache.expire_after,
        )?;
        let log = Log::open(&conf.logfile)?;
        let mut drivers: Vec<Arc<dyn IndexDriver>> = Vec::new();
        for (node, enabled) in &conf.solr_indices {
            if *enabled {
                drivers.push(Arc::new(SolrIndex::new(
                    node,
                    false,
                    session.clone(),
                    log.clone(),
                )));
            }
        }
        for (id, enabled) in &conf.globus_indices {
            if *enabled {
                drivers.push(Arc::new(GlobusIndex::new(id, session.clone(), log.clone())));
            }
        }
        for (host, enabled) in &conf.stac_indices {
            if *enabled {
                drivers.push(Arc::new(StacIndex::new(host, session.clone(), log.clone())));
            }
        }
        Self::assemble(drivers, session, log)
    }

    /// Build a catalog over explicit drivers, for embedding and tests.
    pub fn with_drivers(drivers: Vec<Arc<dyn IndexDriver>>) -> Result<Self> {
        let conf = config::get();
        let session = CachedSession::open(
            &Self::requests_cache_path(&conf)?,
            conf.requests_cache.expire_after,
        )?;
        let log = Log::open(&conf.logfile)?;
        Self::assemble(drivers, session, log)
    }

    fn assemble(
        drivers: Vec<Arc<dyn IndexDriver>>,
        session: CachedSession,
        log: Log,
    ) -> Result<Self> {
        let conf = config::get();
        let primary_cache = first_writable(&conf.local_cache)
            .ok_or_else(|| EsgfError::LocalCacheNotWritable(conf.local_cache.clone()))?;
        let db = RateStore::open(&conf.download_db)?;
        Ok(Self {
            drivers,
            session,
            log,
            db,
            esg_dataroot: conf.esg_dataroot,
            local_cache: conf.local_cache,
            primary_cache,
            df: Vec::new(),
            project: None,
            last_search: Query::new(),
            session_time: Utc::now(),
            num_threads: conf.num_threads,
            confirm: None,
        })
    }

    fn requests_cache_path(conf: &config::Config) -> Result<PathBuf> {
        let dir = if conf.requests_cache.use_cache_dir {
            first_writable(&conf.local_cache)
                .ok_or_else(|| EsgfError::LocalCacheNotWritable(conf.local_cache.clone()))?
        } else {
            conf.download_db
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
        };
        Ok(dir.join(format!("{}.db", conf.requests_cache.name)))
    }

    /// A new catalog sharing this one's drivers, caches and stores, with an
    /// empty result table. Used by hooks that must search without touching
    /// the current results.
    pub fn clone_empty(&self) -> Self {
        Self {
            drivers: self.drivers.clone(),
            session: self.session.clone(),
            log: self.log.clone(),
            db: self.db.clone(),
            esg_dataroot: self.esg_dataroot.clone(),
            local_cache: self.local_cache.clone(),
            primary_cache: self.primary_cache.clone(),
            df: Vec::new(),
            project: None,
            last_search: Query::new(),
            session_time: Utc::now(),
            num_threads: self.num_threads,
            confirm: self.confirm.clone(),
        }
    }

    /// The current result rows.
    pub fn df(&self) -> &[DatasetRecord] {
        &self.df
    }

    /// Mutable access to the result rows, for manual narrowing.
    pub fn df_mut(&mut self) -> &mut Vec<DatasetRecord> {
        &mut self.df
    }

    /// The project of the current results.
    pub fn project(&self) -> Option<Project> {
        self.project
    }

    /// Callback consulted before HTTPS downloads when `confirm_download` is
    /// configured; receives the file count and total megabytes.
    pub fn on_confirm_download(
        &mut self,
        confirm: impl Fn(usize, f64) -> bool + Send + Sync + 'static,
    ) {
        self.confirm = Some(Arc::new(confirm));
    }

    /// Populate the catalog from search facets.
    pub async fn search(&mut self, query: Query) -> Result<&mut Self> {
        let mut query = query;
        // reject queries spanning projects before spending network time
        if let Some(values) = query.get("project") {
            if values.len() > 1 {
                return Err(EsgfError::MixedProjects(values.to_vec()));
            }
        }
        let project = projects::get(query.first("project").unwrap_or("CMIP6"))?;
        if !query.contains("project") {
            query.insert("project", project.as_str());
        }
        if !query.contains("latest") {
            query.insert("latest", true);
        }
        if !query.contains("retracted") {
            query.insert("retracted", false);
        }

        self.log.info(format!("search begin {query:?}"))?;
        let records = federate(&self.drivers, self.num_threads, &self.log, |driver| {
            let query = query.clone();
            async move { driver.search(project, &query).await }
        })
        .await?;
        self.df = self.reconcile(records)?;
        self.project = Some(project);
        self.last_search = query;
        Ok(self)
    }

    /// Populate the catalog from per-file tracking ids.
    ///
    /// A tracking id should resolve to a single dataset, but buggy
    /// publications exist in the wild; extra rows are reported, not fatal.
    pub async fn from_tracking_ids(&mut self, tracking_ids: Vec<String>) -> Result<&mut Self> {
        let records = federate(&self.drivers, self.num_threads, &self.log, |driver| {
            let ids = tracking_ids.clone();
            async move { driver.from_tracking_ids(&ids).await }
        })
        .await?;
        self.df = self.reconcile(records)?;
        if self.df.len() > tracking_ids.len() {
            self.log.info(format!(
                "{} tracking ids resolved to {} datasets",
                tracking_ids.len(),
                self.df.len()
            ))?;
        }
        self.project = projects::get(&self.df[0].project).ok();
        self.last_search = Query::new();
        Ok(self)
    }

    /// Combine per-driver records into the deduplicated catalog table.
    fn reconcile(&self, records: Vec<DatasetRecord>) -> Result<Vec<DatasetRecord>> {
        if records.is_empty() {
            self.log
                .info("\x1b[36;32msearch end \x1b[91;20mno results\x1b[0m")?;
            return Err(EsgfError::NoSearchResults);
        }
        let found: HashSet<String> = records.iter().map(|r| r.project.clone()).collect();
        if found.len() > 1 {
            let mut projects: Vec<String> = found.into_iter().collect();
            projects.sort();
            return Err(EsgfError::MixedProjects(projects));
        }
        let project = projects::get(&records[0].project)?;
        let master: Vec<&str> = project.master_id_facets().to_vec();
        let variable_facet = project.variable_facet();

        // duplicate (variable, id) pairs contribute nothing
        let mut seen: HashSet<(String, String)> = HashSet::new();
        // group replicas by master-id facets, keeping first-seen order
        let mut order: Vec<Vec<String>> = Vec::new();
        let mut groups: HashMap<Vec<String>, DatasetRecord> = HashMap::new();
        for record in records {
            let variable = record
                .facets
                .get(variable_facet)
                .cloned()
                .unwrap_or_default();
            let mut duplicate = false;
            for id in &record.ids {
                if !seen.insert((variable.clone(), id.clone())) {
                    duplicate = true;
                }
            }
            if duplicate {
                continue;
            }
            let key = record.group_values(&master);
            match groups.get_mut(&key) {
                Some(representative) => representative.ids.extend(record.ids),
                None => {
                    order.push(key.clone());
                    groups.insert(key, record);
                }
            }
        }

        let mut rows = Vec::with_capacity(order.len());
        for key in order {
            let mut row = groups.remove(&key).expect("group inserted above");
            // under distributed `latest=true` two indices can disagree on
            // what the latest version is; keep only the newest
            let max_version = row
                .ids
                .iter()
                .filter_map(|id| version_from_id(id))
                .max()
                .unwrap_or_else(|| row.version.clone());
            row.ids
                .retain(|id| version_from_id(id).as_ref() == Some(&max_version));
            row.version = max_version;
            // the data node lives inside each qualified id now
            row.data_node = None;
            rows.push(row);
        }
        rows.sort_by_key(|row| row.group_values(&master));
        self.log
            .info(format!("\x1b[36;32msearch end\x1b[0m rows={}", rows.len()))?;
        Ok(rows)
    }

    fn require_project(&self) -> Result<Project> {
        self.project.ok_or_else(|| EsgfError::Config {
            message: "no results in the catalog, run search() first".to_string(),
        })
    }

    /// Distinct values per master-id facet.
    pub fn unique(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let project = self.require_project()?;
        let mut out = BTreeMap::new();
        for facet in project.master_id_facets() {
            let mut values: Vec<String> = self
                .df
                .iter()
                .filter_map(|row| row.facets.get(*facet).cloned())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            values.sort();
            out.insert(facet.to_string(), values);
        }
        Ok(out)
    }

    /// Row counts per (model, variant, grid) tuple.
    ///
    /// Variants order by their parsed integer tuple (`r10…` after `r9…`),
    /// not lexically.
    pub fn model_groups(&self) -> Result<Vec<ModelGroup>> {
        let project = self.require_project()?;
        let model_facet = project.model_facet();
        let variant_facet = project.variant_facet();
        let grid_facet = project.grid_facet();
        let mut counts: HashMap<(String, Option<String>, Option<String>), usize> = HashMap::new();
        for row in &self.df {
            let key = (
                row.facets.get(model_facet).cloned().unwrap_or_default(),
                variant_facet.and_then(|f| row.facets.get(f).cloned()),
                grid_facet.and_then(|f| row.facets.get(f).cloned()),
            );
            *counts.entry(key).or_insert(0) += 1;
        }
        let mut groups: Vec<ModelGroup> = counts
            .into_iter()
            .map(|((model, variant, grid), count)| ModelGroup {
                model,
                variant,
                grid,
                count,
            })
            .collect();
        groups.sort_by(|a, b| {
            let variant_key = |g: &ModelGroup| {
                g.variant
                    .as_deref()
                    .and_then(variant_tuple)
                    .unwrap_or((u32::MAX, u32::MAX, u32::MAX, u32::MAX))
            };
            (a.model.to_lowercase(), variant_key(a), a.grid.clone()).cmp(&(
                b.model.to_lowercase(),
                variant_key(b),
                b.grid.clone(),
            ))
        });
        Ok(groups)
    }

    /// Drop model groups the predicate rejects.
    pub fn remove_incomplete(
        &mut self,
        complete: impl Fn(&[DatasetRecord]) -> bool,
    ) -> Result<&mut Self> {
        let project = self.require_project()?;
        let facets = project.modelgroup_facets();
        let mut grouped: HashMap<Vec<String>, Vec<DatasetRecord>> = HashMap::new();
        let mut order = Vec::new();
        for row in self.df.drain(..) {
            let key = row.group_values(&facets);
            if !grouped.contains_key(&key) {
                order.push(key.clone());
            }
            grouped.entry(key).or_default().push(row);
        }
        for key in order {
            let rows = grouped.remove(&key).expect("group inserted above");
            if complete(&rows) {
                self.df.extend(rows);
            }
        }
        Ok(self)
    }

    /// For each (model, grid), keep only the numerically smallest variant.
    pub fn remove_ensembles(&mut self) -> Result<&mut Self> {
        let project = self.require_project()?;
        let Some(variant_facet) = project.variant_facet() else {
            return Ok(self);
        };
        let model_facet = project.model_facet();
        let grid_facet = project.grid_facet();
        let mut smallest: HashMap<(String, Option<String>), (u32, u32, u32, u32)> = HashMap::new();
        for row in &self.df {
            let key = (
                row.facets.get(model_facet).cloned().unwrap_or_default(),
                grid_facet.and_then(|f| row.facets.get(f).cloned()),
            );
            let Some(tuple) = row.facets.get(variant_facet).and_then(|v| variant_tuple(v))
            else {
                continue;
            };
            smallest
                .entry(key)
                .and_modify(|best| *best = (*best).min(tuple))
                .or_insert(tuple);
        }
        self.df.retain(|row| {
            let key = (
                row.facets.get(model_facet).cloned().unwrap_or_default(),
                grid_facet.and_then(|f| row.facets.get(f).cloned()),
            );
            match (
                smallest.get(&key),
                row.facets.get(variant_facet).and_then(|v| variant_tuple(v)),
            ) {
                (Some(best), Some(tuple)) => tuple == *best,
                _ => true,
            }
        });
        Ok(self)
    }

    /// Synthesize one key per row.
    ///
    /// In minimal mode only facets taking more than one distinct value
    /// across the catalog participate; an empty subset falls back to the
    /// variable facet.
    fn synthesize_keys(
        &self,
        minimal: bool,
        ignore_facets: &[String],
        separator: &str,
    ) -> Result<Vec<String>> {
        let project = self.require_project()?;
        let mut columns: Vec<&str> = project
            .master_id_facets()
            .iter()
            .filter(|f| !ignore_facets.iter().any(|ig| ig == *f))
            .copied()
            .collect();
        if minimal {
            columns.retain(|facet| {
                let values: HashSet<&str> = self
                    .df
                    .iter()
                    .filter_map(|row| row.facets.get(*facet).map(|v| v.as_str()))
                    .collect();
                values.len() > 1
            });
            if columns.is_empty() {
                columns.push(project.variable_facet());
            }
        }
        Ok(self
            .df
            .iter()
            .map(|row| row.group_values(&columns).join(separator))
            .collect())
    }

    /// Resolve every row to local paths or streaming URLs.
    ///
    /// Pass a [`TransferClient`] to enable the bulk class named by
    /// `options.bulk_endpoint`; without one, bulk candidates fall back to
    /// HTTPS download.
    pub async fn to_path_dict(
        &self,
        transfer: Option<&dyn TransferClient>,
        options: PathDictOptions,
    ) -> Result<HashMap<String, Vec<PathOrUrl>>> {
        let project = self.require_project()?;
        if self.df.is_empty() {
            return Err(EsgfError::NoSearchResults);
        }
        let conf = config::get();
        let keys =
            self.synthesize_keys(options.minimal_keys, &options.ignore_facets, &options.separator)?;

        // only the variable facet of the last search passes through, enough
        // to split CMIP5 dataset-wide file lists without over-constraining
        // replica lookups
        let mut passthrough = Query::new();
        if let Some(values) = self.last_search.get(project.variable_facet()) {
            passthrough.insert(project.variable_facet(), values.to_vec());
        }

        let mut merged: HashMap<PathBuf, FileInfo> = HashMap::new();
        for (row, key) in self.df.iter().zip(&keys) {
            let infos = federate(&self.drivers, self.num_threads, &self.log, |driver| {
                let ids = row.ids.clone();
                let passthrough = passthrough.clone();
                async move { driver.get_file_info(&ids, &passthrough).await }
            })
            .await?;
            for mut info in infos {
                if !info.overlaps(options.file_start, options.file_end) {
                    continue;
                }
                info.key = key.clone();
                match merged.entry(info.path.clone()) {
                    std::collections::hash_map::Entry::Occupied(mut slot) => {
                        slot.get_mut().merge(info);
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(info);
                    }
                }
            }
        }

        let roots: Vec<PathBuf> = self
            .esg_dataroot
            .iter()
            .chain(self.local_cache.iter())
            .cloned()
            .collect();
        let planner = AccessPlanner::new(
            &roots,
            options.prefer_streaming,
            options.bulk_endpoint.is_some(),
            &self.session,
            transfer,
            &self.log,
        );
        let plan = planner.plan(merged.into_values().collect()).await?;
        let mut paths = plan.paths;

        let mut http = plan.http;
        if conf.confirm_download && !http.is_empty() {
            let total_mb: f64 = http.iter().filter_map(|i| i.size).sum::<u64>() as f64 * 1e-6;
            let accepted = match &self.confirm {
                Some(confirm) => confirm(http.len(), total_mb),
                None => true,
            };
            self.log.info(format!(
                "download of {} files ({total_mb:.1} [Mb]) {}",
                http.len(),
                if accepted { "confirmed" } else { "declined" }
            ))?;
            if !accepted {
                http.clear();
            }
        }

        if !http.is_empty() {
            let downloader = Downloader::new(
                self.db.clone(),
                roots.clone(),
                self.primary_cache.clone(),
                conf.slow_download_threshold,
                self.log.clone(),
            )?;
            for resolved in downloader.download_all(http, self.num_threads).await {
                if let Some((key, local)) = resolved {
                    paths.entry(key).or_default().push(PathOrUrl::Local(local));
                }
            }
        }

        if let (Some(endpoint), Some(client)) = (&options.bulk_endpoint, transfer) {
            if !plan.bulk.is_empty() {
                let destination = options.bulk_path.as_deref().unwrap_or("");
                BulkCoordinator::new(client, &self.db, &self.log)
                    .transfer(&plan.bulk, endpoint, destination)
                    .await?;
                // the transferred files should now be visible under a root
                for info in &plan.bulk {
                    if let Some(local) = roots
                        .iter()
                        .map(|root| root.join(&info.path))
                        .find(|p| p.is_file())
                    {
                        paths
                            .entry(info.key.clone())
                            .or_default()
                            .push(PathOrUrl::Local(local));
                    }
                }
            }
        }

        let missing: Vec<String> = {
            let mut missing: Vec<String> = keys
                .iter()
                .filter(|key| !paths.contains_key(*key))
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            missing.sort();
            missing
        };
        if !missing.is_empty() {
            if conf.print_log_on_error {
                if let Ok(log) = self.session_log() {
                    eprintln!("{log}");
                }
            }
            if conf.break_on_error {
                return Err(EsgfError::MissingFileInfo(missing));
            }
            warn!("unable to resolve paths for keys: {missing:?}");
        }
        for resolved in paths.values_mut() {
            resolved.sort_by_key(|p| p.to_string());
        }
        Ok(paths)
    }

    /// Open every resolved key with a caller-supplied reader.
    ///
    /// The reader receives the key, its access routes, and the row's
    /// identity facets to merge as fallback attributes. Reader failures
    /// follow `break_on_error`: raise [`EsgfError::DatasetInitError`] or
    /// warn and return the datasets that did open. `measures` runs on each
    /// opened dataset (the cell-measure enrichment seam).
    pub async fn to_dataset_dict<D>(
        &self,
        transfer: Option<&dyn TransferClient>,
        options: PathDictOptions,
        opener: impl Fn(&str, &[PathOrUrl], &HashMap<String, String>) -> Result<D>,
        measures: Option<&dyn Fn(&str, D) -> Result<D>>,
    ) -> Result<HashMap<String, D>> {
        let keys = self.synthesize_keys(
            options.minimal_keys,
            &options.ignore_facets,
            &options.separator,
        )?;
        let attrs_by_key: HashMap<&String, &DatasetRecord> =
            keys.iter().zip(self.df.iter()).collect();
        let paths = self.to_path_dict(transfer, options).await?;

        let mut datasets = HashMap::new();
        let mut failed = Vec::new();
        for (key, routes) in &paths {
            let attrs = attrs_by_key
                .get(key)
                .map(|row| row.facets.clone())
                .unwrap_or_default();
            match opener(key, routes, &attrs) {
                Ok(dataset) => {
                    let dataset = match measures {
                        Some(enrich) => enrich(key, dataset)?,
                        None => dataset,
                    };
                    datasets.insert(key.clone(), dataset);
                }
                Err(e) => {
                    self.log.info(format!("dataset init failed {key}: {e}"))?;
                    failed.push(key.clone());
                }
            }
        }
        if !failed.is_empty() {
            failed.sort();
            let conf = config::get();
            if conf.print_log_on_error {
                if let Ok(log) = self.session_log() {
                    eprintln!("{log}");
                }
            }
            if conf.break_on_error {
                return Err(EsgfError::DatasetInitError(failed));
            }
            warn!("the reader failed to open keys: {failed:?}");
        }
        Ok(datasets)
    }

    /// The log records this session produced.
    pub fn session_log(&self) -> Result<String> {
        self.log.read_since(self.session_time)
    }

    /// Per-host transfer statistics from the download database.
    pub fn download_summary(
        &self,
        window: RateWindow,
        min_size_mb: f64,
    ) -> Result<Vec<crate::database::HostRate>> {
        self.db.summary(window, min_size_mb)
    }

    /// Free-text search over the variable facet's vocabulary.
    ///
    /// Query tokens match case-insensitively against the facet bucket
    /// values of the first driver that exposes them; each match is joined
    /// with the project's variable-description facets.
    pub async fn variable_info(&self, query: &str) -> Result<Vec<VariableInfo>> {
        let project = self.project.unwrap_or(Project::Cmip6);
        let variable_facet = project.variable_facet();
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();

        let mut buckets = None;
        for driver in &self.drivers {
            match driver.facet_counts(project, &[variable_facet]).await {
                Ok(counts) => {
                    buckets = Some(counts);
                    break;
                }
                Err(EsgfError::Unsupported { .. }) => continue,
                Err(e) if e.is_transport() => continue,
                Err(e) => return Err(e),
            }
        }
        let buckets = buckets.ok_or(EsgfError::NoSearchResults)?;
        let matched: Vec<String> = buckets
            .get(variable_facet)
            .map(|values| {
                values
                    .iter()
                    .filter(|value| {
                        let lower = value.to_lowercase();
                        tokens.iter().any(|t| lower.contains(t))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if matched.is_empty() {
            return Err(EsgfError::NoSearchResults);
        }

        let search = Query::new()
            .facet("project", project.as_str())
            .facet("latest", true)
            .facet("retracted", false)
            .facet(variable_facet, matched);
        let records = federate(&self.drivers, self.num_threads, &self.log, |driver| {
            let search = search.clone();
            async move { driver.search(project, &search).await }
        })
        .await?;

        let mut rows: BTreeMap<String, VariableInfo> = BTreeMap::new();
        for record in records {
            let Some(variable) = record.facets.get(variable_facet) else {
                continue;
            };
            rows.entry(variable.clone()).or_insert_with(|| VariableInfo {
                variable: variable.clone(),
                facets: project
                    .variable_description_facets()
                    .iter()
                    .filter_map(|f| record.facets.get(*f).map(|v| (f.to_string(), v.clone())))
                    .collect(),
            });
        }
        Ok(rows.into_values().collect())
    }
}

/// The first root we can actually write into, created on demand.
fn first_writable(paths: &[PathBuf]) -> Option<PathBuf> {
    for path in paths {
        if std::fs::create_dir_all(path).is_err() {
            continue;
        }
        let probe = path.join(".write_test");
        if std::fs::write(&probe, b"").is_ok() {
            let _ = std::fs::remove_file(&probe);
            return Some(path.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigPatch, TEST_LOCK};
    use tempfile::TempDir;

    fn scoped_config(dir: &TempDir) -> crate::config::ConfigGuard {
        config::set(
            ConfigPatch::new()
                .local_cache(vec![dir.path().join("cache")])
                .esg_dataroot(vec![dir.path().join("dataroot")])
                .download_db(dir.path().join("download.db"))
                .logfile(dir.path().join("esgf.log"))
                .num_threads(2),
        )
    }

    fn catalog() -> Catalog {
        Catalog::with_drivers(vec![]).unwrap()
    }

    fn row(
        source_id: &str,
        experiment_id: &str,
        member_id: &str,
        variable_id: &str,
        version: &str,
        node: &str,
    ) -> DatasetRecord {
        let facets: HashMap<String, String> = [
            ("mip_era", "CMIP6"),
            ("activity_drs", "CMIP"),
            ("institution_id", "X"),
            ("source_id", source_id),
            ("experiment_id", experiment_id),
            ("member_id", member_id),
            ("table_id", "Lmon"),
            ("variable_id", variable_id),
            ("grid_label", "gn"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let id = format!(
            "CMIP6.CMIP.X.{source_id}.{experiment_id}.{member_id}.Lmon.{variable_id}.gn.v{version}|{node}"
        );
        DatasetRecord {
            project: "CMIP6".to_string(),
            facets,
            version: version.to_string(),
            data_node: Some(node.to_string()),
            ids: vec![id],
        }
    }

    /// The 12-row frame of the smoke scenario: CanESM5 publishes both
    /// variables for both experiments and members, CESM2 only half.
    fn smoke_rows() -> Vec<DatasetRecord> {
        let mut rows = Vec::new();
        for variable in ["gpp", "mrso"] {
            for experiment in ["historical", "ssp585"] {
                for member in ["r1i1p1f1", "r2i1p1f1"] {
                    rows.push(row("CanESM5", experiment, member, variable, "20190429", "n1"));
                }
            }
        }
        for variable in ["gpp", "mrso"] {
            rows.push(row("CESM2", "historical", "r1i1p1f1", variable, "20190308", "n1"));
            rows.push(row("CESM2", "ssp585", "r2i1p1f1", variable, "20190308", "n1"));
        }
        rows
    }

    #[test]
    fn test_reconcile_collapses_replicas_and_versions() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let _guard = scoped_config(&dir);
        let cat = catalog();

        let records = vec![
            row("CanESM5", "historical", "r1i1p1f1", "gpp", "20190306", "esgf.ceda.ac.uk"),
            row("CanESM5", "historical", "r1i1p1f1", "gpp", "20190429", "esgf-data.dkrz.de"),
            row("CanESM5", "historical", "r1i1p1f1", "gpp", "20190429", "aims3.llnl.gov"),
        ];
        let rows = cat.reconcile(records).unwrap();
        assert_eq!(rows.len(), 1);
        // only the newest version's replicas survive
        assert_eq!(rows[0].version, "20190429");
        assert_eq!(rows[0].ids.len(), 2);
        assert!(rows[0].ids.iter().all(|id| id.contains(".v20190429|")));
        assert!(rows[0].data_node.is_none());
    }

    #[test]
    fn test_reconcile_drops_duplicate_variable_id_pairs() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let _guard = scoped_config(&dir);
        let cat = catalog();

        let a = row("CanESM5", "historical", "r1i1p1f1", "gpp", "20190429", "n1");
        let rows = cat.reconcile(vec![a.clone(), a]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ids.len(), 1);
    }

    #[test]
    fn test_reconcile_rejects_mixed_projects() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let _guard = scoped_config(&dir);
        let cat = catalog();

        let mut cmip5 = row("CanESM2", "historical", "r1i1p1", "clw", "20120718", "n1");
        cmip5.project = "CMIP5".to_string();
        let cmip6 = row("CanESM5", "historical", "r1i1p1f1", "gpp", "20190429", "n1");
        let result = cat.reconcile(vec![cmip5, cmip6]);
        assert!(matches!(result, Err(EsgfError::MixedProjects(_))));
    }

    #[test]
    fn test_reconcile_empty_is_no_results() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let _guard = scoped_config(&dir);
        let cat = catalog();
        assert!(matches!(
            cat.reconcile(vec![]),
            Err(EsgfError::NoSearchResults)
        ));
    }

    #[test]
    fn test_smoke_filters() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let _guard = scoped_config(&dir);
        let mut cat = catalog();
        cat.project = Some(Project::Cmip6);
        cat.df = smoke_rows();
        assert_eq!(cat.df.len(), 12);
        assert_eq!(cat.model_groups().unwrap().len(), 4);

        // a complete group carries all 4 (variable, experiment) combinations
        cat.remove_incomplete(|rows| rows.len() == 4).unwrap();
        assert_eq!(cat.df.len(), 8);
        assert_eq!(cat.model_groups().unwrap().len(), 2);

        cat.remove_ensembles().unwrap();
        assert_eq!(cat.df.len(), 4);
        let groups = cat.model_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].variant.as_deref(), Some("r1i1p1f1"));
    }

    #[test]
    fn test_model_groups_sorted_by_variant_tuple() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let _guard = scoped_config(&dir);
        let mut cat = catalog();
        cat.project = Some(Project::Cmip6);
        cat.df = vec![
            row("CESM2", "historical", "r10i1p1f1", "gpp", "20190308", "n1"),
            row("CESM2", "historical", "r4i1p1f1", "gpp", "20190308", "n1"),
            row("CESM2", "historical", "r1i1p1f1", "gpp", "20190308", "n1"),
        ];
        let groups = cat.model_groups().unwrap();
        // r4 sorts before r10 in spite of lexical order
        assert_eq!(groups[0].variant.as_deref(), Some("r1i1p1f1"));
        assert_eq!(groups[1].variant.as_deref(), Some("r4i1p1f1"));
        assert_eq!(groups[2].variant.as_deref(), Some("r10i1p1f1"));
    }

    #[test]
    fn test_boundary_filters_are_identity() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let _guard = scoped_config(&dir);
        let mut cat = catalog();
        cat.project = Some(Project::Cmip6);
        // a single model group is left unchanged by remove_ensembles
        cat.df = vec![
            row("CanESM5", "historical", "r1i1p1f1", "gpp", "20190429", "n1"),
            row("CanESM5", "historical", "r1i1p1f1", "mrso", "20190429", "n1"),
        ];
        cat.remove_ensembles().unwrap();
        assert_eq!(cat.df.len(), 2);
        // an always-true predicate is the identity
        cat.remove_incomplete(|_| true).unwrap();
        assert_eq!(cat.df.len(), 2);
    }

    #[test]
    fn test_unique_values() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let _guard = scoped_config(&dir);
        let mut cat = catalog();
        cat.project = Some(Project::Cmip6);
        cat.df = smoke_rows();
        let unique = cat.unique().unwrap();
        assert_eq!(unique["source_id"], vec!["CESM2", "CanESM5"]);
        assert_eq!(unique["variable_id"], vec!["gpp", "mrso"]);
    }

    #[test]
    fn test_synthesize_keys_minimal_and_full() {
        let _lock = TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let _guard = scoped_config(&dir);
        let mut cat = catalog();
        cat.project = Some(Project::Cmip6);
        cat.df = vec![
            row("CanESM5", "historical", "r1i1p1f1", "gpp", "20190429", "n1"),
            row("CanESM5", "historical", "r1i1p1f1", "mrso", "20190429", "n1"),
        ];
        // only the variable facet differs
        let keys = cat.synthesize_keys(true, &[], ".").unwrap();
        assert_eq!(keys, vec!["gpp", "mrso"]);

        // ignoring it leaves no distinguishing facet: fall back to variable
        let keys = cat
            .synthesize_keys(true, &["variable_id".to_string()], ".")
            .unwrap();
        assert_eq!(keys, vec!["gpp", "mrso"]);

        // full keys carry every master facet
        let keys = cat.synthesize_keys(false, &[], "/").unwrap();
        assert!(keys[0].starts_with("CMIP6/CMIP/X/CanESM5/historical/r1i1p1f1/Lmon/gpp"));

        // identical rows except variable: one distinct key each
        let distinct: HashSet<&String> = keys.iter().collect();
        assert_eq!(distinct.len(), 2);
    }

    #[test]
    fn test_first_writable_skips_read_only() {
        let dir = TempDir::new().unwrap();
        let missing = PathBuf::from("/proc/definitely-not-writable/cache");
        let good = dir.path().join("cache");
        let found = first_writable(&[missing, good.clone()]).unwrap();
        assert_eq!(found, good);
        assert!(first_writable(&[PathBuf::from("/proc/nope/cache")]).is_none());
    }
}
