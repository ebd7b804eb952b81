//! Process-wide configuration.
//!
//! Settings live in a single global [`Config`] snapshot. Callers change them
//! through [`set`], which applies a [`ConfigPatch`] and returns a guard that
//! restores the previous snapshot when dropped, so overrides nest:
//!
//! ```rust
//! use esgf_catalog::config::{self, ConfigPatch};
//!
//! let _guard = config::set(ConfigPatch::new().num_threads(2).break_on_error(false));
//! assert_eq!(config::get().num_threads, 2);
//! drop(_guard); // prior settings restored
//! ```

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

/// Expiry policy for the request cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CacheExpiry {
    /// Bypass the cache entirely.
    DoNotCache,
    /// Store but treat every entry as already stale.
    ExpireImmediately,
    /// Entries never expire.
    NeverExpire,
    /// Entries expire after the given duration.
    After(Duration),
}

/// Settings for the process-wide request cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestsCacheConfig {
    pub expire_after: CacheExpiry,
    /// Basename of the cache database file.
    pub name: String,
    /// Place the database under the primary local cache directory rather
    /// than alongside the download database.
    pub use_cache_dir: bool,
}

impl Default for RequestsCacheConfig {
    fn default() -> Self {
        Self {
            expire_after: CacheExpiry::After(Duration::from_secs(3600)),
            name: "requests_cache".to_string(),
            use_cache_dir: true,
        }
    }
}

/// The configuration snapshot governing catalog behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Globus Search indices, id -> enabled.
    pub globus_indices: BTreeMap<String, bool>,
    /// Solr REST indices, hostname -> enabled.
    pub solr_indices: BTreeMap<String, bool>,
    /// STAC indices, hostname -> enabled.
    pub stac_indices: BTreeMap<String, bool>,
    /// Read-only locations checked for data already on this system.
    pub esg_dataroot: Vec<PathBuf>,
    /// Read/write cache locations; the first writable entry receives
    /// downloads, the rest are read-only fallbacks.
    pub local_cache: Vec<PathBuf>,
    /// Request-cache settings shared by every driver session.
    pub requests_cache: RequestsCacheConfig,
    /// Location of the download-rate database.
    pub download_db: PathBuf,
    /// Location of the session logfile.
    pub logfile: PathBuf,
    /// Worker-pool width for searches and downloads.
    pub num_threads: usize,
    /// Raise on partial failures instead of warning and returning what we have.
    pub break_on_error: bool,
    /// Require confirmation before starting HTTPS downloads.
    pub confirm_download: bool,
    /// Abandon a link whose mean rate falls below this many Mb/s; 0 disables.
    pub slow_download_threshold: f64,
    /// Facets to surface as extra catalog columns when the index returns them.
    pub additional_df_cols: Vec<String>,
    /// Dump the session log to stderr when an operation fails.
    pub print_log_on_error: bool,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("esgf-catalog");
        Self {
            globus_indices: BTreeMap::from([
                ("anl-dev".to_string(), true),
                ("ornl-dev".to_string(), true),
            ]),
            solr_indices: BTreeMap::from(
                [
                    "esgf.ceda.ac.uk",
                    "esgf-data.dkrz.de",
                    "esgf-node.ipsl.upmc.fr",
                    "esg-dn1.nsc.liu.se",
                    "esgf-node.llnl.gov",
                    "esgf.nci.org.au",
                    "esgf-node.ornl.gov",
                ]
                .map(|n| (n.to_string(), false)),
            ),
            stac_indices: BTreeMap::from([("api.stac.ceda.ac.uk".to_string(), false)]),
            esg_dataroot: vec![
                PathBuf::from("/p/css03/esgf_publish"),
                PathBuf::from("/eagle/projects/ESGF2/esg_dataroot"),
                PathBuf::from("/global/cfs/projectdirs/m3522/cmip6"),
            ],
            local_cache: vec![home.join(".esgf")],
            requests_cache: RequestsCacheConfig::default(),
            download_db: config_dir.join("download.db"),
            logfile: config_dir.join("esgf.log"),
            num_threads: 6,
            break_on_error: true,
            confirm_download: false,
            slow_download_threshold: 0.0,
            additional_df_cols: Vec::new(),
            print_log_on_error: false,
        }
    }
}

/// A set of pending configuration changes.
///
/// Unset fields leave the current value untouched. Index toggles are merged
/// into whichever backend table contains the key; `all_indices` and
/// `no_indices` flip the Globus and Solr tables wholesale but never STAC.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    indices: BTreeMap<String, bool>,
    all_indices: bool,
    no_indices: bool,
    esg_dataroot: Option<Vec<PathBuf>>,
    local_cache: Option<Vec<PathBuf>>,
    requests_cache: Option<RequestsCacheConfig>,
    download_db: Option<PathBuf>,
    logfile: Option<PathBuf>,
    num_threads: Option<usize>,
    break_on_error: Option<bool>,
    confirm_download: Option<bool>,
    slow_download_threshold: Option<f64>,
    additional_df_cols: Option<Vec<String>>,
    print_log_on_error: Option<bool>,
}

impl ConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a single index by id.
    pub fn index(mut self, id: impl Into<String>, enabled: bool) -> Self {
        self.indices.insert(id.into(), enabled);
        self
    }

    /// Enable every Globus and Solr index.
    pub fn all_indices(mut self) -> Self {
        self.all_indices = true;
        self
    }

    /// Disable every Globus and Solr index.
    pub fn no_indices(mut self) -> Self {
        self.no_indices = true;
        self
    }

    pub fn esg_dataroot(mut self, roots: Vec<PathBuf>) -> Self {
        self.esg_dataroot = Some(roots);
        self
    }

    pub fn local_cache(mut self, caches: Vec<PathBuf>) -> Self {
        self.local_cache = Some(caches);
        self
    }

    pub fn requests_cache(mut self, rc: RequestsCacheConfig) -> Self {
        self.requests_cache = Some(rc);
        self
    }

    pub fn download_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_db = Some(path.into());
        self
    }

    pub fn logfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.logfile = Some(path.into());
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n.max(1));
        self
    }

    pub fn break_on_error(mut self, b: bool) -> Self {
        self.break_on_error = Some(b);
        self
    }

    pub fn confirm_download(mut self, b: bool) -> Self {
        self.confirm_download = Some(b);
        self
    }

    pub fn slow_download_threshold(mut self, mb_per_s: f64) -> Self {
        self.slow_download_threshold = Some(mb_per_s.max(0.0));
        self
    }

    pub fn additional_df_cols(mut self, cols: Vec<String>) -> Self {
        self.additional_df_cols = Some(cols);
        self
    }

    pub fn print_log_on_error(mut self, b: bool) -> Self {
        self.print_log_on_error = Some(b);
        self
    }

    fn apply(self, conf: &mut Config) {
        for (key, enabled) in &self.indices {
            for table in [
                &mut conf.globus_indices,
                &mut conf.solr_indices,
                &mut conf.stac_indices,
            ] {
                if let Some(slot) = table.get_mut(key) {
                    *slot = *enabled;
                }
            }
        }
        if self.no_indices {
            conf.globus_indices.values_mut().for_each(|v| *v = false);
            conf.solr_indices.values_mut().for_each(|v| *v = false);
        }
        if self.all_indices {
            conf.globus_indices.values_mut().for_each(|v| *v = true);
            conf.solr_indices.values_mut().for_each(|v| *v = true);
        }
        if let Some(v) = self.esg_dataroot {
            conf.esg_dataroot = v;
        }
        if let Some(v) = self.local_cache {
            conf.local_cache = v;
        }
        if let Some(v) = self.requests_cache {
            conf.requests_cache = v;
        }
        if let Some(v) = self.download_db {
            conf.download_db = v;
        }
        if let Some(v) = self.logfile {
            conf.logfile = v;
        }
        if let Some(v) = self.num_threads {
            conf.num_threads = v;
        }
        if let Some(v) = self.break_on_error {
            conf.break_on_error = v;
        }
        if let Some(v) = self.confirm_download {
            conf.confirm_download = v;
        }
        if let Some(v) = self.slow_download_threshold {
            conf.slow_download_threshold = v;
        }
        if let Some(v) = self.additional_df_cols {
            conf.additional_df_cols = v;
        }
        if let Some(v) = self.print_log_on_error {
            conf.print_log_on_error = v;
        }
    }
}

static CONF: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));

/// Serializes tests that touch the process-wide configuration.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Return a snapshot of the current configuration.
pub fn get() -> Config {
    CONF.read().expect("config lock poisoned").clone()
}

/// Apply a patch to the process-wide configuration.
///
/// The returned guard restores the prior snapshot when dropped. Hold it for
/// scoped overrides, or `std::mem::forget` it to make the change permanent.
#[must_use = "dropping the guard immediately reverts the configuration"]
pub fn set(patch: ConfigPatch) -> ConfigGuard {
    let mut conf = CONF.write().expect("config lock poisoned");
    let snapshot = conf.clone();
    patch.apply(&mut conf);
    ConfigGuard {
        snapshot: Some(snapshot),
    }
}

/// Restore the frozen defaults, discarding every prior override.
pub fn reset() {
    *CONF.write().expect("config lock poisoned") = Config::default();
}

/// Restores the prior configuration snapshot on drop.
#[derive(Debug)]
pub struct ConfigGuard {
    snapshot: Option<Config>,
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *CONF.write().expect("config lock poisoned") = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_override_restores() {
        let _lock = TEST_LOCK.lock().unwrap();
        let before = get().num_threads;
        {
            let _guard = set(ConfigPatch::new().num_threads(2));
            assert_eq!(get().num_threads, 2);
            {
                let _inner = set(ConfigPatch::new().num_threads(12));
                assert_eq!(get().num_threads, 12);
            }
            assert_eq!(get().num_threads, 2);
        }
        assert_eq!(get().num_threads, before);
    }

    #[test]
    fn test_index_merge_targets_matching_table() {
        let _lock = TEST_LOCK.lock().unwrap();
        let _guard = set(ConfigPatch::new().index("esgf-node.ornl.gov", true));
        let conf = get();
        assert!(conf.solr_indices["esgf-node.ornl.gov"]);
        // Globus table untouched by a Solr key
        assert!(conf.globus_indices["anl-dev"]);
    }

    #[test]
    fn test_bulk_toggles_never_touch_stac() {
        let _lock = TEST_LOCK.lock().unwrap();
        let _guard = set(
            ConfigPatch::new()
                .index("api.stac.ceda.ac.uk", true)
                .no_indices(),
        );
        let conf = get();
        assert!(conf.globus_indices.values().all(|v| !v));
        assert!(conf.solr_indices.values().all(|v| !v));
        assert!(conf.stac_indices["api.stac.ceda.ac.uk"]);
    }

    #[test]
    fn test_num_threads_floor() {
        let _lock = TEST_LOCK.lock().unwrap();
        let _guard = set(ConfigPatch::new().num_threads(0));
        assert_eq!(get().num_threads, 1);
    }
}
