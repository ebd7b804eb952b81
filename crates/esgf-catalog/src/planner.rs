//! File access planning.
//!
//! Every file record is routed down a priority ladder: a copy already on
//! disk wins, then a verified streaming URL, then a live bulk endpoint,
//! and HTTPS download is the fallback. The four output classes partition
//! the input exactly.

use crate::cache::CachedSession;
use crate::error::Result;
use crate::index::types::FileInfo;
use crate::logging::Log;
use crate::transfer::{parse_bulk_link, TransferClient};
use std::collections::HashMap;
use std::path::PathBuf;

/// A resolved access route: a local file or a streaming URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOrUrl {
    Local(PathBuf),
    Url(String),
}

impl std::fmt::Display for PathOrUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathOrUrl::Local(path) => write!(f, "{}", path.display()),
            PathOrUrl::Url(url) => write!(f, "{url}"),
        }
    }
}

/// The partition produced by [`AccessPlanner::plan`].
#[derive(Debug, Default)]
pub struct AccessPlan {
    /// Files already present under a data root or cache.
    pub exist: Vec<FileInfo>,
    /// Files resolved to a verified streaming URL.
    pub stream: Vec<FileInfo>,
    /// Files to move via bulk transfer; their `globus_links` are filtered to
    /// live endpoints.
    pub bulk: Vec<FileInfo>,
    /// Files left for HTTPS download.
    pub http: Vec<FileInfo>,
    /// Access routes resolved so far, keyed by catalog key.
    pub paths: HashMap<String, Vec<PathOrUrl>>,
}

impl AccessPlan {
    pub fn len(&self) -> usize {
        self.exist.len() + self.stream.len() + self.bulk.len() + self.http.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partitions file records into access classes.
pub struct AccessPlanner<'a> {
    /// Read-only roots followed by cache roots, probed in order.
    roots: &'a [PathBuf],
    prefer_streaming: bool,
    prefer_bulk: bool,
    session: &'a CachedSession,
    transfer: Option<&'a dyn TransferClient>,
    log: &'a Log,
}

impl<'a> AccessPlanner<'a> {
    pub fn new(
        roots: &'a [PathBuf],
        prefer_streaming: bool,
        prefer_bulk: bool,
        session: &'a CachedSession,
        transfer: Option<&'a dyn TransferClient>,
        log: &'a Log,
    ) -> Self {
        Self {
            roots,
            prefer_streaming,
            prefer_bulk,
            session,
            transfer,
            log,
        }
    }

    /// Classify every record. The classes partition the input: each record
    /// lands in exactly one of exist/stream/bulk/http.
    pub async fn plan(&self, infos: Vec<FileInfo>) -> Result<AccessPlan> {
        let mut plan = AccessPlan::default();
        // endpoint liveness is checked once per unique endpoint
        let mut endpoint_alive: HashMap<String, bool> = HashMap::new();

        for mut info in infos {
            if let Some(local) = self.find_local(&info) {
                self.log.info(format!("accessed {}", local.display()))?;
                plan.paths
                    .entry(info.key.clone())
                    .or_default()
                    .push(PathOrUrl::Local(local));
                plan.exist.push(info);
                continue;
            }

            if self.prefer_streaming {
                if let Some(url) = self.find_stream(&info).await? {
                    self.log.info(format!("streaming {url}"))?;
                    plan.paths
                        .entry(info.key.clone())
                        .or_default()
                        .push(PathOrUrl::Url(url));
                    plan.stream.push(info);
                    continue;
                }
            }

            if self.prefer_bulk {
                if let Some(client) = self.transfer {
                    let live = self
                        .live_bulk_links(&info, client, &mut endpoint_alive)
                        .await?;
                    if !live.is_empty() {
                        info.globus_links = live;
                        plan.bulk.push(info);
                        continue;
                    }
                }
            }

            plan.http.push(info);
        }
        Ok(plan)
    }

    /// The first root holding this file, as an absolute path.
    fn find_local(&self, info: &FileInfo) -> Option<PathBuf> {
        self.roots
            .iter()
            .map(|root| root.join(&info.path))
            .find(|candidate| candidate.is_file())
    }

    /// A streaming URL that answers a HEAD probe. Virtual zarr outranks
    /// OPeNDAP; the first kind present is the only one tried.
    async fn find_stream(&self, info: &FileInfo) -> Result<Option<String>> {
        let candidates = if !info.virtual_zarr_urls.is_empty() {
            &info.virtual_zarr_urls
        } else {
            &info.opendap_urls
        };
        for url in candidates {
            if self.session.head_ok(url).await {
                return Ok(Some(url.clone()));
            }
            self.log.info(format!("unreachable stream {url}"))?;
        }
        Ok(None)
    }

    async fn live_bulk_links(
        &self,
        info: &FileInfo,
        client: &dyn TransferClient,
        endpoint_alive: &mut HashMap<String, bool>,
    ) -> Result<Vec<String>> {
        let mut live = Vec::new();
        for link in &info.globus_links {
            let Some((endpoint, _)) = parse_bulk_link(link) else {
                continue;
            };
            let alive = match endpoint_alive.get(&endpoint) {
                Some(alive) => *alive,
                None => {
                    let alive = client.endpoint_alive(&endpoint).await.unwrap_or(false);
                    if !alive {
                        self.log.info(format!("endpoint down {endpoint}"))?;
                    }
                    endpoint_alive.insert(endpoint.clone(), alive);
                    alive
                }
            };
            if alive {
                live.push(link.clone());
            }
        }
        Ok(live)
    }
}
