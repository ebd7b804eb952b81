//! Bulk server-to-server transfers.
//!
//! The OAuth handshake and the concrete transfer service live outside this
//! crate; the catalog drives them through [`TransferClient`]. The
//! coordinator batches files by source endpoint (fewest tasks first),
//! submits one task per endpoint, and polls every task to a terminal state
//! before returning, feeding synthetic rate measurements back into the
//! download database.

use crate::database::RateStore;
use crate::error::{EsgfError, Result};
use crate::index::types::FileInfo;
use crate::logging::Log;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Terminal and non-terminal states of a bulk transfer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Still queued or moving bytes.
    Active,
    Succeeded,
    /// Any non-success terminal state, with the raw task document.
    Failed(String),
}

/// One submitted batch: every (source, destination) pair routed through a
/// single source endpoint.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub source_endpoint: String,
    pub destination_endpoint: String,
    /// Pairs of source-relative and destination-relative paths.
    pub items: Vec<(String, String)>,
}

/// The seam to an authorized transfer service client.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Whether the endpoint answers; used to filter candidate sources and to
    /// validate the user-supplied destination.
    async fn endpoint_alive(&self, endpoint: &str) -> Result<bool>;

    /// Submit a task, returning its id.
    async fn submit(&self, task: TransferTask) -> Result<String>;

    /// Current status of a task.
    async fn status(&self, task_id: &str) -> Result<TaskStatus>;
}

/// Parse a bulk link of the form `globus:{endpoint-uuid}/{relative path}`.
pub fn parse_bulk_link(link: &str) -> Option<(String, String)> {
    let rest = link.strip_prefix("globus:")?;
    let (endpoint, relpath) = rest.split_once('/')?;
    Uuid::parse_str(endpoint).ok()?;
    Some((endpoint.to_string(), relpath.to_string()))
}

/// Coordinates bulk transfers and blocks until every task resolves.
pub struct BulkCoordinator<'a> {
    client: &'a dyn TransferClient,
    db: &'a RateStore,
    log: &'a Log,
    /// Initial poll interval; doubles up to [`Self::poll_cap`].
    poll_start: Duration,
    poll_cap: Duration,
}

impl<'a> BulkCoordinator<'a> {
    pub fn new(client: &'a dyn TransferClient, db: &'a RateStore, log: &'a Log) -> Self {
        Self {
            client,
            db,
            log,
            poll_start: Duration::from_secs(5),
            poll_cap: Duration::from_secs(30),
        }
    }

    #[cfg(test)]
    fn with_poll(mut self, start: Duration, cap: Duration) -> Self {
        self.poll_start = start;
        self.poll_cap = cap;
        self
    }

    /// Transfer every file to `destination_endpoint` under
    /// `destination_path`, returning once all tasks have succeeded.
    pub async fn transfer(
        &self,
        infos: &[FileInfo],
        destination_endpoint: &str,
        destination_path: &str,
    ) -> Result<()> {
        if !self.client.endpoint_alive(destination_endpoint).await? {
            return Err(EsgfError::EndpointNotAlive(destination_endpoint.to_string()));
        }

        // Serve as many files as possible per task: iterate source endpoints
        // in decreasing order of how many files they can provide.
        let mut counts: HashMap<String, usize> = HashMap::new();
        for info in infos {
            for link in &info.globus_links {
                if let Some((endpoint, _)) = parse_bulk_link(link) {
                    *counts.entry(endpoint).or_insert(0) += 1;
                }
            }
        }
        let mut endpoints: Vec<(String, usize)> = counts.into_iter().collect();
        endpoints.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut assigned: Vec<bool> = vec![false; infos.len()];
        let mut tasks: Vec<(String, String, Instant, f64)> = Vec::new();
        for (endpoint, _) in endpoints {
            let mut items = Vec::new();
            let mut batch_mb = 0.0;
            for (i, info) in infos.iter().enumerate() {
                if assigned[i] {
                    continue;
                }
                let Some(relpath) = info.globus_links.iter().find_map(|link| {
                    parse_bulk_link(link)
                        .filter(|(e, _)| *e == endpoint)
                        .map(|(_, p)| p)
                }) else {
                    continue;
                };
                let destination = format!(
                    "{}/{}",
                    destination_path.trim_end_matches('/'),
                    info.path.display()
                );
                items.push((relpath, destination));
                batch_mb += info.size.unwrap_or(0) as f64 * 1e-6;
                assigned[i] = true;
            }
            if items.is_empty() {
                continue;
            }
            let task = TransferTask {
                source_endpoint: endpoint.clone(),
                destination_endpoint: destination_endpoint.to_string(),
                items,
            };
            let task_id = self.client.submit(task).await?;
            self.log
                .info(format!("submitted bulk task {task_id} from {endpoint}"))?;
            tasks.push((endpoint, task_id, Instant::now(), batch_mb));
        }

        for (endpoint, task_id, submitted, batch_mb) in tasks {
            self.wait(&task_id).await?;
            let elapsed = submitted.elapsed().as_secs_f64();
            self.log.info(format!(
                "bulk task {task_id} succeeded transfer_time={elapsed:.2} [s]"
            ))?;
            self.db.record(&endpoint, elapsed, batch_mb)?;
        }
        Ok(())
    }

    /// Poll one task to a terminal state with exponential backoff.
    async fn wait(&self, task_id: &str) -> Result<()> {
        let mut interval = self.poll_start;
        loop {
            match self.client.status(task_id).await? {
                TaskStatus::Succeeded => return Ok(()),
                TaskStatus::Failed(detail) => {
                    return Err(EsgfError::BulkTransferError {
                        task_id: task_id.to_string(),
                        detail,
                    });
                }
                TaskStatus::Active => {
                    tokio::time::sleep(interval).await;
                    interval = (interval * 2).min(self.poll_cap);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_parse_bulk_link() {
        let (endpoint, relpath) = parse_bulk_link(
            "globus:d927e2d9-ccdb-48e4-b05d-adbc3d97bbc5/css03_data/CMIP6/f.nc",
        )
        .unwrap();
        assert_eq!(endpoint, "d927e2d9-ccdb-48e4-b05d-adbc3d97bbc5");
        assert_eq!(relpath, "css03_data/CMIP6/f.nc");

        assert!(parse_bulk_link("https://not-a-bulk-link/f.nc").is_none());
        assert!(parse_bulk_link("globus:not-a-uuid/f.nc").is_none());
    }

    struct MockTransfer {
        dead: Vec<String>,
        submitted: Mutex<Vec<TransferTask>>,
        /// remaining Active polls per task before success
        polls: Mutex<HashMap<String, usize>>,
        fail: Option<String>,
    }

    impl MockTransfer {
        fn healthy() -> Self {
            Self {
                dead: vec![],
                submitted: Mutex::new(vec![]),
                polls: Mutex::new(HashMap::new()),
                fail: None,
            }
        }
    }

    #[async_trait]
    impl TransferClient for MockTransfer {
        async fn endpoint_alive(&self, endpoint: &str) -> Result<bool> {
            Ok(!self.dead.contains(&endpoint.to_string()))
        }

        async fn submit(&self, task: TransferTask) -> Result<String> {
            let mut submitted = self.submitted.lock().unwrap();
            let task_id = format!("task-{}", submitted.len());
            self.polls.lock().unwrap().insert(task_id.clone(), 2);
            submitted.push(task);
            Ok(task_id)
        }

        async fn status(&self, task_id: &str) -> Result<TaskStatus> {
            if let Some(detail) = &self.fail {
                return Ok(TaskStatus::Failed(detail.clone()));
            }
            let mut polls = self.polls.lock().unwrap();
            let remaining = polls.get_mut(task_id).unwrap();
            if *remaining == 0 {
                Ok(TaskStatus::Succeeded)
            } else {
                *remaining -= 1;
                Ok(TaskStatus::Active)
            }
        }
    }

    fn info(path: &str, endpoints: &[&str]) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            size: Some(50_000_000),
            globus_links: endpoints
                .iter()
                .map(|e| format!("globus:{e}/{path}"))
                .collect(),
            ..Default::default()
        }
    }

    const EP_A: &str = "11111111-1111-1111-1111-111111111111";
    const EP_B: &str = "22222222-2222-2222-2222-222222222222";
    const DST: &str = "33333333-3333-3333-3333-333333333333";

    #[tokio::test]
    async fn test_batches_minimize_task_count() {
        let dir = TempDir::new().unwrap();
        let db = RateStore::open(dir.path().join("download.db")).unwrap();
        let log = Log::in_memory();
        let client = MockTransfer::healthy();
        let coordinator = BulkCoordinator::new(&client, &db, &log)
            .with_poll(Duration::from_millis(1), Duration::from_millis(2));

        // a and b are served by both endpoints, c only by B: endpoint B can
        // serve everything and must end up as the single task
        let infos = vec![
            info("x/a.nc", &[EP_A, EP_B]),
            info("x/b.nc", &[EP_A, EP_B]),
            info("x/c.nc", &[EP_B]),
        ];
        coordinator.transfer(&infos, DST, "/dest/root").await.unwrap();

        let submitted = client.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].source_endpoint, EP_B);
        assert_eq!(submitted[0].items.len(), 3);
        assert_eq!(submitted[0].items[0].1, "/dest/root/x/a.nc");

        // a synthetic measurement lands under the endpoint id
        let rates = db.rates(crate::database::RateWindow::None, 0.0).unwrap();
        assert!(rates.contains_key(EP_B));
        assert!(rates[EP_B] > 0.0);
    }

    #[tokio::test]
    async fn test_dead_destination_is_an_error() {
        let dir = TempDir::new().unwrap();
        let db = RateStore::open(dir.path().join("download.db")).unwrap();
        let log = Log::in_memory();
        let client = MockTransfer {
            dead: vec![DST.to_string()],
            ..MockTransfer::healthy()
        };
        let coordinator = BulkCoordinator::new(&client, &db, &log);
        let result = coordinator
            .transfer(&[info("x/a.nc", &[EP_A])], DST, "/dest")
            .await;
        assert!(matches!(result, Err(EsgfError::EndpointNotAlive(_))));
    }

    #[tokio::test]
    async fn test_failed_task_raises() {
        let dir = TempDir::new().unwrap();
        let db = RateStore::open(dir.path().join("download.db")).unwrap();
        let log = Log::in_memory();
        let client = MockTransfer {
            fail: Some("ENDPOINT_ERROR".to_string()),
            ..MockTransfer::healthy()
        };
        let coordinator = BulkCoordinator::new(&client, &db, &log)
            .with_poll(Duration::from_millis(1), Duration::from_millis(2));
        let result = coordinator
            .transfer(&[info("x/a.nc", &[EP_A])], DST, "/dest")
            .await;
        match result {
            Err(EsgfError::BulkTransferError { detail, .. }) => {
                assert!(detail.contains("ENDPOINT_ERROR"));
            }
            other => panic!("expected BulkTransferError, got {other:?}"),
        }
    }
}
