//! Parallel HTTPS downloads with integrity verification.
//!
//! Each file streams to `{cache}/{path}.part` and is renamed into place only
//! after its checksum matches. Candidate URLs are ordered by the per-host
//! rate history; a link whose mean rate drops below the configured
//! threshold is abandoned and the next mirror is tried. Completed transfers
//! feed a new measurement back into the rate database.

use crate::database::{self, RateStore, RateWindow};
use crate::error::{EsgfError, Result};
use crate::index::types::FileInfo;
use crate::logging::Log;
use blake3::Hasher as Blake3Hasher;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Suffix of in-flight downloads.
const TEMP_SUFFIX: &str = ".part";

/// Chunk size for streaming hash computation.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// The stall check only engages after this much wall time on a URL.
const STALL_GRACE: Duration = Duration::from_secs(3);

/// Rows smaller than this many megabytes do not contribute to rate ranking.
const RANK_MIN_SIZE_MB: f64 = 10.0;

/// Worker-pool downloader for the `http` class of an access plan.
pub struct Downloader {
    client: reqwest::Client,
    db: RateStore,
    /// Read-only data roots and cache roots, probed before downloading.
    roots: Vec<PathBuf>,
    /// Download target; the first writable cache root.
    cache_dir: PathBuf,
    /// Abandon a link below this many Mb/s; 0 disables.
    slow_threshold: f64,
    log: Log,
}

impl Downloader {
    pub fn new(
        db: RateStore,
        roots: Vec<PathBuf>,
        cache_dir: PathBuf,
        slow_threshold: f64,
        log: Log,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("esgf-catalog/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EsgfError::Network {
                message: format!("Failed to create HTTP client: {e}"),
                source: Some(e),
            })?;
        Ok(Self {
            client,
            db,
            roots,
            cache_dir,
            slow_threshold,
            log,
        })
    }

    /// Download every file with up to `min(num_threads, files)` workers.
    ///
    /// Each element of the result is `Some((key, local path))` on success and
    /// `None` when every URL for that file failed; callers decide whether a
    /// partial result is acceptable.
    pub async fn download_all(
        &self,
        infos: Vec<FileInfo>,
        num_threads: usize,
    ) -> Vec<Option<(String, PathBuf)>> {
        let workers = num_threads.clamp(1, infos.len().max(1));
        futures::stream::iter(infos.iter().map(|info| self.download_one(info)))
            .buffer_unordered(workers)
            .collect()
            .await
    }

    /// Resolve one file: short-circuit on a copy already on disk, otherwise
    /// try each URL in rate-ranked order.
    pub async fn download_one(&self, info: &FileInfo) -> Option<(String, PathBuf)> {
        for root in &self.roots {
            let local = root.join(&info.path);
            if local.is_file() {
                let _ = self.log.info(format!("accessed {}", local.display()));
                return Some((info.key.clone(), local));
            }
        }

        let rates = self
            .db
            .rates(RateWindow::None, RANK_MIN_SIZE_MB)
            .unwrap_or_default();
        // ranks are sampled once per url; the ranker randomizes unknown hosts
        let mut ranked: Vec<(f64, &String)> = info
            .http_urls
            .iter()
            .map(|url| (database::rank_link(url, &rates), url))
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        for (_, url) in &ranked {
            match self.fetch_and_verify(url, info).await {
                Ok(local) => return Some((info.key.clone(), local)),
                Err(e) => {
                    let _ = self
                        .log
                        .info(format!("\x1b[91;20mdownload failed\x1b[0m {url} {e}"));
                }
            }
        }
        None
    }

    /// Stream one URL to the cache, verify it, and record the measurement.
    async fn fetch_and_verify(&self, url: &str, info: &FileInfo) -> Result<PathBuf> {
        let target = self.cache_dir.join(&info.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EsgfError::io_with_path(e, parent))?;
        }
        let temp = PathBuf::from(format!("{}{TEMP_SUFFIX}", target.display()));
        // the partial file must not survive an error or cancellation
        let guard = TempGuard::new(temp.clone());

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EsgfError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let expected_bytes = info.size.or(response.content_length());

        let mut file = std::fs::File::create(&temp)
            .map_err(|e| EsgfError::io_with_path(e, &temp))?;
        let mut stream = response.bytes_stream();
        let started = Instant::now();
        let mut bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| EsgfError::Network {
                message: format!("Error reading download stream: {e}"),
                source: Some(e),
            })?;
            file.write_all(&chunk)
                .map_err(|e| EsgfError::io_with_path(e, &temp))?;
            bytes += chunk.len() as u64;
            if let Some(rate) = stalled_rate(bytes, started.elapsed(), self.slow_threshold) {
                return Err(EsgfError::StalledDownload {
                    url: url.to_string(),
                    rate,
                    threshold: self.slow_threshold,
                });
            }
        }
        file.flush().map_err(|e| EsgfError::io_with_path(e, &temp))?;
        drop(file);
        let elapsed = started.elapsed().as_secs_f64();

        if let Some(expected) = expected_bytes {
            if bytes != expected {
                return Err(EsgfError::DownloadFailed {
                    url: url.to_string(),
                    message: format!("expected {expected} bytes, received {bytes}"),
                });
            }
        }

        if let (Some(checksum), Some(algorithm)) = (&info.checksum, &info.checksum_type) {
            match compute_hash(&temp, algorithm).await? {
                Some(actual) if actual != checksum.to_lowercase() => {
                    self.log.info(format!("\x1b[91;20mHash error\x1b[0m {url}"))?;
                    return Err(EsgfError::HashMismatch {
                        expected: checksum.to_lowercase(),
                        actual,
                    });
                }
                Some(_) => {}
                None => {
                    debug!("no implementation for checksum_type={algorithm}, skipping verify");
                }
            }
        }

        std::fs::rename(&temp, &target).map_err(|e| EsgfError::io_with_path(e, &target))?;
        guard.disarm();

        let mb = bytes as f64 * 1e-6;
        let rate = if elapsed > 0.0 { mb / elapsed } else { 0.0 };
        self.log.info(format!(
            "transfer_time={elapsed:.2} [s] at {rate:.2} [Mb s-1] {url}"
        ))?;
        self.db.record(&database::host_of(url), elapsed, mb)?;
        Ok(target)
    }
}

/// Overall mean rate check: `Some(rate)` when the link should be abandoned.
///
/// The mean is taken since the start of the current URL rather than over an
/// instantaneous window, and only engages after a grace period so slow
/// handshakes are not mistaken for stalled transfers.
fn stalled_rate(bytes: u64, elapsed: Duration, threshold: f64) -> Option<f64> {
    if threshold <= 0.0 || elapsed < STALL_GRACE {
        return None;
    }
    let rate = bytes as f64 * 1e-6 / elapsed.as_secs_f64();
    (rate < threshold).then_some(rate)
}

/// Compute a file's hash with the named algorithm, streaming off-thread.
///
/// Returns `None` for algorithms this crate does not implement (md5-era
/// checksums from old mirrors); those files download unverified rather than
/// not at all.
async fn compute_hash(path: &Path, algorithm: &str) -> Result<Option<String>> {
    enum Algo {
        Sha256,
        Blake3,
    }
    let algo = match algorithm.to_lowercase().as_str() {
        "sha256" | "sha-256" => Algo::Sha256,
        "blake3" => Algo::Blake3,
        _ => return Ok(None),
    };
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file =
            std::fs::File::open(&path).map_err(|e| EsgfError::io_with_path(e, &path))?;
        let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
        match algo {
            Algo::Sha256 => {
                let mut hasher = Sha256::new();
                loop {
                    let n = file
                        .read(&mut buffer)
                        .map_err(|e| EsgfError::io_with_path(e, &path))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                }
                Ok(Some(hex::encode(hasher.finalize())))
            }
            Algo::Blake3 => {
                let mut hasher = Blake3Hasher::new();
                loop {
                    let n = file
                        .read(&mut buffer)
                        .map_err(|e| EsgfError::io_with_path(e, &path))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                }
                Ok(Some(hasher.finalize().to_hex().to_string()))
            }
        }
    })
    .await
    .map_err(|e| EsgfError::Other(format!("Hash computation task failed: {e}")))?
}

/// Deletes the partial file on drop unless disarmed after a rename.
struct TempGuard {
    path: PathBuf,
    armed: std::cell::Cell<bool>,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            armed: std::cell::Cell::new(true),
        }
    }

    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed.get() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn downloader(dir: &TempDir) -> Downloader {
        let db = RateStore::open(dir.path().join("download.db")).unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        Downloader::new(
            db,
            vec![dir.path().join("dataroot"), cache.clone()],
            cache,
            0.0,
            Log::in_memory(),
        )
        .unwrap()
    }

    #[test]
    fn test_stalled_rate_logic() {
        // below grace period: never stalled
        assert!(stalled_rate(10, Duration::from_secs(1), 100.0).is_none());
        // 0.04 Mb over 4 s = 0.01 Mb/s, threshold 100
        let rate = stalled_rate(40_000, Duration::from_secs(4), 100.0).unwrap();
        assert!(rate < 100.0);
        // fast enough
        assert!(stalled_rate(800_000_000, Duration::from_secs(4), 100.0).is_none());
        // threshold disabled
        assert!(stalled_rate(1, Duration::from_secs(60), 0.0).is_none());
    }

    #[tokio::test]
    async fn test_compute_hash_sha256() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.nc");
        std::fs::write(&path, b"").unwrap();
        let hash = compute_hash(&path, "SHA256").await.unwrap().unwrap();
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        // unsupported algorithms verify as None, not as an error
        assert!(compute_hash(&path, "md5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_existing_file_short_circuits() {
        let dir = TempDir::new().unwrap();
        let dl = downloader(&dir);
        let present = dir.path().join("dataroot/CMIP6/x/gpp.nc");
        std::fs::create_dir_all(present.parent().unwrap()).unwrap();
        std::fs::write(&present, b"netcdf").unwrap();

        let info = FileInfo {
            key: "CanESM5.gpp".to_string(),
            path: PathBuf::from("CMIP6/x/gpp.nc"),
            // an unreachable URL proves no network is attempted
            http_urls: vec!["https://localhost:1/never".to_string()],
            ..Default::default()
        };
        let (key, local) = dl.download_one(&info).await.unwrap();
        assert_eq!(key, "CanESM5.gpp");
        assert_eq!(local, present);
        assert!(dl.log.read().unwrap().contains("accessed"));
        assert!(!dl.log.read().unwrap().contains("download"));
    }

    #[tokio::test]
    async fn test_all_urls_failing_yields_none() {
        let dir = TempDir::new().unwrap();
        let dl = downloader(&dir);
        let info = FileInfo {
            key: "k".to_string(),
            path: PathBuf::from("x/missing.nc"),
            http_urls: vec![
                "https://localhost:1/a.nc".to_string(),
                "https://localhost:1/b.nc".to_string(),
            ],
            ..Default::default()
        };
        assert!(dl.download_one(&info).await.is_none());
        // both attempts are on record
        let log = dl.log.read().unwrap();
        assert_eq!(log.matches("download failed").count(), 2);
        // no partial files left behind
        assert!(!dir.path().join("cache/x/missing.nc.part").exists());
    }

    #[tokio::test]
    async fn test_temp_guard_removes_partial() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("f.nc.part");
        std::fs::write(&partial, b"partial").unwrap();
        {
            let _guard = TempGuard::new(partial.clone());
        }
        assert!(!partial.exists());

        std::fs::write(&partial, b"partial").unwrap();
        {
            let guard = TempGuard::new(partial.clone());
            guard.disarm();
        }
        assert!(partial.exists());
    }
}
