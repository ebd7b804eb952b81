//! Persistent download-rate bookkeeping.
//!
//! Every completed transfer appends one row of
//! `(timestamp, host, transfer_time, transfer_size)`; rows are never
//! updated. Aggregated per-host mean rates feed the link ranker so future
//! downloads try the historically fastest host first. HTTPS hosts and bulk
//! endpoint UUIDs share the table because both are ranked the same way.

use crate::error::{EsgfError, Result};
use rand::Rng;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// How much history to use when computing rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateWindow {
    #[default]
    None,
    Day,
    Week,
    Month,
}

impl RateWindow {
    fn modifier(&self) -> Option<&'static str> {
        match self {
            RateWindow::None => None,
            RateWindow::Day => Some("-1 day"),
            RateWindow::Week => Some("-7 days"),
            RateWindow::Month => Some("-1 month"),
        }
    }
}

/// Aggregated per-host transfer statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct HostRate {
    pub host: String,
    /// Total seconds spent transferring from this host.
    pub transfer_time: f64,
    /// Total megabytes transferred from this host.
    pub transfer_size: f64,
    /// Mean rate in Mb/s.
    pub rate: f64,
}

/// SQLite-backed store of transfer measurements.
pub struct RateStore {
    conn: Arc<Mutex<Connection>>,
}

impl RateStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EsgfError::io_with_path(e, parent))?;
        }
        let conn = Connection::open(path).map_err(|e| EsgfError::Database {
            message: format!("Failed to open download database: {e}"),
            source: Some(e),
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| EsgfError::Database {
            message: format!("Failed to set pragmas: {e}"),
            source: Some(e),
        })?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                timestamp     TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
                host          TEXT NOT NULL,
                transfer_time REAL NOT NULL,
                transfer_size REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_host
                ON downloads(host);

            CREATE INDEX IF NOT EXISTS idx_downloads_timestamp
                ON downloads(timestamp);
            "#,
        )
        .map_err(|e| EsgfError::Database {
            message: format!("Failed to initialize download schema: {e}"),
            source: Some(e),
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one measurement: `elapsed` seconds to move `size_mb` megabytes.
    pub fn record(&self, host: &str, elapsed: f64, size_mb: f64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO downloads (host, transfer_time, transfer_size) VALUES (?1, ?2, ?3)",
            params![host, elapsed, size_mb],
        )?;
        Ok(())
    }

    /// Mean Mb/s per host, computed as total size over total time for rows
    /// larger than `min_size_mb` and inside the window.
    pub fn rates(&self, window: RateWindow, min_size_mb: f64) -> Result<HashMap<String, f64>> {
        Ok(self
            .summary(window, min_size_mb)?
            .into_iter()
            .map(|r| (r.host, r.rate))
            .collect())
    }

    /// Per-host totals and mean rates, fastest first.
    pub fn summary(&self, window: RateWindow, min_size_mb: f64) -> Result<Vec<HostRate>> {
        let mut sql = String::from(
            "SELECT host, SUM(transfer_time), SUM(transfer_size) \
             FROM downloads WHERE transfer_size > ?1",
        );
        if let Some(modifier) = window.modifier() {
            sql.push_str(&format!(
                " AND timestamp > datetime('now', '{modifier}', 'localtime')"
            ));
        }
        sql.push_str(" GROUP BY host");
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows: Vec<HostRate> = stmt
            .query_map(params![min_size_mb], |row| {
                let host: String = row.get(0)?;
                let transfer_time: f64 = row.get(1)?;
                let transfer_size: f64 = row.get(2)?;
                Ok(HostRate {
                    host,
                    transfer_time,
                    transfer_size,
                    rate: if transfer_time > 0.0 {
                        transfer_size / transfer_time
                    } else {
                        0.0
                    },
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        rows.sort_by(|a, b| b.rate.total_cmp(&a.rate));
        Ok(rows)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| EsgfError::Database {
            message: "download database lock poisoned".to_string(),
            source: None,
        })
    }
}

impl Clone for RateStore {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

/// Extract the host of an HTTP(S) URL, or return the input unchanged (bulk
/// endpoints are ranked by their UUID).
pub fn host_of(link: &str) -> String {
    url::Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| link.to_string())
}

/// Sort key for a download link: the measured rate of its host.
///
/// Hosts with no history rank strictly above the fastest known host, with a
/// random offset so ties among unknown hosts break arbitrarily. That way a
/// new mirror gets tried before falling back to a known slow one, and its
/// measurement lands in the table for next time.
pub fn rank_link(link: &str, rates: &HashMap<String, f64>) -> f64 {
    rank_host(&host_of(link), rates)
}

/// Sort key for an already-extracted host or endpoint id.
pub fn rank_host(host: &str, rates: &HashMap<String, f64>) -> f64 {
    let mut rng = rand::rng();
    if rates.is_empty() {
        return rng.random_range(0.0..1.0);
    }
    match rates.get(host) {
        Some(rate) => *rate,
        None => {
            let max = rates.values().fold(f64::MIN, |a, b| a.max(*b));
            max + rng.random_range(0.0..1.0) + f64::EPSILON
        }
    }
}
