//! Process-wide HTTP request cache.
//!
//! Index queries are idempotent GETs, so every driver shares one
//! [`CachedSession`] that stores response bodies in a small SQLite table
//! keyed by the full request URL. The TTL policy comes from
//! [`crate::config::RequestsCacheConfig`]. POST bodies and HEAD probes are
//! never cached.

use crate::config::CacheExpiry;
use crate::error::{EsgfError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A reqwest session with transparent caching of GET bodies.
///
/// Cloning shares the underlying client and store, so one session can be
/// injected into every driver.
#[derive(Clone)]
pub struct CachedSession {
    client: reqwest::Client,
    store: Option<Arc<Mutex<Connection>>>,
    expiry: CacheExpiry,
}

impl CachedSession {
    /// Create a session caching into `cache_db` under the given policy.
    pub fn open(cache_db: &Path, expiry: CacheExpiry) -> Result<Self> {
        let store = match expiry {
            CacheExpiry::DoNotCache => None,
            _ => {
                if let Some(parent) = cache_db.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| EsgfError::io_with_path(e, parent))?;
                }
                let conn = Connection::open(cache_db).map_err(|e| EsgfError::Database {
                    message: format!("Failed to open request cache: {e}"),
                    source: Some(e),
                })?;
                conn.execute_batch(
                    "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;
                     CREATE TABLE IF NOT EXISTS requests (
                         key       TEXT PRIMARY KEY,
                         body      TEXT NOT NULL,
                         cached_at TEXT NOT NULL
                     );",
                )
                .map_err(|e| EsgfError::Database {
                    message: format!("Failed to initialize request cache schema: {e}"),
                    source: Some(e),
                })?;
                Some(Arc::new(Mutex::new(conn)))
            }
        };
        Ok(Self {
            client: Self::build_client()?,
            store,
            expiry,
        })
    }

    /// A session that never caches, for tests and ephemeral use.
    pub fn uncached() -> Result<Self> {
        Ok(Self {
            client: Self::build_client()?,
            store: None,
            expiry: CacheExpiry::DoNotCache,
        })
    }

    fn build_client() -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("esgf-catalog/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EsgfError::Network {
                message: format!("Failed to create HTTP client: {e}"),
                source: Some(e),
            })
    }

    /// The underlying client, for requests that must bypass the cache.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET a JSON body, consulting the cache first.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<serde_json::Value> {
        let key = cache_key(url, query);
        if let Some(body) = self.lookup(&key)? {
            debug!("request cache hit: {key}");
            return Ok(serde_json::from_str(&body)?);
        }
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EsgfError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        let value: serde_json::Value = serde_json::from_str(&body)?;
        self.insert(&key, &body)?;
        Ok(value)
    }

    /// POST a JSON body and return the JSON response. Never cached.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EsgfError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// HEAD-probe a URL; true when the server answers 2xx.
    pub async fn head_ok(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn lookup(&self, key: &str) -> Result<Option<String>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        if matches!(self.expiry, CacheExpiry::ExpireImmediately) {
            return Ok(None);
        }
        let conn = lock(store)?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT body, cached_at FROM requests WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((body, cached_at)) = row else {
            return Ok(None);
        };
        let fresh = match self.expiry {
            CacheExpiry::NeverExpire => true,
            CacheExpiry::After(ttl) => cached_at
                .parse::<DateTime<Utc>>()
                .map(|at| Utc::now() - at < chrono::Duration::from_std(ttl).unwrap_or_default())
                .unwrap_or(false),
            CacheExpiry::DoNotCache | CacheExpiry::ExpireImmediately => false,
        };
        if fresh {
            Ok(Some(body))
        } else {
            conn.execute("DELETE FROM requests WHERE key = ?1", params![key])?;
            Ok(None)
        }
    }

    fn insert(&self, key: &str, body: &str) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let conn = lock(store)?;
        conn.execute(
            "INSERT OR REPLACE INTO requests (key, body, cached_at) VALUES (?1, ?2, ?3)",
            params![key, body, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn lock(store: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    store.lock().map_err(|_| EsgfError::Database {
        message: "request cache lock poisoned".to_string(),
        source: None,
    })
}

fn cache_key(url: &str, query: &[(String, String)]) -> String {
    let mut key = url.to_string();
    for (name, value) in query {
        key.push_str(if key.contains('?') { "&" } else { "?" });
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cache_key_includes_query() {
        let a = cache_key(
            "https://x/search",
            &[("variable_id".into(), "gpp".into())],
        );
        let b = cache_key(
            "https://x/search",
            &[("variable_id".into(), "mrso".into())],
        );
        assert_ne!(a, b);
        assert!(a.starts_with("https://x/search?variable_id=gpp"));
    }

    #[test]
    fn test_lookup_respects_policy() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("requests_cache.db");

        let session = CachedSession::open(&db, CacheExpiry::NeverExpire).unwrap();
        session.insert("k", "{\"a\":1}").unwrap();
        assert_eq!(session.lookup("k").unwrap().unwrap(), "{\"a\":1}");

        let stale = CachedSession::open(&db, CacheExpiry::ExpireImmediately).unwrap();
        stale.insert("k2", "{}").unwrap();
        assert!(stale.lookup("k2").unwrap().is_none());

        let none = CachedSession::uncached().unwrap();
        none.insert("k3", "{}").unwrap();
        assert!(none.lookup("k3").unwrap().is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("requests_cache.db");
        let session =
            CachedSession::open(&db, CacheExpiry::After(Duration::from_secs(3600))).unwrap();
        session.insert("k", "{}").unwrap();
        assert!(session.lookup("k").unwrap().is_some());

        let expired = CachedSession::open(&db, CacheExpiry::After(Duration::ZERO)).unwrap();
        assert!(expired.lookup("k").unwrap().is_none());
    }
}
