//! Fan-out over index drivers.
//!
//! Federation is the feature: partial results beat no results, so per-driver
//! transport failures are absorbed into an empty contribution and a single
//! user-visible warning. Only programming errors propagate.

use super::IndexDriver;
use crate::error::{EsgfError, Result};
use crate::logging::Log;
use futures::stream::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Call `call` on every driver with at most `num_threads` in flight and
/// collect the results as they complete (no ordering guarantee).
///
/// Per-driver outcomes:
/// - `NoSearchResults` and `Unsupported` contribute nothing,
/// - transport errors contribute nothing and warn once,
/// - anything else aborts the federation.
pub async fn federate<T, F, Fut>(
    drivers: &[Arc<dyn IndexDriver>],
    num_threads: usize,
    log: &Log,
    call: F,
) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(Arc<dyn IndexDriver>) -> Fut,
    Fut: Future<Output = Result<Vec<T>>> + Send,
{
    let mut stream = futures::stream::iter(drivers.iter().cloned().map(|driver| {
        let name = driver.name();
        let fut = call(driver);
        async move { (name, fut.await) }
    }))
    .buffer_unordered(num_threads.max(1));

    let mut combined = Vec::new();
    while let Some((name, result)) = stream.next().await {
        match result {
            Ok(items) => combined.extend(items),
            Err(EsgfError::NoSearchResults) => {
                log.info(format!("└─{name} \x1b[91;20mno results\x1b[0m"))?;
            }
            Err(EsgfError::Unsupported { operation, .. }) => {
                log.info(format!("└─{name} does not support {operation}"))?;
            }
            Err(e) if e.is_transport() => {
                warn!("{name} failed to return a response, results may be incomplete: {e}");
                log.info(format!("└─{name} \x1b[91;20merror\x1b[0m {e}"))?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(combined)
}
