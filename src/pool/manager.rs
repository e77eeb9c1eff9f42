//! Process-wide pool manager and reaper
//!
//! Maps endpoint keys to pools, resolves proxies, and runs the periodic
//! reaper that evicts expired idle connections and unmaps pools nobody
//! has touched for two sweeps.

use crate::config::Options;
use crate::conn::{Request, Response};
use crate::pool::key::{self, PoolKey};
use crate::pool::pool::{ConnectionPool, PoolSnapshot};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const REAPER_FLOOR: Duration = Duration::from_secs(1);
const REAPER_DEFAULT: Duration = Duration::from_secs(90);

/// Owns every pool; torn down when the owning handler is disposed.
pub struct PoolManager {
    options: Arc<Options>,
    pools: Mutex<HashMap<PoolKey, Arc<ConnectionPool>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    self_weak: std::sync::Weak<PoolManager>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl PoolManager {
    pub fn new(options: Options) -> Result<Arc<Self>> {
        options.validate()?;
        let manager = Arc::new_cyclic(|self_weak| PoolManager {
            options: Arc::new(options),
            pools: Mutex::new(HashMap::new()),
            reaper: Mutex::new(None),
            self_weak: self_weak.clone(),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        // The reaper holds a weak handle so it cannot keep the manager
        // alive; outside a runtime (plain construction in tests) it is
        // simply not started.
        if tokio::runtime::Handle::try_current().is_ok() {
            let period = reaper_period(&manager.options);
            let weak = Arc::downgrade(&manager);
            let token = manager.shutdown.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(period) => {}
                    }
                    match weak.upgrade() {
                        Some(manager) => manager.clean_pools(),
                        None => break,
                    }
                }
            });
            *manager.reaper.lock() = Some(handle);
        }
        Ok(manager)
    }

    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    /// Dispatch one request: resolve the proxy, classify the endpoint,
    /// route to its pool.
    pub async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        let proxy = self
            .options
            .proxy
            .as_ref()
            .and_then(|resolver| resolver.proxy_for(request.uri()));
        let key = key::classify(request.uri(), proxy.as_ref(), self.options.tunnel_plain_http)?;
        trace!("Dispatching {} {} via {}", request.method(), request.uri(), key);
        let pool = self.pool_for(key);
        pool.send(request, true, cancel).await
    }

    /// Look up or insert the pool for `key`. A pool the reaper retired can
    /// race a new request; it is replaced under the map lock.
    pub(crate) fn pool_for(&self, key: PoolKey) -> Arc<ConnectionPool> {
        let mut pools = self.pools.lock();
        if let Some(existing) = pools.get(&key) {
            if !existing.is_disposed() {
                return existing.clone();
            }
        }
        debug!("Creating pool {}", key);
        let pool = ConnectionPool::new(key.clone(), self.options.clone(), self.self_weak.clone());
        pools.insert(key, pool.clone());
        pool
    }

    /// One reaper pass. Pool locks are taken one at a time, never while
    /// the map lock is held.
    fn clean_pools(&self) {
        let snapshot: Vec<(PoolKey, Arc<ConnectionPool>)> = self
            .pools
            .lock()
            .iter()
            .map(|(key, pool)| (key.clone(), pool.clone()))
            .collect();

        let mut retired = Vec::new();
        for (key, pool) in snapshot {
            if pool.clean_cache_and_dispose_if_unused() {
                retired.push((key, pool));
            }
        }
        if retired.is_empty() {
            return;
        }

        let mut pools = self.pools.lock();
        for (key, pool) in retired {
            if let Some(current) = pools.get(&key) {
                if Arc::ptr_eq(current, &pool) {
                    pools.remove(&key);
                }
            }
        }
    }

    /// Dispose every pool and stop the reaper. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        let pools = std::mem::take(&mut *self.pools.lock());
        debug!("Disposing pool manager ({} pools)", pools.len());
        for pool in pools.values() {
            pool.dispose();
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Observability: counts for every live pool.
    pub fn snapshots(&self) -> Vec<(PoolKey, PoolSnapshot)> {
        self.pools
            .lock()
            .iter()
            .map(|(key, pool)| (key.clone(), pool.snapshot()))
            .collect()
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }
}

/// Reaper period: the tighter of the two expiry tunables, floored so a
/// sub-second timeout cannot spin the sweep.
fn reaper_period(options: &Options) -> Duration {
    let finite = [
        options.pooled_connection_idle_timeout,
        options.pooled_connection_lifetime,
    ]
    .into_iter()
    .flatten()
    .filter(|d| !d.is_zero())
    .min();
    match finite {
        Some(period) => period.max(REAPER_FLOOR),
        None => REAPER_DEFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::key::PoolKind;

    #[test]
    fn test_reaper_period_bounds() {
        let defaults = Options::default();
        assert_eq!(reaper_period(&defaults), Duration::from_secs(90));

        let tight = Options {
            pooled_connection_idle_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        assert_eq!(reaper_period(&tight), REAPER_FLOOR);

        let both = Options {
            pooled_connection_idle_timeout: Some(Duration::from_secs(30)),
            pooled_connection_lifetime: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        assert_eq!(reaper_period(&both), Duration::from_secs(10));

        let zero_lifetime = Options {
            pooled_connection_idle_timeout: None,
            pooled_connection_lifetime: Some(Duration::ZERO),
            ..Default::default()
        };
        assert_eq!(reaper_period(&zero_lifetime), REAPER_DEFAULT);
    }

    #[tokio::test]
    async fn test_pool_for_deduplicates() {
        let manager = PoolManager::new(Options::default()).unwrap();
        let key = PoolKey::http("example.com".to_string(), 80);
        let a = manager.pool_for(key.clone());
        let b = manager.pool_for(key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.pool_count(), 1);

        manager.pool_for(PoolKey::http("example.com".to_string(), 8080));
        assert_eq!(manager.pool_count(), 2);
    }

    #[tokio::test]
    async fn test_retired_pool_is_replaced() {
        let manager = PoolManager::new(Options::default()).unwrap();
        let key = PoolKey::http("example.com".to_string(), 80);
        let first = manager.pool_for(key.clone());
        first.dispose();
        let second = manager.pool_for(key);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_disposed());
    }

    #[tokio::test]
    async fn test_send_after_dispose_fails() {
        let manager = PoolManager::new(Options::default()).unwrap();
        manager.dispose();
        let err = manager
            .send(
                Request::get("http://example.com/".parse().unwrap()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disposed));
    }

    #[tokio::test]
    async fn test_reaper_unmaps_quiet_pools() {
        let manager = PoolManager::new(Options::default()).unwrap();
        let key = PoolKey {
            kind: PoolKind::Http,
            host: Some("quiet.test".to_string()),
            port: Some(80),
            ssl_host: None,
            proxy: None,
        };
        manager.pool_for(key);
        assert_eq!(manager.pool_count(), 1);

        manager.clean_pools();
        assert_eq!(manager.pool_count(), 1);
        manager.clean_pools();
        assert_eq!(manager.pool_count(), 0);
    }
}
