//! Per-upstream connection pools.
//!
//! Pools are keyed by `(scheme, host, port, verify_tls)` and created lazily
//! on first use: a critical portion (`min(10, pool_size)`) is filled at
//! creation and a background filler tops the rest up with a 10 ms spacing
//! to avoid a connect stampede. Acquire waits a bounded time for a pooled
//! connection and falls back to a fresh unpooled one. A connection used by
//! a failed request is always closed, never re-pooled: the default drop
//! path closes, and only an explicit `release` re-pools.

use super::client::{connect, UpstreamConnection, UpstreamTarget};
use crate::config::ConnectionPoolingConfig;
use crate::memory::{MemoryModule, MemoryTracker};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const CRITICAL_FILL: usize = 10;
pub const FILL_SPACING: Duration = Duration::from_millis(10);
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);
pub const POOL_EXPIRY: Duration = Duration::from_secs(30 * 60);
/// Nominal byte charge per pooled connection against the pool budget.
const CONN_BYTES: usize = 16 * 1024;

/// Pool identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub target: UpstreamTarget,
    pub verify_tls: bool,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}",
            self.target,
            if self.verify_tls { "" } else { " (no-verify)" }
        )
    }
}

/// A connection plus its pool bookkeeping.
pub struct PooledConnection {
    pub conn: UpstreamConnection,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
}

impl PooledConnection {
    fn new(conn: UpstreamConnection) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

struct Pool {
    tx: mpsc::Sender<PooledConnection>,
    rx: tokio::sync::Mutex<mpsc::Receiver<PooledConnection>>,
    /// Connections currently sitting in the channel.
    available: AtomicUsize,
    running: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Pool {
    fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            available: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn enqueue(&self, pooled: PooledConnection, tracker: &MemoryTracker) -> bool {
        if !self.running.load(Ordering::Relaxed) {
            pooled.conn.close();
            return false;
        }
        if !tracker.try_allocate(MemoryModule::ConnectionPool, CONN_BYTES) {
            // Over budget: degrade by not pooling.
            pooled.conn.close();
            return false;
        }
        match self.tx.try_send(pooled) {
            Ok(()) => {
                self.available.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracker.free(MemoryModule::ConnectionPool, CONN_BYTES);
                // Full channel: close the surplus connection.
                match e {
                    mpsc::error::TrySendError::Full(pc)
                    | mpsc::error::TrySendError::Closed(pc) => pc.conn.close(),
                }
                false
            }
        }
    }

    async fn try_dequeue(&self, wait: Duration, tracker: &MemoryTracker) -> Option<PooledConnection> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(pooled)) => {
                self.available.fetch_sub(1, Ordering::Relaxed);
                tracker.free(MemoryModule::ConnectionPool, CONN_BYTES);
                Some(pooled)
            }
            _ => None,
        }
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// A leased connection. Dropping it closes the connection; only an
/// explicit [`ConnectionLease::release`] after a clean request re-pools.
pub struct ConnectionLease {
    pooled: Option<PooledConnection>,
    pool: Arc<Pool>,
    manager: Arc<PoolManager>,
}

impl ConnectionLease {
    pub fn connection(&mut self) -> &mut UpstreamConnection {
        &mut self
            .pooled
            .as_mut()
            .expect("lease is live until release/drop")
            .conn
    }

    pub fn use_count(&self) -> u64 {
        self.pooled.as_ref().map(|p| p.use_count).unwrap_or(0)
    }

    /// Return the connection to its pool after a successful request.
    pub fn release(mut self) {
        if let Some(mut pooled) = self.pooled.take() {
            self.manager.leased.fetch_sub(1, Ordering::Relaxed);
            pooled.last_used = Instant::now();
            pooled.use_count += 1;
            if pooled.conn.is_open() {
                self.pool.enqueue(pooled, &self.manager.tracker);
            } else {
                pooled.conn.close();
            }
        }
        self.manager.update_gauges();
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        // The non-release path: request errored or the caller bailed.
        if let Some(pooled) = self.pooled.take() {
            self.manager.leased.fetch_sub(1, Ordering::Relaxed);
            pooled.conn.close();
        }
    }
}

/// Lazily creates and owns all pools.
pub struct PoolManager {
    config: ConnectionPoolingConfig,
    pools: Mutex<HashMap<PoolKey, Arc<Pool>>>,
    tracker: Arc<MemoryTracker>,
    total_created: AtomicU64,
    /// Connections currently leased out to requests.
    leased: AtomicUsize,
}

impl PoolManager {
    pub fn new(config: ConnectionPoolingConfig, tracker: Arc<MemoryTracker>) -> Arc<Self> {
        Arc::new(Self {
            config,
            pools: Mutex::new(HashMap::new()),
            tracker,
            total_created: AtomicU64::new(0),
            leased: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &ConnectionPoolingConfig {
        &self.config
    }

    /// Acquire a connection for `key`: pooled when one is ready within the
    /// acquire timeout and healthy, freshly dialed otherwise.
    pub async fn acquire(self: &Arc<Self>, key: PoolKey) -> Result<ConnectionLease, crate::error::WafError> {
        let pool = self.get_or_create(&key).await;
        pool.touch();
        crate::metrics::record_pool_acquire();

        let wait = Duration::from_millis(self.config.acquire_timeout_ms);
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);

        if let Some(pooled) = pool.try_dequeue(wait, &self.tracker).await {
            if pooled.idle_for() <= idle_timeout && pooled.conn.is_open() {
                self.leased.fetch_add(1, Ordering::Relaxed);
                self.update_gauges();
                return Ok(ConnectionLease {
                    pooled: Some(pooled),
                    pool,
                    manager: Arc::clone(self),
                });
            }
            debug!(pool = %key, "pooled connection stale, dialing fresh");
            pooled.conn.close();
        } else {
            crate::metrics::record_pool_timeout();
        }

        // Fallback: a fresh connection, unpooled until released.
        let conn = self.dial(&key).await?;
        self.leased.fetch_add(1, Ordering::Relaxed);
        self.update_gauges();
        Ok(ConnectionLease {
            pooled: Some(PooledConnection::new(conn)),
            pool,
            manager: Arc::clone(self),
        })
    }

    async fn dial(&self, key: &PoolKey) -> Result<UpstreamConnection, crate::error::WafError> {
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let conn = connect(&key.target, key.verify_tls, timeout).await?;
        self.total_created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    async fn get_or_create(self: &Arc<Self>, key: &PoolKey) -> Arc<Pool> {
        if let Some(pool) = self.pools.lock().get(key) {
            return Arc::clone(pool);
        }

        let pool = Pool::new(self.config.pool_size);
        {
            let mut pools = self.pools.lock();
            // A racing creator may have won; use theirs.
            if let Some(existing) = pools.get(key) {
                return Arc::clone(existing);
            }
            pools.insert(key.clone(), Arc::clone(&pool));
        }
        info!(pool = %key, size = self.config.pool_size, "connection pool created");

        // Critical fill: dial the first connections concurrently so early
        // requests find a warm pool.
        let critical = CRITICAL_FILL.min(self.config.pool_size);
        let dials = (0..critical).map(|_| self.dial(key));
        for result in join_all(dials).await {
            match result {
                Ok(conn) => {
                    pool.enqueue(PooledConnection::new(conn), &self.tracker);
                }
                Err(e) => {
                    warn!(pool = %key, error = %e, "critical pool fill dial failed");
                }
            }
        }

        // Background filler for the remainder, spaced out.
        if self.config.pool_size > critical {
            let manager = Arc::clone(self);
            let fill_pool = Arc::clone(&pool);
            let fill_key = key.clone();
            let remainder = self.config.pool_size - critical;
            tokio::spawn(async move {
                for _ in 0..remainder {
                    tokio::time::sleep(FILL_SPACING).await;
                    if !fill_pool.running.load(Ordering::Relaxed) {
                        return;
                    }
                    match manager.dial(&fill_key).await {
                        Ok(conn) => {
                            fill_pool.enqueue(PooledConnection::new(conn), &manager.tracker);
                        }
                        Err(e) => {
                            debug!(pool = %fill_key, error = %e, "background pool fill dial failed");
                        }
                    }
                }
            });
        }

        self.update_gauges();
        pool
    }

    /// One idle-reaping pass: drain each pool, close connections idle past
    /// the idle timeout, re-enqueue the rest. Also expires pools that have
    /// seen no activity for [`POOL_EXPIRY`].
    pub async fn reap_idle(&self) {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let pools: Vec<Arc<Pool>> = self.pools.lock().values().cloned().collect();

        for pool in &pools {
            let mut keep: Vec<PooledConnection> = Vec::new();
            {
                let mut rx = pool.rx.lock().await;
                while let Ok(pooled) = rx.try_recv() {
                    pool.available.fetch_sub(1, Ordering::Relaxed);
                    self.tracker.free(MemoryModule::ConnectionPool, CONN_BYTES);
                    if pooled.idle_for() > idle_timeout || !pooled.conn.is_open() {
                        pooled.conn.close();
                    } else {
                        keep.push(pooled);
                    }
                }
            }
            for pooled in keep {
                pool.enqueue(pooled, &self.tracker);
            }
        }

        // Manager-level expiry of whole pools.
        let expired: Vec<(PoolKey, Arc<Pool>)> = {
            let mut map = self.pools.lock();
            let dead: Vec<PoolKey> = map
                .iter()
                .filter(|(_, p)| p.last_activity.lock().elapsed() > POOL_EXPIRY)
                .map(|(k, _)| k.clone())
                .collect();
            dead.into_iter()
                .filter_map(|k| map.remove(&k).map(|p| (k, p)))
                .collect()
        };
        for (key, pool) in expired {
            info!(pool = %key, "expiring inactive connection pool");
            pool.shutdown();
            let mut rx = pool.rx.lock().await;
            while let Ok(pooled) = rx.try_recv() {
                self.tracker.free(MemoryModule::ConnectionPool, CONN_BYTES);
                pooled.conn.close();
            }
        }

        self.update_gauges();
    }

    /// Close every pool and connection. Shutdown path.
    pub async fn close_all(&self) {
        let pools: Vec<Arc<Pool>> = {
            let mut map = self.pools.lock();
            map.drain().map(|(_, p)| p).collect()
        };
        for pool in pools {
            pool.shutdown();
            let mut rx = pool.rx.lock().await;
            while let Ok(pooled) = rx.try_recv() {
                self.tracker.free(MemoryModule::ConnectionPool, CONN_BYTES);
                pooled.conn.close();
            }
        }
        self.update_gauges();
        info!("all connection pools closed");
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn available_total(&self) -> usize {
        self.pools
            .lock()
            .values()
            .map(|p| p.available.load(Ordering::Relaxed))
            .sum()
    }

    pub fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }

    fn update_gauges(&self) {
        let available = self.available_total();
        let leased = self.leased.load(Ordering::Relaxed);
        crate::metrics::set_pool_gauges(available + leased, available);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// A keep-alive upstream that answers every request on a connection.
    async fn spawn_upstream() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {
                                let _ = socket
                                    .write_all(
                                        b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok",
                                    )
                                    .await;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn small_config() -> ConnectionPoolingConfig {
        ConnectionPoolingConfig {
            pool_size: 2,
            acquire_timeout_ms: 50,
            idle_timeout_secs: 300,
            connect_timeout_secs: 2,
            read_timeout_secs: 5,
            max_retries: 3,
        }
    }

    fn key_for(addr: std::net::SocketAddr) -> PoolKey {
        PoolKey {
            target: UpstreamTarget::parse(&format!("http://{addr}/")).unwrap(),
            verify_tls: true,
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_pool_and_fills() {
        let addr = spawn_upstream().await;
        let manager = PoolManager::new(small_config(), Arc::new(MemoryTracker::new()));

        let lease = manager.acquire(key_for(addr)).await.unwrap();
        assert_eq!(manager.pool_count(), 1);
        // Critical fill dialed up to pool_size connections.
        assert!(manager.total_created() >= 1);
        lease.release();
    }

    #[tokio::test]
    async fn test_release_then_reacquire_reuses() {
        let addr = spawn_upstream().await;
        // pool_size 1 so the released connection is the one handed back.
        let manager = PoolManager::new(
            ConnectionPoolingConfig {
                pool_size: 1,
                ..small_config()
            },
            Arc::new(MemoryTracker::new()),
        );
        let key = key_for(addr);

        let lease = manager.acquire(key.clone()).await.unwrap();
        lease.release();
        let created_before = manager.total_created();

        let lease = manager.acquire(key).await.unwrap();
        // Served from the pool: no new dial, and it carries history.
        assert_eq!(manager.total_created(), created_before);
        assert_eq!(lease.use_count(), 1);
        lease.release();
    }

    #[tokio::test]
    async fn test_dropped_lease_never_repools() {
        let addr = spawn_upstream().await;
        let manager = PoolManager::new(small_config(), Arc::new(MemoryTracker::new()));
        let key = key_for(addr);

        // Drain the pool completely so availability reflects our actions.
        let mut leases = Vec::new();
        loop {
            let lease = manager.acquire(key.clone()).await.unwrap();
            leases.push(lease);
            if manager.available_total() == 0 {
                break;
            }
        }
        let available_before = manager.available_total();
        // Dropping (error path) closes instead of re-pooling.
        leases.pop();
        tokio::task::yield_now().await;
        assert_eq!(manager.available_total(), available_before);
        // Releasing the rest re-pools them.
        let n = leases.len();
        for lease in leases {
            lease.release();
        }
        assert_eq!(manager.available_total(), available_before + n);
    }

    #[tokio::test]
    async fn test_acquire_falls_back_when_upstream_down_pool_empty() {
        // No listener: dials fail, acquire surfaces a connect error.
        let manager = PoolManager::new(small_config(), Arc::new(MemoryTracker::new()));
        let key = PoolKey {
            target: UpstreamTarget::parse("http://127.0.0.1:1/").unwrap(),
            verify_tls: true,
        };
        let result = manager.acquire(key).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_all_empties_pools() {
        let addr = spawn_upstream().await;
        let manager = PoolManager::new(small_config(), Arc::new(MemoryTracker::new()));
        let lease = manager.acquire(key_for(addr)).await.unwrap();
        lease.release();

        manager.close_all().await;
        assert_eq!(manager.pool_count(), 0);
        assert_eq!(manager.available_total(), 0);
    }

    #[tokio::test]
    async fn test_reap_keeps_fresh_connections() {
        let addr = spawn_upstream().await;
        let manager = PoolManager::new(small_config(), Arc::new(MemoryTracker::new()));
        let lease = manager.acquire(key_for(addr)).await.unwrap();
        lease.release();

        let available = manager.available_total();
        manager.reap_idle().await;
        // Nothing is idle past 5 minutes yet.
        assert_eq!(manager.available_total(), available);
        assert_eq!(manager.pool_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_budget_bounds_pooling() {
        let addr = spawn_upstream().await;
        let tracker = Arc::new(MemoryTracker::new());
        // Exhaust the ConnectionPool budget up front.
        assert!(tracker.try_allocate(MemoryModule::ConnectionPool, 10 * 1024 * 1024));

        let manager = PoolManager::new(small_config(), Arc::clone(&tracker));
        let lease = manager.acquire(key_for(addr)).await.unwrap();
        lease.release();
        // Degraded: the connection could not be pooled.
        assert_eq!(manager.available_total(), 0);
    }
}
