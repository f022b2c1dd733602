//! Per-target connection pooling.
//!
//! The pool is the only owner of transport connections; borrowers hold a
//! [`PooledTransport`] guard for the duration of one command. Idle
//! connections are reaped after a deadline and probed on a keepalive
//! interval; a failed probe removes the connection.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use {
    futures::future::BoxFuture,
    tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore},
    tracing::{debug, warn},
};

use crate::{Error, Result, Transport};

/// Factory producing a fresh connected transport for the pool's target.
pub type ConnectFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Box<dyn Transport>>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections alive at once (borrowed + idle).
    pub max_total: usize,
    /// Idle connections kept for reuse; excess is torn down on release.
    pub max_idle: usize,
    /// Idle connections older than this are reaped.
    pub idle_timeout: Duration,
    /// Cadence of the keepalive probe over idle connections.
    pub keepalive_interval: Duration,
    /// How long `acquire` blocks before reporting exhaustion.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 4,
            idle_timeout: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Histogram bucket upper bounds for acquire-wait latency, in milliseconds.
const WAIT_BUCKETS_MS: [u64; 5] = [1, 10, 100, 1_000, u64::MAX];

#[derive(Default)]
struct Metrics {
    active: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
    wait_count: AtomicU64,
    wait_buckets: [AtomicU64; 5],
}

impl Metrics {
    fn record_wait(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        for (i, bound) in WAIT_BUCKETS_MS.iter().enumerate() {
            if ms <= *bound {
                self.wait_buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }
}

/// Point-in-time pool metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolMetricsSnapshot {
    pub active: usize,
    pub idle: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub wait_count: u64,
    /// Cumulative acquire-wait counts per latency bucket
    /// (`<=1ms, <=10ms, <=100ms, <=1s, inf`).
    pub wait_latency_buckets: Vec<u64>,
}

struct IdleConn {
    transport: Box<dyn Transport>,
    last_used: Instant,
}

struct PoolInner {
    config: PoolConfig,
    connect: ConnectFn,
    idle: Mutex<Vec<IdleConn>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    metrics: Metrics,
}

pub struct Pool {
    inner: Arc<PoolInner>,
    maintenance: tokio::task::JoinHandle<()>,
}

impl Pool {
    pub fn new(config: PoolConfig, connect: ConnectFn) -> Self {
        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.max_total)),
            config,
            connect,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            metrics: Metrics::default(),
        });

        let weak = Arc::downgrade(&inner);
        let interval = inner.config.keepalive_interval;
        let maintenance = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.maintain().await;
            }
        });

        Self { inner, maintenance }
    }

    /// Borrow a connection, creating one if the pool is below its cap.
    /// Blocks up to the configured acquire timeout, then reports exhaustion.
    pub async fn acquire(&self) -> Result<PooledTransport> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }

        let started = Instant::now();
        let permit = match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.metrics.wait_count.fetch_add(1, Ordering::Relaxed);
                tokio::time::timeout(
                    self.inner.config.acquire_timeout,
                    self.inner.permits.clone().acquire_owned(),
                )
                .await
                .map_err(|_| Error::PoolExhausted)?
                .map_err(|_| Error::PoolClosed)?
            },
        };
        self.inner.metrics.record_wait(started.elapsed());

        // Closed while we were waiting on a permit.
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }

        let reused = self.inner.idle.lock().await.pop();
        let transport = match reused {
            Some(conn) => conn.transport,
            None => {
                let transport = (self.inner.connect)().await?;
                self.inner.metrics.created.fetch_add(1, Ordering::Relaxed);
                transport
            },
        };

        self.inner.metrics.active.fetch_add(1, Ordering::Relaxed);
        Ok(PooledTransport {
            transport: Some(transport),
            _permit: permit,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Reap idle connections past their deadline and probe the remainder.
    /// Runs on the keepalive interval; exposed for tests.
    pub async fn maintain(&self) {
        self.inner.maintain().await;
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        let m = &self.inner.metrics;
        PoolMetricsSnapshot {
            active: m.active.load(Ordering::Relaxed),
            idle: self.inner.idle.try_lock().map(|v| v.len()).unwrap_or(0),
            total_created: m.created.load(Ordering::Relaxed),
            total_destroyed: m.destroyed.load(Ordering::Relaxed),
            wait_count: m.wait_count.load(Ordering::Relaxed),
            wait_latency_buckets: m
                .wait_buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Drain every idle connection and forbid further acquisition.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<IdleConn> = self.inner.idle.lock().await.drain(..).collect();
        for conn in drained {
            if let Err(e) = conn.transport.disconnect().await {
                debug!(error = %e, "error disconnecting pooled transport on close");
            }
            self.inner.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.maintenance.abort();
    }
}

impl PoolInner {
    async fn maintain(&self) {
        let now = Instant::now();
        let drained: Vec<IdleConn> = self.idle.lock().await.drain(..).collect();
        let mut keep = Vec::with_capacity(drained.len());
        for conn in drained {
            if now.duration_since(conn.last_used) >= self.config.idle_timeout {
                let _ = conn.transport.disconnect().await;
                self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match conn.transport.probe().await {
                Ok(()) => keep.push(conn),
                Err(e) => {
                    warn!(error = %e, "keepalive probe failed, dropping connection");
                    let _ = conn.transport.disconnect().await;
                    self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
                },
            }
        }
        self.idle.lock().await.extend(keep);
    }

    fn release(inner: &Arc<Self>, transport: Box<dyn Transport>) {
        inner.metrics.active.fetch_sub(1, Ordering::Relaxed);
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if inner.closed.load(Ordering::SeqCst) {
                let _ = transport.disconnect().await;
                inner.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let mut idle = inner.idle.lock().await;
            if idle.len() >= inner.config.max_idle {
                drop(idle);
                let _ = transport.disconnect().await;
                inner.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
            } else {
                idle.push(IdleConn {
                    transport,
                    last_used: Instant::now(),
                });
            }
        });
    }
}

/// A borrowed connection. Returns to the pool's idle set on drop (or is
/// torn down when the idle cap is reached or the pool has closed).
pub struct PooledTransport {
    transport: Option<Box<dyn Transport>>,
    _permit: OwnedSemaphorePermit,
    inner: Arc<PoolInner>,
}

impl std::ops::Deref for PooledTransport {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        // Invariant: `transport` is only None after drop.
        match &self.transport {
            Some(t) => t.as_ref(),
            None => unreachable!(),
        }
    }
}

impl Drop for PooledTransport {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            PoolInner::release(&self.inner, transport);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        dockyard_protocol::{Command, CommandResult},
        std::sync::atomic::AtomicBool,
        tokio::io::AsyncWrite,
    };

    #[derive(Default)]
    struct MockState {
        connects: AtomicU64,
        disconnects: AtomicU64,
        probe_fails: AtomicBool,
    }

    struct MockTransport {
        state: Arc<MockState>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn probe(&self) -> Result<()> {
            if self.state.probe_fails.load(Ordering::SeqCst) {
                Err(Error::ConnectionFailed("probe failed".into()))
            } else {
                Ok(())
            }
        }

        async fn execute(&self, command: &Command) -> Result<CommandResult> {
            Ok(CommandResult::success(&command.id, "mock", "ok"))
        }

        async fn stream(
            &self,
            _command: &Command,
            _stdout: &mut (dyn AsyncWrite + Send + Unpin),
            _stderr: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<i32> {
            Ok(0)
        }
    }

    fn pool_with(config: PoolConfig) -> (Pool, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let factory = Arc::clone(&state);
        let connect: ConnectFn = Arc::new(move || {
            let state = Arc::clone(&factory);
            Box::pin(async move {
                state.connects.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MockTransport { state }) as Box<dyn Transport>)
            })
        });
        (Pool::new(config, connect), state)
    }

    #[tokio::test]
    async fn reuses_released_connections() {
        let (pool, state) = pool_with(PoolConfig::default());

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        tokio::task::yield_now().await;

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().total_created, 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_after_wait() {
        let (pool, _state) = pool_with(PoolConfig {
            max_total: 1,
            acquire_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        });

        let held = pool.acquire().await.unwrap();
        match pool.acquire().await {
            Err(Error::PoolExhausted) => {},
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(pool.metrics().wait_count >= 1);
        drop(held);
    }

    #[tokio::test]
    async fn failed_probe_evicts_idle_connection() {
        let (pool, state) = pool_with(PoolConfig::default());

        drop(pool.acquire().await.unwrap());
        tokio::task::yield_now().await;
        assert_eq!(pool.metrics().idle, 1);

        state.probe_fails.store(true, Ordering::SeqCst);
        pool.maintain().await;
        assert_eq!(pool.metrics().idle, 0);
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().total_destroyed, 1);
    }

    #[tokio::test]
    async fn idle_deadline_reaps_connection() {
        let (pool, state) = pool_with(PoolConfig {
            idle_timeout: Duration::from_millis(0),
            ..PoolConfig::default()
        });

        drop(pool.acquire().await.unwrap());
        tokio::task::yield_now().await;

        pool.maintain().await;
        assert_eq!(pool.metrics().idle, 0);
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_forbids_acquire() {
        let (pool, _state) = pool_with(PoolConfig::default());
        drop(pool.acquire().await.unwrap());
        tokio::task::yield_now().await;

        pool.close().await;
        pool.close().await;
        match pool.acquire().await {
            Err(Error::PoolClosed) => {},
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn max_idle_caps_retained_connections() {
        let (pool, state) = pool_with(PoolConfig {
            max_total: 4,
            max_idle: 1,
            ..PoolConfig::default()
        });

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        // Releases hop through a spawned task.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(pool.metrics().idle, 1);
        assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);
    }
}
