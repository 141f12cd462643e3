//! Generic bounded connection pool (spec §4.3).
//!
//! Grounded on the teacher's `JobWorker` resource-bookkeeping idiom
//! (`Arc<RwLock<HashMap<..>>>` tracking live state) and its
//! `tokio_util::sync::CancellationToken`-based cooperative shutdown; here
//! applied to pooled provider sessions instead of running jobs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{CoreError, Result};

/// Creates and health-checks sessions of type `S` on the pool's behalf.
/// A provider adapter implements this over whatever session type its
/// wire protocol uses.
#[async_trait]
pub trait SessionFactory<S>: Send + Sync {
    async fn create(&self) -> anyhow::Result<S>;
    async fn health_check(&self, session: &S) -> bool;
}

struct Entry<S> {
    session: S,
    last_used: Instant,
    _permit: OwnedSemaphorePermit,
}

/// A checked-out session. Returned to the idle list on drop unless
/// explicitly discarded via [`PoolGuard::discard`].
pub struct PoolGuard<S: Send + Sync + 'static> {
    entry: Option<Entry<S>>,
    pool: Arc<ConnectionPoolInner<S>>,
}

impl<S: Send + Sync + 'static> std::ops::Deref for PoolGuard<S> {
    type Target = S;
    fn deref(&self) -> &S {
        &self.entry.as_ref().expect("guard used after discard").session
    }
}

impl<S: Send + Sync + 'static> std::ops::DerefMut for PoolGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.entry.as_mut().expect("guard used after discard").session
    }
}

impl<S: Send + Sync + 'static> PoolGuard<S> {
    /// Drop the session instead of returning it to the idle list, freeing
    /// its capacity slot immediately (e.g. after a health failure observed
    /// by the caller).
    pub fn discard(mut self) {
        self.entry.take();
    }
}

impl<S: Send + Sync + 'static> Drop for PoolGuard<S> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            entry.last_used = Instant::now();
            self.pool.idle.lock().unwrap().push_back(entry);
        }
    }
}

struct ConnectionPoolInner<S> {
    factory: Arc<dyn SessionFactory<S>>,
    idle: StdMutex<VecDeque<Entry<S>>>,
    semaphore: Arc<Semaphore>,
    idle_timeout: Duration,
    total_created: AtomicU64,
    total_reused: AtomicU64,
}

/// Bounded pool of reusable provider sessions, capped at `max_connections`
/// live sessions (idle or checked out). A background sweeper closes
/// sessions idle longer than `idle_timeout` and re-validates the rest at
/// `health_check_interval`; an unhealthy session is dropped, never reused.
pub struct ConnectionPool<S: Send + Sync + 'static> {
    inner: Arc<ConnectionPoolInner<S>>,
}

impl<S: Send + Sync + 'static> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> ConnectionPool<S> {
    pub fn new(factory: Arc<dyn SessionFactory<S>>, max_connections: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ConnectionPoolInner {
                factory,
                idle: StdMutex::new(VecDeque::new()),
                semaphore: Arc::new(Semaphore::new(max_connections)),
                idle_timeout,
                total_created: AtomicU64::new(0),
                total_reused: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a session, reusing a healthy idle one if available, else
    /// creating a new one if under capacity, else waiting for a slot to
    /// free up. Waiting for a slot is bounded two ways: `deadline` elapsing
    /// surfaces `ErrAtCapacity` (spec §4.3's named contract); the caller's
    /// `cancel` firing surfaces `Cancelled` instead, since that's the
    /// caller giving up, not the pool being out of room.
    pub async fn acquire(&self, deadline: Duration, cancel: &CancellationToken) -> Result<PoolGuard<S>> {
        loop {
            if let Some(entry) = self.inner.idle.lock().unwrap().pop_front() {
                if entry.last_used.elapsed() >= self.inner.idle_timeout
                    || !self.inner.factory.health_check(&entry.session).await
                {
                    // permit drops with `entry`, freeing the slot for a fresh session
                    continue;
                }
                self.inner.total_reused.fetch_add(1, Ordering::Relaxed);
                return Ok(PoolGuard {
                    entry: Some(entry),
                    pool: self.inner.clone(),
                });
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled(uuid::Uuid::nil())),
                _ = tokio::time::sleep(deadline) => return Err(CoreError::AtCapacity),
                permit = self.inner.semaphore.clone().acquire_owned() => permit,
            };
            let permit = permit.map_err(|_| CoreError::AtCapacity)?;

            match self.inner.factory.create().await {
                Ok(session) => {
                    self.inner.total_created.fetch_add(1, Ordering::Relaxed);
                    return Ok(PoolGuard {
                        entry: Some(Entry {
                            session,
                            last_used: Instant::now(),
                            _permit: permit,
                        }),
                        pool: self.inner.clone(),
                    });
                }
                Err(err) => {
                    warn!(error = %err, "session creation failed");
                    drop(permit);
                    return Err(CoreError::Store(err));
                }
            }
        }
    }

    pub fn total_created(&self) -> u64 {
        self.inner.total_created.load(Ordering::Relaxed)
    }

    pub fn total_reused(&self) -> u64 {
        self.inner.total_reused.load(Ordering::Relaxed)
    }

    /// Fraction of acquisitions served from the idle list rather than
    /// freshly created.
    pub fn reuse_ratio(&self) -> f64 {
        let created = self.inner.total_created.load(Ordering::Relaxed);
        let reused = self.inner.total_reused.load(Ordering::Relaxed);
        let total = created + reused;
        if total == 0 {
            0.0
        } else {
            reused as f64 / total as f64
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    /// Run the background sweeper until `shutdown` fires. One tick per
    /// `health_check_interval`: closes idle-timed-out sessions, then
    /// health-checks the rest and drops the unhealthy ones.
    pub async fn run_sweeper(&self, health_check_interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(health_check_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.sweep_once().await,
            }
        }
    }

    async fn sweep_once(&self) {
        let stale: Vec<Entry<S>> = {
            let mut idle = self.inner.idle.lock().unwrap();
            let mut keep = VecDeque::new();
            let mut drop_list = Vec::new();
            while let Some(entry) = idle.pop_front() {
                if entry.last_used.elapsed() >= self.inner.idle_timeout {
                    drop_list.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            *idle = keep;
            drop_list
        };
        drop(stale);

        let mut survivors = VecDeque::new();
        let candidates: Vec<Entry<S>> = self.inner.idle.lock().unwrap().drain(..).collect();
        for entry in candidates {
            if self.inner.factory.health_check(&entry.session).await {
                survivors.push_back(entry);
            }
        }
        *self.inner.idle.lock().unwrap() = survivors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingFactory {
        created: AtomicUsize,
        healthy: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl SessionFactory<u32> for CountingFactory {
        async fn create(&self) -> anyhow::Result<u32> {
            Ok(self.created.fetch_add(1, Ordering::Relaxed) as u32)
        }
        async fn health_check(&self, _session: &u32) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn reuses_healthy_idle_session() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        let pool = ConnectionPool::new(factory, 2, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let guard = pool.acquire(Duration::from_secs(5), &cancel).await.unwrap();
        drop(guard);
        let _guard2 = pool.acquire(Duration::from_secs(5), &cancel).await.unwrap();

        assert_eq!(pool.total_created(), 1);
        assert_eq!(pool.total_reused(), 1);
    }

    #[tokio::test]
    async fn unhealthy_idle_session_is_not_reused() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        let pool = ConnectionPool::new(factory.clone(), 2, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let guard = pool.acquire(Duration::from_secs(5), &cancel).await.unwrap();
        drop(guard);
        factory.healthy.store(false, Ordering::Relaxed);
        let _guard2 = pool.acquire(Duration::from_secs(5), &cancel).await.unwrap();

        assert_eq!(pool.total_created(), 2);
        assert_eq!(pool.total_reused(), 0);
    }

    #[test]
    fn acquire_blocks_while_at_capacity() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        let pool = ConnectionPool::new(factory, 1, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = rt.block_on(pool.acquire(Duration::from_secs(5), &cancel)).unwrap();

        let mut waiting = tokio_test::task::spawn(pool.acquire(Duration::from_secs(5), &cancel));
        rt.block_on(async {
            tokio_test::assert_pending!(waiting.poll());
        });
    }

    #[tokio::test]
    async fn cancelling_while_at_capacity_returns_cancelled() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        let pool = ConnectionPool::new(factory, 1, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let _guard = pool.acquire(Duration::from_secs(5), &cancel).await.unwrap();
        cancel.cancel();
        let err = pool.acquire(Duration::from_secs(5), &cancel).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled(_)));
    }

    #[tokio::test]
    async fn deadline_elapsing_while_at_capacity_returns_at_capacity() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        let pool = ConnectionPool::new(factory, 1, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let _guard = pool.acquire(Duration::from_secs(5), &cancel).await.unwrap();
        let err = pool.acquire(Duration::from_millis(20), &cancel).await.unwrap_err();
        assert!(matches!(err, CoreError::AtCapacity));
    }
}
