//! Bounded, health-checked pool of scrape engines.
//!
//! Each engine type has its own cap. A live engine owns one semaphore permit
//! for as long as it exists, idle or in use, so the number of live engines of
//! a type can never exceed its cap. The idle list lock is held only for
//! push/pop, never across a scrape.

use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::ScrapeError;
use crate::job::{EngineType, Job};
use crate::models::RawScrape;
use crate::traits::{EngineFactory, ScrapeEngine};

/// How long `cleanup_all` waits for checked-out engines to come back.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct PooledEngine {
    id: u64,
    engine: Box<dyn ScrapeEngine>,
    uses: u32,
    created_at: Instant,
    _permit: OwnedSemaphorePermit,
}

struct TypeSlot {
    engine_type: EngineType,
    cap: usize,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<PooledEngine>>,
    notify: Notify,
    in_use: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl TypeSlot {
    fn new(engine_type: EngineType, cap: usize) -> Self {
        Self {
            engine_type,
            cap,
            semaphore: Arc::new(Semaphore::new(cap)),
            idle: Mutex::new(Vec::new()),
            notify: Notify::new(),
            in_use: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<PooledEngine>> {
        self.idle.lock().unwrap_or_else(|poisoned| {
            warn!(engine = %self.engine_type, "Recovered from poisoned pool mutex");
            poisoned.into_inner()
        })
    }

    fn live(&self) -> usize {
        self.cap - self.semaphore.available_permits()
    }
}

struct PoolInner {
    factory: Arc<dyn EngineFactory>,
    config: PoolConfig,
    slots: [TypeSlot; 3],
    closed: AtomicBool,
    next_id: AtomicU64,
    drained: Notify,
}

impl PoolInner {
    fn slot(&self, engine_type: EngineType) -> &TypeSlot {
        let index = match engine_type {
            EngineType::Static => 0,
            EngineType::Render => 1,
            EngineType::Crawl => 2,
        };
        &self.slots[index]
    }

    fn live_total(&self) -> usize {
        self.slots.iter().map(TypeSlot::live).sum()
    }

    async fn destroy(&self, mut pooled: PooledEngine, reason: &str) {
        let engine_type = pooled.engine.engine_type();
        if let Err(e) = pooled.engine.cleanup().await {
            warn!(engine = %engine_type, engine_id = pooled.id, error = %e, "Engine cleanup failed");
        }
        debug!(
            engine = %engine_type,
            engine_id = pooled.id,
            uses = pooled.uses,
            age_secs = pooled.created_at.elapsed().as_secs(),
            reason,
            "Engine destroyed"
        );
        let slot = self.slot(engine_type);
        drop(pooled);
        slot.destroyed.fetch_add(1, Ordering::Relaxed);
        slot.notify.notify_one();
        self.drained.notify_waiters();
    }
}

/// Exclusive lease on one pooled engine.
///
/// Give it back with [`EnginePool::release`]. A handle dropped without release
/// (e.g. its task was cancelled mid-scrape) destroys the engine.
pub struct EngineHandle {
    pooled: Option<PooledEngine>,
    engine_type: EngineType,
    job_id: String,
    pool: Arc<PoolInner>,
}

impl EngineHandle {
    pub fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    pub fn engine_id(&self) -> Option<u64> {
        self.pooled.as_ref().map(|p| p.id)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn scrape(&mut self, job: &Job) -> Result<RawScrape, ScrapeError> {
        let Some(pooled) = self.pooled.as_mut() else {
            return Err(ScrapeError::internal("engine handle already released"));
        };
        pooled.uses += 1;
        pooled.engine.scrape(job).await
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let Some(pooled) = self.pooled.take() else {
            return;
        };
        let slot = self.pool.slot(self.engine_type);
        slot.in_use.fetch_sub(1, Ordering::SeqCst);
        warn!(
            engine = %self.engine_type,
            engine_id = pooled.id,
            job_id = %self.job_id,
            "Engine handle dropped without release, destroying engine"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let pool = Arc::clone(&self.pool);
                rt.spawn(async move { pool.destroy(pooled, "dropped").await });
            }
            Err(_) => {
                drop(pooled);
                slot.notify.notify_one();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeStats {
    pub cap: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub destroyed: u64,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub closed: bool,
    pub per_type: BTreeMap<EngineType, TypeStats>,
}

impl PoolStats {
    pub fn get(&self, engine_type: EngineType) -> Option<&TypeStats> {
        self.per_type.get(&engine_type)
    }
}

/// Shared engine pool. Clones refer to the same pool.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

impl EnginePool {
    pub fn new(factory: Arc<dyn EngineFactory>, config: PoolConfig) -> Self {
        let slots = EngineType::ALL.map(|t| TypeSlot::new(t, config.cap(t)));
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                slots,
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                drained: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Lease an engine: an idle one if available, a new one under the cap,
    /// otherwise wait up to `acquire_timeout` for one to be released.
    pub async fn acquire(
        &self,
        engine_type: EngineType,
        job: &Job,
    ) -> Result<EngineHandle, ScrapeError> {
        let slot = self.inner.slot(engine_type);
        let deadline = Instant::now() + self.inner.config.acquire_timeout;

        loop {
            if self.is_closed() {
                return Err(ScrapeError::internal("engine pool is shut down"));
            }

            let mut notified = pin!(slot.notify.notified());
            notified.as_mut().enable();

            let reused = slot.lock_idle().pop();
            if let Some(pooled) = reused {
                debug!(engine = %engine_type, engine_id = pooled.id, job_id = %job.id, "Reusing idle engine");
                return Ok(self.lease(pooled, job));
            }

            if let Ok(permit) = Arc::clone(&slot.semaphore).try_acquire_owned() {
                let pooled = self.create(engine_type, permit).await?;
                return Ok(self.lease(pooled, job));
            }

            debug!(engine = %engine_type, job_id = %job.id, "Engine pool at cap, waiting");
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    warn!(engine = %engine_type, cap = slot.cap, job_id = %job.id, "Engine pool exhausted");
                    return Err(ScrapeError::internal(format!(
                        "engine pool exhausted: no {engine_type} engine within {} ms",
                        self.inner.config.acquire_timeout.as_millis()
                    )));
                }
            }
        }
    }

    async fn create(
        &self,
        engine_type: EngineType,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledEngine, ScrapeError> {
        let slot = self.inner.slot(engine_type);
        let result = match self.inner.factory.create(engine_type).await {
            Ok(mut engine) => match engine.initialize(&self.inner.config.engine).await {
                Ok(()) => Ok(engine),
                Err(e) => {
                    let _ = engine.cleanup().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(engine) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                slot.created.fetch_add(1, Ordering::Relaxed);
                info!(engine = %engine_type, engine_id = id, live = slot.live(), "Engine created");
                Ok(PooledEngine {
                    id,
                    engine,
                    uses: 0,
                    created_at: Instant::now(),
                    _permit: permit,
                })
            }
            Err(e) => {
                drop(permit);
                slot.notify.notify_one();
                warn!(engine = %engine_type, error = %e, "Engine creation failed");
                Err(e)
            }
        }
    }

    fn lease(&self, pooled: PooledEngine, job: &Job) -> EngineHandle {
        let engine_type = pooled.engine.engine_type();
        self.inner
            .slot(engine_type)
            .in_use
            .fetch_add(1, Ordering::SeqCst);
        EngineHandle {
            pooled: Some(pooled),
            engine_type,
            job_id: job.id.clone(),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a handle. Healthy engines go back to idle; engines that ask to
    /// be recycled, reached `max_uses`, or outlived the pool are destroyed.
    pub async fn release(&self, mut handle: EngineHandle) {
        let Some(pooled) = handle.pooled.take() else {
            return;
        };
        let slot = self.inner.slot(handle.engine_type);
        slot.in_use.fetch_sub(1, Ordering::SeqCst);

        let reason = if pooled.engine.needs_recycle() {
            Some("recycle requested")
        } else if pooled.uses >= self.inner.config.max_uses {
            Some("max uses reached")
        } else {
            None
        };

        if let Some(reason) = reason {
            self.inner.destroy(pooled, reason).await;
            return;
        }

        let rejected = {
            let mut idle = slot.lock_idle();
            if self.is_closed() {
                Some(pooled)
            } else {
                idle.push(pooled);
                None
            }
        };
        match rejected {
            Some(pooled) => self.inner.destroy(pooled, "pool closed").await,
            None => slot.notify.notify_one(),
        }
    }

    /// Health-check every idle engine once; destroy the ones that fail.
    ///
    /// Returns the number evicted. Replacements are created lazily by `acquire`.
    pub async fn sweep(&self) -> usize {
        let mut evicted = 0;
        for slot in &self.inner.slots {
            let candidates = std::mem::take(&mut *slot.lock_idle());
            for pooled in candidates {
                if pooled.engine.health_check().await {
                    let rejected = {
                        let mut idle = slot.lock_idle();
                        if self.is_closed() {
                            Some(pooled)
                        } else {
                            idle.push(pooled);
                            None
                        }
                    };
                    match rejected {
                        Some(pooled) => self.inner.destroy(pooled, "pool closed").await,
                        None => slot.notify.notify_one(),
                    }
                } else {
                    warn!(engine = %slot.engine_type, engine_id = pooled.id, "Engine failed health check");
                    self.inner.destroy(pooled, "health check failed").await;
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_health_sweep(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.sweep().await;
                        if evicted > 0 {
                            info!(evicted, "Health sweep evicted engines");
                        }
                    }
                }
            }
        })
    }

    /// Close the pool and terminate every engine.
    ///
    /// Idle engines are destroyed immediately; checked-out engines are
    /// destroyed as their handles come back, and this waits (bounded) for them.
    pub async fn cleanup_all(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        for slot in &self.inner.slots {
            let idle = std::mem::take(&mut *slot.lock_idle());
            for pooled in idle {
                self.inner.destroy(pooled, "shutdown").await;
            }
            slot.notify.notify_waiters();
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let mut drained = pin!(self.inner.drained.notified());
            drained.as_mut().enable();
            let live = self.inner.live_total();
            if live == 0 {
                break;
            }
            tokio::select! {
                () = &mut drained => {}
                () = tokio::time::sleep_until(deadline) => {
                    warn!(live, "Engines still checked out after shutdown drain timeout");
                    break;
                }
            }
        }
        info!("Engine pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let per_type = self
            .inner
            .slots
            .iter()
            .map(|slot| {
                let idle = slot.lock_idle().len();
                (
                    slot.engine_type,
                    TypeStats {
                        cap: slot.cap,
                        live: slot.live(),
                        idle,
                        in_use: slot.in_use.load(Ordering::SeqCst),
                        created: slot.created.load(Ordering::Relaxed),
                        destroyed: slot.destroyed.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        PoolStats {
            closed: self.is_closed(),
            per_type,
        }
    }
}
