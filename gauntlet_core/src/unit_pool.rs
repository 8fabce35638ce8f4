//! Bounded pool of unit worker threads.
//!
//! Spawning a worker thread and its runtime is the expensive part of a
//! unit, so workers are kept after a unit ends cleanly and handed to the
//! next acquisition. The unit itself is never reused: every acquisition
//! starts a fresh lifetime with a new identity and a new handshake.
//! Workers whose unit crashed, was terminated or broke protocol are
//! dropped. A [`PooledUnit`] that is dropped without being released (its
//! game was abandoned mid-flight) terminates the unit and is counted as a
//! discard.

use crate::gauntlet_protocol::Inbound;
use crate::gauntlet_unit::{ExecutionUnit, UnitError, UnitProgram, UnitStatus, Worker};

use gauntlet_env::{CodeLoader, GauntletContext};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle workers kept for reuse; extras are shut down on release
    pub max_idle: usize,

    /// Workers started eagerly when the pool is created
    pub prewarm: usize,

    /// How long a released unit may take to honor `TaskEnded`
    pub release_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 4,
            prewarm: 0,
            release_timeout_ms: 2_000,
        }
    }
}

impl PoolConfig {
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_prewarm(mut self, prewarm: usize) -> Self {
        self.prewarm = prewarm;
        self
    }

    pub fn with_release_timeout(mut self, ms: u64) -> Self {
        self.release_timeout_ms = ms;
        self
    }
}

/// Capacity accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Units currently checked out
    pub active: usize,

    /// Workers waiting for reuse
    pub idle: usize,

    /// Worker threads started over the pool's life
    pub spawned: usize,

    /// Workers returned to the idle list
    pub recycled: usize,

    /// Workers shut down on release
    pub discarded: usize,
}

struct PoolState {
    idle: Vec<Worker>,
    stats: PoolStats,
    next_worker: usize,
}

/// A unit checked out of the pool.
///
/// Hand it back with [`PoolManager::release`]. Dropping it instead
/// terminates the unit and settles the counters as a discard.
pub struct PooledUnit {
    unit: ExecutionUnit,
    state: Arc<Mutex<PoolState>>,
    settled: bool,
}

impl Deref for PooledUnit {
    type Target = ExecutionUnit;

    fn deref(&self) -> &ExecutionUnit {
        &self.unit
    }
}

impl DerefMut for PooledUnit {
    fn deref_mut(&mut self) -> &mut ExecutionUnit {
        &mut self.unit
    }
}

impl Drop for PooledUnit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.unit.terminate();
        if let Ok(mut state) = self.state.lock() {
            state.stats.active = state.stats.active.saturating_sub(1);
            state.stats.discarded += 1;
        }
        warn!(unit = %self.unit.id(), "Unit abandoned without release; worker discarded");
    }
}

/// Supervisor-owned unit pool. Cheap to clone; clones share one pool.
pub struct PoolManager<C: GauntletContext> {
    ctx: Arc<C>,
    loader: Arc<dyn CodeLoader>,
    config: PoolConfig,
    state: Arc<Mutex<PoolState>>,
}

impl<C: GauntletContext> Clone for PoolManager<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            loader: Arc::clone(&self.loader),
            config: self.config,
            state: Arc::clone(&self.state),
        }
    }
}

impl<C: GauntletContext> PoolManager<C> {
    /// Creates a pool, starting `config.prewarm` workers up front.
    pub fn new(ctx: Arc<C>, loader: Arc<dyn CodeLoader>, config: PoolConfig) -> Result<Self, UnitError> {
        let pool = Self {
            ctx,
            loader,
            config,
            state: Arc::new(Mutex::new(PoolState {
                idle: Vec::new(),
                stats: PoolStats::default(),
                next_worker: 0,
            })),
        };
        for _ in 0..config.prewarm {
            let worker = pool.spawn_worker()?;
            let mut state = pool.state.lock().unwrap();
            state.idle.push(worker);
            state.stats.idle = state.idle.len();
        }
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<C> {
        &self.ctx
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().unwrap().stats
    }

    /// Starts a new unit lifetime, on an idle worker when one is available.
    pub fn acquire(
        &self,
        program: Arc<dyn UnitProgram>,
        initial_dependencies: Vec<String>,
    ) -> Result<PooledUnit, UnitError> {
        let reused = {
            let mut state = self.state.lock().unwrap();
            let worker = state.idle.pop();
            state.stats.idle = state.idle.len();
            worker
        };
        let worker = match reused {
            Some(worker) => worker,
            None => self.spawn_worker()?,
        };

        let unit = ExecutionUnit::launch(
            self.ctx.as_ref(),
            worker,
            Arc::clone(&self.loader),
            program,
            initial_dependencies,
        )?;
        self.state.lock().unwrap().stats.active += 1;
        Ok(PooledUnit {
            unit,
            state: Arc::clone(&self.state),
            settled: false,
        })
    }

    /// Ends a unit's task and takes its worker back if the unit exited
    /// cleanly and there is room; otherwise the worker is shut down.
    pub async fn release(&self, mut unit: PooledUnit) -> UnitStatus {
        let _ = unit.post_message(Inbound::TaskEnded);
        let timeout = Duration::from_millis(self.config.release_timeout_ms);
        let status = match tokio::time::timeout(timeout, unit.wait_exit()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(unit = %unit.id(), "Unit ignored TaskEnded; terminating");
                unit.terminate();
                unit.wait_exit().await
            }
        };

        let worker = unit.take_worker();
        let mut state = self.state.lock().unwrap();
        unit.settled = true;
        state.stats.active = state.stats.active.saturating_sub(1);
        match (status.clone(), worker) {
            (UnitStatus::Exited, Some(worker)) if state.idle.len() < self.config.max_idle => {
                debug!(unit = %unit.id(), worker = %worker.name(), "Worker recycled");
                state.idle.push(worker);
                state.stats.recycled += 1;
            }
            (UnitStatus::Exited, _) => {
                debug!(unit = %unit.id(), "Idle list full; worker shut down");
                state.stats.discarded += 1;
            }
            (other, _) => {
                warn!(unit = %unit.id(), status = ?other, "Worker discarded");
                state.stats.discarded += 1;
            }
        }
        state.stats.idle = state.idle.len();
        status
    }

    fn spawn_worker(&self) -> Result<Worker, UnitError> {
        let n = {
            let mut state = self.state.lock().unwrap();
            state.next_worker += 1;
            state.stats.spawned += 1;
            state.next_worker
        };
        Worker::spawn(format!("gauntlet-worker-{n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauntlet_unit::UnitBootstrap;
    use async_trait::async_trait;
    use gauntlet_env::{StaticLoader, TokioContext};

    /// Waits for TaskEnded, or panics on the first message when `crash` is set.
    struct Idle {
        crash: bool,
    }

    #[async_trait]
    impl UnitProgram for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn run(&self, boot: UnitBootstrap) -> Result<(), UnitError> {
            let scope = boot.ready();
            let mut inbox = scope.add_listener();
            while let Some(msg) = inbox.recv().await {
                if self.crash {
                    panic!("crashed on {}", msg.action());
                }
                if msg == Inbound::TaskEnded {
                    return Ok(());
                }
            }
            Ok(())
        }
    }

    fn pool(config: PoolConfig) -> PoolManager<TokioContext> {
        PoolManager::new(TokioContext::shared(), Arc::new(StaticLoader::new()), config).unwrap()
    }

    #[tokio::test]
    async fn test_clean_release_recycles_worker_with_fresh_identity() {
        let pool = pool(PoolConfig::default());

        let mut first = pool.acquire(Arc::new(Idle { crash: false }), Vec::new()).unwrap();
        first.wait_ready().await.unwrap();
        let first_id = first.id();
        assert_eq!(pool.stats().active, 1);

        assert_eq!(pool.release(first).await, UnitStatus::Exited);
        let stats = pool.stats();
        assert_eq!((stats.active, stats.idle, stats.spawned, stats.recycled), (0, 1, 1, 1));

        let mut second = pool.acquire(Arc::new(Idle { crash: false }), Vec::new()).unwrap();
        second.wait_ready().await.unwrap();
        assert_ne!(second.id(), first_id);
        assert_eq!(pool.stats().spawned, 1);
        pool.release(second).await;
    }

    #[tokio::test]
    async fn test_crashed_unit_is_discarded() {
        let pool = pool(PoolConfig::default());

        let mut unit = pool.acquire(Arc::new(Idle { crash: true }), Vec::new()).unwrap();
        unit.wait_ready().await.unwrap();

        let status = pool.release(unit).await;
        assert!(matches!(status, UnitStatus::Failed(ref r) if r.contains("crashed on TASK_ENDED")));
        let stats = pool.stats();
        assert_eq!((stats.idle, stats.recycled, stats.discarded), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_idle_list_is_bounded() {
        let pool = pool(PoolConfig::default().with_max_idle(1));

        let a = pool.acquire(Arc::new(Idle { crash: false }), Vec::new()).unwrap();
        let b = pool.acquire(Arc::new(Idle { crash: false }), Vec::new()).unwrap();
        pool.release(a).await;
        pool.release(b).await;

        let stats = pool.stats();
        assert_eq!((stats.spawned, stats.idle, stats.recycled, stats.discarded), (2, 1, 1, 1));
    }

    #[tokio::test]
    async fn test_dropped_lease_is_counted_as_discard() {
        let pool = pool(PoolConfig::default());

        let mut kept = pool.acquire(Arc::new(Idle { crash: false }), Vec::new()).unwrap();
        let mut abandoned = pool.acquire(Arc::new(Idle { crash: false }), Vec::new()).unwrap();
        kept.wait_ready().await.unwrap();
        abandoned.wait_ready().await.unwrap();
        assert_eq!(pool.stats().active, 2);

        drop(abandoned);
        let stats = pool.stats();
        assert_eq!((stats.active, stats.discarded), (1, 1));

        pool.release(kept).await;
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.spawned, stats.idle + stats.discarded + stats.active);
    }

    #[tokio::test]
    async fn test_prewarm_fills_idle_list() {
        let pool = pool(PoolConfig::default().with_prewarm(2));
        assert_eq!(pool.stats().idle, 2);

        let unit = pool.acquire(Arc::new(Idle { crash: false }), Vec::new()).unwrap();
        let stats = pool.stats();
        assert_eq!((stats.spawned, stats.idle, stats.active), (2, 1, 1));
        pool.release(unit).await;
    }
}
