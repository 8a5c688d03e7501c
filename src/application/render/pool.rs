//! Bounded pool of renderer instances.
//!
//! At most `max_concurrency` instances are alive at any time. Instances are
//! started lazily (only `prewarm` of them eagerly), reused across jobs, and
//! recycled once they have served `recycle_after` renders or once a render on
//! them failed in a way that leaves their state unknown.
//!
//! All bookkeeping lives in one mutex-guarded [`PoolState`]; the lock is never
//! held across an `.await`. Slow work (launching, closing) happens outside the
//! lock on instances that have already been reserved or detached.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::util::lock::mutex_lock;

use super::engine::{
    ContextOptions, EngineError, PdfOptions, RendererEngine, RendererInstance, RenderingContext,
};

const SOURCE: &str = "application::render::pool";

pub const DEFAULT_RECYCLE_AFTER: u32 = 50;
pub const DEFAULT_PREWARM_INSTANCES: usize = 1;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrency: usize,
    pub recycle_after: u32,
    pub prewarm: usize,
    pub context: ContextOptions,
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Every instance is leased and the ceiling is reached. The worker limiter
    /// is sized to the pool, so this means the two ceilings disagree.
    #[error("renderer pool exhausted: {in_use} of {max} instances in use")]
    Exhausted { in_use: usize, max: usize },
    #[error("renderer pool is shut down")]
    ShuttingDown,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Instance counts exposed to health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub max: usize,
    pub recycled: u64,
    pub contexts_acquired: u64,
    pub contexts_released: u64,
}

struct PooledInstance {
    id: u64,
    renders: u32,
    instance: Box<dyn RendererInstance>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledInstance>,
    /// Instances alive or being launched, idle or leased.
    live: usize,
    in_use: usize,
    shut_down: bool,
}

#[derive(Default)]
struct PoolShared {
    state: Mutex<PoolState>,
    next_instance_id: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    recycled: AtomicU64,
}

impl PoolShared {
    fn lock(&self, op: &'static str) -> std::sync::MutexGuard<'_, PoolState> {
        mutex_lock(&self.state, SOURCE, op)
    }

    /// Forget a leased slot whose instance is gone.
    fn retire_leased_slot(&self, op: &'static str) {
        let mut state = self.lock(op);
        state.live = state.live.saturating_sub(1);
        state.in_use = state.in_use.saturating_sub(1);
    }
}

#[derive(Clone)]
pub struct RendererPool {
    engine: Arc<dyn RendererEngine>,
    config: Arc<PoolConfig>,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for RendererPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RendererPool {
    pub fn new(engine: Arc<dyn RendererEngine>, config: PoolConfig) -> Self {
        Self {
            engine,
            config: Arc::new(config),
            shared: Arc::new(PoolShared::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    /// Launch up to `prewarm` idle instances so the first jobs skip the
    /// startup cost. Launch failures are logged; the pool still scales lazily.
    pub async fn prewarm(&self) -> usize {
        let wanted = self.config.prewarm.min(self.config.max_concurrency);
        let mut started = 0;

        for _ in 0..wanted {
            {
                let mut state = self.shared.lock("prewarm.reserve");
                if state.shut_down || state.live >= self.config.max_concurrency {
                    break;
                }
                state.live += 1;
            }

            match self.launch_instance().await {
                Ok(instance) => {
                    let mut state = self.shared.lock("prewarm.commit");
                    state.idle.push_back(instance);
                    started += 1;
                }
                Err(err) => {
                    let mut state = self.shared.lock("prewarm.rollback");
                    state.live = state.live.saturating_sub(1);
                    warn!(
                        target = SOURCE,
                        op = "pool::prewarm",
                        result = "launch_failed",
                        error = %err,
                        "Renderer pre-warm failed; instances will start on demand"
                    );
                    break;
                }
            }
        }

        info!(
            target = SOURCE,
            op = "pool::prewarm",
            started,
            max_concurrency = self.config.max_concurrency,
            "Renderer pool warmed"
        );
        started
    }

    /// Lease an isolated rendering context.
    ///
    /// Reuses an idle instance when one exists, otherwise launches a new one
    /// while below the ceiling. Fails with [`PoolError::Exhausted`] when every
    /// instance is already leased.
    pub async fn acquire_context(&self) -> Result<ContextLease, PoolError> {
        let reserved = {
            let mut state = self.shared.lock("acquire.reserve");
            if state.shut_down {
                return Err(PoolError::ShuttingDown);
            }

            if let Some(instance) = state.idle.pop_front() {
                state.in_use += 1;
                Some(instance)
            } else if state.live < self.config.max_concurrency {
                state.live += 1;
                state.in_use += 1;
                None
            } else {
                let in_use = state.in_use;
                drop(state);
                error!(
                    target = SOURCE,
                    op = "pool::acquire_context",
                    result = "exhausted",
                    fatal_configuration = true,
                    in_use,
                    max_concurrency = self.config.max_concurrency,
                    "Renderer pool exhausted; worker concurrency exceeds pool ceiling"
                );
                return Err(PoolError::Exhausted {
                    in_use,
                    max: self.config.max_concurrency,
                });
            }
        };

        let pooled = match reserved {
            Some(instance) => instance,
            None => match self.launch_instance().await {
                Ok(instance) => instance,
                Err(err) => {
                    self.shared.retire_leased_slot("acquire.launch_failed");
                    return Err(err.into());
                }
            },
        };

        let opened = timeout(
            self.config.context.operation_timeout,
            pooled.instance.new_context(&self.config.context),
        )
        .await
        .unwrap_or(Err(EngineError::Timeout(
            self.config.context.operation_timeout,
        )));

        match opened {
            Ok(context) => {
                self.shared.acquired.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target = SOURCE,
                    op = "pool::acquire_context",
                    instance_id = pooled.id,
                    renders = pooled.renders,
                    "Rendering context acquired"
                );
                Ok(ContextLease {
                    slot: Some(LeasedSlot {
                        instance: pooled,
                        context,
                    }),
                    failed: false,
                    shared: Arc::clone(&self.shared),
                })
            }
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "pool::acquire_context",
                    result = "context_failed",
                    instance_id = pooled.id,
                    error = %err,
                    "Failed to open rendering context; discarding instance"
                );
                self.close_instance(pooled, "context_open_failed").await;
                self.shared.retire_leased_slot("acquire.context_failed");
                Err(err.into())
            }
        }
    }

    /// Close the lease's context and hand its instance back.
    ///
    /// The instance's render count is incremented; it is closed and replaced
    /// when the count reaches the recycle ceiling, when the lease was marked
    /// failed, or when closing the context itself fails.
    pub async fn release_context(&self, mut lease: ContextLease) {
        let Some(LeasedSlot {
            mut instance,
            mut context,
        }) = lease.slot.take()
        else {
            return;
        };

        let close_result = timeout(self.config.context.operation_timeout, context.close())
            .await
            .unwrap_or(Err(EngineError::Timeout(
                self.config.context.operation_timeout,
            )));
        drop(context);

        instance.renders = instance.renders.saturating_add(1);
        self.shared.released.fetch_add(1, Ordering::Relaxed);

        let recycle_reason = if lease.failed {
            Some("render_failed")
        } else if let Err(err) = &close_result {
            warn!(
                target = SOURCE,
                op = "pool::release_context",
                result = "close_failed",
                instance_id = instance.id,
                error = %err,
                "Failed to close rendering context; force-recycling instance"
            );
            Some("context_close_failed")
        } else if instance.renders >= self.config.recycle_after {
            Some("render_ceiling")
        } else {
            None
        };

        match recycle_reason {
            Some(reason) => self.recycle(instance, reason).await,
            None => {
                let orphaned = {
                    let mut state = self.shared.lock("release.return");
                    if state.shut_down {
                        Some(instance)
                    } else {
                        state.in_use = state.in_use.saturating_sub(1);
                        state.idle.push_back(instance);
                        None
                    }
                };
                if let Some(instance) = orphaned {
                    self.close_instance(instance, "shutdown").await;
                    self.shared.retire_leased_slot("release.shutdown");
                }
            }
        }
    }

    /// Close every idle instance and refuse further leases. Instances that are
    /// leased right now are closed when they are released.
    pub async fn cleanup(&self) -> usize {
        let idle: Vec<PooledInstance> = {
            let mut state = self.shared.lock("cleanup");
            state.shut_down = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(drained.len());
            drained
        };

        let closed = idle.len();
        for instance in idle {
            self.close_instance(instance, "shutdown").await;
        }

        info!(
            target = SOURCE,
            op = "pool::cleanup",
            closed,
            "Renderer pool shut down"
        );
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock("stats");
        PoolStats {
            total: state.live,
            available: state.idle.len(),
            in_use: state.in_use,
            max: self.config.max_concurrency,
            recycled: self.shared.recycled.load(Ordering::Relaxed),
            contexts_acquired: self.shared.acquired.load(Ordering::Relaxed),
            contexts_released: self.shared.released.load(Ordering::Relaxed),
        }
    }

    async fn recycle(&self, instance: PooledInstance, reason: &'static str) {
        let old_id = instance.id;
        let renders = instance.renders;
        self.close_instance(instance, reason).await;
        self.shared.recycled.fetch_add(1, Ordering::Relaxed);

        if self.shared.lock("recycle.check").shut_down {
            self.shared.retire_leased_slot("recycle.shutdown");
            return;
        }

        match self.launch_instance().await {
            Ok(replacement) => {
                info!(
                    target = SOURCE,
                    op = "pool::recycle",
                    reason,
                    renders,
                    old_instance_id = old_id,
                    new_instance_id = replacement.id,
                    "Renderer instance recycled"
                );
                let orphaned = {
                    let mut state = self.shared.lock("recycle.commit");
                    state.in_use = state.in_use.saturating_sub(1);
                    if state.shut_down {
                        state.live = state.live.saturating_sub(1);
                        Some(replacement)
                    } else {
                        state.idle.push_back(replacement);
                        None
                    }
                };
                if let Some(replacement) = orphaned {
                    self.close_instance(replacement, "shutdown").await;
                }
            }
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "pool::recycle",
                    reason,
                    old_instance_id = old_id,
                    error = %err,
                    "Replacement launch failed; slot freed for lazy start"
                );
                self.shared.retire_leased_slot("recycle.launch_failed");
            }
        }
    }

    async fn launch_instance(&self) -> Result<PooledInstance, EngineError> {
        let started_at = Instant::now();
        let id = self.shared.next_instance_id.fetch_add(1, Ordering::Relaxed) + 1;

        match self.engine.launch().await {
            Ok(instance) => {
                info!(
                    target = SOURCE,
                    op = "pool::launch",
                    result = "ok",
                    instance_id = id,
                    elapsed_ms = elapsed_ms(started_at),
                    "Renderer instance launched"
                );
                Ok(PooledInstance {
                    id,
                    renders: 0,
                    instance,
                })
            }
            Err(err) => {
                error!(
                    target = SOURCE,
                    op = "pool::launch",
                    result = "error",
                    instance_id = id,
                    elapsed_ms = elapsed_ms(started_at),
                    error = %err,
                    "Renderer instance failed to launch"
                );
                Err(err)
            }
        }
    }

    async fn close_instance(&self, pooled: PooledInstance, reason: &'static str) {
        let closed = timeout(self.config.context.operation_timeout, pooled.instance.close())
            .await
            .unwrap_or(Err(EngineError::Timeout(
                self.config.context.operation_timeout,
            )));

        if let Err(err) = closed {
            warn!(
                target = SOURCE,
                op = "pool::close_instance",
                result = "error",
                instance_id = pooled.id,
                reason,
                error = %err,
                "Renderer instance did not close cleanly"
            );
        } else {
            debug!(
                target = SOURCE,
                op = "pool::close_instance",
                instance_id = pooled.id,
                renders = pooled.renders,
                reason,
                "Renderer instance closed"
            );
        }
    }
}

fn elapsed_ms(started_at: Instant) -> u64 {
    u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
}

struct LeasedSlot {
    instance: PooledInstance,
    context: Box<dyn RenderingContext>,
}

/// A rendering context leased from the pool together with its instance.
///
/// Hand it back with [`RendererPool::release_context`]. A lease dropped
/// without release (cancelled task) discards its instance and frees the slot.
pub struct ContextLease {
    slot: Option<LeasedSlot>,
    failed: bool,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("instance_id", &self.instance_id())
            .field("failed", &self.failed)
            .finish()
    }
}

impl ContextLease {
    pub fn instance_id(&self) -> Option<u64> {
        self.slot.as_ref().map(|slot| slot.instance.id)
    }

    /// Mark the context as being in an unknown state so its instance is
    /// recycled on release instead of returning to the idle set.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub async fn set_content(&mut self, html: &str) -> Result<(), EngineError> {
        self.context_mut()?.set_content(html).await
    }

    pub async fn render_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>, EngineError> {
        self.context_mut()?.render_pdf(options).await
    }

    fn context_mut(&mut self) -> Result<&mut Box<dyn RenderingContext>, EngineError> {
        self.slot
            .as_mut()
            .map(|slot| &mut slot.context)
            .ok_or_else(|| EngineError::Crashed("rendering context already released".into()))
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            warn!(
                target = SOURCE,
                op = "pool::lease_drop",
                instance_id = slot.instance.id,
                "Rendering context dropped without release; discarding instance"
            );
            self.shared.released.fetch_add(1, Ordering::Relaxed);
            self.shared.recycled.fetch_add(1, Ordering::Relaxed);
            self.shared.retire_leased_slot("lease.drop");
        }
    }
}

impl PoolConfig {
    /// Default recycle ceiling and pre-warm count for the given concurrency.
    pub fn with_ceiling(max_concurrency: usize, context: ContextOptions) -> Self {
        Self {
            max_concurrency,
            recycle_after: DEFAULT_RECYCLE_AFTER,
            prewarm: DEFAULT_PREWARM_INSTANCES,
            context,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.context.operation_timeout
    }
}
