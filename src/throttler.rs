//! Task queue throttler
//!
//! The throttler keeps a registry of throttled task queues and the budget
//! pools constraining them, and drives the pump that releases throttled work.
//!
//! A throttled queue carries a fence, so tasks posted to it accumulate instead
//! of running. Each pump moves the fence of every eligible queue to `Now`,
//! which releases the tasks queued so far and holds back everything posted
//! afterwards. Pumps are aligned to whole multiples of
//! [`ThrottlerConfig::alignment`] so independently throttled queues wake up
//! together. A queue whose budget pool is in debt is skipped until the pool's
//! next allowed run time.
//!
//! All methods are meant to be called from one scheduling thread. Work raised
//! on other threads reaches the throttler through
//! [`crate::time_domain::WorkReceiver`].

#![forbid(unsafe_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::budget_pool::{
    BudgetPool, CpuTimeBudgetPool, ManagedPool, PoolId, PoolMembership, ReportingCallback,
};
use crate::clock::{LazyNow, TickClock};
use crate::config::{BudgetPoolConfig, ThrottlerConfig, DEFAULT_RECOVERY_RATE};
use crate::error::{Result, ThrottlerError};
use crate::hooks::HookRegistry;
use crate::metrics::ThrottlerMetrics;
use crate::pump::PumpTimer;
use crate::task_queue::{FencePosition, QueueId, TaskQueue};
use crate::time::{TimeDelta, TimeTicks};
use crate::time_domain::TimeDomainObserver;

/* Per-queue state; exists while ref-counted or in a pool */
struct Metadata {
    queue: Arc<dyn TaskQueue>,
    throttling_ref_count: usize,
    time_budget_pool: Option<PoolId>,
}

impl Metadata {
    fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            queue,
            throttling_ref_count: 0,
            time_budget_pool: None,
        }
    }
}

#[derive(Serialize)]
struct QueueDetailsState<'a> {
    name: &'a str,
    throttling_ref_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_budget_pool: Option<u64>,
}

fn min_optional(a: Option<TimeTicks>, b: Option<TimeTicks>) -> Option<TimeTicks> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn max_optional(a: Option<TimeTicks>, b: Option<TimeTicks>) -> Option<TimeTicks> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Throttles task queues and enforces budget pools.
pub struct TaskQueueThrottler {
    config: ThrottlerConfig,
    clock: Arc<dyn TickClock>,
    pump_timer: Box<dyn PumpTimer>,
    queue_details: BTreeMap<QueueId, Metadata>,
    budget_pools: BTreeMap<PoolId, Box<dyn ManagedPool>>,
    next_pool_id: u64,
    pending_pump_throttled_tasks_runtime: Option<TimeTicks>,
    allow_throttling: bool,
    hooks: HookRegistry,
    metrics: Arc<ThrottlerMetrics>,
}

impl TaskQueueThrottler {
    /// Creates a throttler with throttling allowed.
    pub fn new(
        config: ThrottlerConfig,
        clock: Arc<dyn TickClock>,
        pump_timer: Box<dyn PumpTimer>,
    ) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            name = %config.name,
            alignment = %config.alignment,
            clock = clock.name(),
            "Task queue throttler initialized"
        );

        Ok(Self {
            config,
            clock,
            pump_timer,
            queue_details: BTreeMap::new(),
            budget_pools: BTreeMap::new(),
            next_pool_id: 1,
            pending_pump_throttled_tasks_runtime: None,
            allow_throttling: true,
            hooks: HookRegistry::new(),
            metrics: Arc::new(ThrottlerMetrics::new()),
        })
    }

    #[inline]
    fn now(&self) -> TimeTicks {
        self.clock.now_ticks()
    }

    /// Configuration in use.
    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    /// Hook registry for instrumentation.
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Shared event counters.
    pub fn metrics(&self) -> Arc<ThrottlerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Adds one throttling reason to `queue`.
    ///
    /// On the first reason the queue is fenced and, if it has work, a pump is
    /// scheduled.
    pub fn increase_throttle_ref_count(&mut self, queue: &Arc<dyn TaskQueue>) {
        let id = queue.id();
        let metadata = self
            .queue_details
            .entry(id)
            .or_insert_with(|| Metadata::new(Arc::clone(queue)));
        metadata.throttling_ref_count += 1;
        if metadata.throttling_ref_count != 1 {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(queue_id = ?id, queue = queue.name(), "Task queue throttled");

        self.metrics.record_queue_throttled();
        self.metrics.update_throttled_queues(self.throttled_queue_count());
        self.hooks.on_queue_throttled(id);

        if !self.allow_throttling {
            return;
        }

        queue.insert_fence(FencePosition::BeginningOfTime);

        if !queue.is_queue_enabled() || queue.is_empty() {
            return;
        }
        if queue.has_pending_immediate_work() {
            self.on_time_domain_has_immediate_work(id);
        } else {
            self.on_time_domain_has_delayed_work(id);
        }
    }

    /// Removes one throttling reason from `queue`.
    ///
    /// When the last reason goes the fence is removed and the queue runs
    /// freely. Unknown queues and queues at zero are ignored.
    pub fn decrease_throttle_ref_count(&mut self, queue: QueueId) {
        let Some(metadata) = self.queue_details.get_mut(&queue) else {
            return;
        };
        if metadata.throttling_ref_count == 0 {
            return;
        }
        metadata.throttling_ref_count -= 1;
        if metadata.throttling_ref_count != 0 {
            return;
        }
        let task_queue = Arc::clone(&metadata.queue);

        #[cfg(feature = "tracing")]
        tracing::debug!(queue_id = ?queue, queue = task_queue.name(), "Task queue unthrottled");

        self.metrics.record_queue_unthrottled();
        self.metrics.update_throttled_queues(self.throttled_queue_count());
        self.hooks.on_queue_unthrottled(queue);

        self.maybe_delete_queue_metadata(queue);
        if self.allow_throttling {
            task_queue.remove_fence();
        }
    }

    /// Forgets `queue`, detaching it from its budget pool.
    pub fn unregister_task_queue(&mut self, queue: QueueId) {
        let Some(metadata) = self.queue_details.remove(&queue) else {
            return;
        };
        if let Some(pool) = metadata
            .time_budget_pool
            .and_then(|pool| self.budget_pools.get_mut(&pool))
        {
            pool.detach_queue(queue);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(queue_id = ?queue, "Task queue unregistered");
    }

    /// Returns `true` if `queue` is currently throttled.
    pub fn is_throttled(&self, queue: QueueId) -> bool {
        self.allow_throttling
            && self
                .queue_details
                .get(&queue)
                .is_some_and(|metadata| metadata.throttling_ref_count > 0)
    }

    /// Number of throttling reasons held on `queue`.
    pub fn throttle_ref_count(&self, queue: QueueId) -> usize {
        self.queue_details
            .get(&queue)
            .map_or(0, |metadata| metadata.throttling_ref_count)
    }

    /// Returns `true` if the throttler tracks `queue`.
    pub fn is_registered(&self, queue: QueueId) -> bool {
        self.queue_details.contains_key(&queue)
    }

    /// Budget pool `queue` belongs to, if any.
    pub fn budget_pool_for_queue(&self, queue: QueueId) -> Option<PoolId> {
        self.queue_details
            .get(&queue)
            .and_then(|metadata| metadata.time_budget_pool)
    }

    fn throttled_queue_count(&self) -> usize {
        self.queue_details
            .values()
            .filter(|metadata| metadata.throttling_ref_count > 0)
            .count()
    }

    /// Returns `false` while throttling is globally disabled.
    pub fn is_throttling_allowed(&self) -> bool {
        self.allow_throttling
    }

    /// Unblocks every throttled queue and stops pumping.
    ///
    /// Ref-counts and budget pools are kept.
    pub fn disable_throttling(&mut self) {
        if !self.allow_throttling {
            return;
        }
        self.allow_throttling = false;

        for metadata in self.queue_details.values() {
            if metadata.throttling_ref_count == 0 {
                continue;
            }
            metadata.queue.remove_fence();
        }

        self.pump_timer.cancel();
        self.pending_pump_throttled_tasks_runtime = None;

        #[cfg(feature = "tracing")]
        tracing::info!("Task queue throttling disabled");

        self.hooks.on_throttling_toggled(false);
    }

    /// Re-fences every ref-counted queue and schedules pumps for them.
    pub fn enable_throttling(&mut self) {
        if self.allow_throttling {
            return;
        }
        self.allow_throttling = true;

        let clock = Arc::clone(&self.clock);
        let mut lazy_now = LazyNow::new(&*clock);
        let throttled: Vec<QueueId> = self
            .queue_details
            .iter()
            .filter(|(_, metadata)| metadata.throttling_ref_count > 0)
            .map(|(id, _)| *id)
            .collect();

        for id in throttled {
            if let Some(metadata) = self.queue_details.get(&id) {
                metadata.queue.insert_fence(FencePosition::BeginningOfTime);
            }
            let now = lazy_now.now();
            let next_allowed = self.get_next_allowed_run_time(now, id);
            self.maybe_schedule_pump_queue(now, id, Some(next_allowed));
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Task queue throttling enabled");

        self.hooks.on_throttling_toggled(true);
    }

    /// Rounds `unaligned` up to the next alignment boundary.
    ///
    /// A time already on a boundary moves to the following one.
    pub fn aligned_throttled_run_time(&self, unaligned: TimeTicks) -> TimeTicks {
        let alignment = self.config.alignment;
        unaligned + alignment - (unaligned.since_origin() % alignment)
    }

    /// Run time of the pending pump, if any.
    pub fn pending_pump_run_time(&self) -> Option<TimeTicks> {
        self.pending_pump_throttled_tasks_runtime
    }

    /// Releases the batch of every eligible throttled queue and schedules the
    /// next pump.
    ///
    /// Returns the number of queues released.
    pub fn pump_throttled_tasks(&mut self) -> usize {
        let now = self.now();
        self.pending_pump_throttled_tasks_runtime = None;

        let mut next_scheduled_delayed_task: Option<TimeTicks> = None;
        let mut released = 0;

        let ids: Vec<QueueId> = self.queue_details.keys().copied().collect();
        for id in ids {
            let Some(queue) = self.queue_details.get(&id).map(|m| Arc::clone(&m.queue)) else {
                continue;
            };
            if queue.is_empty() || !self.is_throttled(id) {
                continue;
            }

            let next_allowed = self.get_next_allowed_run_time(now, id);
            if let Some(desired) = self.next_task_run_time(now, id) {
                if next_allowed > desired {
                    next_scheduled_delayed_task =
                        min_optional(next_scheduled_delayed_task, Some(next_allowed));
                    continue;
                }
            }

            next_scheduled_delayed_task =
                min_optional(next_scheduled_delayed_task, queue.next_scheduled_wake_up());

            if next_allowed > now {
                continue;
            }

            queue.insert_fence(FencePosition::Now);
            released += 1;
        }

        if let Some(next) = next_scheduled_delayed_task {
            self.maybe_schedule_pump_throttled_tasks(now, next);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            released = released,
            next_pump = ?self.pending_pump_throttled_tasks_runtime,
            "Pumped throttled tasks"
        );

        self.metrics.record_pump(released);
        self.hooks.on_pump(now, released);
        released
    }

    /* Only ever moves the pending pump earlier */
    fn maybe_schedule_pump_throttled_tasks(&mut self, now: TimeTicks, unaligned: TimeTicks) {
        if !self.allow_throttling {
            return;
        }

        let runtime = now.max(self.aligned_throttled_run_time(unaligned));
        if let Some(pending) = self.pending_pump_throttled_tasks_runtime {
            if runtime >= pending {
                return;
            }
        }

        self.pending_pump_throttled_tasks_runtime = Some(runtime);
        self.pump_timer.schedule(runtime, runtime - now);

        #[cfg(feature = "tracing")]
        tracing::trace!(run_time = %runtime, delay = %(runtime - now), "Pump scheduled");

        self.metrics.record_pump_scheduled();
    }

    fn maybe_schedule_pump_queue(
        &mut self,
        now: TimeTicks,
        queue: QueueId,
        next_possible_run_time: Option<TimeTicks>,
    ) {
        let next_run_time = max_optional(self.next_task_run_time(now, queue), next_possible_run_time);
        if let Some(next_run_time) = next_run_time {
            self.maybe_schedule_pump_throttled_tasks(now, next_run_time);
        }
    }

    fn next_task_run_time(&self, now: TimeTicks, queue: QueueId) -> Option<TimeTicks> {
        let metadata = self.queue_details.get(&queue)?;
        if metadata.queue.has_pending_immediate_work() {
            Some(now)
        } else {
            metadata.queue.next_scheduled_wake_up()
        }
    }

    /// Earliest time `queue` may run given its budget pool.
    pub fn get_next_allowed_run_time(&self, now: TimeTicks, queue: QueueId) -> TimeTicks {
        self.budget_pool_for_queue(queue)
            .and_then(|pool| self.budget_pools.get(&pool))
            .map_or(now, |pool| now.max(pool.next_allowed_run_time()))
    }

    fn maybe_delete_queue_metadata(&mut self, queue: QueueId) {
        let unused = self.queue_details.get(&queue).is_some_and(|metadata| {
            metadata.throttling_ref_count == 0 && metadata.time_budget_pool.is_none()
        });
        if unused {
            self.queue_details.remove(&queue);
        }
    }

    /// Creates a pool with the default recovery rate.
    pub fn create_cpu_time_budget_pool(
        &mut self,
        name: impl Into<String>,
        max_budget_level: Option<TimeDelta>,
        max_throttling_duration: Option<TimeDelta>,
    ) -> Result<PoolId> {
        self.create_budget_pool(BudgetPoolConfig {
            name: name.into(),
            recovery_rate: DEFAULT_RECOVERY_RATE,
            max_budget_level,
            max_throttling_duration,
            initial_budget: TimeDelta::ZERO,
        })
    }

    /// Creates a pool from `config`.
    pub fn create_budget_pool(&mut self, config: BudgetPoolConfig) -> Result<PoolId> {
        let id = PoolId(self.next_pool_id);
        let pool = CpuTimeBudgetPool::new(id, &config, self.now())?;
        self.next_pool_id += 1;
        self.budget_pools.insert(id, Box::new(pool));

        #[cfg(feature = "tracing")]
        tracing::info!(pool = %config.name, pool_id = ?id, "Budget pool created");

        Ok(id)
    }

    /// Pool with the given id.
    pub fn budget_pool(&self, pool: PoolId) -> Option<&dyn BudgetPool> {
        self.budget_pools.get(&pool).map(|budget_pool| budget_pool.as_budget_pool())
    }

    /// CPU time pool with the given id.
    pub fn cpu_time_budget_pool(&self, pool: PoolId) -> Option<&CpuTimeBudgetPool> {
        self.budget_pools
            .get(&pool)
            .and_then(|budget_pool| budget_pool.as_any().downcast_ref::<CpuTimeBudgetPool>())
    }

    /// Ids of every open pool.
    pub fn budget_pool_ids(&self) -> Vec<PoolId> {
        self.budget_pools.keys().copied().collect()
    }

    fn pool_mut(&mut self, pool: PoolId) -> Result<&mut (dyn ManagedPool + 'static)> {
        match self.budget_pools.get_mut(&pool) {
            Some(budget_pool) => Ok(&mut **budget_pool),
            None => Err(ThrottlerError::UnknownPool(pool)),
        }
    }

    fn cpu_time_pool_mut(&mut self, pool: PoolId) -> Result<&mut CpuTimeBudgetPool> {
        self.pool_mut(pool)?
            .as_any_mut()
            .downcast_mut::<CpuTimeBudgetPool>()
            .ok_or(ThrottlerError::UnknownPool(pool))
    }

    /// Changes the recovery rate of `pool` from `now` on.
    pub fn set_time_budget_recovery_rate(
        &mut self,
        pool: PoolId,
        now: TimeTicks,
        cpu_percentage: f64,
    ) -> Result<()> {
        self.cpu_time_pool_mut(pool)?
            .set_time_budget_recovery_rate(now, cpu_percentage)
    }

    /// Adds `amount` to the balance of `pool`.
    ///
    /// Queues already blocked by the pool stay blocked until the next pump.
    /// See [`Self::grant_additional_budget_and_maybe_wake`].
    pub fn grant_additional_budget(
        &mut self,
        pool: PoolId,
        now: TimeTicks,
        amount: TimeDelta,
    ) -> Result<()> {
        self.cpu_time_pool_mut(pool)?.grant_additional_budget(now, amount);
        Ok(())
    }

    /// Installs the callback fired when `pool` runs out of budget.
    pub fn set_reporting_callback(&mut self, pool: PoolId, callback: ReportingCallback) -> Result<()> {
        self.cpu_time_pool_mut(pool)?.set_reporting_callback(callback);
        Ok(())
    }

    /// Makes `queue` a member of `pool`.
    ///
    /// If the pool is enabled and the queue throttled, the queue is fenced
    /// and a pump is scheduled for the pool's next allowed run time.
    pub fn add_queue_to_budget_pool(
        &mut self,
        pool: PoolId,
        now: TimeTicks,
        queue: &Arc<dyn TaskQueue>,
    ) -> Result<()> {
        let id = queue.id();
        if !self.budget_pools.contains_key(&pool) {
            return Err(ThrottlerError::UnknownPool(pool));
        }
        if let Some(existing) = self.budget_pool_for_queue(id) {
            #[cfg(feature = "tracing")]
            tracing::warn!(queue_id = ?id, pool_id = ?existing, "Queue already belongs to a budget pool");
            return Err(ThrottlerError::QueueAlreadyInPool {
                queue: id,
                pool: existing,
            });
        }

        self.queue_details
            .entry(id)
            .or_insert_with(|| Metadata::new(Arc::clone(queue)))
            .time_budget_pool = Some(pool);

        let budget_pool = self.pool_mut(pool)?;
        budget_pool.attach_queue(id);
        let enabled = budget_pool.is_throttling_enabled();
        let next_allowed = budget_pool.next_allowed_run_time();

        #[cfg(feature = "tracing")]
        tracing::debug!(queue_id = ?id, pool = %budget_pool.name(), "Queue added to budget pool");

        if !enabled || !self.is_throttled(id) {
            return Ok(());
        }

        queue.insert_fence(FencePosition::BeginningOfTime);
        self.maybe_schedule_pump_queue(now, id, Some(next_allowed));
        Ok(())
    }

    /// Removes `queue` from `pool`.
    ///
    /// A throttled queue leaving an enabled pool gets a pump so it falls back
    /// to plain throttling promptly.
    pub fn remove_queue_from_budget_pool(
        &mut self,
        pool: PoolId,
        now: TimeTicks,
        queue: QueueId,
    ) -> Result<()> {
        let budget_pool = self.pool_mut(pool)?;
        if !budget_pool.detach_queue(queue) {
            #[cfg(feature = "tracing")]
            tracing::warn!(queue_id = ?queue, pool_id = ?pool, "Queue is not a member of the budget pool");
            return Err(ThrottlerError::QueueNotInPool { queue, pool });
        }
        let enabled = budget_pool.is_throttling_enabled();

        if let Some(metadata) = self.queue_details.get_mut(&queue) {
            metadata.time_budget_pool = None;
        }
        let is_throttled = self.is_throttled(queue);
        self.maybe_delete_queue_metadata(queue);

        #[cfg(feature = "tracing")]
        tracing::debug!(queue_id = ?queue, pool_id = ?pool, "Queue removed from budget pool");

        if enabled && is_throttled {
            self.maybe_schedule_pump_queue(now, queue, None);
        }
        Ok(())
    }

    /// Turns on the pool's constraint and re-blocks its throttled queues.
    pub fn enable_budget_pool_throttling(&mut self, pool: PoolId, now: TimeTicks) -> Result<()> {
        if self.pool_mut(pool)?.enable_throttling(now) {
            self.block_throttled_queues(pool, now);
        }
        Ok(())
    }

    /// Suspends the pool's constraint and wakes its throttled queues.
    pub fn disable_budget_pool_throttling(&mut self, pool: PoolId, now: TimeTicks) -> Result<()> {
        let budget_pool = self.pool_mut(pool)?;
        if !budget_pool.disable_throttling(now) {
            return Ok(());
        }

        let members: Vec<QueueId> = budget_pool.associated_queues().iter().copied().collect();
        for queue in members {
            if !self.is_throttled(queue) {
                continue;
            }
            self.maybe_schedule_pump_queue(now, queue, None);
        }
        Ok(())
    }

    /// Grants budget to `pool` and schedules pumps for its throttled queues.
    ///
    /// Use [`Self::grant_additional_budget`] to grant without waking
    /// anything.
    pub fn grant_additional_budget_and_maybe_wake(
        &mut self,
        pool: PoolId,
        now: TimeTicks,
        amount: TimeDelta,
    ) -> Result<()> {
        let budget_pool = self.cpu_time_pool_mut(pool)?;
        budget_pool.grant_additional_budget(now, amount);

        let members: Vec<QueueId> = budget_pool.associated_queues().iter().copied().collect();
        for queue in members {
            if !self.is_throttled(queue) {
                continue;
            }
            let next_allowed = self.get_next_allowed_run_time(now, queue);
            self.maybe_schedule_pump_queue(now, queue, Some(next_allowed));
        }
        Ok(())
    }

    /// Destroys an empty pool.
    pub fn close_budget_pool(&mut self, pool: PoolId) -> Result<()> {
        let budget_pool = self.pool_mut(pool)?;
        let queues = budget_pool.associated_queues().len();
        if queues != 0 {
            #[cfg(feature = "tracing")]
            tracing::warn!(pool_id = ?pool, queues = queues, "Refusing to close non-empty budget pool");
            return Err(ThrottlerError::PoolNotEmpty { pool, queues });
        }

        self.budget_pools.remove(&pool);

        #[cfg(feature = "tracing")]
        tracing::info!(pool_id = ?pool, "Budget pool closed");
        Ok(())
    }

    /* Fence every throttled member and pump once the pool allows it */
    fn block_throttled_queues(&mut self, pool: PoolId, now: TimeTicks) {
        let Some(budget_pool) = self.budget_pools.get(&pool) else {
            return;
        };
        let members: Vec<QueueId> = budget_pool.associated_queues().iter().copied().collect();
        let next_allowed = budget_pool.next_allowed_run_time();

        let mut blocked = 0;
        for queue in members {
            if !self.is_throttled(queue) {
                continue;
            }
            if let Some(metadata) = self.queue_details.get(&queue) {
                metadata.queue.insert_fence(FencePosition::BeginningOfTime);
            }
            self.maybe_schedule_pump_queue(now, queue, None);
            blocked += 1;
        }

        self.metrics.record_budget_block(blocked);
        self.hooks.on_pool_blocked(pool, next_allowed);
    }

    /// Charges the run time of a task from `queue` to its budget pool.
    ///
    /// Ignored for queues that are not throttled or have no pool. If the pool
    /// runs out of budget its throttled queues are blocked.
    pub fn on_task_run_time_reported(&mut self, queue: QueueId, start: TimeTicks, end: TimeTicks) {
        if !self.is_throttled(queue) {
            return;
        }
        let Some(pool) = self.budget_pool_for_queue(queue) else {
            return;
        };
        let Some(budget_pool) = self.budget_pools.get_mut(&pool) else {
            return;
        };

        let exhausted_before = budget_pool.times_exhausted();
        budget_pool.record_task_run_time(start, end);
        self.metrics.record_task_report();
        if budget_pool.times_exhausted() != exhausted_before {
            self.metrics.record_budget_exhausted();
        }

        if !budget_pool.has_enough_budget_to_run(end) {
            self.block_throttled_queues(pool, end);
        }
    }

    /// Writes diagnostic state into `state`.
    pub fn as_value_into(&self, state: &mut Map<String, Value>, now: TimeTicks) {
        if let Some(pending) = self.pending_pump_throttled_tasks_runtime {
            state.insert(
                "next_throttled_tasks_pump_in_seconds".to_string(),
                Value::from((pending - now).as_secs_f64()),
            );
        }
        state.insert("allow_throttling".to_string(), Value::Bool(self.allow_throttling));

        let mut pools = Map::new();
        for pool in self.budget_pools.values() {
            pool.as_value_into(&mut pools, now);
        }
        state.insert("time_budget_pools".to_string(), Value::Object(pools));

        let mut queues = Map::new();
        for (id, metadata) in &self.queue_details {
            let details = QueueDetailsState {
                name: metadata.queue.name(),
                throttling_ref_count: metadata.throttling_ref_count,
                time_budget_pool: metadata.time_budget_pool.map(|pool| pool.0),
            };
            queues.insert(
                id.0.to_string(),
                serde_json::to_value(details).unwrap_or(Value::Null),
            );
        }
        state.insert("queue_details".to_string(), Value::Object(queues));
    }

    /// Diagnostic state as a JSON object.
    pub fn as_value(&self, now: TimeTicks) -> Value {
        let mut state = Map::new();
        self.as_value_into(&mut state, now);
        Value::Object(state)
    }
}

impl TimeDomainObserver for TaskQueueThrottler {
    fn on_time_domain_has_immediate_work(&mut self, queue: QueueId) {
        if !self.is_throttled(queue) {
            return;
        }
        let now = self.now();
        let next_allowed = self.get_next_allowed_run_time(now, queue);
        self.maybe_schedule_pump_throttled_tasks(now, next_allowed);
    }

    fn on_time_domain_has_delayed_work(&mut self, queue: QueueId) {
        if !self.is_throttled(queue) {
            return;
        }
        let now = self.now();
        if let Some(next_run_time) = self.next_task_run_time(now, queue) {
            self.maybe_schedule_pump_throttled_tasks(now, next_run_time);
        }
    }
}

impl fmt::Debug for TaskQueueThrottler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueueThrottler")
            .field("config", &self.config)
            .field("queues", &self.queue_details.len())
            .field("budget_pools", &self.budget_pools.len())
            .field("pending_pump", &self.pending_pump_throttled_tasks_runtime)
            .field("allow_throttling", &self.allow_throttling)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hooks::ThrottlingHooks;
    use crate::pump::{ManualPumpTimer, PumpHandle};
    use crate::task_queue::{EnqueueOrder, FencedTaskQueue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        pump: PumpHandle,
        order: Arc<EnqueueOrder>,
        throttler: TaskQueueThrottler,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(TimeTicks::from_millis(100)));
            let (timer, pump) = ManualPumpTimer::new();
            let throttler =
                TaskQueueThrottler::new(ThrottlerConfig::default(), clock.clone(), Box::new(timer))
                    .unwrap();
            Self {
                clock,
                pump,
                order: EnqueueOrder::new(),
                throttler,
            }
        }

        fn queue(&self, id: u64) -> (Arc<FencedTaskQueue>, Arc<dyn TaskQueue>) {
            let queue = Arc::new(FencedTaskQueue::new(
                QueueId(id),
                format!("queue-{id}"),
                self.clock.clone(),
                self.order.clone(),
            ));
            let handle: Arc<dyn TaskQueue> = queue.clone();
            (queue, handle)
        }

        fn now(&self) -> TimeTicks {
            self.clock.now_ticks()
        }
    }

    fn ms(millis: i64) -> TimeTicks {
        TimeTicks::from_millis(millis)
    }

    #[test]
    fn test_aligned_throttled_run_time() {
        let fixture = Fixture::new();
        let throttler = &fixture.throttler;
        assert_eq!(throttler.aligned_throttled_run_time(ms(0)), ms(1_000));
        assert_eq!(throttler.aligned_throttled_run_time(ms(1_200)), ms(2_000));
        assert_eq!(throttler.aligned_throttled_run_time(ms(2_000)), ms(3_000));
        assert_eq!(throttler.aligned_throttled_run_time(ms(2_999)), ms(3_000));
    }

    #[test]
    fn test_increase_fences_and_schedules_pump() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        queue.post_task(|| {});

        fixture.throttler.increase_throttle_ref_count(&handle);

        assert!(fixture.throttler.is_throttled(QueueId(1)));
        assert_eq!(queue.fence(), Some(0));
        assert!(queue.take_runnable().is_none());
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(1_000)));
        assert_eq!(fixture.pump.deadline(), Some(ms(1_000)));
    }

    #[test]
    fn test_increase_on_empty_queue_does_not_pump() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);

        fixture.throttler.increase_throttle_ref_count(&handle);

        assert!(queue.has_fence());
        assert_eq!(fixture.throttler.pending_pump_run_time(), None);
    }

    #[test]
    fn test_ref_count_with_two_callers() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);

        fixture.throttler.increase_throttle_ref_count(&handle);
        fixture.throttler.increase_throttle_ref_count(&handle);
        assert_eq!(fixture.throttler.throttle_ref_count(QueueId(1)), 2);

        fixture.throttler.decrease_throttle_ref_count(QueueId(1));
        assert!(fixture.throttler.is_throttled(QueueId(1)));
        assert!(queue.has_fence());

        fixture.throttler.decrease_throttle_ref_count(QueueId(1));
        assert!(!fixture.throttler.is_throttled(QueueId(1)));
        assert!(!queue.has_fence());
        assert!(!fixture.throttler.is_registered(QueueId(1)));

        fixture.throttler.decrease_throttle_ref_count(QueueId(1));
        assert_eq!(fixture.throttler.throttle_ref_count(QueueId(1)), 0);
    }

    #[test]
    fn test_pump_releases_one_batch() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        queue.post_task(|| {});
        queue.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&handle);

        fixture.clock.set(ms(1_000));
        assert_eq!(fixture.pump.take_due(fixture.now()), Some(ms(1_000)));
        assert_eq!(fixture.throttler.pump_throttled_tasks(), 1);

        queue.post_task(|| {});
        assert!(queue.take_runnable().is_some());
        assert!(queue.take_runnable().is_some());
        assert!(queue.take_runnable().is_none());
        assert!(queue.is_blocked_by_fence());

        let metrics = fixture.throttler.metrics().snapshot();
        assert_eq!(metrics.pumps_run, 1);
        assert_eq!(metrics.fences_released, 1);
    }

    #[test]
    fn test_pump_only_tightens() {
        let mut fixture = Fixture::new();
        let now = fixture.now();

        fixture.throttler.maybe_schedule_pump_throttled_tasks(now, ms(5_000));
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(6_000)));

        fixture.throttler.maybe_schedule_pump_throttled_tasks(now, ms(2_500));
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(3_000)));

        fixture.throttler.maybe_schedule_pump_throttled_tasks(now, ms(10_000));
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(3_000)));
        assert_eq!(fixture.pump.deadline(), Some(ms(3_000)));
        assert_eq!(fixture.pump.times_armed(), 2);
    }

    #[test]
    fn test_disable_enable_round_trip() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        let (other, other_handle) = fixture.queue(2);
        queue.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&handle);
        fixture.throttler.increase_throttle_ref_count(&other_handle);
        fixture.throttler.decrease_throttle_ref_count(QueueId(2));

        fixture.throttler.disable_throttling();
        assert!(!fixture.throttler.is_throttling_allowed());
        assert!(!fixture.throttler.is_throttled(QueueId(1)));
        assert!(!queue.has_fence());
        assert_eq!(fixture.throttler.pending_pump_run_time(), None);
        assert_eq!(fixture.pump.deadline(), None);
        assert_eq!(fixture.throttler.throttle_ref_count(QueueId(1)), 1);

        fixture.throttler.enable_throttling();
        assert!(fixture.throttler.is_throttled(QueueId(1)));
        assert_eq!(queue.fence(), Some(0));
        assert!(!other.has_fence());
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(1_000)));
    }

    #[test]
    fn test_no_pump_while_disabled() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        fixture.throttler.disable_throttling();

        queue.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&handle);
        fixture.throttler.on_time_domain_has_immediate_work(QueueId(1));

        assert!(!queue.has_fence());
        assert_eq!(fixture.throttler.pending_pump_run_time(), None);
    }

    #[test]
    fn test_budget_pool_defers_pump() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        let pool = fixture
            .throttler
            .create_budget_pool(BudgetPoolConfig::builder("pool").recovery_rate(0.1).build().unwrap())
            .unwrap();
        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();
        queue.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&handle);
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(1_000)));

        fixture.clock.set(ms(1_000));
        fixture.pump.take_due(fixture.now());
        assert_eq!(fixture.throttler.pump_throttled_tasks(), 1);
        let task = queue.take_runnable().unwrap();
        fixture.clock.set(ms(2_000));
        task.run();
        fixture
            .throttler
            .on_task_run_time_reported(QueueId(1), ms(1_000), ms(2_000));

        let budget = fixture.throttler.cpu_time_budget_pool(pool).unwrap();
        assert_eq!(budget.current_budget_level(), TimeDelta::from_millis(-810));
        assert_eq!(budget.next_allowed_run_time(), ms(10_100));
        assert_eq!(queue.fence(), Some(0));

        queue.post_task(|| {});
        fixture.throttler.on_time_domain_has_immediate_work(QueueId(1));
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(11_000)));

        let (other, other_handle) = fixture.queue(2);
        other.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&other_handle);
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(3_000)));

        fixture.clock.set(ms(3_000));
        fixture.pump.take_due(fixture.now());
        assert_eq!(fixture.throttler.pump_throttled_tasks(), 1);
        assert!(queue.take_runnable().is_none());
        assert!(other.take_runnable().is_some());
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(11_000)));

        let metrics = fixture.throttler.metrics().snapshot();
        assert_eq!(metrics.task_reports, 1);
        assert_eq!(metrics.budget_exhaustions, 1);
        assert_eq!(metrics.budget_blocks, 1);
    }

    #[test]
    fn test_add_queue_to_blocked_pool_fences_throttled_queue() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        queue.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&handle);
        fixture.throttler.decrease_throttle_ref_count(QueueId(1));
        fixture.throttler.increase_throttle_ref_count(&handle);

        let pool = fixture
            .throttler
            .create_budget_pool(BudgetPoolConfig::builder("pool").recovery_rate(0.5).build().unwrap())
            .unwrap();
        fixture
            .throttler
            .grant_additional_budget(pool, ms(100), TimeDelta::from_secs(-2))
            .unwrap();

        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();
        assert_eq!(queue.fence(), Some(0));
        assert_eq!(fixture.throttler.budget_pool_for_queue(QueueId(1)), Some(pool));
        assert_eq!(fixture.throttler.get_next_allowed_run_time(now, QueueId(1)), ms(4_100));
    }

    #[test]
    fn test_queue_in_two_pools_is_rejected() {
        let mut fixture = Fixture::new();
        let (_queue, handle) = fixture.queue(1);
        let first = fixture.throttler.create_cpu_time_budget_pool("first", None, None).unwrap();
        let second = fixture.throttler.create_cpu_time_budget_pool("second", None, None).unwrap();
        let now = fixture.now();

        fixture.throttler.add_queue_to_budget_pool(first, now, &handle).unwrap();
        let err = fixture
            .throttler
            .add_queue_to_budget_pool(second, now, &handle)
            .unwrap_err();
        assert_eq!(
            err,
            ThrottlerError::QueueAlreadyInPool {
                queue: QueueId(1),
                pool: first
            }
        );
        assert!(fixture.throttler.budget_pool(second).unwrap().is_empty());
    }

    #[test]
    fn test_remove_queue_not_in_pool() {
        let mut fixture = Fixture::new();
        let pool = fixture.throttler.create_cpu_time_budget_pool("pool", None, None).unwrap();
        let now = fixture.now();

        let err = fixture
            .throttler
            .remove_queue_from_budget_pool(pool, now, QueueId(9))
            .unwrap_err();
        assert_eq!(
            err,
            ThrottlerError::QueueNotInPool {
                queue: QueueId(9),
                pool
            }
        );

        let err = fixture
            .throttler
            .remove_queue_from_budget_pool(PoolId(77), now, QueueId(9))
            .unwrap_err();
        assert_eq!(err, ThrottlerError::UnknownPool(PoolId(77)));
    }

    #[test]
    fn test_metadata_lifetime_follows_pool_membership() {
        let mut fixture = Fixture::new();
        let (_queue, handle) = fixture.queue(1);
        let pool = fixture.throttler.create_cpu_time_budget_pool("pool", None, None).unwrap();
        let now = fixture.now();

        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();
        assert!(fixture.throttler.is_registered(QueueId(1)));
        assert!(!fixture.throttler.is_throttled(QueueId(1)));

        fixture.throttler.remove_queue_from_budget_pool(pool, now, QueueId(1)).unwrap();
        assert!(!fixture.throttler.is_registered(QueueId(1)));
        fixture.throttler.close_budget_pool(pool).unwrap();
        assert!(fixture.throttler.budget_pool(pool).is_none());
    }

    #[test]
    fn test_close_non_empty_pool_fails() {
        let mut fixture = Fixture::new();
        let (_queue, handle) = fixture.queue(1);
        let pool = fixture.throttler.create_cpu_time_budget_pool("pool", None, None).unwrap();
        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();

        assert_eq!(
            fixture.throttler.close_budget_pool(pool),
            Err(ThrottlerError::PoolNotEmpty { pool, queues: 1 })
        );
        assert_eq!(
            fixture.throttler.close_budget_pool(PoolId(99)),
            Err(ThrottlerError::UnknownPool(PoolId(99)))
        );
    }

    #[test]
    fn test_remove_throttled_queue_schedules_pump() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        let pool = fixture
            .throttler
            .create_budget_pool(BudgetPoolConfig::builder("pool").recovery_rate(0.01).build().unwrap())
            .unwrap();
        fixture
            .throttler
            .grant_additional_budget(pool, ms(100), TimeDelta::from_secs(-1))
            .unwrap();
        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();
        queue.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&handle);
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(101_000)));

        fixture.throttler.remove_queue_from_budget_pool(pool, now, QueueId(1)).unwrap();
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(1_000)));
        assert!(fixture.throttler.is_throttled(QueueId(1)));
    }

    #[test]
    fn test_unregister_detaches_from_pool() {
        let mut fixture = Fixture::new();
        let (_queue, handle) = fixture.queue(1);
        let pool = fixture.throttler.create_cpu_time_budget_pool("pool", None, None).unwrap();
        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();
        fixture.throttler.increase_throttle_ref_count(&handle);

        fixture.throttler.unregister_task_queue(QueueId(1));
        assert!(!fixture.throttler.is_registered(QueueId(1)));
        assert!(fixture.throttler.budget_pool(pool).unwrap().is_empty());
        assert!(fixture.throttler.close_budget_pool(pool).is_ok());
    }

    #[test]
    fn test_disabling_pool_wakes_queues() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        let pool = fixture
            .throttler
            .create_budget_pool(BudgetPoolConfig::builder("pool").recovery_rate(0.01).build().unwrap())
            .unwrap();
        fixture
            .throttler
            .grant_additional_budget(pool, ms(100), TimeDelta::from_secs(-1))
            .unwrap();
        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();
        queue.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&handle);

        fixture.throttler.disable_budget_pool_throttling(pool, now).unwrap();
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(1_000)));
        assert_eq!(fixture.throttler.get_next_allowed_run_time(now, QueueId(1)), now);

        fixture.clock.set(ms(1_000));
        assert_eq!(fixture.throttler.pump_throttled_tasks(), 1);

        let now = fixture.now();
        fixture.throttler.enable_budget_pool_throttling(pool, now).unwrap();
        assert_eq!(queue.fence(), Some(0));
    }

    #[test]
    fn test_grant_and_maybe_wake() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        let pool = fixture
            .throttler
            .create_budget_pool(BudgetPoolConfig::builder("pool").recovery_rate(0.01).build().unwrap())
            .unwrap();
        fixture
            .throttler
            .grant_additional_budget(pool, ms(100), TimeDelta::from_secs(-1))
            .unwrap();
        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();
        queue.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&handle);
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(101_000)));

        fixture
            .throttler
            .grant_additional_budget_and_maybe_wake(pool, now, TimeDelta::from_secs(2))
            .unwrap();
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(1_000)));
    }

    #[test]
    fn test_delayed_work_schedules_pump_at_wake_up() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(1);
        fixture.throttler.increase_throttle_ref_count(&handle);

        queue.post_delayed_task(|| {}, TimeDelta::from_millis(3_400));
        fixture.throttler.on_time_domain_has_delayed_work(QueueId(1));
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(4_000)));

        fixture.throttler.on_time_domain_has_delayed_work(QueueId(5));
        assert_eq!(fixture.throttler.pending_pump_run_time(), Some(ms(4_000)));
    }

    #[test]
    fn test_task_reports_ignored_for_unthrottled_queue() {
        let mut fixture = Fixture::new();
        let (_queue, handle) = fixture.queue(1);
        let pool = fixture.throttler.create_cpu_time_budget_pool("pool", None, None).unwrap();
        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();

        fixture
            .throttler
            .on_task_run_time_reported(QueueId(1), ms(100), ms(5_000));
        assert_eq!(
            fixture.throttler.cpu_time_budget_pool(pool).unwrap().current_budget_level(),
            TimeDelta::ZERO
        );
    }

    #[test]
    fn test_as_value_into() {
        let mut fixture = Fixture::new();
        let (queue, handle) = fixture.queue(3);
        let pool = fixture.throttler.create_cpu_time_budget_pool("background", None, None).unwrap();
        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(pool, now, &handle).unwrap();
        queue.post_task(|| {});
        fixture.throttler.increase_throttle_ref_count(&handle);

        let value = fixture.throttler.as_value(now);
        assert_eq!(value["allow_throttling"], Value::Bool(true));
        assert!((value["next_throttled_tasks_pump_in_seconds"].as_f64().unwrap() - 0.9).abs() < 1e-9);
        assert_eq!(value["queue_details"]["3"]["throttling_ref_count"], Value::from(1));
        assert_eq!(value["queue_details"]["3"]["time_budget_pool"], Value::from(pool.0));
        assert_eq!(value["time_budget_pools"]["background"]["task_queues"], serde_json::json!([3]));
    }

    #[test]
    fn test_hooks_observe_transitions() {
        #[derive(Default)]
        struct Recorder {
            throttled: AtomicUsize,
            unthrottled: AtomicUsize,
            pumps: AtomicUsize,
            toggles: AtomicUsize,
        }

        impl ThrottlingHooks for Recorder {
            fn on_queue_throttled(&self, _queue: QueueId) {
                self.throttled.fetch_add(1, Ordering::Relaxed);
            }
            fn on_queue_unthrottled(&self, _queue: QueueId) {
                self.unthrottled.fetch_add(1, Ordering::Relaxed);
            }
            fn on_pump(&self, _now: TimeTicks, _released: usize) {
                self.pumps.fetch_add(1, Ordering::Relaxed);
            }
            fn on_pool_blocked(&self, _pool: PoolId, _next_allowed: TimeTicks) {}
            fn on_throttling_toggled(&self, _allowed: bool) {
                self.toggles.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut fixture = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        fixture.throttler.hooks().set_hooks(recorder.clone());
        let (_queue, handle) = fixture.queue(1);

        fixture.throttler.increase_throttle_ref_count(&handle);
        fixture.throttler.increase_throttle_ref_count(&handle);
        fixture.throttler.pump_throttled_tasks();
        fixture.throttler.disable_throttling();
        fixture.throttler.disable_throttling();
        fixture.throttler.enable_throttling();
        fixture.throttler.decrease_throttle_ref_count(QueueId(1));
        fixture.throttler.decrease_throttle_ref_count(QueueId(1));

        assert_eq!(recorder.throttled.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.unthrottled.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.pumps.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.toggles.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_pool_accounting_keeps_membership_consistent() {
        let mut fixture = Fixture::new();
        let (_queue, handle) = fixture.queue(1);
        let first = fixture.throttler.create_cpu_time_budget_pool("first", None, None).unwrap();
        let second = fixture.throttler.create_cpu_time_budget_pool("second", None, None).unwrap();
        let now = fixture.now();
        fixture.throttler.add_queue_to_budget_pool(first, now, &handle).unwrap();

        let reported = Arc::new(AtomicUsize::new(0));
        let sink = reported.clone();
        fixture
            .throttler
            .set_reporting_callback(first, Box::new(move |_: TimeDelta| {
                sink.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        fixture.throttler.set_time_budget_recovery_rate(first, now, 0.5).unwrap();
        fixture
            .throttler
            .grant_additional_budget(second, now, TimeDelta::from_secs(1))
            .unwrap();
        assert_eq!(
            fixture.throttler.grant_additional_budget(PoolId(42), now, TimeDelta::ZERO),
            Err(ThrottlerError::UnknownPool(PoolId(42)))
        );

        let first_pool = fixture.throttler.budget_pool(first).unwrap();
        assert_eq!(first_pool.associated_queues().iter().copied().collect::<Vec<_>>(), vec![QueueId(1)]);
        assert!(fixture.throttler.budget_pool(second).unwrap().is_empty());
        assert_eq!(fixture.throttler.budget_pool_for_queue(QueueId(1)), Some(first));
        assert!((fixture.throttler.cpu_time_budget_pool(first).unwrap().cpu_percentage() - 0.5).abs() < f64::EPSILON);

        fixture.throttler.increase_throttle_ref_count(&handle);
        fixture
            .throttler
            .on_task_run_time_reported(QueueId(1), ms(100), ms(1_100));
        assert_eq!(reported.load(Ordering::Relaxed), 1);
        assert_eq!(fixture.throttler.budget_pool(first).unwrap().times_exhausted(), 1);
        assert_eq!(fixture.throttler.budget_pool(second).unwrap().times_exhausted(), 0);
    }

    struct CountingClock {
        inner: ManualClock,
        reads: AtomicUsize,
    }

    impl TickClock for CountingClock {
        fn now_ticks(&self) -> TimeTicks {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.inner.now_ticks()
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[test]
    fn test_enable_throttling_reads_clock_at_most_once() {
        let clock = Arc::new(CountingClock {
            inner: ManualClock::new(ms(100)),
            reads: AtomicUsize::new(0),
        });
        let (timer, pump) = ManualPumpTimer::new();
        let mut throttler =
            TaskQueueThrottler::new(ThrottlerConfig::default(), clock.clone(), Box::new(timer)).unwrap();

        throttler.disable_throttling();
        let before = clock.reads.load(Ordering::Relaxed);
        throttler.enable_throttling();
        assert_eq!(clock.reads.load(Ordering::Relaxed), before);

        let queue_clock = Arc::new(ManualClock::new(ms(100)));
        let order = EnqueueOrder::new();
        for id in 1..=3 {
            let queue = Arc::new(FencedTaskQueue::new(
                QueueId(id),
                "lazy",
                queue_clock.clone(),
                order.clone(),
            ));
            queue.post_task(|| {});
            let handle: Arc<dyn TaskQueue> = queue;
            throttler.increase_throttle_ref_count(&handle);
        }

        throttler.disable_throttling();
        let before = clock.reads.load(Ordering::Relaxed);
        throttler.enable_throttling();
        assert_eq!(clock.reads.load(Ordering::Relaxed), before + 1);
        assert_eq!(pump.deadline(), Some(ms(1_000)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock = Arc::new(ManualClock::default());
        let (timer, _pump) = ManualPumpTimer::new();
        let config = ThrottlerConfig {
            alignment: TimeDelta::from_secs(-1),
            ..ThrottlerConfig::default()
        };
        assert!(TaskQueueThrottler::new(config, clock, Box::new(timer)).is_err());
    }
}
