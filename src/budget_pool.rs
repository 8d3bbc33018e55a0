//! Budget pools
//!
//! A budget pool is a shared constraint over a set of task queues. The
//! throttler owns every pool and keeps the queue side of the membership
//! (fences, pumps); the pool keeps the accounting.
//!
//! [`CpuTimeBudgetPool`] limits its queues to a fraction of wall-clock time.
//! The budget is a signed balance: it recovers at `cpu_percentage` of elapsed
//! time and is debited by the run time of every task. While the balance is
//! negative the pool's queues stay blocked until recovery brings it back to
//! zero.

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

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{debt_floor, validate_limits, BudgetPoolConfig};
use crate::error::Result;
use crate::task_queue::QueueId;
use crate::time::{TimeDelta, TimeTicks};

/// Budget pool identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PoolId(pub u64);

/// Called with the throttling delay when a pool runs out of budget.
pub type ReportingCallback = Box<dyn FnMut(TimeDelta) + Send>;

/// Shared-resource throttling policy over a set of queues.
///
/// Membership and the enabled flag belong to the throttler that owns the
/// pool: they change only through [`crate::TaskQueueThrottler`], which keeps
/// queue fences and pumps in step with them.
pub trait BudgetPool: Send {
    /// Pool identifier.
    fn id(&self) -> PoolId;

    /// Pool name.
    fn name(&self) -> &str;

    /// Returns `true` while the pool constrains its queues.
    fn is_throttling_enabled(&self) -> bool;

    /// Member queues.
    fn associated_queues(&self) -> &BTreeSet<QueueId>;

    /// Returns `true` if no queue belongs to the pool.
    fn is_empty(&self) -> bool {
        self.associated_queues().is_empty()
    }

    /// Feeds the run time of one task into the accounting.
    fn record_task_run_time(&mut self, start: TimeTicks, end: TimeTicks);

    /// Number of times the pool ran out of budget.
    fn times_exhausted(&self) -> u64;

    /// Earliest time a member task may run. May lie in the past.
    fn next_allowed_run_time(&self) -> TimeTicks;

    /// Returns `true` if a member task may run at `now`.
    fn has_enough_budget_to_run(&mut self, now: TimeTicks) -> bool;

    /// Writes diagnostic state under the pool's name.
    fn as_value_into(&self, state: &mut Map<String, Value>, now: TimeTicks);
}

/* Mutators the throttler keeps to itself */
pub(crate) trait PoolMembership {
    /// Turns throttling on. Returns `false` if it already was.
    fn enable_throttling(&mut self, now: TimeTicks) -> bool;

    /// Turns throttling off. Returns `false` if it already was.
    fn disable_throttling(&mut self, now: TimeTicks) -> bool;

    /// Adds `queue` to the member set. Returns `false` if already present.
    fn attach_queue(&mut self, queue: QueueId) -> bool;

    /// Removes `queue` from the member set. Returns `false` if absent.
    fn detach_queue(&mut self, queue: QueueId) -> bool;
}

/* Pool as stored by the throttler */
pub(crate) trait ManagedPool: BudgetPool + PoolMembership {
    fn as_budget_pool(&self) -> &dyn BudgetPool;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<P: BudgetPool + PoolMembership + 'static> ManagedPool for P {
    fn as_budget_pool(&self) -> &dyn BudgetPool {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Serialisable view of a [`CpuTimeBudgetPool`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetPoolSnapshot {
    /// Pool name
    pub name: String,
    /// Recovery rate
    pub time_budget: f64,
    /// Current balance in seconds
    pub time_budget_level_in_seconds: f64,
    /// Seconds between `now` and the last checkpoint
    pub last_checkpoint_seconds_ago: f64,
    /// Throttling enabled
    pub is_enabled: bool,
    /// Ceiling in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_level_in_seconds: Option<f64>,
    /// Debt bound in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_throttling_duration_in_seconds: Option<f64>,
    /// Member queue ids
    pub task_queues: Vec<u64>,
}

/// Pool limiting its queues to a share of wall-clock time.
pub struct CpuTimeBudgetPool {
    id: PoolId,
    name: String,
    cpu_percentage: f64,
    current_budget_level: TimeDelta,
    last_checkpoint: TimeTicks,
    max_budget_level: Option<TimeDelta>,
    max_throttling_duration: Option<TimeDelta>,
    is_enabled: bool,
    associated_task_queues: BTreeSet<QueueId>,
    reporting_callback: Option<ReportingCallback>,
    exhaustions: u64,
}

impl CpuTimeBudgetPool {
    /// Creates an enabled pool from a validated configuration.
    ///
    /// The initial budget is granted at `now`.
    pub fn new(id: PoolId, config: &BudgetPoolConfig, now: TimeTicks) -> Result<Self> {
        config.validate()?;

        let mut pool = Self {
            id,
            name: config.name.clone(),
            cpu_percentage: config.recovery_rate,
            current_budget_level: TimeDelta::ZERO,
            last_checkpoint: now,
            max_budget_level: config.max_budget_level,
            max_throttling_duration: config.max_throttling_duration,
            is_enabled: true,
            associated_task_queues: BTreeSet::new(),
            reporting_callback: None,
            exhaustions: 0,
        };
        pool.grant_additional_budget(now, config.initial_budget);
        Ok(pool)
    }

    /// Current balance. Negative means debt.
    #[inline]
    pub fn current_budget_level(&self) -> TimeDelta {
        self.current_budget_level
    }

    /// Time the balance was last brought up to date.
    #[inline]
    pub fn last_checkpoint(&self) -> TimeTicks {
        self.last_checkpoint
    }

    /// Recovery rate.
    #[inline]
    pub fn cpu_percentage(&self) -> f64 {
        self.cpu_percentage
    }

    /// Budget ceiling, if any.
    pub fn max_budget_level(&self) -> Option<TimeDelta> {
        self.max_budget_level
    }

    /// Debt bound, if any.
    pub fn max_throttling_duration(&self) -> Option<TimeDelta> {
        self.max_throttling_duration
    }

    /// Changes the recovery rate from `now` on.
    ///
    /// Recovery up to `now` is credited at the old rate first.
    pub fn set_time_budget_recovery_rate(&mut self, now: TimeTicks, cpu_percentage: f64) -> Result<()> {
        validate_limits(cpu_percentage, self.max_budget_level, self.max_throttling_duration)?;

        self.advance(now);
        self.cpu_percentage = cpu_percentage;
        self.enforce_budget_level_restrictions();

        #[cfg(feature = "tracing")]
        tracing::debug!(pool = %self.name, cpu_percentage, "Budget recovery rate changed");
        Ok(())
    }

    /// Adds `amount` to the balance.
    ///
    /// Queues already blocked by the pool stay blocked until the next pump.
    pub fn grant_additional_budget(&mut self, now: TimeTicks, amount: TimeDelta) {
        self.advance(now);
        self.current_budget_level += amount;
        self.enforce_budget_level_restrictions();
    }

    /// Installs the callback fired when the balance turns negative.
    pub fn set_reporting_callback(&mut self, callback: ReportingCallback) {
        self.reporting_callback = Some(callback);
    }

    /// Diagnostic snapshot at `now`.
    pub fn snapshot(&self, now: TimeTicks) -> BudgetPoolSnapshot {
        BudgetPoolSnapshot {
            name: self.name.clone(),
            time_budget: self.cpu_percentage,
            time_budget_level_in_seconds: self.current_budget_level.as_secs_f64(),
            last_checkpoint_seconds_ago: (now - self.last_checkpoint).as_secs_f64(),
            is_enabled: self.is_enabled,
            max_budget_level_in_seconds: self.max_budget_level.map(TimeDelta::as_secs_f64),
            max_throttling_duration_in_seconds: self
                .max_throttling_duration
                .map(TimeDelta::as_secs_f64),
            task_queues: self.associated_task_queues.iter().map(|queue| queue.0).collect(),
        }
    }

    /* Stale `now` values are ignored; the checkpoint moves even while disabled */
    fn advance(&mut self, now: TimeTicks) {
        if now <= self.last_checkpoint {
            return;
        }
        if self.is_enabled {
            self.current_budget_level += (now - self.last_checkpoint) * self.cpu_percentage;
            self.enforce_budget_level_restrictions();
        }
        self.last_checkpoint = now;
    }

    /* Ceiling first, then the debt floor */
    fn enforce_budget_level_restrictions(&mut self) {
        if let Some(ceiling) = self.max_budget_level {
            self.current_budget_level = self.current_budget_level.min(ceiling);
        }
        if let Some(duration) = self.max_throttling_duration {
            let floor = debt_floor(duration, self.cpu_percentage);
            self.current_budget_level = self.current_budget_level.max(floor);
        }
    }
}

impl BudgetPool for CpuTimeBudgetPool {
    fn id(&self) -> PoolId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_throttling_enabled(&self) -> bool {
        self.is_enabled
    }

    fn associated_queues(&self) -> &BTreeSet<QueueId> {
        &self.associated_task_queues
    }

    /// # Panics
    ///
    /// Panics if `start` is later than `end`.
    fn record_task_run_time(&mut self, start: TimeTicks, end: TimeTicks) {
        assert!(start <= end, "Task run time must not be negative: start {start} > end {end}");

        self.advance(end);
        if !self.is_enabled {
            return;
        }

        let was_solvent = !self.current_budget_level.is_negative();
        self.current_budget_level -= end - start;
        self.enforce_budget_level_restrictions();

        if was_solvent && self.current_budget_level.is_negative() {
            let delay = -self.current_budget_level / self.cpu_percentage;
            self.exhaustions += 1;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                pool = %self.name,
                budget = %self.current_budget_level,
                delay = %delay,
                "Budget pool exhausted"
            );

            if let Some(callback) = self.reporting_callback.as_mut() {
                callback(delay);
            }
        }
    }

    fn times_exhausted(&self) -> u64 {
        self.exhaustions
    }

    fn next_allowed_run_time(&self) -> TimeTicks {
        if !self.is_enabled || !self.current_budget_level.is_negative() {
            return self.last_checkpoint;
        }
        self.last_checkpoint + (-self.current_budget_level / self.cpu_percentage)
    }

    fn has_enough_budget_to_run(&mut self, now: TimeTicks) -> bool {
        self.advance(now);
        !self.is_enabled || !self.current_budget_level.is_negative()
    }

    fn as_value_into(&self, state: &mut Map<String, Value>, now: TimeTicks) {
        let value = serde_json::to_value(self.snapshot(now)).unwrap_or(Value::Null);
        state.insert(self.name.clone(), value);
    }
}

impl PoolMembership for CpuTimeBudgetPool {
    fn enable_throttling(&mut self, now: TimeTicks) -> bool {
        if self.is_enabled {
            return false;
        }
        self.advance(now);
        self.is_enabled = true;

        #[cfg(feature = "tracing")]
        tracing::debug!(pool = %self.name, "Budget pool throttling enabled");
        true
    }

    fn disable_throttling(&mut self, now: TimeTicks) -> bool {
        if !self.is_enabled {
            return false;
        }
        self.advance(now);
        self.is_enabled = false;

        #[cfg(feature = "tracing")]
        tracing::debug!(pool = %self.name, "Budget pool throttling disabled");
        true
    }

    fn attach_queue(&mut self, queue: QueueId) -> bool {
        self.associated_task_queues.insert(queue)
    }

    fn detach_queue(&mut self, queue: QueueId) -> bool {
        self.associated_task_queues.remove(&queue)
    }
}

impl fmt::Debug for CpuTimeBudgetPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuTimeBudgetPool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cpu_percentage", &self.cpu_percentage)
            .field("current_budget_level", &self.current_budget_level)
            .field("last_checkpoint", &self.last_checkpoint)
            .field("max_budget_level", &self.max_budget_level)
            .field("max_throttling_duration", &self.max_throttling_duration)
            .field("is_enabled", &self.is_enabled)
            .field("associated_task_queues", &self.associated_task_queues)
            .field("has_reporting_callback", &self.reporting_callback.is_some())
            .finish()
    }
}
