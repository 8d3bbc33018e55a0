//! Pulse-Throttler: Task Queue Throttling with CPU Time Budgets
//!
//! This library throttles background task queues of a single-threaded
//! scheduler. Throttled queues are fenced so their tasks accumulate, and a
//! pump aligned to whole seconds releases one batch at a time. Queues can be
//! grouped into CPU time budget pools: a pool earns budget at a fixed fraction
//! of wall time and is charged the run time of its tasks, and a pool in debt
//! keeps its queues blocked until the budget recovers.
//!
//! # Features
//!
//! - **Ref-counted Throttling**: Independent callers throttle and unthrottle
//!   the same queue without coordinating
//! - **Aligned Wake-ups**: Pumps land on alignment boundaries so throttled
//!   queues run together
//! - **CPU Time Budget Pools**: Recovery rate, budget ceiling and a bounded
//!   debt floor per pool
//! - **Virtual Time**: [`ManualClock`] and [`ThrottledRunLoop`] drive the whole
//!   system deterministically
//!
//! # Example
//!
//! ```rust
//! use pulse_throttler::{ThrottledRunLoop, ThrottlerConfig, TimeDelta, TimeTicks};
//!
//! let mut run_loop = ThrottledRunLoop::new(ThrottlerConfig::default(), TimeTicks::ORIGIN)?;
//! let queue = run_loop.create_queue("timers");
//! run_loop.throttle(&queue);
//!
//! queue.post_task(|| {});
//! assert_eq!(run_loop.run_until_idle(), 0);
//!
//! // The pump at the next whole second releases the task
//! assert_eq!(run_loop.run_for(TimeDelta::from_secs(1)), 1);
//! # Ok::<(), pulse_throttler::ThrottlerError>(())
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
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

/// CPU time budget pools
pub mod budget_pool;
/// Tick clocks
pub mod clock;
/// Throttler and pool configuration
pub mod config;
/// Error types
pub mod error;
/// Hook system for throttling instrumentation
pub mod hooks;
/// Metrics collection and reporting
pub mod metrics;
/// Pump timers
pub mod pump;
/// Virtual-time executor
pub mod run_loop;
/// Task queues and fences
pub mod task_queue;
/// Task queue throttler
pub mod throttler;
/// Monotonic time values
pub mod time;
/// Work notifications from task queues
pub mod time_domain;

// Public API exports
pub use budget_pool::{BudgetPool, BudgetPoolSnapshot, CpuTimeBudgetPool, PoolId, ReportingCallback};
pub use clock::{LazyNow, ManualClock, MonotonicClock, TickClock};
pub use config::{BudgetPoolConfig, BudgetPoolConfigBuilder, BudgetProfile, ThrottlerConfig};
pub use error::{Result, ThrottlerError};
pub use hooks::{HookRegistry, NullHooks, ThrottlingHooks};
pub use metrics::{ThrottlerMetrics, ThrottlerMetricsSnapshot};
pub use pump::{ManualPumpTimer, PumpHandle, PumpSignal, PumpSignals, PumpTimer, ThreadPumpTimer};
pub use run_loop::ThrottledRunLoop;
pub use task_queue::{EnqueueOrder, FencePosition, FencedTaskQueue, QueueId, RunnableTask, TaskQueue};
pub use throttler::TaskQueueThrottler;
pub use time::{TimeDelta, TimeTicks};
pub use time_domain::{work_channel, TimeDomainObserver, WorkNotification, WorkNotifier, WorkReceiver};

#[cfg(feature = "metrics")]
pub use metrics::init_metrics;
