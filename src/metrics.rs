/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */
//! Throttler metrics
//!
//! Counters live in relaxed atomics so they can be read from any thread while
//! the scheduling thread updates them. With the `metrics` feature every event
//! is also exported through the `metrics` facade.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Throttler event counters
#[derive(Debug)]
pub struct ThrottlerMetrics {
    /// Queues that became throttled
    pub queues_throttled: AtomicU64,

    /// Queues that became unthrottled
    pub queues_unthrottled: AtomicU64,

    /// Pump timers armed or re-armed
    pub pumps_scheduled: AtomicU64,

    /// Pumps executed
    pub pumps_run: AtomicU64,

    /// Queues released by a pump
    pub fences_released: AtomicU64,

    /// Times a pool re-blocked its queues for lack of budget
    pub budget_blocks: AtomicU64,

    /// Task run times reported to a pool
    pub task_reports: AtomicU64,

    /// Budget transitions from non-negative to negative
    pub budget_exhaustions: AtomicU64,

    start_time: Instant,
}

impl ThrottlerMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues_throttled: AtomicU64::new(0),
            queues_unthrottled: AtomicU64::new(0),
            pumps_scheduled: AtomicU64::new(0),
            pumps_run: AtomicU64::new(0),
            fences_released: AtomicU64::new(0),
            budget_blocks: AtomicU64::new(0),
            task_reports: AtomicU64::new(0),
            budget_exhaustions: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a queue becoming throttled
    pub fn record_queue_throttled(&self) {
        self.queues_throttled.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("pulse_throttler.queues_throttled_total").increment(1);
    }

    /// Record a queue becoming unthrottled
    pub fn record_queue_unthrottled(&self) {
        self.queues_unthrottled.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("pulse_throttler.queues_unthrottled_total").increment(1);
    }

    /// Record a pump timer (re)scheduled
    pub fn record_pump_scheduled(&self) {
        self.pumps_scheduled.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("pulse_throttler.pumps_scheduled_total").increment(1);
    }

    /// Record a pump and the number of queues it released
    pub fn record_pump(&self, released: usize) {
        self.pumps_run.fetch_add(1, Ordering::Relaxed);
        self.fences_released.fetch_add(released as u64, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        {
            counter!("pulse_throttler.pumps_total").increment(1);
            counter!("pulse_throttler.fences_released_total").increment(released as u64);
        }
    }

    /// Record a pool blocking its queues
    pub fn record_budget_block(&self, queues: usize) {
        self.budget_blocks.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        tracing::debug!(queues = queues, "Budget pool blocked its queues");

        #[cfg(feature = "metrics")]
        counter!("pulse_throttler.budget_blocks_total").increment(1);

        #[cfg(not(feature = "tracing"))]
        let _ = queues;
    }

    /// Record a task run time report
    pub fn record_task_report(&self) {
        self.task_reports.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("pulse_throttler.task_reports_total").increment(1);
    }

    /// Record a pool running out of budget
    pub fn record_budget_exhausted(&self) {
        self.budget_exhaustions.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("pulse_throttler.budget_exhaustions_total").increment(1);
    }

    /// Update the throttled queue gauge
    pub fn update_throttled_queues(&self, count: usize) {
        #[cfg(feature = "metrics")]
        gauge!("pulse_throttler.throttled_queues").set(count as f64);

        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    /// Seconds since the counters were created
    #[must_use]
    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Get snapshot of current counter values
    #[must_use]
    pub fn snapshot(&self) -> ThrottlerMetricsSnapshot {
        ThrottlerMetricsSnapshot {
            queues_throttled: self.queues_throttled.load(Ordering::Relaxed),
            queues_unthrottled: self.queues_unthrottled.load(Ordering::Relaxed),
            pumps_scheduled: self.pumps_scheduled.load(Ordering::Relaxed),
            pumps_run: self.pumps_run.load(Ordering::Relaxed),
            fences_released: self.fences_released.load(Ordering::Relaxed),
            budget_blocks: self.budget_blocks.load(Ordering::Relaxed),
            task_reports: self.task_reports.load(Ordering::Relaxed),
            budget_exhaustions: self.budget_exhaustions.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for ThrottlerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of [`ThrottlerMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlerMetricsSnapshot {
    /// Queues that became throttled
    pub queues_throttled: u64,
    /// Queues that became unthrottled
    pub queues_unthrottled: u64,
    /// Pump timers armed
    pub pumps_scheduled: u64,
    /// Pumps executed
    pub pumps_run: u64,
    /// Queues released by pumps
    pub fences_released: u64,
    /// Pool blocking events
    pub budget_blocks: u64,
    /// Task run time reports
    pub task_reports: u64,
    /// Budget exhaustion events
    pub budget_exhaustions: u64,
    /// Seconds since creation
    pub uptime_seconds: f64,
}

impl ThrottlerMetricsSnapshot {
    /// Average queues released per pump
    #[must_use]
    pub fn releases_per_pump(&self) -> f64 {
        if self.pumps_run == 0 {
            0.0
        } else {
            self.fences_released as f64 / self.pumps_run as f64
        }
    }
}

/// Registers every exported series at zero
#[cfg(feature = "metrics")]
pub fn init_metrics() {
    #[cfg(feature = "tracing")]
    tracing::info!("Initializing throttler metrics");

    counter!("pulse_throttler.queues_throttled_total").absolute(0);
    counter!("pulse_throttler.queues_unthrottled_total").absolute(0);
    counter!("pulse_throttler.pumps_scheduled_total").absolute(0);
    counter!("pulse_throttler.pumps_total").absolute(0);
    counter!("pulse_throttler.fences_released_total").absolute(0);
    counter!("pulse_throttler.budget_blocks_total").absolute(0);
    counter!("pulse_throttler.task_reports_total").absolute(0);
    counter!("pulse_throttler.budget_exhaustions_total").absolute(0);
    gauge!("pulse_throttler.throttled_queues").set(0.0);
}
