//! Virtual-time run loop
//!
//! [`ThrottledRunLoop`] is a single-threaded executor wired to a
//! [`TaskQueueThrottler`]. It owns a [`ManualClock`], so time only moves when
//! a task advances it or when the loop jumps to the next pending event. Each
//! task's run time is measured on that clock and reported back to the
//! throttler, which closes the budget feedback loop.

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
use std::sync::Arc;

use crate::clock::{ManualClock, TickClock};
use crate::config::ThrottlerConfig;
use crate::error::Result;
use crate::pump::{ManualPumpTimer, PumpHandle};
use crate::task_queue::{EnqueueOrder, FencedTaskQueue, QueueId, TaskQueue};
use crate::throttler::TaskQueueThrottler;
use crate::time::{TimeDelta, TimeTicks};
use crate::time_domain::{work_channel, WorkNotifier, WorkReceiver};

/// Single-threaded executor driving a throttler in virtual time.
pub struct ThrottledRunLoop {
    clock: Arc<ManualClock>,
    pump: PumpHandle,
    throttler: TaskQueueThrottler,
    queues: BTreeMap<QueueId, Arc<FencedTaskQueue>>,
    notifier: WorkNotifier,
    work: WorkReceiver,
    order: Arc<EnqueueOrder>,
    next_queue_id: u64,
    tasks_run: u64,
}

impl ThrottledRunLoop {
    /// Creates a run loop whose clock starts at `start`.
    pub fn new(config: ThrottlerConfig, start: TimeTicks) -> Result<Self> {
        let clock = Arc::new(ManualClock::new(start));
        let (timer, pump) = ManualPumpTimer::new();
        let throttler = TaskQueueThrottler::new(config, clock.clone(), Box::new(timer))?;
        let (notifier, work) = work_channel();

        Ok(Self {
            clock,
            pump,
            throttler,
            queues: BTreeMap::new(),
            notifier,
            work,
            order: EnqueueOrder::new(),
            next_queue_id: 1,
            tasks_run: 0,
        })
    }

    /// The loop's clock. Tasks advance it to simulate their run time.
    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Current virtual time.
    pub fn now(&self) -> TimeTicks {
        self.clock.now_ticks()
    }

    /// The throttler.
    pub fn throttler(&self) -> &TaskQueueThrottler {
        &self.throttler
    }

    /// Mutable access to the throttler.
    pub fn throttler_mut(&mut self) -> &mut TaskQueueThrottler {
        &mut self.throttler
    }

    /// Deadline of the pending pump.
    pub fn pump_deadline(&self) -> Option<TimeTicks> {
        self.pump.deadline()
    }

    /// Tasks run so far.
    pub fn tasks_run(&self) -> u64 {
        self.tasks_run
    }

    /// Creates a queue owned by the loop.
    pub fn create_queue(&mut self, name: impl Into<String>) -> Arc<FencedTaskQueue> {
        let id = QueueId(self.next_queue_id);
        self.next_queue_id += 1;

        let queue = Arc::new(
            FencedTaskQueue::new(id, name, self.clock.clone(), self.order.clone())
                .with_notifier(self.notifier.clone()),
        );
        self.queues.insert(id, Arc::clone(&queue));
        queue
    }

    /// Unregisters `queue` from the throttler and drops it from the loop.
    pub fn remove_queue(&mut self, queue: QueueId) {
        self.throttler.unregister_task_queue(queue);
        self.queues.remove(&queue);
    }

    /// Adds a throttling reason to `queue`.
    pub fn throttle(&mut self, queue: &Arc<FencedTaskQueue>) {
        let handle: Arc<dyn TaskQueue> = queue.clone();
        self.throttler.increase_throttle_ref_count(&handle);
    }

    /// Removes a throttling reason from `queue`.
    pub fn unthrottle(&mut self, queue: &Arc<FencedTaskQueue>) {
        self.throttler.decrease_throttle_ref_count(queue.id());
    }

    /* Notifications, delayed promotion, then a due pump */
    fn service(&mut self) {
        self.work.drain_into(&mut self.throttler);

        let now = self.now();
        for queue in self.queues.values() {
            queue.promote_ready_delayed_tasks(now);
        }
        if self.pump.take_due(now).is_some() {
            self.throttler.pump_throttled_tasks();
        }
    }

    fn oldest_runnable(&self) -> Option<Arc<FencedTaskQueue>> {
        self.queues
            .values()
            .filter_map(|queue| queue.runnable_sequence().map(|sequence| (sequence, queue)))
            .min_by_key(|(sequence, _)| *sequence)
            .map(|(_, queue)| Arc::clone(queue))
    }

    /// Runs every task that may run without moving the clock forward.
    ///
    /// Tasks may still advance the clock themselves. Returns the number of
    /// tasks run.
    pub fn run_until_idle(&mut self) -> usize {
        let mut ran = 0;
        loop {
            self.service();

            let Some(queue) = self.oldest_runnable() else {
                break;
            };
            let Some(task) = queue.take_runnable() else {
                break;
            };

            let start = self.now();
            task.run();
            let end = self.now();
            self.throttler.on_task_run_time_reported(queue.id(), start, end);

            ran += 1;
            self.tasks_run += 1;
        }
        ran
    }

    fn next_event_after(&self, now: TimeTicks) -> Option<TimeTicks> {
        let wake_ups = self
            .queues
            .values()
            .filter_map(|queue| queue.next_scheduled_wake_up());
        self.pump
            .deadline()
            .into_iter()
            .chain(wake_ups)
            .filter(|time| *time > now)
            .min()
    }

    /// Runs tasks and jumps the clock from event to event until `deadline`.
    ///
    /// Returns the number of tasks run.
    pub fn run_until(&mut self, deadline: TimeTicks) -> usize {
        let mut ran = self.run_until_idle();
        loop {
            let now = self.now();
            if now >= deadline {
                break;
            }

            let target = self
                .next_event_after(now)
                .map_or(deadline, |event| event.min(deadline));
            self.clock.set(target);
            ran += self.run_until_idle();
        }
        ran
    }

    /// Runs for `delta` of virtual time.
    pub fn run_for(&mut self, delta: TimeDelta) -> usize {
        let deadline = self.now() + delta;
        self.run_until(deadline)
    }
}

impl std::fmt::Debug for ThrottledRunLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledRunLoop")
            .field("now", &self.now())
            .field("queues", &self.queues.len())
            .field("pump_deadline", &self.pump.deadline())
            .field("tasks_run", &self.tasks_run)
            .finish_non_exhaustive()
    }
}
