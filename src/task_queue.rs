//! Task queues and fences
//!
//! The throttler does not own or run tasks. It only talks to queues through
//! the [`TaskQueue`] trait: it inserts and removes fences and asks whether
//! work is pending. [`FencedTaskQueue`] is a complete in-process
//! implementation used by [`crate::run_loop::ThrottledRunLoop`].
//!
//! Every task that becomes runnable receives a sequence number from a shared
//! [`EnqueueOrder`]. A fence is a sequence number: tasks enqueued before it may
//! run, tasks enqueued at or after it wait until the fence moves.

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

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::TickClock;
use crate::time::{TimeDelta, TimeTicks};
use crate::time_domain::{WorkNotification, WorkNotifier};

/// Task queue identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct QueueId(pub u64);

/// Where a fence is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencePosition {
    /// Tasks already enqueued may run, later ones wait
    Now,
    /// Nothing may run until the fence moves
    BeginningOfTime,
}

/// Queue contract consumed by the throttler.
pub trait TaskQueue: Send + Sync {
    /// Stable identity of the queue.
    fn id(&self) -> QueueId;

    /// Human readable name for diagnostics.
    fn name(&self) -> &str;

    /// Inserts a fence, replacing any existing one.
    fn insert_fence(&self, position: FencePosition);

    /// Removes the fence so every task may run.
    fn remove_fence(&self);

    /// Returns `true` if a fence is installed.
    fn has_fence(&self) -> bool;

    /// Returns `true` if neither immediate nor delayed tasks are queued.
    fn is_empty(&self) -> bool;

    /// Returns `false` if the queue was disabled by its owner.
    fn is_queue_enabled(&self) -> bool;

    /// Returns `true` if immediate tasks are queued, fenced or not.
    fn has_pending_immediate_work(&self) -> bool;

    /// Run time of the earliest delayed task, if any.
    fn next_scheduled_wake_up(&self) -> Option<TimeTicks>;
}

/// Global source of enqueue sequence numbers.
///
/// Sequence `0` is reserved for [`FencePosition::BeginningOfTime`].
#[derive(Debug)]
pub struct EnqueueOrder {
    next: AtomicU64,
}

impl EnqueueOrder {
    /// Creates a shared sequence source.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(1),
        })
    }

    #[inline]
    fn take(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Sequence number the next enqueued task will receive.
    #[inline]
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}

/// Unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Task taken from a queue, ready to run.
pub struct RunnableTask {
    /// Enqueue sequence number
    pub sequence: u64,
    /// Time the task was posted
    pub posted_at: TimeTicks,
    task: Task,
}

impl RunnableTask {
    /// Runs the task.
    pub fn run(self) {
        (self.task)();
    }
}

impl fmt::Debug for RunnableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableTask")
            .field("sequence", &self.sequence)
            .field("posted_at", &self.posted_at)
            .finish_non_exhaustive()
    }
}

struct DelayedTask {
    run_at: TimeTicks,
    delayed_sequence: u64, /* Tie breaker for equal run times */
    posted_at: TimeTicks,
    task: Task,
}

/* Reversed so BinaryHeap pops the earliest run time first */
impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.delayed_sequence.cmp(&self.delayed_sequence))
    }
}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.delayed_sequence == other.delayed_sequence
    }
}

impl Eq for DelayedTask {}

struct QueueState {
    immediate: VecDeque<RunnableTask>,
    delayed: BinaryHeap<DelayedTask>,
    fence: Option<u64>,
    enabled: bool,
    next_delayed_sequence: u64,
}

impl QueueState {
    fn front_runnable(&self) -> Option<u64> {
        if !self.enabled {
            return None;
        }
        let front = self.immediate.front()?.sequence;
        match self.fence {
            Some(fence) if front >= fence => None,
            _ => Some(front),
        }
    }
}

/// FIFO task queue with delayed tasks and a single fence.
pub struct FencedTaskQueue {
    id: QueueId,
    name: String,
    clock: Arc<dyn TickClock>,
    order: Arc<EnqueueOrder>,
    notifier: Option<WorkNotifier>,
    state: Mutex<QueueState>,
}

impl FencedTaskQueue {
    /// Creates an empty, enabled, unfenced queue.
    pub fn new(
        id: QueueId,
        name: impl Into<String>,
        clock: Arc<dyn TickClock>,
        order: Arc<EnqueueOrder>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            clock,
            order,
            notifier: None,
            state: Mutex::new(QueueState {
                immediate: VecDeque::new(),
                delayed: BinaryHeap::new(),
                fence: None,
                enabled: true,
                next_delayed_sequence: 0,
            }),
        }
    }

    /// Announces posted work through `notifier`.
    #[must_use]
    pub fn with_notifier(mut self, notifier: WorkNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Posts a task that is runnable immediately, subject to the fence.
    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let posted_at = self.clock.now_ticks();
        {
            let mut state = self.state.lock();
            state.immediate.push_back(RunnableTask {
                sequence: self.order.take(),
                posted_at,
                task: Box::new(task),
            });
        }
        self.notify(WorkNotification::Immediate(self.id));
    }

    /// Posts a task that becomes runnable after `delay`.
    pub fn post_delayed_task<F>(&self, task: F, delay: TimeDelta)
    where
        F: FnOnce() + Send + 'static,
    {
        if delay <= TimeDelta::ZERO {
            self.post_task(task);
            return;
        }

        let posted_at = self.clock.now_ticks();
        {
            let mut state = self.state.lock();
            let delayed_sequence = state.next_delayed_sequence;
            state.next_delayed_sequence += 1;
            state.delayed.push(DelayedTask {
                run_at: posted_at + delay,
                delayed_sequence,
                posted_at,
                task: Box::new(task),
            });
        }
        self.notify(WorkNotification::Delayed(self.id));
    }

    fn notify(&self, notification: WorkNotification) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(notification);
        }
    }

    /// Enables or disables the queue. Disabled queues run nothing.
    pub fn set_queue_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    /// Moves delayed tasks due at `now` to the immediate queue.
    ///
    /// Promoted tasks receive fresh sequence numbers, so an existing fence
    /// keeps them waiting.
    pub fn promote_ready_delayed_tasks(&self, now: TimeTicks) -> usize {
        let mut state = self.state.lock();
        let mut promoted = 0;
        while state.delayed.peek().is_some_and(|next| next.run_at <= now) {
            if let Some(delayed) = state.delayed.pop() {
                state.immediate.push_back(RunnableTask {
                    sequence: self.order.take(),
                    posted_at: delayed.posted_at,
                    task: delayed.task,
                });
                promoted += 1;
            }
        }
        promoted
    }

    /// Sequence number of the front task if it may run now.
    pub fn runnable_sequence(&self) -> Option<u64> {
        self.state.lock().front_runnable()
    }

    /// Takes the front task if it may run now.
    pub fn take_runnable(&self) -> Option<RunnableTask> {
        let mut state = self.state.lock();
        state.front_runnable()?;
        state.immediate.pop_front()
    }

    /// Returns `true` if immediate work exists but the fence holds it back.
    pub fn is_blocked_by_fence(&self) -> bool {
        let state = self.state.lock();
        match (state.fence, state.immediate.front()) {
            (Some(fence), Some(front)) => front.sequence >= fence,
            _ => false,
        }
    }

    /// Number of immediate tasks.
    pub fn immediate_len(&self) -> usize {
        self.state.lock().immediate.len()
    }

    /// Number of delayed tasks not yet due.
    pub fn delayed_len(&self) -> usize {
        self.state.lock().delayed.len()
    }

    /// Current fence sequence, if any.
    pub fn fence(&self) -> Option<u64> {
        self.state.lock().fence
    }
}

impl TaskQueue for FencedTaskQueue {
    fn id(&self) -> QueueId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn insert_fence(&self, position: FencePosition) {
        let fence = match position {
            FencePosition::Now => self.order.peek(),
            FencePosition::BeginningOfTime => 0,
        };
        self.state.lock().fence = Some(fence);
    }

    fn remove_fence(&self) {
        self.state.lock().fence = None;
    }

    fn has_fence(&self) -> bool {
        self.state.lock().fence.is_some()
    }

    fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.immediate.is_empty() && state.delayed.is_empty()
    }

    fn is_queue_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    fn has_pending_immediate_work(&self) -> bool {
        !self.state.lock().immediate.is_empty()
    }

    fn next_scheduled_wake_up(&self) -> Option<TimeTicks> {
        self.state.lock().delayed.peek().map(|task| task.run_at)
    }
}

impl fmt::Debug for FencedTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FencedTaskQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("immediate", &state.immediate.len())
            .field("delayed", &state.delayed.len())
            .field("fence", &state.fence)
            .field("enabled", &state.enabled)
            .finish()
    }
}
