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

/* Instrumentation hooks for throttling decisions */

use crate::budget_pool::PoolId;
use crate::task_queue::QueueId;
use crate::time::TimeTicks;
use parking_lot::RwLock;
use std::sync::Arc;

/// Throttling hook interface.
pub trait ThrottlingHooks: Send + Sync {
    /// Called when a queue's throttle ref-count goes from zero to one.
    fn on_queue_throttled(&self, queue: QueueId);

    /// Called when a queue's throttle ref-count drops back to zero.
    fn on_queue_unthrottled(&self, queue: QueueId);

    /// Called after a pump with the number of queues it released.
    fn on_pump(&self, now: TimeTicks, released: usize);

    /// Called when a pool runs out of budget and re-blocks its queues.
    fn on_pool_blocked(&self, pool: PoolId, next_allowed: TimeTicks);

    /// Called when throttling is globally allowed or disallowed.
    fn on_throttling_toggled(&self, allowed: bool);
}

/// Null implementation of `ThrottlingHooks`
#[derive(Debug, Default)]
pub struct NullHooks;

impl ThrottlingHooks for NullHooks {
    #[inline(always)]
    fn on_queue_throttled(&self, _queue: QueueId) {
        // No-op
    }

    #[inline(always)]
    fn on_queue_unthrottled(&self, _queue: QueueId) {
        // No-op
    }

    #[inline(always)]
    fn on_pump(&self, _now: TimeTicks, _released: usize) {
        // No-op
    }

    #[inline(always)]
    fn on_pool_blocked(&self, _pool: PoolId, _next_allowed: TimeTicks) {
        // No-op
    }

    #[inline(always)]
    fn on_throttling_toggled(&self, _allowed: bool) {
        // No-op
    }
}

/* Hook registry; hooks may be swapped from any thread */
pub struct HookRegistry {
    hooks: Arc<RwLock<Option<Arc<dyn ThrottlingHooks>>>>,
}

impl HookRegistry {
    /* Create new registry */
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: Arc::new(RwLock::new(None)),
        }
    }

    /* Install hooks */
    pub fn set_hooks(&self, hooks: Arc<dyn ThrottlingHooks>) -> Option<Arc<dyn ThrottlingHooks>> {
        self.hooks.write().replace(hooks)
    }

    /* Remove hooks */
    pub fn clear_hooks(&self) -> Option<Arc<dyn ThrottlingHooks>> {
        self.hooks.write().take()
    }

    #[inline]
    pub fn on_queue_throttled(&self, queue: QueueId) {
        if let Some(hooks) = self.hooks.read().as_ref() {
            hooks.on_queue_throttled(queue);
        }
    }

    #[inline]
    pub fn on_queue_unthrottled(&self, queue: QueueId) {
        if let Some(hooks) = self.hooks.read().as_ref() {
            hooks.on_queue_unthrottled(queue);
        }
    }

    #[inline]
    pub fn on_pump(&self, now: TimeTicks, released: usize) {
        if let Some(hooks) = self.hooks.read().as_ref() {
            hooks.on_pump(now, released);
        }
    }

    #[inline]
    pub fn on_pool_blocked(&self, pool: PoolId, next_allowed: TimeTicks) {
        if let Some(hooks) = self.hooks.read().as_ref() {
            hooks.on_pool_blocked(pool, next_allowed);
        }
    }

    #[inline]
    pub fn on_throttling_toggled(&self, allowed: bool) {
        if let Some(hooks) = self.hooks.read().as_ref() {
            hooks.on_throttling_toggled(allowed);
        }
    }

    /* Check if hooks installed */
    #[inline]
    pub fn has_hooks(&self) -> bool {
        self.hooks.read().is_some()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("has_hooks", &self.has_hooks())
            .finish()
    }
}
