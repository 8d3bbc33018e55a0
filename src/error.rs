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
/* Error types for throttler misuse and configuration */

use crate::budget_pool::PoolId;
use crate::task_queue::QueueId;

/// Errors reported by the throttler and its budget pools
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThrottlerError {
    /// Queue is already attached to a budget pool
    #[error("{queue:?} already belongs to budget pool {pool:?}")]
    QueueAlreadyInPool {
        /// Queue being attached
        queue: QueueId,
        /// Pool that currently owns the queue
        pool: PoolId,
    },

    /// Queue is not a member of the pool it is being removed from
    #[error("{queue:?} is not a member of budget pool {pool:?}")]
    QueueNotInPool {
        /// Queue being detached
        queue: QueueId,
        /// Pool the caller named
        pool: PoolId,
    },

    /// Pool still has member queues
    #[error("budget pool {pool:?} still has {queues} associated queue(s)")]
    PoolNotEmpty {
        /// Pool being closed
        pool: PoolId,
        /// Number of queues still attached
        queues: usize,
    },

    /// Pool does not exist or was already closed
    #[error("unknown budget pool {0:?}")]
    UnknownPool(PoolId),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pump timer thread could not be started
    #[error("Failed to start pump timer thread: {0}")]
    TimerThread(String),
}

/// Convenience alias for throttler results
pub type Result<T, E = ThrottlerError> = std::result::Result<T, E>;
