/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */
//! Work notifications from task queues to the throttler
//!
//! Queues announce new work through a [`WorkNotifier`]. Notifications may be
//! raised on any thread; the scheduling thread drains them from the matching
//! [`WorkReceiver`] into a [`TimeDomainObserver`] (normally the throttler),
//! which keeps all throttling state single-threaded.

#![forbid(unsafe_code)]

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::task_queue::QueueId;

/// Observer for queues that received new work.
pub trait TimeDomainObserver {
    /// Called when an immediate task was posted to `queue`.
    fn on_time_domain_has_immediate_work(&mut self, queue: QueueId);

    /// Called when a delayed task was posted to `queue`.
    fn on_time_domain_has_delayed_work(&mut self, queue: QueueId);
}

/// Kind of work a queue announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkNotification {
    /// Immediate task posted
    Immediate(QueueId),
    /// Delayed task posted
    Delayed(QueueId),
}

impl WorkNotification {
    /// Queue that raised the notification.
    #[must_use]
    pub const fn queue(&self) -> QueueId {
        match self {
            Self::Immediate(queue) | Self::Delayed(queue) => *queue,
        }
    }
}

/// Sending half, cloned into every queue.
#[derive(Debug, Clone)]
pub struct WorkNotifier {
    sender: Sender<WorkNotification>,
}

impl WorkNotifier {
    /// Announces work. Returns `false` once the receiver is gone.
    pub fn notify(&self, notification: WorkNotification) -> bool {
        match self.sender.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(?notification, "Work notification dropped, receiver closed");
                false
            }
        }
    }
}

/// Receiving half, owned by the scheduling thread.
#[derive(Debug)]
pub struct WorkReceiver {
    receiver: Receiver<WorkNotification>,
}

impl WorkReceiver {
    /// Forwards every pending notification to `observer`.
    ///
    /// Returns the number of notifications delivered.
    pub fn drain_into(&self, observer: &mut dyn TimeDomainObserver) -> usize {
        let mut delivered = 0;
        while let Ok(notification) = self.receiver.try_recv() {
            match notification {
                WorkNotification::Immediate(queue) => {
                    observer.on_time_domain_has_immediate_work(queue);
                }
                WorkNotification::Delayed(queue) => {
                    observer.on_time_domain_has_delayed_work(queue);
                }
            }
            delivered += 1;
        }
        delivered
    }

    /// Number of notifications waiting.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns `true` if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Creates a connected notifier/receiver pair.
#[must_use]
pub fn work_channel() -> (WorkNotifier, WorkReceiver) {
    let (sender, receiver) = channel::unbounded();
    (WorkNotifier { sender }, WorkReceiver { receiver })
}
