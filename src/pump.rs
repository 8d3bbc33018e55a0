//! Pump timers
//!
//! The throttler keeps at most one pending pump. Scheduling a new one replaces
//! the previous deadline and cancelling clears it; a [`PumpTimer`] only has to
//! deliver "pump now" back to the embedder once the deadline passes.
//!
//! - [`ManualPumpTimer`] stores the deadline in a shared [`PumpHandle`] for
//!   virtual-time run loops and tests.
//! - [`ThreadPumpTimer`] runs a dedicated timer thread and delivers
//!   [`PumpSignal`]s over a channel.

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

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{Result, ThrottlerError};
use crate::time::{TimeDelta, TimeTicks};

/// Single cancel-and-replace wake-up.
pub trait PumpTimer: Send {
    /// Arms the timer for `run_time`, `delay` from now, replacing any
    /// pending deadline.
    fn schedule(&mut self, run_time: TimeTicks, delay: TimeDelta);

    /// Clears the pending deadline.
    fn cancel(&mut self);
}

#[derive(Debug, Default)]
struct PumpState {
    deadline: Option<TimeTicks>,
    armed: u64,
}

/// Shared view of a [`ManualPumpTimer`]'s deadline.
#[derive(Debug, Clone, Default)]
pub struct PumpHandle {
    state: Arc<Mutex<PumpState>>,
}

impl PumpHandle {
    /// Pending deadline, if any.
    pub fn deadline(&self) -> Option<TimeTicks> {
        self.state.lock().deadline
    }

    /// Clears and returns the deadline if it is due at `now`.
    pub fn take_due(&self, now: TimeTicks) -> Option<TimeTicks> {
        let mut state = self.state.lock();
        match state.deadline {
            Some(deadline) if deadline <= now => state.deadline.take(),
            _ => None,
        }
    }

    /// Number of times the timer was armed.
    pub fn times_armed(&self) -> u64 {
        self.state.lock().armed
    }
}

/// Timer that only records its deadline.
#[derive(Debug, Default)]
pub struct ManualPumpTimer {
    handle: PumpHandle,
}

impl ManualPumpTimer {
    /// Creates a timer and the handle used to poll it.
    #[must_use]
    pub fn new() -> (Self, PumpHandle) {
        let handle = PumpHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl PumpTimer for ManualPumpTimer {
    fn schedule(&mut self, run_time: TimeTicks, _delay: TimeDelta) {
        let mut state = self.handle.state.lock();
        state.deadline = Some(run_time);
        state.armed += 1;
    }

    fn cancel(&mut self) {
        self.handle.state.lock().deadline = None;
    }
}

/// Delivered by [`ThreadPumpTimer`] when a deadline expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSignal {
    /// Arming this signal belongs to
    pub generation: u64,
    /// Run time the timer was armed for
    pub run_time: TimeTicks,
}

enum TimerCommand {
    Schedule {
        generation: u64,
        run_time: TimeTicks,
        delay: Duration,
    },
    Cancel,
    Shutdown,
}

/// Receiving side of a [`ThreadPumpTimer`].
///
/// Signals from an arming that was replaced or cancelled after it fired are
/// dropped.
#[derive(Debug)]
pub struct PumpSignals {
    receiver: Receiver<PumpSignal>,
    latest: Arc<AtomicU64>,
}

impl PumpSignals {
    /// Waits up to `timeout` for the current pump signal.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PumpSignal> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let signal = self.receiver.recv_timeout(remaining).ok()?;
            if self.is_current(&signal) {
                return Some(signal);
            }
        }
    }

    /// Returns a pending current signal without blocking.
    pub fn try_recv(&self) -> Option<PumpSignal> {
        while let Ok(signal) = self.receiver.try_recv() {
            if self.is_current(&signal) {
                return Some(signal);
            }
        }
        None
    }

    fn is_current(&self, signal: &PumpSignal) -> bool {
        signal.generation == self.latest.load(Ordering::Acquire)
    }
}

/// Pump timer backed by a dedicated thread.
pub struct ThreadPumpTimer {
    commands: Sender<TimerCommand>,
    latest: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadPumpTimer {
    /// Starts the timer thread.
    pub fn spawn(name: &str) -> Result<(Self, PumpSignals)> {
        let (commands, command_receiver) = channel::unbounded();
        let (signal_sender, receiver) = channel::unbounded();
        let latest = Arc::new(AtomicU64::new(0));

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(&command_receiver, &signal_sender))
            .map_err(|e| ThrottlerError::TimerThread(e.to_string()))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(thread = name, "Pump timer thread started");

        Ok((
            Self {
                commands,
                latest: latest.clone(),
                handle: Some(handle),
            },
            PumpSignals { receiver, latest },
        ))
    }

    /// Generation of the latest arming or cancellation.
    pub fn generation(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    fn send(&self, command: TimerCommand) {
        if self.commands.send(command).is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Pump timer thread is gone, command dropped");
        }
    }
}

impl PumpTimer for ThreadPumpTimer {
    fn schedule(&mut self, run_time: TimeTicks, delay: TimeDelta) {
        let generation = self.latest.fetch_add(1, Ordering::AcqRel) + 1;
        self.send(TimerCommand::Schedule {
            generation,
            run_time,
            delay: delay.to_std(),
        });
    }

    fn cancel(&mut self) {
        self.latest.fetch_add(1, Ordering::AcqRel);
        self.send(TimerCommand::Cancel);
    }
}

impl Drop for ThreadPumpTimer {
    fn drop(&mut self) {
        let _ = self.commands.send(TimerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                #[cfg(feature = "tracing")]
                tracing::error!("Pump timer thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ThreadPumpTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPumpTimer")
            .field("generation", &self.generation())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn timer_loop(commands: &Receiver<TimerCommand>, signals: &Sender<PumpSignal>) {
    let mut pending: Option<(Instant, PumpSignal)> = None;

    loop {
        let command = match pending {
            Some((deadline, _)) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match commands.recv_timeout(timeout) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        match command {
            Some(TimerCommand::Schedule {
                generation,
                run_time,
                delay,
            }) => {
                pending = Some((Instant::now() + delay, PumpSignal { generation, run_time }));
            }
            Some(TimerCommand::Cancel) => pending = None,
            Some(TimerCommand::Shutdown) => break,
            None => {
                if let Some((_, signal)) = pending.take() {
                    if signals.send(signal).is_err() {
                        break;
                    }
                }
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("Pump timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_timer_replaces_deadline() {
        let (mut timer, handle) = ManualPumpTimer::new();
        assert_eq!(handle.deadline(), None);

        timer.schedule(TimeTicks::from_secs(3), TimeDelta::from_secs(3));
        timer.schedule(TimeTicks::from_secs(2), TimeDelta::from_secs(2));
        assert_eq!(handle.deadline(), Some(TimeTicks::from_secs(2)));
        assert_eq!(handle.times_armed(), 2);

        assert_eq!(handle.take_due(TimeTicks::from_secs(1)), None);
        assert_eq!(handle.take_due(TimeTicks::from_secs(2)), Some(TimeTicks::from_secs(2)));
        assert_eq!(handle.deadline(), None);

        timer.schedule(TimeTicks::from_secs(5), TimeDelta::from_secs(3));
        timer.cancel();
        assert_eq!(handle.deadline(), None);
    }

    #[test]
    fn test_thread_timer_fires() {
        let (mut timer, signals) = ThreadPumpTimer::spawn("pump-test").unwrap();
        timer.schedule(TimeTicks::from_millis(10), TimeDelta::from_millis(10));

        let signal = signals.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(signal.run_time, TimeTicks::from_millis(10));
        assert_eq!(signal.generation, timer.generation());
    }

    #[test]
    fn test_thread_timer_cancel() {
        let (mut timer, signals) = ThreadPumpTimer::spawn("pump-test").unwrap();
        timer.schedule(TimeTicks::from_millis(50), TimeDelta::from_millis(50));
        timer.cancel();

        assert!(signals.recv_timeout(Duration::from_millis(150)).is_none());
    }

    #[test]
    fn test_thread_timer_replace_keeps_latest() {
        let (mut timer, signals) = ThreadPumpTimer::spawn("pump-test").unwrap();
        timer.schedule(TimeTicks::from_secs(30), TimeDelta::from_secs(30));
        timer.schedule(TimeTicks::from_millis(5), TimeDelta::from_millis(5));

        let signal = signals.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(signal.run_time, TimeTicks::from_millis(5));
        assert!(signals.try_recv().is_none());
    }

    #[test]
    fn test_thread_timer_drop_joins() {
        let (timer, _signals) = ThreadPumpTimer::spawn("pump-test").unwrap();
        drop(timer);
    }
}
