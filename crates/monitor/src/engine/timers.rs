//! Periodic timers feeding the engine.
//!
//! Each armed timer is a small task that sends its key into the engine's
//! tick channel once per period. The engine reacts to ticks on its own
//! task, so timers never touch engine state directly.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::model::{MachineId, SessionRef};

/// What a timer tick is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Poll a machine's session list.
    Poll(MachineId),
    /// Refresh a session's preview.
    Preview(SessionRef),
}

/// The set of armed timers.
pub struct Timers {
    tick_tx: mpsc::UnboundedSender<TimerKey>,
    root: CancellationToken,
    armed: HashMap<TimerKey, CancellationToken>,
}

impl Timers {
    /// Creates an empty set. Cancelling `root` stops every timer.
    pub fn new(tick_tx: mpsc::UnboundedSender<TimerKey>, root: CancellationToken) -> Self {
        Self {
            tick_tx,
            root,
            armed: HashMap::new(),
        }
    }

    /// Starts a timer firing every `period`, first after one full period.
    ///
    /// Re-arming an armed key restarts it.
    pub fn arm(&mut self, key: TimerKey, period: Duration) {
        self.disarm(key);

        let token = self.root.child_token();
        let cancel = token.clone();
        let tx = self.tick_tx.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(key).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.armed.insert(key, token);
    }

    /// Stops a timer. Returns false if it was not armed.
    pub fn disarm(&mut self, key: TimerKey) -> bool {
        match self.armed.remove(&key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a timer for `key` is running.
    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }

    /// Number of running timers.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Whether no timer is running.
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Stops every timer.
    pub fn shutdown(&mut self) {
        self.root.cancel();
        self.armed.clear();
    }
}
