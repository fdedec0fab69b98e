//! Outbox sync state machine.
//!
//! A pure state machine deciding when the outbox drains. It takes events
//! as input and returns the new state plus a list of actions to execute.
//! The engine owns the timers and the connectivity feed, and performs the
//! actual sends.
//!
//! At most one pass runs at a time: `syncing` is the in-flight guard, and
//! it only clears on `PassFinished`. A reconnect that lands while a pass is
//! in flight is remembered and answered with a fresh full pass once the
//! current one finishes.

/// Sync engine state - NO I/O, just transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMachine {
    online: bool,
    syncing: bool,
    resync: bool,
}

/// Inputs to the sync machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// The connectivity feed reported a value.
    ConnectivityChanged {
        /// Whether the device is online now.
        online: bool,
    },
    /// The periodic sync timer fired.
    TimerTick,
    /// A caller asked for an immediate pass (`force_sync`).
    SyncRequested,
    /// The running pass completed.
    PassFinished,
}

/// Actions for the engine to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Drain due entries.
    StartPass {
        /// Skip entries whose retry backoff has not elapsed.
        respect_backoff: bool,
    },
    /// Notify sync listeners that counts or flags changed.
    EmitStatus,
}

impl SyncMachine {
    /// Idle machine with the given initial connectivity.
    pub fn new(online: bool) -> Self {
        Self {
            online,
            syncing: false,
            resync: false,
        }
    }

    /// Whether the device is online.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Whether a pass is in flight.
    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: SyncEvent) -> (Self, Vec<SyncAction>) {
        match event {
            SyncEvent::ConnectivityChanged { online } if online == self.online => (self, vec![]),

            // Coming back online drains everything, backoff or not
            SyncEvent::ConnectivityChanged { online: true } => {
                let next = Self {
                    online: true,
                    ..self
                };
                next.try_start(false).unwrap_or((
                    Self {
                        resync: true,
                        ..next
                    },
                    vec![SyncAction::EmitStatus],
                ))
            }

            // Going offline only stops new passes; in-flight sends fail on their own
            SyncEvent::ConnectivityChanged { online: false } => (
                Self {
                    online: false,
                    ..self
                },
                vec![SyncAction::EmitStatus],
            ),

            SyncEvent::TimerTick => self.try_start(true).unwrap_or((self, vec![])),

            SyncEvent::SyncRequested => self.try_start(false).unwrap_or((self, vec![])),

            SyncEvent::PassFinished => {
                let idle = Self {
                    syncing: false,
                    resync: false,
                    ..self
                };
                match idle.try_start(false) {
                    Some(next) if self.resync => next,
                    _ => (idle, vec![SyncAction::EmitStatus]),
                }
            }
        }
    }

    fn try_start(self, respect_backoff: bool) -> Option<(Self, Vec<SyncAction>)> {
        if !self.online || self.syncing {
            return None;
        }
        Some((
            Self {
                syncing: true,
                ..self
            },
            vec![
                SyncAction::EmitStatus,
                SyncAction::StartPass { respect_backoff },
            ],
        ))
    }
}
