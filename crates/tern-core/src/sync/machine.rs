//! Sync lifecycle state machine.
//!
//! Transitions are pure; the engine feeds events in and acts on the state that
//! comes out. Events that mean nothing in the current state leave it unchanged.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    /// Nothing to do until a mutation or a manual sync
    #[default]
    Idle,
    /// Work is waiting for the debounce window to close
    Pending,
    /// A pass is running. `attempt` counts failed passes before this one;
    /// `rearmed` is set when a local mutation arrived mid-pass.
    Syncing { attempt: u32, rearmed: bool },
    /// Waiting to retry after `attempt` failed passes
    Backoff { attempt: u32 },
    /// Automatic retries are exhausted or the failure cannot be retried
    ManualSyncRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    LocalMutation,
    ConnectivityRestored,
    DebounceElapsed,
    ManualSync,
    PassSucceeded,
    PassFailed { retryable: bool },
    BackoffElapsed,
}

impl SyncState {
    /// State after `event`, allowing up to `max_retries` automatic retries
    #[must_use]
    pub const fn next(self, event: SyncEvent, max_retries: u32) -> Self {
        use SyncEvent as E;

        match (self, event) {
            (Self::Idle | Self::Pending, E::LocalMutation | E::ConnectivityRestored) => {
                Self::Pending
            }
            (Self::Idle | Self::Pending | Self::ManualSyncRequired, E::ManualSync)
            | (Self::Pending, E::DebounceElapsed) => Self::Syncing {
                attempt: 0,
                rearmed: false,
            },

            (Self::Syncing { attempt, .. }, E::LocalMutation) => Self::Syncing {
                attempt,
                rearmed: true,
            },
            (Self::Syncing { rearmed, .. }, E::PassSucceeded) => {
                if rearmed {
                    Self::Pending
                } else {
                    Self::Idle
                }
            }
            (Self::Syncing { attempt, .. }, E::PassFailed { retryable: true }) => {
                if attempt >= max_retries {
                    Self::ManualSyncRequired
                } else {
                    Self::Backoff {
                        attempt: attempt + 1,
                    }
                }
            }
            (Self::Syncing { .. }, E::PassFailed { retryable: false }) => Self::ManualSyncRequired,

            (Self::Backoff { attempt }, E::BackoffElapsed) => Self::Syncing {
                attempt,
                rearmed: false,
            },
            (Self::Backoff { .. }, E::ManualSync) => Self::Syncing {
                attempt: 0,
                rearmed: false,
            },
            (Self::Backoff { .. } | Self::ManualSyncRequired, E::ConnectivityRestored) => {
                Self::Pending
            }

            (state, _) => state,
        }
    }

    #[must_use]
    pub const fn is_syncing(self) -> bool {
        matches!(self, Self::Syncing { .. })
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Pending => f.write_str("pending"),
            Self::Syncing { attempt: 0, .. } => f.write_str("syncing"),
            Self::Syncing { attempt, .. } => write!(f, "syncing (retry {attempt})"),
            Self::Backoff { attempt } => write!(f, "backoff (attempt {attempt})"),
            Self::ManualSyncRequired => f.write_str("manual sync required"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RETRIES: u32 = 5;

    fn run(start: SyncState, events: &[SyncEvent]) -> SyncState {
        events
            .iter()
            .fold(start, |state, event| state.next(*event, RETRIES))
    }

    #[test]
    fn mutation_debounce_success_returns_to_idle() {
        let end = run(
            SyncState::Idle,
            &[
                SyncEvent::LocalMutation,
                SyncEvent::LocalMutation,
                SyncEvent::DebounceElapsed,
                SyncEvent::PassSucceeded,
            ],
        );
        assert_eq!(end, SyncState::Idle);
    }

    #[test]
    fn mutation_mid_pass_rearms_without_interrupting() {
        let syncing = run(
            SyncState::Pending,
            &[SyncEvent::DebounceElapsed, SyncEvent::LocalMutation],
        );
        assert_eq!(
            syncing,
            SyncState::Syncing {
                attempt: 0,
                rearmed: true
            }
        );
        assert_eq!(
            syncing.next(SyncEvent::PassSucceeded, RETRIES),
            SyncState::Pending
        );
    }

    #[test]
    fn transient_failures_back_off_then_require_manual_sync() {
        let mut state = SyncState::Syncing {
            attempt: 0,
            rearmed: false,
        };
        for expected in 1..=RETRIES {
            state = state.next(SyncEvent::PassFailed { retryable: true }, RETRIES);
            assert_eq!(state, SyncState::Backoff { attempt: expected });
            state = state.next(SyncEvent::BackoffElapsed, RETRIES);
        }
        state = state.next(SyncEvent::PassFailed { retryable: true }, RETRIES);
        assert_eq!(state, SyncState::ManualSyncRequired);
    }

    #[test]
    fn fatal_failure_requires_manual_sync_immediately() {
        let end = run(
            SyncState::Idle,
            &[
                SyncEvent::ManualSync,
                SyncEvent::PassFailed { retryable: false },
            ],
        );
        assert_eq!(end, SyncState::ManualSyncRequired);
        assert_eq!(
            end.next(SyncEvent::LocalMutation, RETRIES),
            SyncState::ManualSyncRequired
        );
        assert!(end.next(SyncEvent::ManualSync, RETRIES).is_syncing());
    }

    #[test]
    fn connectivity_cuts_backoff_short() {
        assert_eq!(
            SyncState::Backoff { attempt: 3 }.next(SyncEvent::ConnectivityRestored, RETRIES),
            SyncState::Pending
        );
        assert_eq!(
            SyncState::Backoff { attempt: 3 }.next(SyncEvent::LocalMutation, RETRIES),
            SyncState::Backoff { attempt: 3 }
        );
    }

    #[test]
    fn stray_events_are_ignored() {
        assert_eq!(
            SyncState::Idle.next(SyncEvent::PassSucceeded, RETRIES),
            SyncState::Idle
        );
        assert_eq!(
            SyncState::Idle.next(SyncEvent::BackoffElapsed, RETRIES),
            SyncState::Idle
        );
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(SyncState::ManualSyncRequired.to_string(), "manual sync required");
        assert_eq!(SyncState::Backoff { attempt: 2 }.to_string(), "backoff (attempt 2)");
    }
}
