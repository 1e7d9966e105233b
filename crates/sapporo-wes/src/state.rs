// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle states and the transition rules between them.
//!
//! `state.txt` inside each run directory is the single writable truth for a
//! run's lifecycle. Every writer inspects the current state before writing;
//! a forbidden transition is a no-op reported as a conflict to the caller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Run state as defined by the WES protocol, plus the deletion extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Unknown,
    Queued,
    Initializing,
    Running,
    Paused,
    Complete,
    ExecutorError,
    SystemError,
    Canceled,
    Canceling,
    Preempted,
    Deleting,
    Deleted,
}

impl State {
    /// Terminal states are absorbing: no transition leaves them except the
    /// deletion path.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Complete
                | State::ExecutorError
                | State::SystemError
                | State::Canceled
                | State::Deleted
        )
    }

    /// States that a cancellation request may act on.
    pub fn is_cancelable(self) -> bool {
        matches!(self, State::Queued | State::Initializing | State::Running)
    }

    /// Whether writing `to` over `self` is a legal transition.
    ///
    /// The graph:
    ///
    /// ```text
    /// QUEUED -> INITIALIZING -> RUNNING -> {COMPLETE, EXECUTOR_ERROR, SYSTEM_ERROR}
    /// {QUEUED, INITIALIZING, RUNNING} -> CANCELING -> CANCELED
    /// any terminal -> DELETING -> DELETED
    /// ```
    ///
    /// A dispatcher that observes `CANCELING` may still move to `RUNNING`
    /// first (the run was canceled before it started); it then finalizes to
    /// `CANCELED`. `SYSTEM_ERROR` is additionally reachable from any
    /// non-terminal state so crash recovery can reconcile dead runs.
    pub fn can_transition(self, to: State) -> bool {
        use State::*;
        if self == to {
            return false;
        }
        match (self, to) {
            (Queued, Initializing) => true,
            (Queued | Initializing | Canceling, Running) => true,
            (Running, Complete | ExecutorError) => true,
            (s, SystemError) if !s.is_terminal() && s != Deleting => true,
            (s, Canceling) if s.is_cancelable() => true,
            (Canceling, Canceled) => true,
            (s, Deleting) if s.is_terminal() && s != Deleted => true,
            (Deleting, Deleted) => true,
            _ => false,
        }
    }

    /// All representable states, in protocol order.
    pub fn all() -> &'static [State] {
        &[
            State::Unknown,
            State::Queued,
            State::Initializing,
            State::Running,
            State::Paused,
            State::Complete,
            State::ExecutorError,
            State::SystemError,
            State::Canceled,
            State::Canceling,
            State::Preempted,
            State::Deleting,
            State::Deleted,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Queued => "QUEUED",
            State::Initializing => "INITIALIZING",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Complete => "COMPLETE",
            State::ExecutorError => "EXECUTOR_ERROR",
            State::SystemError => "SYSTEM_ERROR",
            State::Canceled => "CANCELED",
            State::Canceling => "CANCELING",
            State::Preempted => "PREEMPTED",
            State::Deleting => "DELETING",
            State::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "UNKNOWN" => Ok(State::Unknown),
            "QUEUED" => Ok(State::Queued),
            "INITIALIZING" => Ok(State::Initializing),
            "RUNNING" => Ok(State::Running),
            "PAUSED" => Ok(State::Paused),
            "COMPLETE" => Ok(State::Complete),
            "EXECUTOR_ERROR" => Ok(State::ExecutorError),
            "SYSTEM_ERROR" => Ok(State::SystemError),
            "CANCELED" => Ok(State::Canceled),
            "CANCELING" => Ok(State::Canceling),
            "PREEMPTED" => Ok(State::Preempted),
            "DELETING" => Ok(State::Deleting),
            "DELETED" => Ok(State::Deleted),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Returned when `state.txt` contains a word outside the closed state set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown run state: {0}")]
pub struct UnknownState(pub String);
