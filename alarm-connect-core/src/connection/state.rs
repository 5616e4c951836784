//! Connection lifecycle state
//!
//! ```text
//! Created → Connecting → Active → Draining → Terminated
//!               │                     ↑
//!               └─────────────────────┘
//! ```
//!
//! States only move forward. `Active` is reported by the client once its
//! session is up, so a connection torn down before that goes straight from
//! `Connecting` to `Draining`. `Terminated` is only reachable from
//! `Draining`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LifecycleState {
    /// Client is being built
    Created = 0,
    /// Background task spawned, session not yet established
    Connecting = 1,
    /// Client reported a live session
    Active = 2,
    /// Teardown in progress
    Draining = 3,
    /// Removed from the registry
    Terminated = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Created,
            1 => LifecycleState::Connecting,
            2 => LifecycleState::Active,
            3 => LifecycleState::Draining,
            _ => LifecycleState::Terminated,
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, next),
            (Created, Connecting)
                | (Connecting, Active)
                | (Connecting, Draining)
                | (Active, Draining)
                | (Draining, Terminated)
        )
    }

    /// Teardown has started
    pub fn is_stopping(self) -> bool {
        self >= LifecycleState::Draining
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Active => "active",
            LifecycleState::Draining => "draining",
            LifecycleState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free cell holding a connection's lifecycle state
///
/// Shared between the registry entry and the session reporter handed to the
/// client, so the client can mark the session active without touching the
/// registry lock.
#[derive(Debug)]
pub struct LifecycleCell(AtomicU8);

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleCell {
    /// New cell in `Created`
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Created as u8))
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if that is a legal transition from the current state
    ///
    /// Returns the state observed when the transition was refused.
    pub fn advance(&self, next: LifecycleState) -> Result<(), LifecycleState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                LifecycleState::from_u8(current)
                    .can_advance_to(next)
                    .then_some(next as u8)
            })
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }
}
