//! Domain snapshot types.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a domain as reported by the host.
///
/// Values outside the known range are kept as [`DomainState::Unknown`] so
/// the raw number still reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
    Unknown(u32),
}

impl DomainState {
    /// The raw state number used by the host API.
    #[must_use]
    pub fn as_raw(self) -> u32 {
        match self {
            DomainState::NoState => 0,
            DomainState::Running => 1,
            DomainState::Blocked => 2,
            DomainState::Paused => 3,
            DomainState::Shutdown => 4,
            DomainState::Shutoff => 5,
            DomainState::Crashed => 6,
            DomainState::PmSuspended => 7,
            DomainState::Unknown(raw) => raw,
        }
    }
}

impl From<u32> for DomainState {
    fn from(raw: u32) -> Self {
        match raw {
            0 => DomainState::NoState,
            1 => DomainState::Running,
            2 => DomainState::Blocked,
            3 => DomainState::Paused,
            4 => DomainState::Shutdown,
            5 => DomainState::Shutoff,
            6 => DomainState::Crashed,
            7 => DomainState::PmSuspended,
            other => DomainState::Unknown(other),
        }
    }
}

impl From<DomainState> for u32 {
    fn from(state: DomainState) -> Self {
        state.as_raw()
    }
}

/// Read-only snapshot of one active domain, taken at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSummary {
    /// Host-assigned identifier of the running domain.
    pub id: u32,
    pub name: String,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_time: u64,
    /// Memory currently used by the domain, in KiB.
    pub memory: u64,
    pub state: DomainState,
}
