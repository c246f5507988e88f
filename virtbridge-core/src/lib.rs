//! Core types for the virtbridge hypervisor bridge.
//!
//! Defines the snapshot types returned by host queries (domains, per-CPU
//! time, node information), the error taxonomy shared by every boundary
//! call, and the [`Term`] conversion layer that shapes results for callers.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod domain;
pub mod error;
pub mod host;
pub mod id;
pub mod term;

pub use domain::{DomainState, DomainSummary};
pub use error::{BridgeError, Query};
pub use host::{CpuStatParam, CpuTime, HostInfo, NodeInfo};
pub use id::ConnectionId;
pub use term::{reply, Handle, Term, ToTerm};
