//! Connection handles and host queries for the virtbridge hypervisor bridge.
//!
//! Wraps a virtualization host behind [`VirtBackend`], owns live connections
//! through [`Connection`] handles, and exposes the domain listing and host
//! statistics queries both as typed async calls ([`HostApi`]) and as a
//! tagged-term function table ([`Bridge::invoke`]).

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod dispatch;
#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod mock;
pub mod ops;

pub use backend::{CallError, RawDomainInfo, VirtBackend};
pub use bridge::{Bridge, ConnectionInfo, HostApi, CLOSED_HANDLE_HISTORY};
pub use config::{BridgeConfig, ConfigError};
pub use connection::Connection;
pub use dispatch::BlockingPool;
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
pub use mock::{MockBackend, MockHost};
