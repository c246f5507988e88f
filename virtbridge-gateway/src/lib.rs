//! HTTP gateway for the virtbridge hypervisor bridge.
//!
//! Exposes connection lifecycle, domain listing and host statistics over a
//! small JSON API in front of a [`virtbridge_host::HostApi`].

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod routes;
