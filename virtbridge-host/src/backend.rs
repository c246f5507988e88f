//! Host API abstraction trait.
//!
//! One method per foreign call the bridge makes into the virtualization
//! library. Allows swapping libvirt for the in-memory mock without touching
//! the operation layer.

use virtbridge_core::{CpuStatParam, NodeInfo};

/// A single foreign call failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{call} failed: {message}")]
pub struct CallError {
    /// Name of the foreign call, e.g. `virConnectNumOfDomains`.
    pub call: &'static str,
    pub message: String,
}

impl CallError {
    pub fn new(call: &'static str, message: impl Into<String>) -> Self {
        Self { call, message: message.into() }
    }
}

/// Raw per-domain counters as the host reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawDomainInfo {
    pub state: u32,
    /// Maximum memory in KiB.
    pub max_mem: u64,
    /// Current memory in KiB.
    pub memory: u64,
    pub nr_virt_cpu: u32,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_time: u64,
}

/// Blocking interface to the external virtualization library.
///
/// Every method maps to exactly one foreign call. Calls block the current
/// thread; callers in async code go through [`crate::BlockingPool`].
///
/// Connections are released by passing ownership back to
/// [`VirtBackend::close`], so a closed connection can never be used again.
/// Domain references are freed in place by [`VirtBackend::free_domain`] and
/// must not be used afterwards.
pub trait VirtBackend: Send + Sync + 'static {
    /// Live connection to one host.
    type Conn: Send + 'static;

    /// Host-side reference to one domain, valid until freed.
    type Domain;

    /// Open a connection to the host at `uri`.
    ///
    /// # Errors
    /// Returns a [`CallError`] for an invalid URI, an unreachable host or an
    /// authentication failure. These are not distinguished.
    fn connect(&self, uri: &str) -> Result<Self::Conn, CallError>;

    /// Close a connection and release its host-side resources.
    ///
    /// # Errors
    /// Returns a [`CallError`] when the host reports a failure while closing.
    /// The connection is consumed either way.
    fn close(&self, conn: Self::Conn) -> Result<(), CallError>;

    /// Count the active domains.
    ///
    /// # Errors
    /// Returns a [`CallError`] when the host query fails.
    fn num_of_domains(&self, conn: &Self::Conn) -> Result<u32, CallError>;

    /// Write up to `ids.len()` active domain identifiers into `ids`.
    ///
    /// Returns how many entries were written.
    ///
    /// # Errors
    /// Returns a [`CallError`] when the host query fails.
    fn list_domain_ids(&self, conn: &Self::Conn, ids: &mut [u32]) -> Result<usize, CallError>;

    /// Look up an active domain by identifier.
    ///
    /// # Errors
    /// Returns a [`CallError`] when no such domain exists (it may have shut
    /// down since enumeration) or the lookup fails.
    fn lookup_domain(&self, conn: &Self::Conn, id: u32) -> Result<Self::Domain, CallError>;

    /// Read the state, memory and CPU counters of a domain.
    ///
    /// # Errors
    /// Returns a [`CallError`] when the host query fails.
    fn domain_info(&self, domain: &Self::Domain) -> Result<RawDomainInfo, CallError>;

    /// Read the name of a domain.
    ///
    /// # Errors
    /// Returns a [`CallError`] when the host query fails.
    fn domain_name(&self, domain: &Self::Domain) -> Result<String, CallError>;

    /// Release a domain reference obtained from [`VirtBackend::lookup_domain`].
    ///
    /// # Errors
    /// Returns a [`CallError`] when the host reports a failure while freeing.
    fn free_domain(&self, domain: &mut Self::Domain) -> Result<(), CallError>;

    /// Read the node hardware summary.
    ///
    /// # Errors
    /// Returns a [`CallError`] when the host query fails.
    fn node_info(&self, conn: &Self::Conn) -> Result<NodeInfo, CallError>;

    /// Query the time counters of one logical CPU.
    ///
    /// With `params` set to `None` the call only reports how many counters the
    /// host has for `cpu`. With a buffer it fills up to `params.len()` entries
    /// and returns how many were written.
    ///
    /// # Errors
    /// Returns a [`CallError`] when the host query fails.
    fn node_cpu_stats(
        &self,
        conn: &Self::Conn,
        cpu: u32,
        params: Option<&mut [CpuStatParam]>,
    ) -> Result<usize, CallError>;
}
