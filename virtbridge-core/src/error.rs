use std::fmt;

/// A host query that can fail independently of the connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Query {
    /// Counting the active domains.
    DomainCount,
    /// Enumerating the active domain identifiers.
    DomainList,
    /// Reading the host node information.
    NodeInfo,
    /// Reading the per-CPU time counters for one logical CPU.
    CpuStats { cpu: u32 },
}

impl Query {
    /// Short reason string reported to callers when this query fails.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Query::DomainCount => "failed to get number of domains",
            Query::DomainList => "failed to list domains",
            Query::NodeInfo => "failed to get node info",
            Query::CpuStats { .. } => "failed to get cpu stats",
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Errors produced at the bridge boundary.
///
/// The `Display` output of each variant is the reason string handed back to
/// callers. Backend detail is carried alongside for logging only.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// Input was rejected before any call reached the host.
    #[error("bad argument")]
    BadArgument(String),

    /// Opening a connection to the host failed.
    #[error("failed to connect to hypervisor")]
    Connection { uri: String, detail: String },

    /// The handle was already closed.
    #[error("connection closed")]
    ClosedConnection,

    /// A local buffer could not be allocated.
    #[error("memory allocation failed")]
    Allocation { what: &'static str },

    /// A host query failed or returned an unusable count.
    #[error("{query}")]
    Query { query: Query, detail: String },

    /// A host call panicked inside the bridge.
    #[error("internal error")]
    Internal { detail: String },
}

impl BridgeError {
    /// Build a [`BridgeError::Query`] for the given query.
    pub fn query(query: Query, detail: impl Into<String>) -> Self {
        Self::Query { query, detail: detail.into() }
    }

    /// Stable snake-case name of the failure kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::BadArgument(_) => "bad_argument",
            BridgeError::Connection { .. } => "connection_error",
            BridgeError::ClosedConnection => "closed_connection",
            BridgeError::Allocation { .. } => "allocation_error",
            BridgeError::Query { .. } => "query_error",
            BridgeError::Internal { .. } => "internal_error",
        }
    }

    /// Backend or validation detail, when there is any.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        match self {
            BridgeError::BadArgument(detail)
            | BridgeError::Connection { detail, .. }
            | BridgeError::Query { detail, .. }
            | BridgeError::Internal { detail } => Some(detail),
            BridgeError::Allocation { what } => Some(what),
            BridgeError::ClosedConnection => None,
        }
    }
}
