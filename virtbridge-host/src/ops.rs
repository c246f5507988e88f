//! Host queries run against an open [`Connection`].
//!
//! Each operation checks the handle, makes its foreign calls, converts any
//! failure at the point it happens, and returns plain snapshot types.

use virtbridge_core::{
    BridgeError, CpuStatParam, CpuTime, DomainState, DomainSummary, HostInfo, NodeInfo, Query,
};

use crate::backend::{CallError, VirtBackend};
use crate::Connection;

/// List the active domains.
///
/// The result has one entry per identifier the host enumerated, in the
/// host's order. A domain that cannot be looked up or described (typically
/// because it shut down mid-enumeration) appears as `None`.
///
/// # Errors
/// - [`BridgeError::ClosedConnection`] if the handle is closed.
/// - [`BridgeError::Query`] if counting or enumerating the domains fails.
/// - [`BridgeError::Allocation`] if the id buffer cannot be allocated.
pub fn list_domains<B: VirtBackend>(
    connection: &Connection<B>,
) -> Result<Vec<Option<DomainSummary>>, BridgeError> {
    connection.with_conn(|backend, conn| {
        let count = backend
            .num_of_domains(conn)
            .map_err(|e| query_failed(Query::DomainCount, &e))?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut ids: Vec<u32> = alloc_filled(count, "domain id buffer")?;
        let listed = backend
            .list_domain_ids(conn, &mut ids)
            .map_err(|e| query_failed(Query::DomainList, &e))?;
        ids.truncate(listed);

        tracing::debug!(conn_id = %connection.id(), count = ids.len(), "enumerated active domains");

        Ok(ids.into_iter().map(|id| describe_domain(backend, conn, id)).collect())
    })
}

/// Collect per-CPU time counters for every logical CPU of the host.
///
/// # Errors
/// - [`BridgeError::ClosedConnection`] if the handle is closed.
/// - [`BridgeError::Query`] if node info fails, or if the stats query for any
///   single CPU fails or reports no counters. No partial result is returned.
/// - [`BridgeError::Allocation`] if a stats buffer cannot be allocated.
pub fn get_host_info<B: VirtBackend>(connection: &Connection<B>) -> Result<HostInfo, BridgeError> {
    connection.with_conn(|backend, conn| {
        let node = backend
            .node_info(conn)
            .map_err(|e| query_failed(Query::NodeInfo, &e))?;

        let time = (0..node.cpus)
            .map(|cpu| cpu_stats(backend, conn, cpu).map(|params| CpuTime::aggregate(&params)))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(conn_id = %connection.id(), cpus = node.cpus, "collected host cpu time");

        Ok(HostInfo { cpus: node.cpus, time })
    })
}

/// Read the node hardware summary.
///
/// # Errors
/// - [`BridgeError::ClosedConnection`] if the handle is closed.
/// - [`BridgeError::Query`] if the node info query fails.
pub fn get_node_info<B: VirtBackend>(connection: &Connection<B>) -> Result<NodeInfo, BridgeError> {
    connection.with_conn(|backend, conn| {
        backend.node_info(conn).map_err(|e| query_failed(Query::NodeInfo, &e))
    })
}

/// Holds a looked-up domain and frees it when dropped.
struct DomainGuard<'a, B: VirtBackend> {
    backend: &'a B,
    domain: B::Domain,
    id: u32,
}

impl<'a, B: VirtBackend> DomainGuard<'a, B> {
    fn lookup(backend: &'a B, conn: &B::Conn, id: u32) -> Result<Self, CallError> {
        let domain = backend.lookup_domain(conn, id)?;
        Ok(Self { backend, domain, id })
    }

    fn describe(&self) -> Result<DomainSummary, CallError> {
        let info = self.backend.domain_info(&self.domain)?;
        let name = self.backend.domain_name(&self.domain)?;
        Ok(DomainSummary {
            id: self.id,
            name,
            cpu_time: info.cpu_time,
            memory: info.memory,
            state: DomainState::from(info.state),
        })
    }
}

impl<B: VirtBackend> Drop for DomainGuard<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.free_domain(&mut self.domain) {
            tracing::warn!(domain_id = self.id, error = %e, "failed to free domain reference");
        }
    }
}

fn describe_domain<B: VirtBackend>(backend: &B, conn: &B::Conn, id: u32) -> Option<DomainSummary> {
    match DomainGuard::lookup(backend, conn, id).and_then(|guard| guard.describe()) {
        Ok(summary) => Some(summary),
        Err(e) => {
            tracing::warn!(domain_id = id, error = %e, "domain unavailable, reporting it as absent");
            None
        }
    }
}

/// Two-phase stats query: probe for the counter count, then fetch into a
/// buffer of exactly that size.
fn cpu_stats<B: VirtBackend>(
    backend: &B,
    conn: &B::Conn,
    cpu: u32,
) -> Result<Vec<CpuStatParam>, BridgeError> {
    let query = Query::CpuStats { cpu };

    let nparams = backend
        .node_cpu_stats(conn, cpu, None)
        .map_err(|e| query_failed(query, &e))?;
    if nparams == 0 {
        tracing::warn!(cpu, "host reported no cpu stat fields");
        return Err(BridgeError::query(query, format!("cpu {cpu} reported no stat fields")));
    }

    let mut params: Vec<CpuStatParam> = alloc_filled(nparams, "cpu stats buffer")?;
    let filled = backend
        .node_cpu_stats(conn, cpu, Some(&mut params))
        .map_err(|e| query_failed(query, &e))?;
    params.truncate(filled);

    Ok(params)
}

fn query_failed(query: Query, e: &CallError) -> BridgeError {
    tracing::warn!(error = %e, "{query}");
    BridgeError::query(query, e.to_string())
}

/// Allocate a buffer of `len` default values, reporting allocation failure
/// instead of aborting.
fn alloc_filled<T, N>(len: N, what: &'static str) -> Result<Vec<T>, BridgeError>
where
    T: Clone + Default,
    N: TryInto<usize>,
{
    let len = len.try_into().map_err(|_| BridgeError::Allocation { what })?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| BridgeError::Allocation { what })?;
    buf.resize(len, T::default());
    Ok(buf)
}
