//! In-memory host backend for tests and local development.
//!
//! A [`MockHost`] scripts what the host reports (domains, node info, per-CPU
//! counters) and which foreign calls fail. [`MockBackend`] serves it through
//! [`VirtBackend`] and counts every acquire and release so tests can check
//! that nothing leaks or is released twice.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use virtbridge_core::{CpuStatParam, NodeInfo};

use crate::backend::{CallError, RawDomainInfo, VirtBackend};

/// URI scheme the mock accepts. Anything else is treated as unreachable.
pub const MOCK_SCHEME: &str = "mock://";

/// One scripted domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDomain {
    pub id: u32,
    pub name: String,
    pub info: RawDomainInfo,
    /// Lookup by id fails, as if the domain shut down after enumeration.
    pub vanished: bool,
    /// Info retrieval fails after a successful lookup.
    pub info_fails: bool,
}

impl MockDomain {
    /// A running domain with 1 GiB of memory and one vCPU.
    pub fn running(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            info: RawDomainInfo {
                state: 1,
                max_mem: 1_048_576,
                memory: 1_048_576,
                nr_virt_cpu: 1,
                cpu_time: u64::from(id) * 1_000_000_000,
            },
            vanished: false,
            info_fails: false,
        }
    }

    #[must_use]
    pub fn vanished(mut self) -> Self {
        self.vanished = true;
        self
    }

    #[must_use]
    pub fn with_failing_info(mut self) -> Self {
        self.info_fails = true;
        self
    }
}

/// Foreign calls that should fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockFailures {
    pub close: bool,
    pub num_of_domains: bool,
    pub list_domains: bool,
    pub node_info: bool,
    /// CPU whose count probe fails.
    pub cpu_probe: Option<u32>,
    /// CPU whose second, buffer-filling stats call fails.
    pub cpu_fetch: Option<u32>,
}

/// Scripted host state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockHost {
    pub domains: Vec<MockDomain>,
    pub node: NodeInfo,
    /// Counters reported for each logical CPU, indexed by CPU number.
    pub cpu_stats: Vec<Vec<CpuStatParam>>,
    pub failures: MockFailures,
}

impl MockHost {
    /// A host with no domains and no CPUs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            domains: Vec::new(),
            node: NodeInfo {
                model: "x86_64".to_owned(),
                memory: 16_777_216,
                cpus: 0,
                mhz: 2400,
                nodes: 1,
                sockets: 1,
                cores: 0,
                threads: 1,
            },
            cpu_stats: Vec::new(),
            failures: MockFailures::default(),
        }
    }

    /// Two running domains on a two-CPU host.
    #[must_use]
    pub fn demo() -> Self {
        Self::new()
            .with_domain(MockDomain::running(1, "web-01"))
            .with_domain(MockDomain::running(2, "db-01"))
            .with_cpu(linux_cpu_stats(9_000, 600, 300, 100))
            .with_cpu(linux_cpu_stats(8_000, 1_200, 500, 300))
    }

    #[must_use]
    pub fn with_domain(mut self, domain: MockDomain) -> Self {
        self.domains.push(domain);
        self
    }

    /// Add one logical CPU reporting `params`.
    #[must_use]
    pub fn with_cpu(mut self, params: Vec<CpuStatParam>) -> Self {
        self.cpu_stats.push(params);
        self.node.cpus = u32::try_from(self.cpu_stats.len()).unwrap_or(u32::MAX);
        self.node.cores = self.node.cpus;
        self
    }

    #[must_use]
    pub fn with_failures(mut self, failures: MockFailures) -> Self {
        self.failures = failures;
        self
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

/// The four counters Linux hosts report for each CPU.
#[must_use]
pub fn linux_cpu_stats(idle: u64, user: u64, kernel: u64, iowait: u64) -> Vec<CpuStatParam> {
    vec![
        CpuStatParam::new("kernel", kernel),
        CpuStatParam::new("user", user),
        CpuStatParam::new("idle", idle),
        CpuStatParam::new("iowait", iowait),
    ]
}

/// Call counters kept by [`MockBackend`].
#[derive(Debug, Default)]
pub struct MockCounters {
    connects: AtomicUsize,
    closes: AtomicUsize,
    lookups: AtomicUsize,
    frees: AtomicUsize,
    list_calls: AtomicUsize,
    stats_calls: AtomicUsize,
}

impl MockCounters {
    /// Successful connects.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections handed back through `close`.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Successful domain lookups.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Domain references handed back through `free_domain`.
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    /// Calls to `list_domain_ids`.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Calls to `node_cpu_stats`, probes included.
    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }
}

/// Connection served by [`MockBackend`].
#[derive(Debug)]
pub struct MockConn {
    serial: u64,
}

/// Domain reference served by [`MockBackend`].
#[derive(Debug)]
pub struct MockDomainRef {
    index: usize,
}

/// In-memory [`VirtBackend`].
#[derive(Debug, Default)]
pub struct MockBackend {
    host: Mutex<MockHost>,
    counters: MockCounters,
    next_serial: AtomicU64,
}

impl MockBackend {
    #[must_use]
    pub fn new(host: MockHost) -> Self {
        Self {
            host: Mutex::new(host),
            counters: MockCounters::default(),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn counters(&self) -> &MockCounters {
        &self.counters
    }

    /// Change the scripted host state, e.g. to make a query start failing.
    pub fn update(&self, f: impl FnOnce(&mut MockHost)) {
        f(&mut self.host.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn with_host<T>(&self, f: impl FnOnce(&MockHost) -> T) -> T {
        f(&self.host.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl VirtBackend for MockBackend {
    type Conn = MockConn;
    type Domain = MockDomainRef;

    fn connect(&self, uri: &str) -> Result<MockConn, CallError> {
        if !uri.starts_with(MOCK_SCHEME) {
            return Err(CallError::new("virConnectOpen", format!("no connection driver available for {uri}")));
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        Ok(MockConn { serial })
    }

    fn close(&self, conn: MockConn) -> Result<(), CallError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if self.with_host(|h| h.failures.close) {
            return Err(CallError::new("virConnectClose", format!("connection {} close failed", conn.serial)));
        }
        Ok(())
    }

    fn num_of_domains(&self, _conn: &MockConn) -> Result<u32, CallError> {
        self.with_host(|h| {
            if h.failures.num_of_domains {
                return Err(CallError::new("virConnectNumOfDomains", "scripted failure"));
            }
            Ok(u32::try_from(h.domains.len()).unwrap_or(u32::MAX))
        })
    }

    fn list_domain_ids(&self, _conn: &MockConn, ids: &mut [u32]) -> Result<usize, CallError> {
        self.counters.list_calls.fetch_add(1, Ordering::SeqCst);
        self.with_host(|h| {
            if h.failures.list_domains {
                return Err(CallError::new("virConnectListDomains", "scripted failure"));
            }
            let written = ids.len().min(h.domains.len());
            for (slot, domain) in ids.iter_mut().zip(&h.domains) {
                *slot = domain.id;
            }
            Ok(written)
        })
    }

    fn lookup_domain(&self, _conn: &MockConn, id: u32) -> Result<MockDomainRef, CallError> {
        let index = self.with_host(|h| h.domains.iter().position(|d| d.id == id && !d.vanished));
        match index {
            Some(index) => {
                self.counters.lookups.fetch_add(1, Ordering::SeqCst);
                Ok(MockDomainRef { index })
            }
            None => Err(CallError::new("virDomainLookupByID", format!("domain {id} not found"))),
        }
    }

    fn domain_info(&self, domain: &MockDomainRef) -> Result<RawDomainInfo, CallError> {
        self.with_host(|h| match h.domains.get(domain.index) {
            Some(d) if !d.info_fails => Ok(d.info),
            _ => Err(CallError::new("virDomainGetInfo", "scripted failure")),
        })
    }

    fn domain_name(&self, domain: &MockDomainRef) -> Result<String, CallError> {
        self.with_host(|h| {
            h.domains
                .get(domain.index)
                .map(|d| d.name.clone())
                .ok_or_else(|| CallError::new("virDomainGetName", "domain reference is stale"))
        })
    }

    fn free_domain(&self, _domain: &mut MockDomainRef) -> Result<(), CallError> {
        self.counters.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn node_info(&self, _conn: &MockConn) -> Result<NodeInfo, CallError> {
        self.with_host(|h| {
            if h.failures.node_info {
                return Err(CallError::new("virNodeGetInfo", "scripted failure"));
            }
            Ok(h.node.clone())
        })
    }

    fn node_cpu_stats(
        &self,
        _conn: &MockConn,
        cpu: u32,
        params: Option<&mut [CpuStatParam]>,
    ) -> Result<usize, CallError> {
        self.counters.stats_calls.fetch_add(1, Ordering::SeqCst);
        self.with_host(|h| {
            let stats = usize::try_from(cpu)
                .ok()
                .and_then(|i| h.cpu_stats.get(i))
                .ok_or_else(|| CallError::new("virNodeGetCPUStats", format!("invalid cpu number {cpu}")))?;
            match params {
                None if h.failures.cpu_probe == Some(cpu) => {
                    Err(CallError::new("virNodeGetCPUStats", "scripted probe failure"))
                }
                None => Ok(stats.len()),
                Some(_) if h.failures.cpu_fetch == Some(cpu) => {
                    Err(CallError::new("virNodeGetCPUStats", "scripted fetch failure"))
                }
                Some(buf) => {
                    let written = buf.len().min(stats.len());
                    buf[..written].clone_from_slice(&stats[..written]);
                    Ok(written)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_refuses_foreign_schemes() {
        let backend = MockBackend::new(MockHost::new());
        assert!(backend.connect("qemu:///system").is_err());
        assert!(backend.connect("mock:///default").is_ok());
        assert_eq!(backend.counters().connects(), 1);
    }

    #[test]
    fn mock_probe_reports_param_count() {
        let backend = MockBackend::new(MockHost::demo());
        let conn = match backend.connect("mock:///default") {
            Ok(c) => c,
            Err(e) => panic!("connect failed: {e}"),
        };
        let count = backend.node_cpu_stats(&conn, 0, None);
        assert!(matches!(count, Ok(4)), "demo CPUs report four counters, got {count:?}");
        assert!(backend.node_cpu_stats(&conn, 7, None).is_err(), "unknown CPU must fail");
    }

    #[test]
    fn demo_host_cpu_count_matches_stats() {
        let host = MockHost::demo();
        assert_eq!(host.node.cpus as usize, host.cpu_stats.len());
        assert_eq!(host.domains.len(), 2);
    }
}
