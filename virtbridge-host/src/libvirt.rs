//! libvirt backend.
//!
//! Talks to the hypervisor through the `virt` crate. Per-CPU statistics are
//! not wrapped there, so they go straight through `virNodeGetCPUStats`.
//!
//! # API Reference
//! <https://libvirt.org/html/libvirt-libvirt-host.html#virNodeGetCPUStats>

use std::ffi::CStr;
use std::os::raw::c_int;

use virt::connect::Connect;
use virt::domain::Domain;
use virtbridge_core::{CpuStatParam, NodeInfo};

use crate::backend::{CallError, RawDomainInfo, VirtBackend};

/// Open libvirt connection.
pub struct LibvirtConn(Connect);

// SAFETY: libvirt connection objects are thread safe; the bridge only
// moves a connection between threads and never shares one without the
// handle's lock.
unsafe impl Send for LibvirtConn {}

/// [`VirtBackend`] backed by libvirt.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibvirtBackend;

impl LibvirtBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn call_error(call: &'static str, e: &virt::error::Error) -> CallError {
    CallError::new(call, e.to_string())
}

impl VirtBackend for LibvirtBackend {
    type Conn = LibvirtConn;
    type Domain = Domain;

    fn connect(&self, uri: &str) -> Result<LibvirtConn, CallError> {
        Connect::open(Some(uri))
            .map(LibvirtConn)
            .map_err(|e| call_error("virConnectOpen", &e))
    }

    fn close(&self, mut conn: LibvirtConn) -> Result<(), CallError> {
        conn.0
            .close()
            .map(|_| ())
            .map_err(|e| call_error("virConnectClose", &e))
    }

    fn num_of_domains(&self, conn: &LibvirtConn) -> Result<u32, CallError> {
        conn.0
            .num_of_domains()
            .map_err(|e| call_error("virConnectNumOfDomains", &e))
    }

    fn list_domain_ids(&self, conn: &LibvirtConn, ids: &mut [u32]) -> Result<usize, CallError> {
        let listed = conn
            .0
            .list_domains()
            .map_err(|e| call_error("virConnectListDomains", &e))?;
        let written = ids.len().min(listed.len());
        ids[..written].copy_from_slice(&listed[..written]);
        Ok(written)
    }

    fn lookup_domain(&self, conn: &LibvirtConn, id: u32) -> Result<Domain, CallError> {
        Domain::lookup_by_id(&conn.0, id).map_err(|e| call_error("virDomainLookupByID", &e))
    }

    fn domain_info(&self, domain: &Domain) -> Result<RawDomainInfo, CallError> {
        let info = domain.get_info().map_err(|e| call_error("virDomainGetInfo", &e))?;
        Ok(RawDomainInfo {
            state: info.state as u32,
            max_mem: info.max_mem,
            memory: info.memory,
            nr_virt_cpu: info.nr_virt_cpu,
            cpu_time: info.cpu_time,
        })
    }

    fn domain_name(&self, domain: &Domain) -> Result<String, CallError> {
        domain.get_name().map_err(|e| call_error("virDomainGetName", &e))
    }

    fn free_domain(&self, domain: &mut Domain) -> Result<(), CallError> {
        domain.free().map_err(|e| call_error("virDomainFree", &e))
    }

    fn node_info(&self, conn: &LibvirtConn) -> Result<NodeInfo, CallError> {
        let info = conn
            .0
            .get_node_info()
            .map_err(|e| call_error("virNodeGetInfo", &e))?;
        Ok(NodeInfo {
            model: info.model,
            memory: info.memory,
            cpus: info.cpus,
            mhz: info.mhz,
            nodes: info.nodes,
            sockets: info.sockets,
            cores: info.cores,
            threads: info.threads,
        })
    }

    fn node_cpu_stats(
        &self,
        conn: &LibvirtConn,
        cpu: u32,
        params: Option<&mut [CpuStatParam]>,
    ) -> Result<usize, CallError> {
        let cpu_num = c_int::try_from(cpu)
            .map_err(|_| CallError::new("virNodeGetCPUStats", format!("cpu number {cpu} out of range")))?;

        let Some(params) = params else {
            let mut nparams: c_int = 0;
            // SAFETY: a null params pointer asks libvirt for the count only;
            // `nparams` is a valid out pointer for the duration of the call.
            let ret = unsafe {
                virt::sys::virNodeGetCPUStats(conn.0.as_ptr(), cpu_num, std::ptr::null_mut(), &mut nparams, 0)
            };
            if ret < 0 {
                return Err(last_error("virNodeGetCPUStats"));
            }
            return usize::try_from(nparams)
                .map_err(|_| CallError::new("virNodeGetCPUStats", format!("negative param count {nparams}")));
        };

        let mut nparams = c_int::try_from(params.len())
            .map_err(|_| CallError::new("virNodeGetCPUStats", "stats buffer too large"))?;
        // SAFETY: virNodeCPUStats is plain old data; an all-zero value is valid.
        let mut raw: Vec<virt::sys::virNodeCPUStats> = (0..params.len())
            .map(|_| unsafe { std::mem::zeroed() })
            .collect();

        // SAFETY: `raw` holds `nparams` initialised entries and outlives the
        // call; libvirt writes at most `nparams` of them.
        let ret = unsafe {
            virt::sys::virNodeGetCPUStats(conn.0.as_ptr(), cpu_num, raw.as_mut_ptr(), &mut nparams, 0)
        };
        if ret < 0 {
            return Err(last_error("virNodeGetCPUStats"));
        }

        let written = usize::try_from(nparams).unwrap_or(0).min(params.len());
        for (slot, stat) in params.iter_mut().zip(&raw).take(written) {
            // SAFETY: libvirt NUL-terminates every field name within the
            // fixed-size array.
            let field = unsafe { CStr::from_ptr(stat.field.as_ptr()) };
            *slot = CpuStatParam::new(field.to_string_lossy(), stat.value);
        }
        Ok(written)
    }
}

fn last_error(call: &'static str) -> CallError {
    CallError::new(call, virt::error::Error::last_error().to_string())
}
