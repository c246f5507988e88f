//! Host-level snapshot types and per-CPU aggregation.

use serde::{Deserialize, Serialize};

/// Field name the host uses for idle time.
pub const CPU_STATS_IDLE: &str = "idle";
/// Field name the host uses for user-mode time.
pub const CPU_STATS_USER: &str = "user";
/// Field name the host uses for kernel-mode time.
pub const CPU_STATS_KERNEL: &str = "kernel";

/// One named counter returned by the per-CPU stats query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStatParam {
    pub field: String,
    pub value: u64,
}

impl CpuStatParam {
    pub fn new(field: impl Into<String>, value: u64) -> Self {
        Self { field: field.into(), value }
    }
}

/// Accumulated time-in-state for one logical CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTime {
    pub total: u64,
    pub idle: u64,
    pub user: u64,
    pub kernel: u64,
}

impl CpuTime {
    /// Fold the counters reported for one CPU into the tracked buckets.
    ///
    /// Every value counts toward `total`. Fields other than idle, user and
    /// kernel (`iowait` on Linux, for instance) only count toward `total`.
    #[must_use]
    pub fn aggregate(params: &[CpuStatParam]) -> Self {
        params.iter().fold(Self::default(), |mut acc, param| {
            acc.total = acc.total.saturating_add(param.value);
            let bucket = match param.field.as_str() {
                CPU_STATS_IDLE => Some(&mut acc.idle),
                CPU_STATS_USER => Some(&mut acc.user),
                CPU_STATS_KERNEL => Some(&mut acc.kernel),
                _ => None,
            };
            if let Some(bucket) = bucket {
                *bucket = bucket.saturating_add(param.value);
            }
            acc
        })
    }
}

/// Logical CPU count plus one [`CpuTime`] per CPU, in CPU index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub cpus: u32,
    pub time: Vec<CpuTime>,
}

/// Hardware summary of the host node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// CPU model string.
    pub model: String,
    /// Memory size in KiB.
    pub memory: u64,
    /// Number of active logical CPUs.
    pub cpus: u32,
    /// Expected CPU frequency in MHz.
    pub mhz: u32,
    /// Number of NUMA cells.
    pub nodes: u32,
    /// Sockets per NUMA cell.
    pub sockets: u32,
    /// Cores per socket.
    pub cores: u32,
    /// Threads per core.
    pub threads: u32,
}
