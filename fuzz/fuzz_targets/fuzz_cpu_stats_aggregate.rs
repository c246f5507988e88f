//! Fuzz target: per-CPU counter aggregation.
//!
//! Every 9-byte chunk is one counter: a field selector byte and a
//! little-endian value. Named buckets can never exceed the total.

#![no_main]

use libfuzzer_sys::fuzz_target;
use virtbridge_core::{CpuStatParam, CpuTime};

const FIELDS: [&str; 5] = ["idle", "user", "kernel", "iowait", "intr"];

fuzz_target!(|data: &[u8]| {
    let params: Vec<CpuStatParam> = data
        .chunks_exact(9)
        .map(|chunk| {
            let field = FIELDS[usize::from(chunk[0]) % FIELDS.len()];
            let mut value = [0u8; 8];
            value.copy_from_slice(&chunk[1..]);
            CpuStatParam::new(field, u64::from_le_bytes(value))
        })
        .collect();

    let time = CpuTime::aggregate(&params);
    assert!(time.idle <= time.total);
    assert!(time.user <= time.total);
    assert!(time.kernel <= time.total);
});
