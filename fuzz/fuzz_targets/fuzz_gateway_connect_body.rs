//! Fuzz target: JSON deserialization of `ConnectBody`.
//!
//! Arbitrary bytes fed to the request body parser must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use virtbridge_gateway::routes::ConnectBody;

fuzz_target!(|data: &[u8]| {
    if let Ok(body) = serde_json::from_slice::<ConnectBody>(data) {
        let _ = body.uri.as_deref().map(str::len);
    }
});
