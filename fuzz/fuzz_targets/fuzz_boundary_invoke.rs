//! Fuzz target: the tagged-term function table.
//!
//! Arbitrary function names and argument lists must always produce a tagged
//! reply and never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use virtbridge_core::{ConnectionId, Handle, Term};
use virtbridge_host::{Bridge, BridgeConfig, MockBackend, MockHost};

const FUNCTIONS: [&str; 7] = [
    "connect",
    "disconnect",
    "list_domains",
    "get_host_info",
    "get_node_info",
    "release",
    "unknown",
];

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let function = FUNCTIONS[usize::from(selector) % FUNCTIONS.len()];
    let text = String::from_utf8_lossy(rest).into_owned();
    let args = match selector >> 4 {
        0 => vec![],
        1 => vec![Term::str(text)],
        2 => vec![Term::Handle(Handle::detached(ConnectionId::new()))],
        3 => vec![Term::atom(text)],
        _ => vec![Term::str(text.clone()), Term::str(text)],
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let bridge = Bridge::new(MockBackend::new(MockHost::demo()), BridgeConfig::default())
        .expect("default config is valid");

    let reply = runtime.block_on(bridge.invoke(function, args));
    assert!(reply.as_tagged().is_some(), "reply must be tagged: {reply:?}");
});
