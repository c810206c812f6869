//! Fuzz the routing configuration pipeline.
//!
//! Arbitrary bytes are parsed as a routing document, compiled into a
//! snapshot, and an arbitrary path is matched against it. Nothing here may
//! panic, and matching must stay consistent:
//!
//! - a matched entry's prefix really matches the path
//! - the path handed to the backend always starts with `/`
//!
//! # Running
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_routing_config -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use gatehouse::{RoutingConfig, RoutingSnapshot};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    document: &'a [u8],
    path: &'a str,
    version: u64,
}

fuzz_target!(|input: Input<'_>| {
    let Ok(cfg) = RoutingConfig::from_json(input.document) else {
        return;
    };

    let snapshot = RoutingSnapshot::compile(&cfg, input.version);
    assert!(snapshot.len() <= cfg.routes.len());
    assert_eq!(snapshot.version(), input.version);

    if let Some(entry) = snapshot.find(input.path) {
        assert!(entry.matches(input.path));
        let upstream = entry
            .upstream_path(input.path)
            .expect("matched entry must yield an upstream path");
        assert!(upstream.starts_with('/'));
    }
});
