//! Integration tests for snipbox
//!
//! The pipeline tests need a working `rustc` on PATH. The isolate tests also
//! need the isolate binary and root, so they are marked `#[ignore]`.
//! Run with: cargo test -p snipbox --features integration-tests
//!
//! To include the root-only tests:
//!    cargo test -p snipbox --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::time::Duration;

use snipbox::Config;
use snipbox::config::Backend;

mod config_loading;
mod isolate_backend;
mod pipeline;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

pub(crate) fn fixture_config(name: &str) -> String {
    format!("{FIXTURES_PATH}/configs/{name}")
}

/// Default config on the process backend with a deadline short enough for tests
pub(crate) fn process_config(timeout: Duration) -> Config {
    let mut config = Config::default().with_timeout(timeout);
    config.sandbox.backend = Backend::Process;
    config
}

/// Isolate config with cgroup support if available, falling back to non-cgroup mode.
pub(crate) fn isolate_config(timeout: Duration, first_box_id: u32) -> Config {
    let mut config = Config::default().with_timeout(timeout);
    config.sandbox.backend = Backend::Isolate;
    config.sandbox.first_box_id = first_box_id;
    config.sandbox.box_count = 4;
    if config.sandbox.cgroup {
        match snipbox::prepare_cgroup(&config.sandbox.cg_root) {
            Ok(true) => {}                      // cgroups ready
            _ => config.sandbox.cgroup = false, // not available, fall back
        }
    }
    config
}
