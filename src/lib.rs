pub mod aggregate;
pub mod classify;
pub mod config;
pub mod error;
pub mod fetch;
pub mod fields;
pub mod ingest;
pub mod lifecycle;
pub mod merge;
pub mod ownership;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod run_record;
pub mod verifier_log;

pub use error::*;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Installs the diagnostics subscriber. Output goes to stderr so stdout stays a clean
/// report; `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(service, "tracing initialized");
    }
}
