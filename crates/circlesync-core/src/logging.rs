//! Console logging setup shared by the binaries.
//!
//! `RUST_LOG` always wins over the verbosity-derived filter.

use tracing_subscriber::EnvFilter;

/// Filter directive for a `-v` count.
pub fn filter_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,circlesync_core=info",
        1 => "info,circlesync_core=debug",
        2 => "debug,iroh=info,iroh_gossip=info",
        _ => "trace",
    }
}

/// Install a global `fmt` subscriber. A second call is a no-op.
pub fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbosity)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity > 1)
        .try_init();
}
