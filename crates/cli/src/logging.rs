use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Logs always go to stderr so that stdout carries only results.
pub fn init(quiet: bool) {
    INIT.call_once(|| {
        let filter = if quiet {
            EnvFilter::new("error")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hf_hub=warn"))
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(!quiet)
            .with_writer(std::io::stderr)
            .init();
    });
}
