//! Tracing subscriber setup for embedding binaries.
//!
//! Call [`init`] once at process start. Filtering is controlled through
//! `RUST_LOG` (falling back to `info`), output goes through the fmt layer,
//! and a [`tracing_error::ErrorLayer`] is installed so error reports can
//! capture span traces.

use std::sync::Once;

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Installs the global subscriber. Safe to call repeatedly; only the first
/// call has any effect, so tests can invoke it without coordination.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .with(ErrorLayer::default())
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
