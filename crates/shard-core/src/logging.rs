//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to the
/// configured directive. Returns false if a subscriber was already set.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Log a shard open at info when `log_opens` is set, debug otherwise
#[macro_export]
macro_rules! log_open {
    ($log:expr, $($arg:tt)+) => {
        if $log.log_opens {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}
