//! Logging setup for the plugin process.
//!
//! All logs go to **stderr**: stdout carries the handshake line and nothing
//! else. The host captures stderr and interleaves it with its own log.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: full `tracing` filter syntax, wins when set
//!   (e.g. `terraform_provider_mssql=debug`)
//! - `TF_LOG`: the host's log level (`TRACE`, `DEBUG`, `INFO`, `WARN`,
//!   `ERROR`, `JSON`), used when `RUST_LOG` is unset

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Map the host's `TF_LOG` value to a filter directive.
fn level_from_tf_log(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_uppercase().as_str() {
        "TRACE" | "JSON" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARN" => Some("warn"),
        "ERROR" => Some("error"),
        _ => None,
    }
}

/// Resolve the filter: `RUST_LOG`, then `TF_LOG`, then `default_level`.
fn resolve_filter(default_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var("TF_LOG")
        .ok()
        .and_then(|v| level_from_tf_log(&v))
        .unwrap_or(default_level);
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn try_init_with(default_level: &str) -> bool {
    let (filter, handle) = reload::Layer::new(resolve_filter(default_level));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .try_init()
        .is_ok();
    if installed {
        let _ = FILTER_HANDLE.set(handle);
    }
    installed
}

/// Initialize the default logging subscriber at `info`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Initialize logging with a custom default level.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    if !try_init_with(default_level) {
        panic!("a global tracing subscriber is already installed");
    }
}

/// Try to initialize logging, returning false if already initialized.
pub fn try_init_logging() -> bool {
    try_init_with("info")
}

/// Switch the installed subscriber to `debug`, as requested by the
/// provider's `debug` setting. No-op when `RUST_LOG` is set or when logging
/// was never initialized through this module.
pub fn enable_debug_logging() -> bool {
    if std::env::var_os("RUST_LOG").is_some() {
        return false;
    }
    match FILTER_HANDLE.get() {
        Some(handle) => handle
            .modify(|filter| *filter = EnvFilter::new("debug"))
            .is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    // The global subscriber can only be set once per process, so only the
    // filter resolution is exercised here.

    use super::*;

    #[test]
    fn test_tf_log_levels() {
        assert_eq!(level_from_tf_log("TRACE"), Some("trace"));
        assert_eq!(level_from_tf_log("debug"), Some("debug"));
        assert_eq!(level_from_tf_log(" WARN "), Some("warn"));
        assert_eq!(level_from_tf_log("JSON"), Some("trace"));
        assert_eq!(level_from_tf_log("off"), None);
    }

    #[test]
    fn test_enable_debug_without_subscriber() {
        // Nothing was installed through this module in the test binary.
        assert!(!enable_debug_logging());
    }

    #[test]
    fn test_env_filter_parsing() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("terraform_provider_mssql=debug").is_ok());
        assert!(EnvFilter::try_new("warn,terraform_provider_mssql=trace").is_ok());
    }
}
