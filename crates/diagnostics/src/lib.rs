//! Lightweight diagnostics for the anyfs workspace.
//!
//! Configured through the ANYFS_LOG environment variable:
//! - ANYFS_LOG=off (default) - no logs
//! - ANYFS_LOG=info - facade operations, credential decisions
//! - ANYFS_LOG=debug - cache hits/misses and other internal detail

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

static INIT: Once = Once::new();

/// Initialize diagnostics based on the ANYFS_LOG environment variable.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init_diagnostics() {
    INIT.call_once(|| {
        let log_level = std::env::var("ANYFS_LOG").unwrap_or_else(|_| "off".to_string());

        let level = match log_level.as_str() {
            "off" => return,
            "debug" => emit::Level::Debug,
            "info" => emit::Level::Info,
            "warn" => emit::Level::Warn,
            "error" => emit::Level::Error,
            other => {
                eprintln!("Warning: Unknown ANYFS_LOG value '{other}', using 'info'");
                emit::Level::Info
            }
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        // The runtime must live for the rest of the process.
        std::mem::forget(rt);
    });
}

/// Log facade operations (listings, mutations, credential decisions).
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log internal detail (cache hits/misses, scope reconciliation, eviction).
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log recoverable conditions (silent refresh fallthrough, stale cache slots).
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures surfaced to callers.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

pub use init_diagnostics as init;
