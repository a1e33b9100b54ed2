//! Module-gated logging macros.
//!
//! A module opts in by declaring two constants next to its imports:
//! ```rust,ignore
//! const ENABLE_LOGS: bool = true;
//! const LOG_TARGET: &str = "phasemark::sync";
//!
//! use crate::{log_debug, log_info, log_warn, log_error};
//! ```
//! Flipping `ENABLE_LOGS` silences the whole module without touching call
//! sites; `LOG_TARGET` lets `RUST_LOG=phasemark::sync=debug` pick it out.

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!(target: LOG_TARGET, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!(target: LOG_TARGET, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!(target: LOG_TARGET, $($arg)*);
        }
    };
}

/// Errors still go through the gate so a noisy module can be muted while
/// its failures are being investigated elsewhere.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!(target: LOG_TARGET, $($arg)*);
        }
    };
}
