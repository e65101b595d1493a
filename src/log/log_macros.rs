//! Simple, leveled logging macros for any `LogSink`.
//!
//! # Feature Flags
//! specific log levels are controlled by cargo features:
//! `log-trace`, `log-debug`, `log-info`, `log-warn`, `log-error`.
//!
//! If a feature is disabled, the corresponding macros expand to `()`, removing
//! all formatting and allocation overhead at compile time.

// ============================================================================
// 1. GENERIC INTERNAL MACRO (the "worker")
// ============================================================================
// Remains available so the enabled macros below can use it.
// We generally don't call this directly if we want feature-gating.

#[macro_export]
/// Logs a message to any type that implements `LogSink`.
///
/// This macro formats the message and calls the `log` method on the provided `LogSink` instance.
///
/// # Arguments
/// * `$sink` - An expression that evaluates to a reference or `Arc` to a `LogSink` trait object.
/// * `$lvl` - The `LogLevel` for the message.
/// * `$($arg:tt)*` - Format string and arguments for the log message.
macro_rules! sink_log {
    ($sink:expr, $lvl:expr, $($arg:tt)*) => {{
        let __msg = format!($($arg)*);
        $sink.log($lvl, &__msg, module_path!());
    }};
}

// ============================================================================
// 2. LEVEL-SPECIFIC MACROS (Feature Gated)
// ============================================================================

// ---------------------- TRACE ----------------------
#[cfg(feature = "log-trace")]
/// Logs a trace message to a `LogSink`.
#[macro_export]
macro_rules! sink_trace { ($sink:expr, $($arg:tt)*) => { $crate::sink_log!($sink, $crate::log::log_level::LogLevel::Trace, $($arg)*) } }

#[cfg(not(feature = "log-trace"))]
#[macro_export]
/// No-op trace macro when `log-trace` feature is not enabled.
macro_rules! sink_trace {
    ($($arg:tt)*) => {
        ()
    };
}

// ---------------------- DEBUG ----------------------
#[cfg(feature = "log-debug")]
#[macro_export]
macro_rules! sink_debug { ($sink:expr, $($arg:tt)*) => { $crate::sink_log!($sink, $crate::log::log_level::LogLevel::Debug, $($arg)*); } }

#[cfg(not(feature = "log-debug"))]
#[macro_export]
macro_rules! sink_debug {
    ($($arg:tt)*) => {
        ()
    };
}

// ---------------------- INFO ----------------------
#[cfg(feature = "log-info")]
#[macro_export]
macro_rules! sink_info { ($sink:expr, $($arg:tt)*) => { $crate::sink_log!($sink, $crate::log::log_level::LogLevel::Info, $($arg)*); } }

#[cfg(not(feature = "log-info"))]
#[macro_export]
macro_rules! sink_info {
    ($($arg:tt)*) => {
        ()
    };
}

// ---------------------- WARN ----------------------
#[cfg(feature = "log-warn")]
#[macro_export]
macro_rules! sink_warn { ($sink:expr, $($arg:tt)*) => { $crate::sink_log!($sink, $crate::log::log_level::LogLevel::Warn, $($arg)*) } }

#[cfg(not(feature = "log-warn"))]
#[macro_export]
macro_rules! sink_warn {
    ($($arg:tt)*) => {
        ()
    };
}

// ---------------------- ERROR ----------------------
// Generally always enabled, but consistent structure allows user to disable if really needed.
#[cfg(feature = "log-error")]
#[macro_export]
macro_rules! sink_error { ($sink:expr, $($arg:tt)*) => { $crate::sink_log!($sink, $crate::log::log_level::LogLevel::Error, $($arg)*); } }

#[cfg(not(feature = "log-error"))]
#[macro_export]
macro_rules! sink_error {
    ($($arg:tt)*) => {
        ()
    };
}

// ---------------------- FMP TRANSFER DEBUG ----------------------
#[cfg(feature = "fmp-transfer-debug")]
#[macro_export]
macro_rules! fmp_log {
    ($sink:expr, $($arg:tt)*) => {
        // Force INFO level logs for transfer debug so they appear even in INFO mode
        $crate::sink_log!($sink, $crate::log::log_level::LogLevel::Info, "[FMP_DEBUG] {}", format!($($arg)*));
    }
}

#[cfg(not(feature = "fmp-transfer-debug"))]
#[macro_export]
macro_rules! fmp_log {
    ($($arg:tt)*) => {
        ()
    };
}
