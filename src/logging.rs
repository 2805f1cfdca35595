//! Configurable log levels mapped onto `tracing`.
//!
//! `tracing` fixes the level of an event at the call site, so policies that let users pick a
//! level at configuration time go through [`log_at!`], which dispatches to the matching macro.

/// Level at which a policy writes a particular log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LoggingLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
    /// Suppress the log line entirely.
    Off,
}

impl LoggingLevel {
    pub fn is_enabled(self) -> bool {
        match self {
            LoggingLevel::Trace => tracing::enabled!(tracing::Level::TRACE),
            LoggingLevel::Debug => tracing::enabled!(tracing::Level::DEBUG),
            LoggingLevel::Info => tracing::enabled!(tracing::Level::INFO),
            LoggingLevel::Warn => tracing::enabled!(tracing::Level::WARN),
            LoggingLevel::Error => tracing::enabled!(tracing::Level::ERROR),
            LoggingLevel::Off => false,
        }
    }
}

/// Emit a `tracing` event at a runtime-selected [`LoggingLevel`].
macro_rules! log_at {
    ($level:expr, target: $target:expr, $($arg:tt)+) => {
        match $level {
            $crate::logging::LoggingLevel::Trace => ::tracing::trace!(target: $target, $($arg)+),
            $crate::logging::LoggingLevel::Debug => ::tracing::debug!(target: $target, $($arg)+),
            $crate::logging::LoggingLevel::Info => ::tracing::info!(target: $target, $($arg)+),
            $crate::logging::LoggingLevel::Warn => ::tracing::warn!(target: $target, $($arg)+),
            $crate::logging::LoggingLevel::Error => ::tracing::error!(target: $target, $($arg)+),
            $crate::logging::LoggingLevel::Off => {}
        }
    };
}

pub(crate) use log_at;
