//! Logging for results whose error is handled by carrying on.
//!
//! Background loops (tick, bus ingestion, workers) must not stop on a single
//! failed operation. `log` reports at error level, `warn_on_err` at warn level
//! for best-effort work such as settling bus messages.

use std::fmt::Display;
use std::panic::Location;

pub trait ResultExt<T, E> {
    /// Log an `Err` at error level with context and caller location.
    ///
    /// ```ignore
    /// use noetl_engine::ResultExt;
    ///
    /// coordinator.recover(Utc::now()).await.log("initial recovery");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;

    /// Log an `Err` at warn level and discard the error.
    fn warn_on_err<S: ToString>(self, context: S) -> Option<T>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let at = Location::caller();
            tracing::error!(
                target: "noetl_engine",
                error = %e,
                file = %format!("{}:{}", at.file(), at.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }

    #[track_caller]
    fn warn_on_err<S: ToString>(self, context: S) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                let at = Location::caller();
                tracing::warn!(
                    target: "noetl_engine",
                    error = %e,
                    file = %format!("{}:{}", at.file(), at.line()),
                    context = %context.to_string(),
                    "Best-effort operation failed"
                );
                None
            }
        }
    }
}
