//! Structured logging utilities.
//!
//! Provides operation timing helpers for tracking initialization phases and
//! request handling performance.

use std::time::Instant;

/// Operation timer for measuring and logging execution duration.
///
/// Logs the operation start at debug level and the completion (with duration)
/// when finished.
///
/// # Examples
///
/// ```rust,ignore
/// let timer = OpTimer::new("store", "migrate_schema");
/// // ... perform operation ...
/// timer.finish();
/// ```
#[derive(Debug)]
pub struct OpTimer {
    /// Component being timed (e.g., "engine", "store").
    component: String,
    /// Operation being performed (e.g., "submit", "migration").
    operation: String,
    /// Start time of the operation.
    start: Instant,
}

impl OpTimer {
    /// Creates a new operation timer and logs the start.
    #[must_use]
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        let component = component.into();
        let operation = operation.into();

        tracing::debug!(
            component = %component,
            operation = %operation,
            "Operation started"
        );

        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Logs successful completion with the elapsed duration.
    pub fn finish(self) {
        tracing::debug!(
            component = %self.component,
            operation = %self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }

    /// Logs failed completion with the elapsed duration and error.
    pub fn finish_with_error(self, error: &dyn std::fmt::Display) {
        tracing::warn!(
            component = %self.component,
            operation = %self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            error = %error,
            "Operation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_finish() {
        let timer = OpTimer::new("test", "noop");
        timer.finish();
    }

    #[test]
    fn test_timer_finish_with_error() {
        let timer = OpTimer::new("test", "noop");
        timer.finish_with_error(&"boom");
    }
}
