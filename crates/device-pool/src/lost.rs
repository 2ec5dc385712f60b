//! Write-once loss flag shared between a device's loss callback and the pool.

use std::sync::{Arc, OnceLock};

/// Records why a device was lost.
///
/// The first [`report`](Self::report) wins; later reports are ignored and the
/// reason is never cleared. Each holder owns its own signal, so a late
/// notification from a replaced device cannot mark its successor.
#[derive(Debug, Clone, Default)]
pub struct LostSignal {
    reason: Arc<OnceLock<String>>,
}

impl LostSignal {
    /// Create an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the loss reason. Returns `true` if this call set it.
    pub fn report(&self, reason: impl Into<String>) -> bool {
        self.reason.set(reason.into()).is_ok()
    }

    /// The recorded reason, if the device was lost.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Whether a loss has been recorded.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.reason.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        let signal = LostSignal::new();
        assert!(!signal.is_lost());
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn first_report_wins() {
        let signal = LostSignal::new();
        assert!(signal.report("gpu process crashed"));
        assert!(!signal.report("destroyed"));
        assert_eq!(signal.reason(), Some("gpu process crashed"));
    }

    #[test]
    fn clones_observe_the_same_flag() {
        let signal = LostSignal::new();
        let from_callback = signal.clone();

        std::thread::spawn(move || {
            from_callback.report("driver reset");
        })
        .join()
        .unwrap();

        assert!(signal.is_lost());
        assert_eq!(signal.reason(), Some("driver reset"));
    }

    #[test]
    fn separate_signals_are_independent() {
        let old = LostSignal::new();
        let new = LostSignal::new();
        old.report("late notification");
        assert!(!new.is_lost());
    }
}
