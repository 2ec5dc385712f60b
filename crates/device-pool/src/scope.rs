//! The two error scopes wrapping every lease.
//!
//! `acquire` pushes one scope per [`ErrorFilter`] in [`SCOPE_ORDER`];
//! `release` pops them in reverse, then checks that nothing else was left
//! open. Popping out of order is undefined in the backend, so the order
//! lives in one constant and both directions derive from it.

use thiserror::Error;

use crate::backend::{BackendError, CapturedError, Device, ErrorFilter};

/// Push order of the lease scopes, outermost first.
pub const SCOPE_ORDER: [ErrorFilter; 2] = [ErrorFilter::OutOfMemory, ErrorFilter::Validation];

/// What each lease scope captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeReport {
    /// First error captured by the out-of-memory scope.
    pub out_of_memory: Option<CapturedError>,
    /// First error captured by the validation scope.
    pub validation: Option<CapturedError>,
}

impl ScopeReport {
    /// Whether neither scope captured anything.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.out_of_memory.is_none() && self.validation.is_none()
    }

    /// The capture for `filter`.
    #[must_use]
    pub fn get(&self, filter: ErrorFilter) -> Option<&CapturedError> {
        match filter {
            ErrorFilter::OutOfMemory => self.out_of_memory.as_ref(),
            ErrorFilter::Validation => self.validation.as_ref(),
        }
    }

    fn slot_mut(&mut self, filter: ErrorFilter) -> &mut Option<CapturedError> {
        match filter {
            ErrorFilter::OutOfMemory => &mut self.out_of_memory,
            ErrorFilter::Validation => &mut self.validation,
        }
    }
}

/// Why draining the lease scopes failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    /// The backend rejected a pop.
    #[error("popping the {filter} error scope failed but no device loss was reported")]
    Pop {
        /// The scope being popped.
        filter: ErrorFilter,
        /// The backend error.
        #[source]
        source: BackendError,
    },
    /// A scope yielded an error of a kind it does not capture.
    #[error("{expected} error scope captured a {} error: {}", .captured.filter, .captured.message)]
    MismatchedCapture {
        /// The scope being popped.
        expected: ErrorFilter,
        /// What it yielded.
        captured: CapturedError,
    },
    /// A scope opened by the caller was still on the stack.
    #[error("an extra error scope was left on the stack")]
    StrayScope,
}

/// Open the lease scopes on `device`.
pub fn open<D: Device>(device: &D) {
    for filter in SCOPE_ORDER {
        device.push_error_scope(filter);
    }
}

/// Close the lease scopes on `device` and collect what they captured.
///
/// After both pops a third pop must be rejected; if it succeeds the caller
/// left a scope of its own open.
pub async fn drain<D: Device>(device: &D) -> Result<ScopeReport, DrainError> {
    let mut report = ScopeReport::default();

    for filter in SCOPE_ORDER.into_iter().rev() {
        let captured = device
            .pop_error_scope()
            .await
            .map_err(|source| DrainError::Pop { filter, source })?;
        if let Some(captured) = captured {
            if captured.filter != filter {
                return Err(DrainError::MismatchedCapture {
                    expected: filter,
                    captured,
                });
            }
            *report.slot_mut(filter) = Some(captured);
        }
    }

    match device.pop_error_scope().await {
        Ok(_) => Err(DrainError::StrayScope),
        Err(_) => Ok(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    #[tokio::test]
    async fn open_pushes_out_of_memory_first() {
        let device = FakeDevice::new(1);
        open(&device);
        assert_eq!(device.open_scopes(), SCOPE_ORDER.to_vec());
    }

    #[tokio::test]
    async fn drain_of_clean_scopes_is_clean() {
        let device = FakeDevice::new(1);
        open(&device);

        let report = drain(&device).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(device.scope_depth(), 0);
    }

    #[tokio::test]
    async fn drain_routes_captures_to_their_slots() {
        let device = FakeDevice::new(1);
        open(&device);
        device.raise(ErrorFilter::Validation, "bad pipeline layout");
        device.raise(ErrorFilter::OutOfMemory, "texture allocation failed");

        let report = drain(&device).await.unwrap();
        assert_eq!(
            report.get(ErrorFilter::Validation).map(|e| e.message.as_str()),
            Some("bad pipeline layout")
        );
        assert_eq!(
            report.get(ErrorFilter::OutOfMemory).map(|e| e.message.as_str()),
            Some("texture allocation failed")
        );
    }

    #[tokio::test]
    async fn extra_scope_is_reported_as_stray() {
        let device = FakeDevice::new(1);
        open(&device);
        device.push_error_scope(ErrorFilter::Validation);

        assert_eq!(drain(&device).await, Err(DrainError::StrayScope));
    }

    #[tokio::test]
    async fn rejected_pop_names_the_scope() {
        let device = FakeDevice::new(1);
        open(&device);
        device.fail_pops(BackendError::Other("backend crashed".into()));

        let err = drain(&device).await.unwrap_err();
        assert_eq!(
            err,
            DrainError::Pop {
                filter: ErrorFilter::Validation,
                source: BackendError::Other("backend crashed".into()),
            }
        );
    }

    #[tokio::test]
    async fn mismatched_capture_is_rejected() {
        let device = FakeDevice::new(1);
        open(&device);
        device.corrupt_next_capture(CapturedError::new(ErrorFilter::OutOfMemory, "wrong kind"));

        let err = drain(&device).await.unwrap_err();
        assert!(matches!(
            err,
            DrainError::MismatchedCapture {
                expected: ErrorFilter::Validation,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "validation error scope captured a out-of-memory error: wrong kind"
        );
    }

    #[tokio::test]
    async fn rejected_pop_chains_backend_error() {
        let device = FakeDevice::new(1);
        open(&device);
        device.fail_pops(BackendError::Other("backend crashed".into()));

        let err = drain(&device).await.unwrap_err();
        let source = std::error::Error::source(&err).expect("pop failure has a source");
        assert_eq!(
            source.downcast_ref::<BackendError>(),
            Some(&BackendError::Other("backend crashed".into()))
        );
    }
}
