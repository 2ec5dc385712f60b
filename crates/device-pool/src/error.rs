//! Error types for device pool operations
use thiserror::Error;

use crate::backend::{BackendError, ErrorFilter};

/// Result type for device pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which step of device creation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStage {
    /// Requesting an adapter from the GPU entry point.
    Adapter,
    /// Requesting a device from the adapter.
    Device,
}

impl std::fmt::Display for CreationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adapter => f.write_str("adapter"),
            Self::Device => f.write_str("device"),
        }
    }
}

/// Every failure `acquire` or `release` can report.
///
/// The variant tells the caller what went wrong; it does not tell them
/// whether the pool kept the device. That decision is made by the pool and
/// is visible through [`ReleaseOutcome`](crate::ReleaseOutcome) on the
/// event bus and in [`PoolStats`](crate::PoolStats).
#[derive(Error, Debug)]
pub enum Error {
    /// Pool configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// Creating the device failed. The pool is permanently failed afterwards.
    #[error("Device initialization failed at {stage} request: {reason}")]
    Initialization {
        /// The creation step that failed
        stage: CreationStage,
        /// The failure reason
        reason: String,
        /// The underlying backend error, absent when the request returned nothing
        #[source]
        source: Option<BackendError>,
    },

    /// A previous device creation failed; the pool will not try again.
    #[error("Device previously failed to initialize; not retrying: {reason}")]
    PermanentFailure {
        /// Reason recorded by the creation failure
        reason: String,
    },

    /// Draining the error scopes did not finish in time.
    #[error("Draining error scopes of device #{generation} timed out after {timeout_ms}ms")]
    ScopeDrainTimeout {
        /// Generation of the device being released
        generation: u64,
        /// The configured drain timeout in milliseconds
        timeout_ms: u64,
    },

    /// The backend reported the device as lost.
    #[error("Device #{generation} was lost: {reason}")]
    DeviceLost {
        /// Generation of the lost device
        generation: u64,
        /// Reason delivered by the loss notification
        reason: String,
    },

    /// The out-of-memory scope captured an error. The device was retired.
    #[error("Unexpected out-of-memory error on device #{generation}: {message}")]
    OutOfMemory {
        /// Generation of the retired device
        generation: u64,
        /// Message of the captured error
        message: String,
    },

    /// The validation scope captured an error. The device stays pooled.
    #[error("Unexpected validation error on device #{generation}: {message}")]
    ValidationFailure {
        /// Generation of the device
        generation: u64,
        /// Message of the captured error
        message: String,
    },

    /// The caller or the backend broke the acquire/release contract.
    #[error("Protocol violation: {message}")]
    ProtocolViolation {
        /// What was violated
        message: String,
        /// The backend error that exposed the violation, if any
        #[source]
        source: Option<BackendError>,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a protocol violation without an underlying backend error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn initialization(stage: CreationStage, source: BackendError) -> Self {
        Self::Initialization {
            stage,
            reason: source.to_string(),
            source: Some(source),
        }
    }

    pub(crate) fn nothing_returned(stage: CreationStage) -> Self {
        Self::Initialization {
            stage,
            reason: format!("{stage} request returned nothing"),
            source: None,
        }
    }

    pub(crate) fn captured(filter: ErrorFilter, generation: u64, message: String) -> Self {
        match filter {
            ErrorFilter::OutOfMemory => Self::OutOfMemory {
                generation,
                message,
            },
            ErrorFilter::Validation => Self::ValidationFailure {
                generation,
                message,
            },
        }
    }

    /// Whether this error means the pool can never hand out a device again.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Initialization { .. } | Self::PermanentFailure { .. }
        )
    }

    /// Whether the caller should reclaim memory before the next acquisition.
    #[must_use]
    pub fn should_attempt_gc(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Get the device generation associated with this error (if any)
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Configuration { .. }
            | Self::Initialization { .. }
            | Self::PermanentFailure { .. }
            | Self::ProtocolViolation { .. } => None,
            Self::ScopeDrainTimeout { generation, .. }
            | Self::DeviceLost { generation, .. }
            | Self::OutOfMemory { generation, .. }
            | Self::ValidationFailure { generation, .. } => Some(*generation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_errors_are_permanent() {
        let err = Error::nothing_returned(CreationStage::Adapter);
        assert!(err.is_permanent());
        assert_eq!(
            err.to_string(),
            "Device initialization failed at adapter request: adapter request returned nothing"
        );

        let err = Error::PermanentFailure {
            reason: "no adapter".into(),
        };
        assert!(err.is_permanent());
        assert!(!Error::protocol("double acquire").is_permanent());
    }

    #[test]
    fn only_out_of_memory_asks_for_gc() {
        let oom = Error::captured(ErrorFilter::OutOfMemory, 3, "heap".into());
        let validation = Error::captured(ErrorFilter::Validation, 3, "bad bind group".into());
        assert!(oom.should_attempt_gc());
        assert!(!validation.should_attempt_gc());
        assert!(matches!(validation, Error::ValidationFailure { .. }));
    }

    #[test]
    fn generation_is_reported_for_device_errors() {
        let err = Error::DeviceLost {
            generation: 7,
            reason: "gpu process crashed".into(),
        };
        assert_eq!(err.generation(), Some(7));
        assert_eq!(Error::configuration("x").generation(), None);
    }

    #[test]
    fn initialization_keeps_backend_source() {
        let err = Error::initialization(
            CreationStage::Device,
            BackendError::Other("driver refused".into()),
        );
        let source = std::error::Error::source(&err).expect("source is kept");
        assert_eq!(source.to_string(), "driver refused");
    }
}
