//! Traits the host's GPU API implements.
//!
//! The pool only needs a narrow slice of a WebGPU-style API: adapter and
//! device requests, error scopes and the device-lost notification.
//! Everything else the caller does with the device goes through the device
//! type directly.

use std::future::Future;

use thiserror::Error;

/// Kind of errors an error scope captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorFilter {
    /// Allocation failures.
    OutOfMemory,
    /// API misuse detected by the implementation.
    Validation,
}

impl std::fmt::Display for ErrorFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out-of-memory"),
            Self::Validation => f.write_str("validation"),
        }
    }
}

/// An error captured by an error scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedError {
    /// Kind of the captured error.
    pub filter: ErrorFilter,
    /// Message reported by the implementation.
    pub message: String,
}

impl CapturedError {
    /// Create a captured error of the given kind.
    pub fn new(filter: ErrorFilter, message: impl Into<String>) -> Self {
        Self {
            filter,
            message: message.into(),
        }
    }
}

/// Errors reported by the backend itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// `pop_error_scope` was called with no scope open.
    #[error("error scope stack is empty")]
    EmptyScopeStack,
    /// The call was rejected because the device is lost.
    #[error("device is lost: {0}")]
    Lost(String),
    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

/// Callback invoked once with the reason when the device is lost.
pub type LostCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Entry point of the GPU API.
pub trait Gpu: Send + Sync + 'static {
    /// Adapter type returned by [`Gpu::request_adapter`].
    type Adapter: Adapter<Device = Self::Device>;
    /// Device type handed out by the pool.
    type Device: Device;

    /// Request an adapter. `Ok(None)` means no adapter is available.
    fn request_adapter(
        &self,
    ) -> impl Future<Output = Result<Option<Self::Adapter>, BackendError>> + Send;
}

/// A physical or virtual adapter that can open devices.
pub trait Adapter: Send + Sync + 'static {
    /// Device type this adapter opens.
    type Device: Device;

    /// Request a device. `Ok(None)` means the adapter refused.
    fn request_device(
        &self,
    ) -> impl Future<Output = Result<Option<Self::Device>, BackendError>> + Send;
}

/// An open device with a WebGPU-style error scope stack.
pub trait Device: Send + Sync + 'static {
    /// Push a scope capturing errors of `filter`.
    fn push_error_scope(&self, filter: ErrorFilter);

    /// Pop the innermost scope, yielding the first error it captured.
    ///
    /// Fails when no scope is open or the device is gone. Implementations
    /// are allowed to never resolve; callers bound the wait themselves.
    fn pop_error_scope(
        &self,
    ) -> impl Future<Output = Result<Option<CapturedError>, BackendError>> + Send;

    /// Register the loss notification. Called once per device, right after
    /// creation. The callback may run on any thread at any later time.
    fn on_lost(&self, callback: LostCallback);
}
