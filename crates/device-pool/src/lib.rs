//! # Device Pool
//!
//! Exclusive, health-checked access to a single GPU device shared by a
//! sequence of test executions.
//!
//! [`DevicePool::acquire`] leases the device and wraps the lease in an
//! out-of-memory and a validation error scope. [`DevicePool::release`]
//! drains both scopes under a bounded wait and decides whether the device
//! may be leased again:
//!
//! | release finds            | error                      | device   |
//! |--------------------------|----------------------------|----------|
//! | nothing                  | none                       | kept     |
//! | validation error         | [`Error::ValidationFailure`] | kept   |
//! | out-of-memory error      | [`Error::OutOfMemory`]     | retired  |
//! | loss notification        | [`Error::DeviceLost`]      | retired  |
//! | drain did not finish     | [`Error::ScopeDrainTimeout`] | kept   |
//! | broken scope protocol    | [`Error::ProtocolViolation`] | retired |
//! | release dropped early    | none (future never resolves) | retired |
//!
//! A retired device is replaced on the next acquire. If opening a device
//! ever fails, the pool refuses every later acquire.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod lost;
pub mod pool;
pub mod scope;
pub mod timeout;

mod holder;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use backend::{Adapter, BackendError, CapturedError, Device, ErrorFilter, Gpu, LostCallback};
pub use config::{DEFAULT_DRAIN_TIMEOUT, PoolConfig};
pub use error::{CreationStage, Error, Result};
pub use events::{EventBus, PoolEvent};
pub use holder::Lease;
pub use lost::LostSignal;
pub use pool::{DevicePool, PoolState, PoolStats, ReleaseOutcome};
pub use scope::ScopeReport;
