//! Single-device pool with error-scope health checks.
//!
//! `DevicePool<G>` opens at most one device through `G`, leases it to one
//! caller at a time, and on every release drains the error scopes opened
//! at acquire to decide whether the device may be leased again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::backend::{Adapter, ErrorFilter, Gpu};
use crate::config::PoolConfig;
use crate::error::{CreationStage, Error, Result};
use crate::events::{EventBus, PoolEvent};
use crate::holder::{Holder, Lease};
use crate::scope::{self, DrainError, ScopeReport};
use crate::timeout::{Elapsed, timeout};

// ---------------------------------------------------------------------------
// Public state
// ---------------------------------------------------------------------------

/// Externally visible pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// No device; the next acquire opens one.
    Uninitialized,
    /// A device is pooled and free.
    Ready,
    /// A device is pooled and leased.
    InUse,
    /// Device creation failed once; every acquire fails.
    PermanentlyFailed,
}

/// How a release was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Both scopes were empty.
    Clean,
    /// The validation scope captured an error. The device is kept.
    ValidationFailure,
    /// The out-of-memory scope captured an error. The device is retired.
    OutOfMemory,
    /// The backend reported the device lost. The device is retired.
    DeviceLost,
    /// Draining did not finish in time and no loss was reported. The
    /// device is kept.
    DrainTimeout,
    /// Draining exposed a broken scope protocol. The device is retired.
    ProtocolViolation,
    /// The release was dropped before it finished. The lease scopes may
    /// still be open, so the device is retired.
    Cancelled,
}

impl ReleaseOutcome {
    /// Whether the pool drops the device after this outcome.
    #[must_use]
    pub fn retires_device(self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::DeviceLost | Self::ProtocolViolation | Self::Cancelled
        )
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Releases that passed the contract checks.
    pub releases: u64,
    /// Devices opened.
    pub devices_created: u64,
    /// Devices dropped after an unhealthy release.
    pub devices_retired: u64,
    /// Releases with clean scopes.
    pub clean_releases: u64,
    /// Releases that captured a validation error.
    pub validation_failures: u64,
    /// Releases that captured an out-of-memory error.
    pub out_of_memory: u64,
    /// Releases that found the device lost.
    pub devices_lost: u64,
    /// Releases whose drain timed out.
    pub drain_timeouts: u64,
    /// Contract violations, at the call boundary or while draining.
    pub protocol_violations: u64,
    /// Releases dropped before they finished.
    pub cancelled_releases: u64,
}

impl PoolStats {
    fn record(&mut self, outcome: ReleaseOutcome) {
        self.releases += 1;
        let counter = match outcome {
            ReleaseOutcome::Clean => &mut self.clean_releases,
            ReleaseOutcome::ValidationFailure => &mut self.validation_failures,
            ReleaseOutcome::OutOfMemory => &mut self.out_of_memory,
            ReleaseOutcome::DeviceLost => &mut self.devices_lost,
            ReleaseOutcome::DrainTimeout => &mut self.drain_timeouts,
            ReleaseOutcome::ProtocolViolation => &mut self.protocol_violations,
            ReleaseOutcome::Cancelled => &mut self.cancelled_releases,
        };
        *counter += 1;
    }
}

// ---------------------------------------------------------------------------
// Pool internals
// ---------------------------------------------------------------------------

/// What the pool currently holds.
enum Slot<D> {
    Empty,
    /// An acquire is opening a device.
    Creating,
    Ready(Arc<Holder<D>>),
    /// Creation failed; never leaves this state.
    Failed(String),
}

/// Inner shared state for the pool.
struct PoolInner<G: Gpu> {
    gpu: G,
    config: PoolConfig,
    slot: Mutex<Slot<G::Device>>,
    generations: AtomicU64,
    stats: Mutex<PoolStats>,
    events: EventBus,
}

/// Result of inspecting the slot at the start of `acquire`.
enum Reservation<'a, G: Gpu> {
    Existing(Arc<Holder<G::Device>>),
    Create(CreationGuard<'a, G>),
}

/// Puts the slot back to `Empty` if an in-flight creation is abandoned.
struct CreationGuard<'a, G: Gpu> {
    inner: &'a PoolInner<G>,
    armed: bool,
}

impl<G: Gpu> CreationGuard<'_, G> {
    fn fill(mut self, slot: Slot<G::Device>) {
        *self.inner.slot.lock() = slot;
        self.armed = false;
    }
}

impl<G: Gpu> Drop for CreationGuard<'_, G> {
    fn drop(&mut self) {
        if self.armed {
            let mut slot = self.inner.slot.lock();
            if matches!(*slot, Slot::Creating) {
                *slot = Slot::Empty;
            }
        }
    }
}

/// Frees the holder on every exit from `release`.
///
/// A release dropped before [`complete`](Self::complete) retires the holder:
/// its lease scopes may still be on the stack and would corrupt the next
/// lease's drain.
struct ReleaseGuard<'a, G: Gpu> {
    pool: &'a DevicePool<G>,
    holder: &'a Arc<Holder<G::Device>>,
    completed: bool,
}

impl<G: Gpu> ReleaseGuard<'_, G> {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl<G: Gpu> Drop for ReleaseGuard<'_, G> {
    fn drop(&mut self) {
        self.holder.clear_acquired();
        if self.completed {
            return;
        }

        self.pool.inner.stats.lock().record(ReleaseOutcome::Cancelled);
        tracing::warn!(
            pool = %self.pool.inner.config.label,
            generation = self.holder.generation(),
            "Release abandoned before the scopes were drained"
        );
        self.pool.retire(self.holder, ReleaseOutcome::Cancelled);
    }
}

// ---------------------------------------------------------------------------
// DevicePool<G>
// ---------------------------------------------------------------------------

/// Exclusive, health-checked access to one device.
///
/// Construct one per test run and pass it to whatever drives the tests.
/// Clones share the same device.
pub struct DevicePool<G: Gpu> {
    inner: Arc<PoolInner<G>>,
}

impl<G: Gpu> Clone for DevicePool<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: Gpu> std::fmt::Debug for DevicePool<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePool")
            .field("label", &self.inner.config.label)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<G: Gpu> DevicePool<G> {
    /// Create an empty pool. No device is opened until the first acquire.
    ///
    /// # Errors
    /// Returns error if `config` is invalid.
    pub fn new(gpu: G, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_buffer);
        Ok(Self {
            inner: Arc::new(PoolInner {
                gpu,
                config,
                slot: Mutex::new(Slot::Empty),
                generations: AtomicU64::new(0),
                stats: Mutex::new(PoolStats::default()),
                events,
            }),
        })
    }

    /// Lease the device, opening it first if the pool is empty.
    ///
    /// Fails with [`Error::PermanentFailure`] once any creation has failed,
    /// with [`Error::Initialization`] when this call's creation fails, and
    /// with [`Error::ProtocolViolation`] when the device is already leased.
    /// Both creation errors report [`Error::is_permanent`]; check that rather
    /// than matching `PermanentFailure` alone.
    pub async fn acquire(&self) -> Result<Lease<G::Device>> {
        let holder = match self.reserve()? {
            Reservation::Existing(holder) => holder,
            Reservation::Create(guard) => self.create(guard).await?,
        };

        scope::open(holder.device());
        self.inner.stats.lock().acquisitions += 1;
        self.inner.events.emit(PoolEvent::Acquired {
            generation: holder.generation(),
        });
        tracing::debug!(
            pool = %self.inner.config.label,
            generation = holder.generation(),
            lease = holder.leases(),
            "Acquired device"
        );

        Ok(Lease::new(holder))
    }

    /// Return a lease and classify the device's health.
    ///
    /// `Ok(())` means both error scopes were clean and the device stays
    /// pooled. Every error is reported as-is; whether the device was kept
    /// depends on the [`ReleaseOutcome`], not on the error alone.
    ///
    /// Dropping the returned future before it resolves retires the device
    /// with [`ReleaseOutcome::Cancelled`].
    pub async fn release(&self, lease: Lease<G::Device>) -> Result<()> {
        let holder = self.check_release(&lease)?;
        let mut guard = ReleaseGuard {
            pool: self,
            holder: &holder,
            completed: false,
        };
        let usage_duration = lease.held_for();
        drop(lease);

        let drained = timeout(
            self.inner.config.drain_timeout,
            scope::drain(holder.device()),
        )
        .await;

        let (outcome, result) = classify(&holder, drained);
        let generation = holder.generation();
        guard.complete();

        self.inner.stats.lock().record(outcome);
        if let Err(err) = &result {
            tracing::warn!(
                pool = %self.inner.config.label,
                generation,
                ?outcome,
                error = %err,
                "Device release failed"
            );
        } else {
            tracing::debug!(pool = %self.inner.config.label, generation, "Released device");
        }
        if let Err(Error::DeviceLost { reason, .. }) = &result {
            self.inner.events.emit(PoolEvent::DeviceLost {
                generation,
                reason: reason.clone(),
            });
        }
        if outcome.retires_device() {
            self.retire(&holder, outcome);
        }
        self.inner.events.emit(PoolEvent::Released {
            generation,
            usage_duration,
            outcome,
        });

        result
    }

    /// Current state of the pool.
    #[must_use]
    pub fn state(&self) -> PoolState {
        match &*self.inner.slot.lock() {
            Slot::Empty | Slot::Creating => PoolState::Uninitialized,
            Slot::Ready(holder) if holder.is_acquired() => PoolState::InUse,
            Slot::Ready(_) => PoolState::Ready,
            Slot::Failed(_) => PoolState::PermanentlyFailed,
        }
    }

    /// Whether device creation has failed for this pool.
    #[must_use]
    pub fn is_permanently_failed(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Failed(_))
    }

    /// Generation of the pooled device, if any.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        match &*self.inner.slot.lock() {
            Slot::Ready(holder) => Some(holder.generation()),
            _ => None,
        }
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.lock().clone()
    }

    /// Subscribe to pool events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// The configuration this pool was built with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn reserve(&self) -> Result<Reservation<'_, G>> {
        let mut slot = self.inner.slot.lock();
        match &*slot {
            Slot::Failed(reason) => Err(Error::PermanentFailure {
                reason: reason.clone(),
            }),
            Slot::Creating => {
                Err(self.violation("acquire called while another acquire is opening the device"))
            }
            Slot::Ready(holder) if holder.try_acquire() => {
                Ok(Reservation::Existing(Arc::clone(holder)))
            }
            Slot::Ready(_) => Err(self.violation("device is already acquired")),
            Slot::Empty => {
                *slot = Slot::Creating;
                Ok(Reservation::Create(CreationGuard {
                    inner: &self.inner,
                    armed: true,
                }))
            }
        }
    }

    async fn create(&self, guard: CreationGuard<'_, G>) -> Result<Arc<Holder<G::Device>>> {
        match self.open_device().await {
            Ok(device) => {
                let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
                let holder = Holder::new(device, generation);
                let acquired = holder.try_acquire();
                debug_assert!(acquired, "fresh holder is free");
                guard.fill(Slot::Ready(Arc::clone(&holder)));

                self.inner.stats.lock().devices_created += 1;
                self.inner.events.emit(PoolEvent::DeviceCreated { generation });
                tracing::info!(pool = %self.inner.config.label, generation, "Created device");
                Ok(holder)
            }
            Err(err) => {
                let reason = err.to_string();
                guard.fill(Slot::Failed(reason.clone()));

                self.inner.events.emit(PoolEvent::CreationFailed {
                    reason: reason.clone(),
                });
                tracing::error!(
                    pool = %self.inner.config.label,
                    %reason,
                    "Device creation failed; pool will not retry"
                );
                Err(err)
            }
        }
    }

    async fn open_device(&self) -> Result<G::Device> {
        let adapter = self
            .inner
            .gpu
            .request_adapter()
            .await
            .map_err(|e| Error::initialization(CreationStage::Adapter, e))?
            .ok_or_else(|| Error::nothing_returned(CreationStage::Adapter))?;

        adapter
            .request_device()
            .await
            .map_err(|e| Error::initialization(CreationStage::Device, e))?
            .ok_or_else(|| Error::nothing_returned(CreationStage::Device))
    }

    /// Contract checks for `release`. Leaves the pool untouched on failure.
    fn check_release(&self, lease: &Lease<G::Device>) -> Result<Arc<Holder<G::Device>>> {
        let current = match &*self.inner.slot.lock() {
            Slot::Ready(holder) => Some(Arc::clone(holder)),
            _ => None,
        };
        let Some(current) = current else {
            return Err(self.violation("release called while the pool holds no device"));
        };

        if !current.is_acquired() {
            return Err(self.violation(format!(
                "release called for device #{} which is not acquired",
                current.generation()
            )));
        }
        if !Arc::ptr_eq(&current, lease.holder()) {
            return Err(self.violation(format!(
                "released device #{} is not the pooled device #{}",
                lease.generation(),
                current.generation()
            )));
        }
        Ok(current)
    }

    fn retire(&self, holder: &Arc<Holder<G::Device>>, outcome: ReleaseOutcome) {
        {
            let mut slot = self.inner.slot.lock();
            match &*slot {
                Slot::Ready(current) if Arc::ptr_eq(current, holder) => *slot = Slot::Empty,
                _ => return,
            }
        }

        self.inner.stats.lock().devices_retired += 1;
        self.inner.events.emit(PoolEvent::DeviceRetired {
            generation: holder.generation(),
            outcome,
        });
        tracing::info!(
            pool = %self.inner.config.label,
            generation = holder.generation(),
            ?outcome,
            age_ms = u64::try_from(holder.age().as_millis()).unwrap_or(u64::MAX),
            leases = holder.leases(),
            "Retired device"
        );
    }

    fn violation(&self, message: impl Into<String>) -> Error {
        let err = Error::protocol(message);
        self.inner.stats.lock().protocol_violations += 1;
        tracing::error!(pool = %self.inner.config.label, error = %err, "Pool contract violated");
        err
    }
}

/// Decide the outcome of a release from the loss flag and the drain result.
///
/// A recorded loss wins over everything else. Otherwise a timeout keeps the
/// device, a failed drain retires it, and captured errors are checked
/// out-of-memory first.
fn classify<D>(
    holder: &Holder<D>,
    drained: std::result::Result<std::result::Result<ScopeReport, DrainError>, Elapsed>,
) -> (ReleaseOutcome, Result<()>) {
    let generation = holder.generation();

    if let Some(reason) = holder.lost_reason() {
        return (
            ReleaseOutcome::DeviceLost,
            Err(Error::DeviceLost {
                generation,
                reason: reason.to_owned(),
            }),
        );
    }

    let report = match drained {
        Err(elapsed) => {
            return (
                ReleaseOutcome::DrainTimeout,
                Err(Error::ScopeDrainTimeout {
                    generation,
                    timeout_ms: elapsed.millis(),
                }),
            );
        }
        Ok(Err(drain_err)) => {
            let message = drain_err.to_string();
            let source = match drain_err {
                DrainError::Pop { source, .. } => Some(source),
                DrainError::MismatchedCapture { .. } | DrainError::StrayScope => None,
            };
            return (
                ReleaseOutcome::ProtocolViolation,
                Err(Error::ProtocolViolation { message, source }),
            );
        }
        Ok(Ok(report)) => report,
    };

    if let Some(oom) = report.out_of_memory {
        return (
            ReleaseOutcome::OutOfMemory,
            Err(Error::captured(ErrorFilter::OutOfMemory, generation, oom.message)),
        );
    }
    if let Some(validation) = report.validation {
        return (
            ReleaseOutcome::ValidationFailure,
            Err(Error::captured(
                ErrorFilter::Validation,
                generation,
                validation.message,
            )),
        );
    }
    (ReleaseOutcome::Clean, Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, CapturedError};
    use crate::testing::FakeDevice;
    use std::time::Duration;

    fn holder() -> Arc<Holder<FakeDevice>> {
        Holder::new(FakeDevice::new(1), 1)
    }

    fn report(oom: Option<&str>, validation: Option<&str>) -> ScopeReport {
        ScopeReport {
            out_of_memory: oom.map(|m| CapturedError::new(ErrorFilter::OutOfMemory, m)),
            validation: validation.map(|m| CapturedError::new(ErrorFilter::Validation, m)),
        }
    }

    #[test]
    fn clean_report_is_clean() {
        let (outcome, result) = classify(&holder(), Ok(Ok(report(None, None))));
        assert_eq!(outcome, ReleaseOutcome::Clean);
        assert!(result.is_ok());
    }

    #[test]
    fn out_of_memory_outranks_validation() {
        let (outcome, result) = classify(&holder(), Ok(Ok(report(Some("oom"), Some("bad")))));
        assert_eq!(outcome, ReleaseOutcome::OutOfMemory);
        assert!(result.unwrap_err().should_attempt_gc());
    }

    #[test]
    fn loss_outranks_everything() {
        let device = FakeDevice::new(1);
        let holder = Holder::new(device.clone(), 1);
        device.lose("gpu process crashed");

        let (outcome, result) = classify(&holder, Ok(Ok(report(Some("oom"), None))));
        assert_eq!(outcome, ReleaseOutcome::DeviceLost);
        assert!(matches!(result, Err(Error::DeviceLost { ref reason, .. }) if reason == "gpu process crashed"));

        let (outcome, _) = classify(
            &holder,
            Err(Elapsed {
                after: Duration::from_secs(5),
            }),
        );
        assert_eq!(outcome, ReleaseOutcome::DeviceLost);
    }

    #[test]
    fn timeout_without_loss_keeps_device() {
        let (outcome, result) = classify(
            &holder(),
            Err(Elapsed {
                after: Duration::from_millis(5000),
            }),
        );
        assert_eq!(outcome, ReleaseOutcome::DrainTimeout);
        assert!(!outcome.retires_device());
        assert!(matches!(
            result,
            Err(Error::ScopeDrainTimeout {
                timeout_ms: 5000,
                ..
            })
        ));
    }

    #[test]
    fn stray_scope_retires_device() {
        let (outcome, result) = classify(&holder(), Ok(Err(DrainError::StrayScope)));
        assert_eq!(outcome, ReleaseOutcome::ProtocolViolation);
        assert!(outcome.retires_device());
        assert!(matches!(result, Err(Error::ProtocolViolation { .. })));
    }

    #[test]
    fn stats_record_each_outcome() {
        let mut stats = PoolStats::default();
        stats.record(ReleaseOutcome::Clean);
        stats.record(ReleaseOutcome::ValidationFailure);
        stats.record(ReleaseOutcome::DrainTimeout);
        assert_eq!(stats.releases, 3);
        assert_eq!(stats.clean_releases, 1);
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(stats.drain_timeouts, 1);
    }

    #[test]
    fn cancelled_release_is_counted_and_retires() {
        let mut stats = PoolStats::default();
        stats.record(ReleaseOutcome::Cancelled);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.cancelled_releases, 1);
        assert!(ReleaseOutcome::Cancelled.retires_device());
    }

    #[test]
    fn rejected_pop_keeps_backend_error_as_source() {
        let drained = Ok(Err(DrainError::Pop {
            filter: ErrorFilter::Validation,
            source: BackendError::Other("backend crashed".into()),
        }));

        let (outcome, result) = classify(&holder(), drained);
        assert_eq!(outcome, ReleaseOutcome::ProtocolViolation);
        match result {
            Err(Error::ProtocolViolation { message, source }) => {
                assert_eq!(
                    message,
                    "popping the validation error scope failed but no device loss was reported"
                );
                assert_eq!(source, Some(BackendError::Other("backend crashed".into())));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
