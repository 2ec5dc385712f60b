//! In-memory GPU backend for exercising the pool without hardware.
//!
//! [`FakeGpu`] hands out [`FakeDevice`]s that keep a real error-scope stack,
//! so tests drive the pool through the same calls a driver would see and
//! inject errors, losses and hangs from the outside.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{
    Adapter, BackendError, CapturedError, Device, ErrorFilter, Gpu, LostCallback,
};

/// Scripted answer to an adapter or device request.
#[derive(Debug, Clone)]
enum Refusal {
    Nothing,
    Fail(BackendError),
}

#[derive(Debug, Default)]
struct GpuState {
    adapter_requests: usize,
    device_requests: usize,
    adapter_refusal: Option<Refusal>,
    device_refusal: Option<Refusal>,
    device_delay: Option<Duration>,
    devices: Vec<FakeDevice>,
}

/// Scriptable GPU entry point.
#[derive(Debug, Clone, Default)]
pub struct FakeGpu {
    state: Arc<Mutex<GpuState>>,
}

impl FakeGpu {
    /// A GPU that opens healthy devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter requests resolve to nothing.
    pub fn no_adapter(&self) {
        self.state.lock().adapter_refusal = Some(Refusal::Nothing);
    }

    /// Adapter requests fail with `error`.
    pub fn fail_adapter(&self, error: BackendError) {
        self.state.lock().adapter_refusal = Some(Refusal::Fail(error));
    }

    /// Device requests resolve to nothing.
    pub fn no_device(&self) {
        self.state.lock().device_refusal = Some(Refusal::Nothing);
    }

    /// Device requests fail with `error`.
    pub fn fail_device(&self, error: BackendError) {
        self.state.lock().device_refusal = Some(Refusal::Fail(error));
    }

    /// Device requests take `delay` before resolving.
    pub fn delay_devices(&self, delay: Duration) {
        self.state.lock().device_delay = Some(delay);
    }

    /// Clear every scripted refusal.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.adapter_refusal = None;
        state.device_refusal = None;
    }

    /// Number of adapter requests made so far.
    #[must_use]
    pub fn adapter_requests(&self) -> usize {
        self.state.lock().adapter_requests
    }

    /// Number of device requests made so far.
    #[must_use]
    pub fn device_requests(&self) -> usize {
        self.state.lock().device_requests
    }

    /// Every device opened so far, oldest first.
    #[must_use]
    pub fn devices(&self) -> Vec<FakeDevice> {
        self.state.lock().devices.clone()
    }
}

impl Gpu for FakeGpu {
    type Adapter = FakeAdapter;
    type Device = FakeDevice;

    fn request_adapter(
        &self,
    ) -> impl Future<Output = Result<Option<FakeAdapter>, BackendError>> + Send {
        let result = {
            let mut state = self.state.lock();
            state.adapter_requests += 1;
            match state.adapter_refusal.clone() {
                Some(Refusal::Nothing) => Ok(None),
                Some(Refusal::Fail(error)) => Err(error),
                None => Ok(Some(FakeAdapter {
                    gpu: Arc::clone(&self.state),
                })),
            }
        };
        async move { result }
    }
}

/// Adapter handed out by [`FakeGpu`].
#[derive(Debug)]
pub struct FakeAdapter {
    gpu: Arc<Mutex<GpuState>>,
}

impl Adapter for FakeAdapter {
    type Device = FakeDevice;

    fn request_device(
        &self,
    ) -> impl Future<Output = Result<Option<FakeDevice>, BackendError>> + Send {
        let (result, delay) = {
            let mut state = self.gpu.lock();
            state.device_requests += 1;
            let result = match state.device_refusal.clone() {
                Some(Refusal::Nothing) => Ok(None),
                Some(Refusal::Fail(error)) => Err(error),
                None => {
                    let device = FakeDevice::new(state.devices.len() as u64 + 1);
                    state.devices.push(device.clone());
                    Ok(Some(device))
                }
            };
            (result, state.device_delay)
        };
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }
}

#[derive(Debug)]
struct OpenScope {
    filter: ErrorFilter,
    captured: Option<CapturedError>,
}

#[derive(Default)]
struct DeviceState {
    scopes: Vec<OpenScope>,
    uncaptured: Vec<CapturedError>,
    lost_callback: Option<LostCallback>,
    lost: Option<String>,
    pop_failure: Option<BackendError>,
    lose_on_pop: Option<String>,
    corrupt_next: Option<CapturedError>,
    hang_pops: bool,
    pops: usize,
}

/// Device with an error-scope stack and injectable faults.
///
/// Clones share state, so a test can keep a handle while the pool owns
/// the device.
#[derive(Clone)]
pub struct FakeDevice {
    id: u64,
    state: Arc<Mutex<DeviceState>>,
}

impl std::fmt::Debug for FakeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeDevice")
            .field("id", &self.id)
            .field("scope_depth", &state.scopes.len())
            .field("lost", &state.lost)
            .finish()
    }
}

impl FakeDevice {
    /// A healthy device with no open scopes.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(DeviceState::default())),
        }
    }

    /// Identity of this device, unique per [`FakeGpu`].
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Raise an error the way the implementation would: the innermost open
    /// scope with a matching filter captures it, unless it already holds
    /// an error. With no such scope the error goes uncaptured.
    pub fn raise(&self, filter: ErrorFilter, message: impl Into<String>) {
        let error = CapturedError::new(filter, message);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.scopes.iter_mut().rev().find(|s| s.filter == filter) {
            Some(scope) => {
                if scope.captured.is_none() {
                    scope.captured = Some(error);
                }
            }
            None => state.uncaptured.push(error),
        }
    }

    /// Report the device as lost. Only the first loss is delivered.
    pub fn lose(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let callback = {
            let mut state = self.state.lock();
            if state.lost.is_some() {
                return;
            }
            state.lost = Some(reason.clone());
            state.lost_callback.take()
        };
        if let Some(callback) = callback {
            callback(reason);
        }
    }

    /// Make every pop fail with `error`.
    pub fn fail_pops(&self, error: BackendError) {
        self.state.lock().pop_failure = Some(error);
    }

    /// Make the next pop lose the device and fail.
    pub fn lose_on_pop(&self, reason: impl Into<String>) {
        self.state.lock().lose_on_pop = Some(reason.into());
    }

    /// Make the next successful pop yield `captured` instead of the real capture.
    pub fn corrupt_next_capture(&self, captured: CapturedError) {
        self.state.lock().corrupt_next = Some(captured);
    }

    /// Make every pop hang forever.
    pub fn hang_pops(&self) {
        self.state.lock().hang_pops = true;
    }

    /// Let pops issued from now on resolve again. Pops already hanging stay
    /// pending.
    pub fn resume_pops(&self) {
        self.state.lock().hang_pops = false;
    }

    /// Filters of the open scopes, outermost first.
    #[must_use]
    pub fn open_scopes(&self) -> Vec<ErrorFilter> {
        self.state.lock().scopes.iter().map(|s| s.filter).collect()
    }

    /// Number of open scopes.
    #[must_use]
    pub fn scope_depth(&self) -> usize {
        self.state.lock().scopes.len()
    }

    /// Number of pops issued so far.
    #[must_use]
    pub fn pops(&self) -> usize {
        self.state.lock().pops
    }

    /// Errors raised outside any matching scope.
    #[must_use]
    pub fn uncaptured(&self) -> Vec<CapturedError> {
        self.state.lock().uncaptured.clone()
    }

    /// Whether the device was lost.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.state.lock().lost.is_some()
    }

    fn pop_now(&self) -> Option<Result<Option<CapturedError>, BackendError>> {
        let mut state = self.state.lock();
        state.pops += 1;
        if state.hang_pops {
            return None;
        }
        if let Some(reason) = state.lose_on_pop.take() {
            drop(state);
            self.lose(reason.clone());
            return Some(Err(BackendError::Lost(reason)));
        }
        if let Some(error) = state.pop_failure.clone() {
            return Some(Err(error));
        }
        let Some(scope) = state.scopes.pop() else {
            return Some(Err(BackendError::EmptyScopeStack));
        };
        if let Some(captured) = state.corrupt_next.take() {
            return Some(Ok(Some(captured)));
        }
        Some(Ok(scope.captured))
    }
}

impl Device for FakeDevice {
    fn push_error_scope(&self, filter: ErrorFilter) {
        self.state.lock().scopes.push(OpenScope {
            filter,
            captured: None,
        });
    }

    fn pop_error_scope(
        &self,
    ) -> impl Future<Output = Result<Option<CapturedError>, BackendError>> + Send {
        let outcome = self.pop_now();
        async move {
            match outcome {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    fn on_lost(&self, callback: LostCallback) {
        let mut state = self.state.lock();
        if let Some(reason) = state.lost.clone() {
            drop(state);
            callback(reason);
        } else {
            state.lost_callback = Some(callback);
        }
    }
}
