//! The pooled device and the lease handed to callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::backend::Device;
use crate::lost::LostSignal;

/// A device owned by the pool, plus its bookkeeping.
pub(crate) struct Holder<D> {
    device: D,
    generation: u64,
    acquired: AtomicBool,
    lost: LostSignal,
    created_at: Instant,
    leases: AtomicU64,
}

impl<D: Device> Holder<D> {
    /// Wrap a freshly opened device and hook its loss notification to this
    /// holder's own signal.
    pub(crate) fn new(device: D, generation: u64) -> Arc<Self> {
        let lost = LostSignal::new();
        let signal = lost.clone();
        device.on_lost(Box::new(move |reason| {
            tracing::warn!(generation, %reason, "Device lost");
            signal.report(reason);
        }));

        Arc::new(Self {
            device,
            generation,
            acquired: AtomicBool::new(false),
            lost,
            created_at: Instant::now(),
            leases: AtomicU64::new(0),
        })
    }
}

impl<D> Holder<D> {
    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }

    /// Mark the holder acquired. Returns `false` if it already was.
    pub(crate) fn try_acquire(&self) -> bool {
        let won = self
            .acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.leases.fetch_add(1, Ordering::Relaxed);
        }
        won
    }

    pub(crate) fn clear_acquired(&self) {
        self.acquired.store(false, Ordering::Release);
    }

    pub(crate) fn lost_reason(&self) -> Option<&str> {
        self.lost.reason()
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn leases(&self) -> u64 {
        self.leases.load(Ordering::Relaxed)
    }
}

/// Exclusive use of the pooled device between `acquire` and `release`.
///
/// Derefs to the device. The lease must be handed back to
/// [`DevicePool::release`](crate::DevicePool::release); clones exist only
/// so the handle can be shared inside a single test and must not outlive
/// the release.
pub struct Lease<D> {
    holder: Arc<Holder<D>>,
    acquired_at: Instant,
}

impl<D> Lease<D> {
    pub(crate) fn new(holder: Arc<Holder<D>>) -> Self {
        Self {
            holder,
            acquired_at: Instant::now(),
        }
    }

    /// The leased device.
    #[must_use]
    pub fn device(&self) -> &D {
        self.holder.device()
    }

    /// Generation of the leased device within its pool.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.holder.generation()
    }

    /// How long this lease has been held.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub(crate) fn holder(&self) -> &Arc<Holder<D>> {
        &self.holder
    }
}

impl<D> Clone for Lease<D> {
    fn clone(&self) -> Self {
        Self {
            holder: Arc::clone(&self.holder),
            acquired_at: self.acquired_at,
        }
    }
}

impl<D> std::ops::Deref for Lease<D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.holder.device()
    }
}

impl<D> std::fmt::Debug for Lease<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("generation", &self.holder.generation)
            .field("held_for", &self.held_for())
            .finish()
    }
}
