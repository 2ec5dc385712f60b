//! Event broadcasting for pool observability.
//!
//! Provides [`PoolEvent`] variants emitted as devices are created, leased,
//! released and retired, and an [`EventBus`] backed by
//! `tokio::sync::broadcast`.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::pool::ReleaseOutcome;

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Events emitted by a [`DevicePool`](crate::DevicePool).
///
/// Devices are identified by their generation: `1` for the first device a
/// pool opens, incremented for every replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new device was opened.
    DeviceCreated {
        /// Generation of the new device.
        generation: u64,
    },
    /// Opening a device failed; the pool is permanently failed.
    CreationFailed {
        /// Human-readable failure.
        reason: String,
    },
    /// A device was leased to the caller.
    Acquired {
        /// Generation of the leased device.
        generation: u64,
    },
    /// A lease was returned and classified.
    Released {
        /// Generation of the released device.
        generation: u64,
        /// How long the caller held the device.
        usage_duration: Duration,
        /// How the release was classified.
        outcome: ReleaseOutcome,
    },
    /// The pool observed a loss notification while releasing.
    DeviceLost {
        /// Generation of the lost device.
        generation: u64,
        /// Reason delivered by the backend.
        reason: String,
    },
    /// A device was dropped from the pool; the next acquire opens a new one.
    DeviceRetired {
        /// Generation of the retired device.
        generation: u64,
        /// The release outcome that caused retirement.
        outcome: ReleaseOutcome,
    },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus for pool events.
///
/// Emission is fire-and-forget: if no subscribers are listening or the
/// channel is full, events are silently dropped.
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: PoolEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.emit(PoolEvent::DeviceCreated { generation: 1 });
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        bus.emit(PoolEvent::DeviceRetired {
            generation: 2,
            outcome: ReleaseOutcome::OutOfMemory,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            PoolEvent::DeviceRetired {
                generation: 2,
                outcome: ReleaseOutcome::OutOfMemory,
            }
        );
    }
}
