//! Per-tick event source
//!
//! The host announces two kinds of ticks: one per entity after that entity
//! has updated, and one per world frame. Entity ticks drive the override
//! loop; world ticks drive sweeps.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::error::catch_boundary;
use super::value::HostValue;

/// "Entity `entity` finished its update"
#[derive(Debug, Clone)]
pub struct FrameEvent {
    pub entity: usize,
    /// Index of the locally controlled entity this frame
    pub local_entity: usize,
    /// The entity object, as a receiver for field writes
    pub target: HostValue,
}

impl FrameEvent {
    pub fn is_local(&self) -> bool {
        self.entity == self.local_entity
    }
}

#[derive(Debug, Clone)]
pub enum TickEvent {
    Entity(FrameEvent),
    World { frame: u64 },
}

pub type TickListener = Arc<dyn Fn(&TickEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Something that delivers tick events
pub trait TickSource: Send + Sync {
    fn subscribe(&self, listener: TickListener) -> SubscriptionId;
    /// Returns `true` if the subscription existed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// In-process tick source the host adapter publishes into
#[derive(Default)]
pub struct TickBus {
    listeners: RwLock<Vec<(SubscriptionId, TickListener)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for TickBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl TickBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every listener. A listener that panics is skipped;
    /// the host's loop keeps running.
    pub fn publish(&self, event: &TickEvent) {
        let listeners: Vec<TickListener> = self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            if let Err(fault) = catch_boundary(|| {
                listener(event);
                Ok(())
            }) {
                trace!(target: "hostpatch::tick", error = %fault, "Tick listener faulted");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl TickSource for TickBus {
    fn subscribe(&self, listener: TickListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}
