use std::sync::atomic::{AtomicU32, Ordering};

use muxlink_proto::PacketId;

use crate::registry::ServiceRegistry;

/// Shared context for every driver in the process: the packet-id counter
/// and the service registry.
///
/// Passed by `Arc` through driver construction — deliberately not a
/// process global. One runtime per process gives packet ids that never
/// repeat, even across reconnects.
pub struct NetRuntime {
    registry: ServiceRegistry,
    next_packet_id: AtomicU32,
}

impl NetRuntime {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry,
            next_packet_id: AtomicU32::new(1),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Allocate the next packet id. Strictly increasing; the only
    /// lock-free state shared across drivers.
    pub fn next_packet_id(&self) -> PacketId {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed)
    }
}
