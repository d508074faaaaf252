use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use muxlink_proto::{ChannelId, PacketId, ServiceId};
use tracing::warn;

use crate::driver::ChannelRef;

/// Which end of a connection this driver plays. Services are registered
/// for one role; a process acting as both registers twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

/// A consumer of one or more channels.
///
/// Implementations receive a short-lived [`ChannelRef`] for callbacks that
/// may want to reply; holding it beyond the call is impossible by
/// construction. All callbacks run on the connection's event thread.
pub trait ServiceListener: Send + Sync {
    /// The handshake confirmed this channel; sending is now allowed.
    fn channel_active(&self, channel: ChannelRef<'_>);

    /// A data payload arrived on a confirmed channel.
    fn data_received(&self, channel: ChannelRef<'_>, payload: Bytes);

    /// Advisory: the remote end acknowledged this packet. Absence of this
    /// call never means the packet was lost — only a disconnect is a
    /// definitive failure signal.
    fn delivered(&self, channel: ChannelId, packet: PacketId) {
        let _ = (channel, packet);
    }

    /// The handshake for this channel was refused or timed out. The
    /// channel is permanently unusable.
    fn channel_denied(&self, channel: ChannelId) {
        let _ = channel;
    }

    /// The connection carrying this channel is gone. All in-flight packet
    /// ids on it are unresolved: neither delivered nor lost.
    fn disconnected(&self, channel: ChannelId) {
        let _ = channel;
    }
}

/// Registry entry for one service: the listener plus a count of channels
/// currently bound to it. Entries live for the whole process.
pub struct ServiceEntry {
    service: ServiceId,
    listener: Arc<dyn ServiceListener>,
    bound: AtomicU32,
}

impl ServiceEntry {
    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn listener(&self) -> &Arc<dyn ServiceListener> {
        &self.listener
    }

    /// Channels currently bound to this service, across all connections.
    pub fn bound_channels(&self) -> u32 {
        self.bound.load(Ordering::Acquire)
    }

    pub(crate) fn bind(&self) {
        self.bound.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let prev = self.bound.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            warn!(service = self.service, "service bind count underflow");
            self.bound.store(0, Ordering::Release);
        }
    }
}

/// Process-wide map from service id to the listener implementing it for a
/// given role. Built once at startup, immutable afterwards.
pub struct ServiceRegistry {
    entries: HashMap<(ServiceId, Role), Arc<ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder {
            entries: HashMap::new(),
        }
    }

    /// Look up the service implementation for this driver's role.
    pub fn find(&self, service: ServiceId, role: Role) -> Option<&Arc<ServiceEntry>> {
        self.entries.get(&(service, role))
    }
}

pub struct ServiceRegistryBuilder {
    entries: HashMap<(ServiceId, Role), Arc<ServiceEntry>>,
}

impl ServiceRegistryBuilder {
    /// Register a listener for a service id and role. Registering the same
    /// pair twice replaces the earlier listener (and logs, since that is
    /// almost always a configuration mistake).
    pub fn register(
        mut self,
        service: ServiceId,
        role: Role,
        listener: Arc<dyn ServiceListener>,
    ) -> Self {
        let replaced = self
            .entries
            .insert(
                (service, role),
                Arc::new(ServiceEntry {
                    service,
                    listener,
                    bound: AtomicU32::new(0),
                }),
            )
            .is_some();
        if replaced {
            warn!(service, ?role, "service registered twice, replacing");
        }
        self
    }

    pub fn build(self) -> ServiceRegistry {
        ServiceRegistry {
            entries: self.entries,
        }
    }
}
