use std::time::{Duration, Instant};

use muxlink_proto::{ChannelId, ServiceId};

/// Handshake lifecycle of one logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Known locally, not yet negotiated.
    Unqueried,
    /// A `Query` is outstanding; awaiting `Allow` or `Deny`.
    Queried,
    /// Confirmed by the handshake; data may flow.
    Active,
    /// Refused, permanently. No retry.
    Denied,
    /// Torn down with the connection.
    Closed,
}

/// One numbered logical stream bound to a service on one connection.
///
/// Exclusively owned by the driver that created it; services are handed a
/// short-lived borrow at dispatch time and never retain one.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    service: ServiceId,
    /// Whether this side opens the handshake when the transport activates.
    initiate: bool,
    state: ChannelState,
    confirmed: bool,
    queried_at: Option<Instant>,
}

impl Channel {
    pub fn new(id: ChannelId, service: ServiceId, initiate: bool) -> Self {
        Self {
            id,
            service,
            initiate,
            state: ChannelState::Unqueried,
            confirmed: false,
            queried_at: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn initiates(&self) -> bool {
        self.initiate
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Only confirmed channels may dispatch inbound data to their service.
    pub fn is_active(&self) -> bool {
        self.confirmed && self.state == ChannelState::Active
    }

    /// Record that a `Query` went out for this channel.
    pub fn mark_queried(&mut self, now: Instant) {
        debug_assert_eq!(self.state, ChannelState::Unqueried);
        self.state = ChannelState::Queried;
        self.queried_at = Some(now);
    }

    /// Process a received `Allow`. Returns true on the Queried → Active
    /// transition; a duplicate (or misdirected) Allow is a no-op.
    pub fn on_allow(&mut self) -> bool {
        if self.state == ChannelState::Queried {
            self.state = ChannelState::Active;
            self.confirmed = true;
            self.queried_at = None;
            true
        } else {
            false
        }
    }

    /// Process a received `Deny`. Returns true on the transition into
    /// Denied; duplicates are no-ops. Denied is terminal.
    pub fn on_deny(&mut self) -> bool {
        match self.state {
            ChannelState::Unqueried | ChannelState::Queried => {
                self.state = ChannelState::Denied;
                self.confirmed = false;
                self.queried_at = None;
                true
            }
            _ => false,
        }
    }

    /// Activate directly in answer to a remote `Query` this driver allowed.
    pub fn activate(&mut self) {
        self.state = ChannelState::Active;
        self.confirmed = true;
        self.queried_at = None;
    }

    /// Close with the connection. Returns true if the channel held a
    /// service binding (was active) that must now be released.
    pub fn close(&mut self) -> bool {
        let was_active = self.is_active();
        self.state = ChannelState::Closed;
        self.confirmed = false;
        self.queried_at = None;
        was_active
    }

    /// True if a `Query` has been outstanding longer than `timeout`.
    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        match (self.state, self.queried_at) {
            (ChannelState::Queried, Some(at)) => now.duration_since(at) > timeout,
            _ => false,
        }
    }
}
