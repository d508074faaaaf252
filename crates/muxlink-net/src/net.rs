use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use muxlink_driver::{ChannelBinding, DriverConfig, NetRuntime, ProtoDriver, Role};
use muxlink_proto::{ChannelId, PacketId};
use muxlink_transport::{EventSink, Transport, TransportEvent, TransportId};
#[cfg(unix)]
use muxlink_transport::{UdsListener, UdsTransport};
use tracing::{debug, info, warn};

use crate::config::{NetConfig, TransportConfig, TransportRole};
use crate::error::{NetError, Result};

/// How long the event loop sleeps between deadline sweeps when no
/// transport events arrive.
const DEADLINE_TICK: Duration = Duration::from_millis(250);

/// Opens the physical transport behind one [`TransportConfig`] entry.
///
/// Kept as a trait so tests and embedders can substitute in-memory or
/// custom transports without touching the routing layer.
pub trait TransportConnector {
    fn open(
        &self,
        config: &TransportConfig,
        sink: EventSink,
    ) -> muxlink_transport::Result<Arc<dyn Transport>>;
}

/// Unix-domain-socket connector: `endpoint` is a filesystem path.
///
/// The Listen role binds the path and blocks for a single peer; this repo's
/// transports carry one connection each, so a listening entry is one
/// accepted stream, not an accept loop.
#[cfg(unix)]
pub struct UdsConnector;

#[cfg(unix)]
impl TransportConnector for UdsConnector {
    fn open(
        &self,
        config: &TransportConfig,
        sink: EventSink,
    ) -> muxlink_transport::Result<Arc<dyn Transport>> {
        match config.role {
            TransportRole::Connect => {
                let transport = UdsTransport::connect(&config.endpoint, sink)?;
                Ok(transport as Arc<dyn Transport>)
            }
            TransportRole::Listen => {
                let listener = UdsListener::bind(&config.endpoint)?;
                let transport = listener.accept(sink)?;
                // Listener dropped here; the socket file goes with it while
                // the accepted stream lives on.
                Ok(transport as Arc<dyn Transport>)
            }
        }
    }
}

struct TransportEntry {
    name: String,
    driver: Arc<ProtoDriver>,
    transport: Arc<dyn Transport>,
    /// Cleared by the Deactivated event.
    active: bool,
}

#[derive(Default)]
struct NetState {
    config: NetConfig,
    entries: Vec<TransportEntry>,
    by_name: HashMap<String, TransportId>,
    started: bool,
    stopping: bool,
    /// Callbacks awaiting the all-transports-deactivated barrier.
    on_stopped: Vec<Box<dyn FnOnce() + Send>>,
}

impl NetState {
    fn all_inactive(&self) -> bool {
        self.entries.iter().all(|e| !e.active)
    }
}

/// Routes transport events and service sends across every configured
/// connection, and owns the start/stop lifecycle.
///
/// One event-loop thread per `NetDriver` drains the shared event channel
/// and serializes decode, dispatch, and send completion for all its
/// drivers. `send` may be called from any thread.
pub struct NetDriver {
    runtime: Arc<NetRuntime>,
    role: Role,
    driver_config: DriverConfig,
    state: Mutex<NetState>,
}

impl NetDriver {
    pub fn new(role: Role, runtime: Arc<NetRuntime>, driver_config: DriverConfig) -> Self {
        Self {
            runtime,
            role,
            driver_config,
            state: Mutex::new(NetState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().expect("net state poisoned")
    }

    /// Validate and store a configuration. A validation failure leaves the
    /// previously applied configuration untouched.
    pub fn apply_config(&self, config: NetConfig) -> Result<()> {
        config.validate()?;
        let mut st = self.state();
        if st.started {
            warn!("configuration replaced while started; applies on next start");
        }
        info!(transports = config.transports.len(), "configuration applied");
        st.config = config;
        Ok(())
    }

    /// Open every configured transport and spawn the event-loop thread.
    ///
    /// On any open failure the transports opened so far are closed and the
    /// driver stays unstarted.
    pub fn start(self: &Arc<Self>, connector: &dyn TransportConnector) -> Result<()> {
        let configs = {
            let st = self.state();
            if st.started {
                warn!("start called twice, ignoring");
                return Ok(());
            }
            st.config.transports.clone()
        };

        let (tx, rx) = mpsc::channel();
        let mut entries: Vec<TransportEntry> = Vec::with_capacity(configs.len());
        for (id, config) in configs.iter().enumerate() {
            let sink = EventSink::new(id, tx.clone());
            let transport = match connector.open(config, sink.clone()) {
                Ok(transport) => transport,
                Err(source) => {
                    for entry in &entries {
                        entry.transport.close();
                    }
                    return Err(NetError::Open {
                        name: config.name.clone(),
                        source,
                    });
                }
            };
            let bindings: Vec<ChannelBinding> = config
                .bindings
                .iter()
                .map(|b| ChannelBinding {
                    channel: b.channel,
                    service: b.service,
                    initiate: b.initiate,
                })
                .collect();
            let driver = Arc::new(ProtoDriver::new(
                self.role,
                &bindings,
                Arc::clone(&self.runtime),
                Arc::clone(&transport),
                sink,
                self.driver_config.clone(),
            ));
            debug!(name = %config.name, id, "transport opened");
            entries.push(TransportEntry {
                name: config.name.clone(),
                driver,
                transport,
                active: true,
            });
        }

        {
            let mut st = self.state();
            st.by_name = entries
                .iter()
                .enumerate()
                .map(|(id, e)| (e.name.clone(), id))
                .collect();
            st.entries = entries;
            st.started = true;
            st.stopping = false;
        }

        let net = Arc::clone(self);
        thread::Builder::new()
            .name("muxlink-events".into())
            .spawn(move || {
                // Wake on events, or on a tick so the read-inactivity and
                // handshake deadlines fire without any embedder polling.
                loop {
                    match rx.recv_timeout(DEADLINE_TICK) {
                        Ok((id, event)) => net.handle_event(id, event),
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            net.check_deadlines(Instant::now());
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("event loop finished");
            })
            .map_err(|e| NetError::Open {
                name: "muxlink-events".into(),
                source: muxlink_transport::TransportError::Io(e),
            })?;
        Ok(())
    }

    /// Route one transport event to its owning per-connection driver.
    pub fn handle_event(&self, id: TransportId, event: TransportEvent) {
        let driver = {
            let st = self.state();
            match st.entries.get(id) {
                Some(entry) => Arc::clone(&entry.driver),
                None => {
                    warn!(id, "event for unknown transport dropped");
                    return;
                }
            }
        };
        match event {
            TransportEvent::Activated => driver.on_activated(),
            TransportEvent::Received(bytes) => driver.on_receive(&bytes),
            TransportEvent::SendComplete => driver.on_send_complete(),
            TransportEvent::SendReady => driver.on_send_ready(),
            TransportEvent::Deactivated(error) => {
                driver.on_disconnect(error.as_ref());
                self.transport_deactivated(id);
            }
        }
    }

    fn transport_deactivated(&self, id: TransportId) {
        let callbacks = {
            let mut st = self.state();
            if let Some(entry) = st.entries.get_mut(id) {
                debug!(name = %entry.name, id, "transport deactivated");
                entry.active = false;
            }
            if st.stopping && st.all_inactive() {
                std::mem::take(&mut st.on_stopped)
            } else {
                Vec::new()
            }
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Route a send to the named transport's channel.
    pub fn send(
        &self,
        transport: &str,
        channel: ChannelId,
        payload: impl Into<Bytes>,
    ) -> Result<PacketId> {
        let driver = {
            let st = self.state();
            if !st.started {
                return Err(NetError::NotStarted);
            }
            let id = st
                .by_name
                .get(transport)
                .copied()
                .ok_or_else(|| NetError::UnknownTransport {
                    name: transport.to_string(),
                })?;
            Arc::clone(&st.entries[id].driver)
        };
        Ok(driver.send_data(channel, payload)?)
    }

    /// Begin shutdown. `on_all_stopped` fires exactly once, after every
    /// owned transport has deactivated; with no live transports it fires
    /// before `stop` returns. A transport failing on its own after `stop`
    /// still counts toward the barrier.
    pub fn stop(&self, on_all_stopped: impl FnOnce() + Send + 'static) {
        let mut callback: Option<Box<dyn FnOnce() + Send>> = Some(Box::new(on_all_stopped));
        let to_close: Vec<Arc<dyn Transport>> = {
            let mut st = self.state();
            st.stopping = true;
            if st.all_inactive() {
                Vec::new()
            } else {
                if let Some(callback) = callback.take() {
                    st.on_stopped.push(callback);
                }
                st.entries
                    .iter()
                    .filter(|e| e.active)
                    .map(|e| Arc::clone(&e.transport))
                    .collect()
            }
        };
        if let Some(callback) = callback.take() {
            info!("stop requested with no live transports");
            callback();
            return;
        }
        info!(count = to_close.len(), "stopping transports");
        for transport in to_close {
            transport.close();
        }
    }

    /// Apply per-connection deadlines; a connection past its read timeout
    /// is closed (its Deactivated event finishes the teardown).
    pub fn check_deadlines(&self, now: Instant) {
        let live: Vec<(Arc<ProtoDriver>, Arc<dyn Transport>, String)> = {
            let st = self.state();
            st.entries
                .iter()
                .filter(|e| e.active)
                .map(|e| (Arc::clone(&e.driver), Arc::clone(&e.transport), e.name.clone()))
                .collect()
        };
        for (driver, transport, name) in live {
            if driver.check_deadlines(now) {
                warn!(name = %name, "connection expired, closing");
                transport.close();
            }
        }
    }
}
