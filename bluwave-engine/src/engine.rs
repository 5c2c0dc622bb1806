//! ChatEngine façade: session state machine, observable surface, commands.
//!
//! Observables are `watch` channels with latest-value replay; commands are
//! effectively fire-and-forget — every failure is mirrored into the
//! current-error observable, and the returned `Result` carries the same
//! information for callers that want it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bluwave_core::{
    ChatMessage, CryptoSession, Device, DeviceId, DeviceRegistry, Keypair, Role, Session,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinSet};

use crate::config::Config;
use crate::errors::EngineError;
use crate::{connection, discovery, router};

/// One connected peer: its outbound write queue and read-task handle.
/// `gen` disambiguates a connection from a same-device replacement so a stale
/// disconnect path cannot tear down the replacement.
pub(crate) struct PeerHandle {
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    pub read_abort: Option<AbortHandle>,
    pub gen: u64,
}

pub(crate) struct EngineState {
    pub session: Option<Session>,
    pub registry: DeviceRegistry,
    pub crypto: CryptoSession,
    pub peers: HashMap<DeviceId, PeerHandle>,
    pub tasks: JoinSet<()>,
    pub listen_addr: Option<SocketAddr>,
    /// Transport addresses learned from discovery, keyed by device id.
    pub host_addrs: HashMap<DeviceId, SocketAddr>,
    pub next_gen: u64,
}

impl EngineState {
    pub(crate) fn next_gen(&mut self) -> u64 {
        self.next_gen += 1;
        self.next_gen
    }
}

pub(crate) struct Watches {
    pub role_tx: watch::Sender<Option<Role>>,
    pub connected_tx: watch::Sender<bool>,
    pub devices_tx: watch::Sender<Vec<Device>>,
    pub discovered_tx: watch::Sender<Vec<Device>>,
    pub messages_tx: watch::Sender<Vec<ChatMessage>>,
    pub error_tx: watch::Sender<Option<String>>,
}

pub(crate) struct Inner {
    pub config: Config,
    pub device_id: DeviceId,
    pub state: Mutex<EngineState>,
    pub watches: Watches,
}

impl Inner {
    pub(crate) fn append_message(&self, msg: ChatMessage) {
        self.watches.messages_tx.send_modify(|log| log.push(msg));
    }

    pub(crate) fn append_system(&self, text: String) {
        tracing::info!(text, "system message");
        self.append_message(ChatMessage::system(text));
    }

    pub(crate) fn report_error(&self, err: &EngineError) {
        tracing::warn!(error = %err, "engine error");
        self.watches.error_tx.send_replace(Some(err.to_string()));
    }

    pub(crate) fn publish_devices(&self, state: &EngineState) {
        self.watches
            .devices_tx
            .send_replace(state.registry.connected_devices());
    }
}

/// The engine the UI collaborator drives. Cheap to clone; all clones share
/// one session.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<Inner>,
}

impl ChatEngine {
    pub fn new(config: Config) -> Self {
        let keypair = Keypair::generate();
        let device_id = keypair.device_id();
        let watches = Watches {
            role_tx: watch::Sender::new(None),
            connected_tx: watch::Sender::new(false),
            devices_tx: watch::Sender::new(Vec::new()),
            discovered_tx: watch::Sender::new(Vec::new()),
            messages_tx: watch::Sender::new(Vec::new()),
            error_tx: watch::Sender::new(None),
        };
        let state = EngineState {
            session: None,
            registry: DeviceRegistry::new(),
            crypto: CryptoSession::new(keypair),
            peers: HashMap::new(),
            tasks: JoinSet::new(),
            listen_addr: None,
            host_addrs: HashMap::new(),
            next_gen: 0,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                device_id,
                state: Mutex::new(state),
                watches,
            }),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Begin hosting: bind the listener, start the accept loop and the
    /// discovery announcer. `connected` flips on when the first peer joins.
    pub async fn start_host(&self) -> Result<(), EngineError> {
        let result = self.start_host_impl().await;
        if let Err(err) = &result {
            self.inner.report_error(err);
        }
        result
    }

    async fn start_host_impl(&self) -> Result<(), EngineError> {
        if !self.inner.config.enabled {
            return Err(EngineError::RadioDisabled);
        }
        {
            let mut state = self.inner.state.lock().await;
            if state.session.is_some() {
                return Err(EngineError::AlreadyInSession);
            }
            state.session = Some(Session::new(Role::Host));
        }
        self.inner.watches.role_tx.send_replace(Some(Role::Host));

        match connection::start_listening(self.inner.clone()).await {
            Ok(addr) => {
                tracing::info!(%addr, "hosting");
                let announcer = discovery::announce_loop(self.inner.clone(), addr.port());
                self.inner.state.lock().await.tasks.spawn(announcer);
                Ok(())
            }
            Err(err) => {
                let mut state = self.inner.state.lock().await;
                state.session = None;
                drop(state);
                self.inner.watches.role_tx.send_replace(None);
                Err(err)
            }
        }
    }

    /// Join a discovered host.
    pub async fn join(&self, device: &Device) -> Result<(), EngineError> {
        let addr = {
            let state = self.inner.state.lock().await;
            state.host_addrs.get(&device.id).copied()
        };
        match addr {
            Some(addr) => self.join_addr(addr).await,
            None => {
                let err = EngineError::UnknownDevice;
                self.inner.report_error(&err);
                Err(err)
            }
        }
    }

    /// Join a host by transport address.
    pub async fn join_addr(&self, addr: SocketAddr) -> Result<(), EngineError> {
        let result = self.join_addr_impl(addr).await;
        if let Err(err) = &result {
            self.inner.report_error(err);
        }
        result
    }

    async fn join_addr_impl(&self, addr: SocketAddr) -> Result<(), EngineError> {
        if !self.inner.config.enabled {
            return Err(EngineError::RadioDisabled);
        }
        {
            let mut state = self.inner.state.lock().await;
            if state.session.is_some() {
                return Err(EngineError::AlreadyInSession);
            }
            state.session = Some(Session::new(Role::Client));
        }
        self.inner.watches.role_tx.send_replace(Some(Role::Client));

        match connection::connect_to(self.inner.clone(), addr).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Connect failed: back to Idle, nothing retained.
                let mut state = self.inner.state.lock().await;
                state.session = None;
                state.crypto.clear_keys();
                drop(state);
                self.inner.watches.role_tx.send_replace(None);
                Err(err)
            }
        }
    }

    /// Send a chat message. With no peers connected this only appends to the
    /// local log; it is not an error.
    pub async fn send(&self, text: &str) -> Result<(), EngineError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let result = router::send_local(&self.inner, text).await;
        if let Err(err) = &result {
            self.inner.report_error(err);
        }
        result
    }

    /// Listen for host announces for the configured scan window, publishing
    /// found hosts to `discoverable_devices`. Fire-and-forget.
    pub async fn scan_for_devices(&self) -> Result<(), EngineError> {
        if !self.inner.config.enabled {
            let err = EngineError::RadioDisabled;
            self.inner.report_error(&err);
            return Err(err);
        }
        let inner = self.inner.clone();
        let window = Duration::from_secs(self.inner.config.scan_window_secs);
        let mut state = self.inner.state.lock().await;
        state.tasks.spawn(async move {
            if let Err(err) = discovery::scan(inner.clone(), window).await {
                inner.report_error(&EngineError::Io(err));
            }
        });
        Ok(())
    }

    /// Every device this engine has ever seen, connected or not.
    pub async fn known_devices(&self) -> Vec<Device> {
        self.inner.state.lock().await.registry.known_devices()
    }

    /// The bound transport address while hosting.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().await.listen_addr
    }

    /// Tear down the session: cancel all tasks, close every connection and
    /// the listener, zero key material. Idempotent; safe to call while
    /// connections are failing on their own.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.tasks.abort_all();
        state.peers.clear();
        state.registry.clear_connections();
        state.session = None;
        state.crypto.clear_keys();
        state.listen_addr = None;
        drop(state);
        self.inner.watches.role_tx.send_replace(None);
        self.inner.watches.connected_tx.send_replace(false);
        self.inner.watches.devices_tx.send_replace(Vec::new());
        self.inner.watches.messages_tx.send_replace(Vec::new());
        tracing::info!("disconnected");
    }

    // Observables: latest-value replay to every new observer.

    pub fn role(&self) -> watch::Receiver<Option<Role>> {
        self.inner.watches.role_tx.subscribe()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.watches.connected_tx.subscribe()
    }

    pub fn connected_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.inner.watches.devices_tx.subscribe()
    }

    pub fn discoverable_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.inner.watches.discovered_tx.subscribe()
    }

    pub fn messages(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.inner.watches.messages_tx.subscribe()
    }

    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.inner.watches.error_tx.subscribe()
    }
}
