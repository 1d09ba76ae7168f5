//! Connection lifecycle: discovery passes, client connects, server accepts and
//! the single current session.
//!
//! The manager is an actor. Callers drive it through a [`LinkHandle`] and
//! observe it through a stream of [`LinkEvent`]s; radio work runs in spawned
//! tasks that report back into the manager's inbox, so all state changes
//! happen on one task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trail_core::{
    AudioChunk, Coordinate, Device, DeviceAddress, DiscoveredDevices, FrameCodec, FrameError,
    LinkActivity, LinkState,
};

use crate::radio::{DiscoveryEvent, Radio};
use crate::session::{Session, SessionError, SessionEvent, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed on request.
    Requested,
    /// A newer session took over.
    Replaced,
    PeerClosed,
    Failed(String),
    /// Data was sent with no session in place.
    NotConnected,
}

impl From<SessionError> for DisconnectReason {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::PeerClosed => DisconnectReason::PeerClosed,
            SessionError::NotConnected => DisconnectReason::NotConnected,
            other => DisconnectReason::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(LinkState),
    DiscoveryStarted,
    DeviceFound(Device),
    DiscoveryFinished,
    DiscoveryFailed(String),
    Connected {
        session: SessionId,
        peer: Option<DeviceAddress>,
    },
    ConnectFailed {
        device: DeviceAddress,
        reason: String,
    },
    /// Connect was asked for the device already on the current session.
    AlreadyConnected(DeviceAddress),
    ListenFailed(String),
    Disconnected {
        session: Option<SessionId>,
        reason: DisconnectReason,
    },
    Audio(AudioChunk),
    PeerLocation(Coordinate),
}

#[derive(Debug)]
enum Command {
    StartDiscovery,
    StopDiscovery,
    Connect(DeviceAddress),
    Listen,
    StopListening,
    Send(Vec<u8>),
    Disconnect,
    Shutdown,
}

/// Results reported by spawned radio tasks, tagged so stale ones can be dropped.
enum Internal<C> {
    Discovery { pass: u64, event: DiscoveryEvent },
    DiscoveryDone { pass: u64 },
    Connected { attempt: u64, device: DeviceAddress, channel: C },
    ConnectFailed { attempt: u64, device: DeviceAddress, reason: String },
    Accepted { attempt: u64, channel: C, peer: Option<DeviceAddress> },
    ListenFailed { attempt: u64, reason: String },
}

enum Input<C> {
    Command(Command),
    Internal(Internal<C>),
    Session(SessionEvent),
}

#[derive(Debug, thiserror::Error)]
#[error("link manager has stopped")]
pub struct ManagerStopped;

/// Cheap, cloneable control surface for a running [`LinkManager`].
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl LinkHandle {
    fn command(&self, cmd: Command) -> Result<(), ManagerStopped> {
        self.commands.send(cmd).map_err(|_| ManagerStopped)
    }

    /// Start a fresh discovery pass; the found-device set is cleared first.
    pub fn start_discovery(&self) -> Result<(), ManagerStopped> {
        self.command(Command::StartDiscovery)
    }

    pub fn stop_discovery(&self) -> Result<(), ManagerStopped> {
        self.command(Command::StopDiscovery)
    }

    /// Connect as client. Supersedes any connect still in flight.
    pub fn connect(&self, device: DeviceAddress) -> Result<(), ManagerStopped> {
        self.command(Command::Connect(device))
    }

    /// Accept one inbound channel. No-op while already listening.
    pub fn listen(&self) -> Result<(), ManagerStopped> {
        self.command(Command::Listen)
    }

    pub fn stop_listening(&self) -> Result<(), ManagerStopped> {
        self.command(Command::StopListening)
    }

    /// Queue bytes on the current session.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), ManagerStopped> {
        self.command(Command::Send(bytes))
    }

    pub fn disconnect(&self) -> Result<(), ManagerStopped> {
        self.command(Command::Disconnect)
    }

    pub fn shutdown(&self) -> Result<(), ManagerStopped> {
        self.command(Command::Shutdown)
    }
}

struct Pending {
    id: u64,
    task: JoinHandle<()>,
}

impl Pending {
    fn abort(self) {
        self.task.abort();
    }
}

pub struct LinkManager<R: Radio> {
    radio: Arc<R>,
    buffer_size: usize,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal<R::Channel>>,
    internal_rx: mpsc::UnboundedReceiver<Internal<R::Channel>>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    events: mpsc::UnboundedSender<LinkEvent>,

    current: Option<Session>,
    connecting: Option<(Pending, DeviceAddress)>,
    listening: Option<Pending>,
    discovery: Option<Pending>,
    discovered: DiscoveredDevices,
    state: LinkState,
    next_id: u64,
}

impl<R: Radio> LinkManager<R> {
    /// Build a manager around `radio`. Fails on an unusable audio buffer size
    /// before anything is started.
    pub fn new(
        radio: Arc<R>,
        buffer_size: usize,
    ) -> Result<(Self, LinkHandle, mpsc::UnboundedReceiver<LinkEvent>), FrameError> {
        FrameCodec::new(buffer_size)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            radio,
            buffer_size,
            commands: cmd_rx,
            internal_tx,
            internal_rx,
            session_tx,
            session_rx,
            events: event_tx,
            current: None,
            connecting: None,
            listening: None,
            discovery: None,
            discovered: DiscoveredDevices::new(),
            state: LinkState::Idle,
            next_id: 1,
        };
        Ok((manager, LinkHandle { commands: cmd_tx }, event_rx))
    }

    /// Process inputs until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(input) = self.next_input().await {
            if !self.handle(input) {
                break;
            }
        }
        self.teardown();
        debug!("link manager stopped");
    }

    async fn next_input(&mut self) -> Option<Input<R::Channel>> {
        tokio::select! {
            Some(ev) = self.session_rx.recv() => Some(Input::Session(ev)),
            Some(i) = self.internal_rx.recv() => Some(Input::Internal(i)),
            cmd = self.commands.recv() => cmd.map(Input::Command),
        }
    }

    fn handle(&mut self, input: Input<R::Channel>) -> bool {
        match input {
            Input::Command(Command::Shutdown) => return false,
            Input::Command(cmd) => self.on_command(cmd),
            Input::Internal(i) => self.on_internal(i),
            Input::Session(ev) => self.on_session(ev),
        }
        true
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartDiscovery => self.start_discovery(),
            Command::StopDiscovery => {
                self.stop_discovery();
                self.update_state();
            }
            Command::Connect(device) => self.connect(device),
            Command::Listen => self.listen(),
            Command::StopListening => {
                if let Some(p) = self.listening.take() {
                    p.abort();
                }
                self.update_state();
            }
            Command::Send(bytes) => match &self.current {
                Some(session) => {
                    if let Err(e) = session.send(bytes) {
                        debug!(session = %session.id(), "send dropped: {}", e);
                    }
                }
                None => self.emit(LinkEvent::Disconnected {
                    session: None,
                    reason: DisconnectReason::NotConnected,
                }),
            },
            Command::Disconnect => {
                if let Some(mut session) = self.current.take() {
                    session.close();
                    info!(session = %session.id(), "disconnected on request");
                    self.session_lost(session.id(), DisconnectReason::Requested);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn start_discovery(&mut self) {
        if let Some(p) = self.discovery.take() {
            p.abort();
        }
        self.discovered.clear();
        let pass = self.take_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let radio = self.radio.clone();
        let internal = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let forward = async {
                while let Some(event) = rx.recv().await {
                    if internal.send(Internal::Discovery { pass, event }).is_err() {
                        break;
                    }
                }
            };
            let (result, ()) = tokio::join!(radio.discover(tx), forward);
            if let Err(e) = result {
                debug!(pass, "discovery pass ended with error: {}", e);
            }
            let _ = internal.send(Internal::DiscoveryDone { pass });
        });
        self.discovery = Some(Pending { id: pass, task });
        self.update_state();
    }

    fn stop_discovery(&mut self) {
        if let Some(p) = self.discovery.take() {
            p.abort();
            self.emit(LinkEvent::DiscoveryFinished);
        }
    }

    fn connect(&mut self, device: DeviceAddress) {
        if let Some(session) = &self.current {
            if session.peer() == Some(device) && session.is_open() {
                info!(%device, "already connected");
                self.emit(LinkEvent::AlreadyConnected(device));
                return;
            }
        }
        self.stop_discovery();
        if let Some((p, previous)) = self.connecting.take() {
            debug!(%previous, "connect superseded");
            p.abort();
        }
        let attempt = self.take_id();
        let radio = self.radio.clone();
        let internal = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let msg = match radio.connect(device).await {
                Ok(channel) => Internal::Connected {
                    attempt,
                    device,
                    channel,
                },
                Err(e) => Internal::ConnectFailed {
                    attempt,
                    device,
                    reason: e.to_string(),
                },
            };
            let _ = internal.send(msg);
        });
        info!(%device, "connecting");
        self.connecting = Some((Pending { id: attempt, task }, device));
        self.update_state();
    }

    fn listen(&mut self) {
        if self.listening.is_some() {
            return;
        }
        let attempt = self.take_id();
        let radio = self.radio.clone();
        let internal = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let msg = match radio.accept().await {
                Ok((channel, peer)) => Internal::Accepted {
                    attempt,
                    channel,
                    peer,
                },
                Err(e) => Internal::ListenFailed {
                    attempt,
                    reason: e.to_string(),
                },
            };
            let _ = internal.send(msg);
        });
        debug!("listening for inbound link");
        self.listening = Some(Pending { id: attempt, task });
        self.update_state();
    }

    fn on_internal(&mut self, msg: Internal<R::Channel>) {
        match msg {
            Internal::Discovery { pass, event } => {
                if self.discovery.as_ref().map(|p| p.id) != Some(pass) {
                    return;
                }
                match event {
                    DiscoveryEvent::Started => self.emit(LinkEvent::DiscoveryStarted),
                    DiscoveryEvent::Found(device) => {
                        if self.discovered.insert(device.clone()) {
                            info!(%device, "device found");
                            self.emit(LinkEvent::DeviceFound(device));
                        }
                    }
                    DiscoveryEvent::Finished => {
                        self.discovery = None;
                        self.emit(LinkEvent::DiscoveryFinished);
                        self.update_state();
                    }
                    DiscoveryEvent::Failed(reason) => {
                        warn!("discovery failed: {}", reason);
                        self.discovery = None;
                        self.emit(LinkEvent::DiscoveryFailed(reason));
                        self.update_state();
                    }
                }
            }
            Internal::DiscoveryDone { pass } => {
                if self.discovery.as_ref().map(|p| p.id) == Some(pass) {
                    self.discovery = None;
                    self.emit(LinkEvent::DiscoveryFinished);
                    self.update_state();
                }
            }
            Internal::Connected {
                attempt,
                device,
                channel,
            } => {
                if self.connecting.as_ref().map(|(p, _)| p.id) != Some(attempt) {
                    debug!(%device, "dropping channel from superseded connect");
                    return;
                }
                self.connecting = None;
                self.install_session(channel, Some(device));
            }
            Internal::ConnectFailed {
                attempt,
                device,
                reason,
            } => {
                if self.connecting.as_ref().map(|(p, _)| p.id) != Some(attempt) {
                    return;
                }
                self.connecting = None;
                warn!(%device, "connect failed: {}", reason);
                self.emit(LinkEvent::ConnectFailed { device, reason });
                self.update_state();
            }
            Internal::Accepted {
                attempt,
                channel,
                peer,
            } => {
                if self.listening.as_ref().map(|p| p.id) != Some(attempt) {
                    return;
                }
                self.listening = None;
                self.install_session(channel, peer);
            }
            Internal::ListenFailed { attempt, reason } => {
                if self.listening.as_ref().map(|p| p.id) != Some(attempt) {
                    return;
                }
                self.listening = None;
                warn!("listen failed: {}", reason);
                self.emit(LinkEvent::ListenFailed(reason));
                self.update_state();
            }
        }
    }

    /// Make `channel` the current session, closing whatever was there.
    fn install_session(&mut self, channel: R::Channel, peer: Option<DeviceAddress>) {
        self.stop_discovery();
        if let Some((p, _)) = self.connecting.take() {
            p.abort();
        }
        if let Some(p) = self.listening.take() {
            p.abort();
        }
        if let Some(mut old) = self.current.take() {
            old.close();
            info!(session = %old.id(), "session replaced");
            self.emit(LinkEvent::Disconnected {
                session: Some(old.id()),
                reason: DisconnectReason::Replaced,
            });
        }

        let id = SessionId(self.take_id());
        match Session::open(id, peer, channel, self.buffer_size, self.session_tx.clone()) {
            Ok(session) => {
                info!(session = %id, peer = ?peer, "connected");
                self.current = Some(session);
                self.emit(LinkEvent::Connected { session: id, peer });
            }
            Err(e) => warn!("cannot open session: {}", e),
        }
        self.update_state();
    }

    fn on_session(&mut self, ev: SessionEvent) {
        let current = self.current.as_ref().map(Session::id);
        match ev {
            SessionEvent::Audio(id, chunk) if Some(id) == current => {
                self.emit(LinkEvent::Audio(chunk));
            }
            SessionEvent::Location(id, text) if Some(id) == current => match Coordinate::parse(&text) {
                Ok(coord) => self.emit(LinkEvent::PeerLocation(coord)),
                Err(e) => debug!(session = %id, "discarding location record: {}", e),
            },
            SessionEvent::Closed(id, err) if Some(id) == current => {
                self.current = None;
                info!(session = %id, "link lost: {}", err);
                self.session_lost(id, err.into());
            }
            _ => {}
        }
    }

    fn session_lost(&mut self, id: SessionId, reason: DisconnectReason) {
        self.state = LinkState::Disconnected;
        self.emit(LinkEvent::StateChanged(LinkState::Disconnected));
        self.emit(LinkEvent::Disconnected {
            session: Some(id),
            reason,
        });
        self.update_state();
    }

    fn activity(&self) -> LinkActivity {
        LinkActivity {
            session: self.current.is_some(),
            connecting: self.connecting.is_some(),
            listening: self.listening.is_some(),
            discovering: self.discovery.is_some(),
        }
    }

    fn update_state(&mut self) {
        let next = self.activity().state();
        if next != self.state {
            debug!(from = %self.state, to = %next, "link state");
            self.state = next;
            self.emit(LinkEvent::StateChanged(next));
        }
    }

    fn teardown(&mut self) {
        if let Some(p) = self.discovery.take() {
            p.abort();
        }
        if let Some((p, _)) = self.connecting.take() {
            p.abort();
        }
        if let Some(p) = self.listening.take() {
            p.abort();
        }
        if let Some(mut session) = self.current.take() {
            session.close();
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}
