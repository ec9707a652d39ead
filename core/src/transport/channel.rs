/// Push channel connection and per-owner handles
///
/// One `TransportChannel` is created at startup and cloned into every view.
/// Views never talk to the connection directly; each one takes a
/// `ChannelHandle`, which tracks the rooms it joined and releases them on
/// drop. The connection closes when the last handle goes away.
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::identity::{Credential, IdentityProvider};
use crate::transport::protocol::{
    read_frame, write_frame, ClientEvent, Room, ServerEvent, ServerFrame, PROTOCOL_VERSION,
};
use crate::transport::rooms::{OwnerId, RoomRegistry};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Lifecycle and push events fanned out to every handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { connection_id: String },
    Disconnected { reason: String },
    /// User-facing description of a transport failure
    Error { message: String },
    Push {
        room: Option<Room>,
        event: ServerEvent,
    },
}

/// Snapshot of the connection as seen by callers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportSession {
    pub connection_id: Option<String>,
    pub is_connected: bool,
    pub subscribed_rooms: BTreeSet<String>,
}

struct Link {
    generation: u64,
    connection_id: String,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Stop reading; the writer drains what is queued, then closes its half.
    fn shutdown(self) {
        self.reader.abort();
        drop(self.outbound);
    }
}

#[derive(Default)]
struct ChannelState {
    link: Option<Link>,
    rooms: RoomRegistry,
    live_handles: usize,
}

impl ChannelState {
    fn send(&self, event: ClientEvent) {
        if let Some(link) = &self.link {
            debug!("Queueing {}", event.name());
            let _ = link.outbound.send(event);
        }
    }
}

struct Shared {
    config: Config,
    state: Mutex<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    next_owner: AtomicU64,
    next_generation: AtomicU64,
}

impl Shared {
    fn publish(&self, event: ChannelEvent) {
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send(event);
    }

    fn dispatch(&self, frame: ServerFrame) {
        let room = match frame.room.as_deref() {
            Some(key) => match Room::parse(key) {
                Some(room) => Some(room),
                None => {
                    debug!("Dropping push for unknown room key {}", key);
                    return;
                }
            },
            None => None,
        };

        if let Some(room) = &room {
            if !self.state.lock().rooms.is_active(room) {
                debug!("Dropping push for released room {}", room);
                return;
            }
        }

        match frame.event {
            ServerEvent::Pong { timestamp } => debug!("Pong {}", timestamp),
            ServerEvent::Error { message } => {
                warn!("Server reported error: {}", message);
                self.publish(ChannelEvent::Error {
                    message: "The live channel reported a problem.".to_string(),
                });
            }
            event => self.publish(ChannelEvent::Push { room, event }),
        }
    }

    fn link_lost(&self, generation: u64, reason: String) {
        let lost = {
            let mut state = self.state.lock();
            match &state.link {
                Some(link) if link.generation == generation => state.link.take(),
                _ => None,
            }
        };
        if let Some(link) = lost {
            warn!("Push channel {} disconnected: {}", link.connection_id, reason);
            drop(link.outbound);
            self.publish(ChannelEvent::Disconnected { reason });
        }
    }
}

/// Process-wide push channel, passed to views explicitly
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<Shared>,
}

impl TransportChannel {
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(Shared {
                config,
                state: Mutex::new(ChannelState::default()),
                events,
                next_owner: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Resolve the credential, dial the configured push address and
    /// authenticate. Failures are returned and also published as
    /// `ChannelEvent::Error`; nothing retries on its own.
    pub async fn connect(&self, identity: &dyn IdentityProvider) -> Result<TransportSession> {
        if self.is_connected() {
            return Ok(self.session());
        }

        let principal = identity.resolve().await.map_err(|e| self.report(e))?;
        let addr = self.inner.config.push_addr;

        let stream = match timeout(self.inner.config.connection_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(self.report(SyncError::Transport(format!(
                    "connect to {} failed: {}",
                    addr, e
                ))))
            }
            Err(_) => {
                return Err(self.report(SyncError::Transport(format!(
                    "connect to {} timed out",
                    addr
                ))))
            }
        };
        let _ = stream.set_nodelay(true);

        self.attach(stream, &principal.credential).await
    }

    /// Authenticate over an already open stream and start the reader/writer
    /// tasks. Rooms claimed while disconnected are joined right away.
    pub async fn attach<S>(&self, stream: S, credential: &Credential) -> Result<TransportSession>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let hello = ClientEvent::Authenticate {
            credential: credential.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        let handshake = async {
            write_frame(&mut writer, &hello).await?;
            read_frame::<_, ServerFrame>(&mut reader).await
        };

        let reply = match timeout(self.inner.config.connection_timeout, handshake).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                return Err(self.report(SyncError::Transport(
                    "connection closed during handshake".to_string(),
                )))
            }
            Ok(Err(e)) => {
                return Err(self.report(SyncError::Transport(format!("handshake failed: {}", e))))
            }
            Err(_) => {
                return Err(self.report(SyncError::Transport(
                    "handshake timed out".to_string(),
                )))
            }
        };

        let connection_id = match reply.event {
            ServerEvent::Connected { connection_id } => connection_id,
            ServerEvent::AuthRejected { reason } => {
                return Err(self.report(SyncError::Transport(format!(
                    "authentication rejected: {}",
                    reason
                ))))
            }
            other => {
                return Err(self.report(SyncError::Transport(format!(
                    "unexpected handshake reply: {:?}",
                    other
                ))))
            }
        };

        let established = {
            let mut state = self.inner.state.lock();
            if state.link.is_some() {
                false
            } else {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (outbound, rx) = mpsc::unbounded_channel();
                for room in state.rooms.active_rooms() {
                    let _ = outbound.send(room.join_event());
                }
                tokio::spawn(run_writer(writer, rx));
                let reader = tokio::spawn(run_reader(reader, Arc::downgrade(&self.inner), generation));
                state.link = Some(Link {
                    generation,
                    connection_id: connection_id.clone(),
                    outbound,
                    reader,
                });
                true
            }
        };

        if !established {
            debug!("Concurrent connect already established a link, dropping {}", connection_id);
            return Ok(self.session());
        }

        info!("Push channel connected ({})", connection_id);
        self.inner.publish(ChannelEvent::Connected { connection_id });
        Ok(self.session())
    }

    /// Close the connection regardless of live handles. Room claims are kept
    /// and re-joined on the next connect.
    pub fn close(&self) {
        let link = self.inner.state.lock().link.take();
        if let Some(link) = link {
            info!("Closing push channel {}", link.connection_id);
            link.shutdown();
            self.inner.publish(ChannelEvent::Disconnected {
                reason: "closed by client".to_string(),
            });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().link.is_some()
    }

    pub fn session(&self) -> TransportSession {
        let state = self.inner.state.lock();
        TransportSession {
            connection_id: state.link.as_ref().map(|l| l.connection_id.clone()),
            is_connected: state.link.is_some(),
            subscribed_rooms: state.rooms.active_rooms().iter().map(Room::key).collect(),
        }
    }

    /// Raw event stream, unfiltered (connection banner, diagnostics)
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// New owner-scoped handle
    pub fn handle(&self, label: &str) -> ChannelHandle {
        let owner = OwnerId(self.inner.next_owner.fetch_add(1, Ordering::Relaxed));
        self.inner.state.lock().live_handles += 1;
        debug!("Handle {} opened for {}", owner, label);
        ChannelHandle {
            owner,
            label: label.to_string(),
            shared: self.inner.clone(),
            events: self.inner.events.subscribe(),
            released: false,
        }
    }

    fn report(&self, err: SyncError) -> SyncError {
        warn!("Push channel error: {}", err);
        self.inner.publish(ChannelEvent::Error {
            message: err.user_message(),
        });
        err
    }
}

async fn run_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<ClientEvent>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &event).await {
            error!("Failed to write {}: {}", event.name(), e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader<R>(mut reader: R, shared: Weak<Shared>, generation: u64)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match read_frame::<_, ServerFrame>(&mut reader).await {
            Ok(Some(frame)) => match shared.upgrade() {
                Some(shared) => shared.dispatch(frame),
                None => return,
            },
            Ok(None) => break "closed by server".to_string(),
            // The whole payload was consumed, so the stream is still aligned
            Err(SyncError::Serialization(e)) => warn!("Skipping malformed frame: {}", e),
            Err(e) => {
                error!("Push channel read failed: {}", e);
                break format!("read failed: {}", e);
            }
        }
    };
    if let Some(shared) = shared.upgrade() {
        shared.link_lost(generation, reason);
    }
}

/// One owner's view of the push channel
pub struct ChannelHandle {
    owner: OwnerId,
    label: String,
    shared: Arc<Shared>,
    events: broadcast::Receiver<ChannelEvent>,
    released: bool,
}

impl ChannelHandle {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Claim a room; the join frame goes out only for the first claimant.
    pub fn subscribe(&self, room: Room) {
        if self.released {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.rooms.acquire(self.owner, room.clone()) {
            debug!("{} joins {}", self.label, room);
            state.send(room.join_event());
        }
    }

    /// Drop this handle's claim; the leave frame goes out only for the last one.
    pub fn unsubscribe(&self, room: &Room) {
        let mut state = self.shared.state.lock();
        if state.rooms.release(self.owner, room) {
            debug!("{} leaves {}", self.label, room);
            if let Some(leave) = room.leave_event() {
                state.send(leave);
            }
        }
    }

    pub fn holds(&self, room: &Room) -> bool {
        self.shared.state.lock().rooms.holds(self.owner, room)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().link.is_some()
    }

    /// Queue an event for the server
    pub fn emit(&self, event: ClientEvent) -> Result<()> {
        let state = self.shared.state.lock();
        match &state.link {
            Some(link) => link
                .outbound
                .send(event)
                .map_err(|_| SyncError::Send("push channel writer stopped".to_string())),
            None => Err(SyncError::Send("push channel is not connected".to_string())),
        }
    }

    /// Next event for this owner. Pushes for rooms this handle does not hold
    /// are skipped. Returns `None` once released.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            if self.released {
                return None;
            }
            let received = self.events.recv().await;
            match received {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("{} lagged {} channel events", self.label, n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn accepts(&self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::Push {
                room: Some(room), ..
            } => self.holds(room),
            _ => true,
        }
    }

    /// Release every room of this owner. Closes the connection when this was
    /// the last live handle.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let closing = {
            let mut state = self.shared.state.lock();
            for room in state.rooms.release_owner(self.owner) {
                debug!("{} leaves {} on release", self.label, room);
                if let Some(leave) = room.leave_event() {
                    state.send(leave);
                }
            }
            state.live_handles = state.live_handles.saturating_sub(1);
            if state.live_handles == 0 {
                state.link.take()
            } else {
                None
            }
        };

        if let Some(link) = closing {
            info!("Last handle released, closing push channel {}", link.connection_id);
            link.shutdown();
            self.shared.publish(ChannelEvent::Disconnected {
                reason: "no active views".to_string(),
            });
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.release();
    }
}
