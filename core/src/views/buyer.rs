/// Buyer conversation view: one buyer talking to the support operator
use crate::cache::ConversationCache;
use crate::error::Result;
use crate::identity::Principal;
use crate::reconcile::{self, Incoming};
use crate::rest::HistoryApi;
use crate::transport::{ChannelEvent, ChannelHandle, ClientEvent, Room, ServerEvent, TransportChannel};
use crate::types::Message;
use crate::utils::{wait_until, Debounce};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyerPhase {
    Uninitialized,
    LoadingHistory,
    Ready,
}

/// Host input for `BuyerView::run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuyerCommand {
    SetDraft(String),
    Keystroke,
    Send,
    RetryHistory,
    Deactivate,
}

enum Step {
    Command(Option<BuyerCommand>),
    Channel(Option<ChannelEvent>),
    Timer,
}

pub struct BuyerView {
    principal: Principal,
    support_id: String,
    channel: ChannelHandle,
    api: Arc<dyn HistoryApi>,
    cache: Option<ConversationCache>,
    echo_window: Duration,
    phase: BuyerPhase,
    messages: Vec<Message>,
    /// Ids that so far only come from the local cache
    cached_ids: HashSet<String>,
    history_error: Option<String>,
    send_error: Option<String>,
    draft: String,
    typing: Debounce,
    support_typing: bool,
    connected: bool,
    active: bool,
    stale: bool,
}

impl BuyerView {
    pub fn new(
        principal: Principal,
        support_id: &str,
        channel: &TransportChannel,
        api: Arc<dyn HistoryApi>,
    ) -> Self {
        let config = channel.config();
        Self {
            support_id: support_id.to_string(),
            echo_window: config.echo_window,
            typing: Debounce::new(config.typing_stop_delay),
            connected: channel.is_connected(),
            channel: channel.handle(&format!("buyer:{}", principal.id)),
            principal,
            api,
            cache: None,
            phase: BuyerPhase::Uninitialized,
            messages: Vec::new(),
            cached_ids: HashSet::new(),
            history_error: None,
            send_error: None,
            draft: String::new(),
            support_typing: false,
            active: false,
            stale: false,
        }
    }

    pub fn with_cache(mut self, cache: ConversationCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn phase(&self) -> BuyerPhase {
        self.phase
    }

    pub fn self_id(&self) -> &str {
        &self.principal.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn history_error(&self) -> Option<&str> {
        self.history_error.as_deref()
    }

    pub fn send_error(&self) -> Option<&str> {
        self.send_error.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn support_typing(&self) -> bool {
        self.support_typing
    }

    /// History loaded, nothing in it, no error: render the empty state
    pub fn is_empty_state(&self) -> bool {
        self.phase == BuyerPhase::Ready && self.messages.is_empty() && self.history_error.is_none()
    }

    /// Join the personal room, show cached messages, then load the snapshot
    pub async fn activate(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.channel
            .subscribe(Room::Personal(self.principal.id.clone()));

        if let Some(cache) = &self.cache {
            match cache.load(&self.support_id) {
                Ok(cached) if !cached.is_empty() => {
                    debug!("Pre-populating {} cached messages", cached.len());
                    self.cached_ids = cached.iter().map(|m| m.id.clone()).collect();
                    self.messages = reconcile::merge_snapshot(&[], cached, self.echo_window);
                }
                Ok(_) => {}
                Err(e) => warn!("Conversation cache unavailable: {}", e),
            }
        }

        self.load_history().await;
    }

    /// Fetch the REST snapshot and fold it in. Failure stays inline.
    pub async fn load_history(&mut self) {
        if !self.active {
            return;
        }
        self.phase = BuyerPhase::LoadingHistory;
        self.stale = false;

        let result = self.api.fetch_history(None).await;
        if !self.active {
            return;
        }
        match result {
            Ok(snapshot) => {
                // Cache entries are replaced wholesale by the snapshot
                let live: Vec<Message> = self
                    .messages
                    .iter()
                    .filter(|m| !self.cached_ids.contains(&m.id))
                    .cloned()
                    .collect();
                self.cached_ids.clear();
                self.messages = reconcile::merge(
                    &live,
                    Incoming::Snapshot {
                        messages: snapshot,
                        window: self.echo_window,
                    },
                );
                self.history_error = None;
                self.write_cache();
                info!("Loaded {} messages", self.messages.len());
            }
            Err(e) => {
                warn!("History load failed: {}", e);
                self.history_error = Some(e.user_message());
            }
        }
        self.phase = BuyerPhase::Ready;
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    /// Emit `typing` and (re)arm the `stop_typing` timer
    pub fn keystroke(&mut self, now: Instant) {
        if !self.active {
            return;
        }
        self.typing.touch(now);
        self.emit_best_effort(ClientEvent::Typing {
            peer_id: self.support_id.clone(),
        });
    }

    pub fn is_typing(&self) -> bool {
        self.typing.is_armed()
    }

    /// Send the draft through the RPC. On failure the draft is put back.
    pub async fn send(&mut self) -> Result<()> {
        let content = self.draft.trim().to_string();
        if content.is_empty() || !self.active {
            return Ok(());
        }
        let draft = std::mem::take(&mut self.draft);
        self.stop_typing();

        match self.api.send_message(&self.support_id, &content).await {
            Ok(message) => {
                self.send_error = None;
                self.messages = reconcile::merge(&self.messages, Incoming::BuyerSend(message));
                self.write_cache();
                Ok(())
            }
            Err(e) => {
                warn!("Send failed, draft kept: {}", e);
                self.draft = draft;
                self.send_error = Some(e.user_message());
                Err(e)
            }
        }
    }

    pub fn handle_event(&mut self, event: ChannelEvent) {
        if !self.active {
            return;
        }
        match event {
            ChannelEvent::Push {
                event: ServerEvent::NewMessage { message },
                ..
            } => {
                if !message.involves(&self.principal.id) {
                    debug!("Ignoring message {} not addressed to us", message.id);
                    return;
                }
                self.cached_ids.remove(&message.id);
                self.messages = reconcile::merge(&self.messages, Incoming::Push(message));
            }
            ChannelEvent::Push {
                event: ServerEvent::UserTyping { peer_id, is_typing },
                ..
            } => {
                if peer_id == self.support_id {
                    self.support_typing = is_typing;
                }
            }
            ChannelEvent::Push { .. } => {}
            ChannelEvent::Connected { .. } => {
                // the snapshot is the source of truth after a reconnect
                if !self.connected && self.phase == BuyerPhase::Ready {
                    self.stale = true;
                }
                self.connected = true;
            }
            ChannelEvent::Disconnected { .. } => {
                self.connected = false;
                self.support_typing = false;
            }
            ChannelEvent::Error { .. } => {}
        }
    }

    pub fn poll_timers(&mut self, now: Instant) {
        if self.typing.fire(now) {
            self.emit_best_effort(ClientEvent::StopTyping {
                peer_id: self.support_id.clone(),
            });
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.typing.deadline()
    }

    /// Leave the room, clear timers and stop reacting to late events
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.stop_typing();
        self.active = false;
        self.channel.release();
        info!("Buyer view for {} deactivated", self.principal.id);
    }

    /// Drive the view until the host sends `Deactivate` or drops the sender.
    /// Dropping this future aborts an in-flight REST call.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<BuyerCommand>) {
        self.activate().await;
        while self.step(&mut commands).await {}
        self.deactivate();
    }

    /// Handle one command, channel event or timer. Returns `false` once the
    /// host is done with the view.
    pub async fn step(&mut self, commands: &mut mpsc::UnboundedReceiver<BuyerCommand>) -> bool {
        let deadline = self.next_deadline();
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            event = self.channel.recv() => Step::Channel(event),
            _ = wait_until(deadline) => Step::Timer,
        };
        match step {
            Step::Command(None) | Step::Command(Some(BuyerCommand::Deactivate)) => return false,
            Step::Command(Some(command)) => self.apply(command).await,
            Step::Channel(Some(event)) => self.handle_event(event),
            Step::Channel(None) => return false,
            Step::Timer => self.poll_timers(Instant::now()),
        }
        if self.stale {
            self.load_history().await;
        }
        true
    }

    async fn apply(&mut self, command: BuyerCommand) {
        match command {
            BuyerCommand::SetDraft(text) => self.set_draft(text),
            BuyerCommand::Keystroke => self.keystroke(Instant::now()),
            BuyerCommand::Send => {
                // outcome is already reflected in send_error / draft
                let _ = self.send().await;
            }
            BuyerCommand::RetryHistory => self.load_history().await,
            BuyerCommand::Deactivate => self.deactivate(),
        }
    }

    fn stop_typing(&mut self) {
        if self.typing.is_armed() {
            self.typing.cancel();
            self.emit_best_effort(ClientEvent::StopTyping {
                peer_id: self.support_id.clone(),
            });
        }
    }

    fn emit_best_effort(&self, event: ClientEvent) {
        if let Err(e) = self.channel.emit(event) {
            debug!("Typing signal dropped: {}", e);
        }
    }

    fn write_cache(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&self.support_id, &self.messages) {
                warn!("Could not update conversation cache: {}", e);
            }
        }
    }
}
