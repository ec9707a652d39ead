/// Operator conversation view: roster of buyers plus one detail pane
///
/// Selection is either empty or one peer. Entering a peer joins its chat room
/// and replaces the detail buffer with that peer's REST history; leaving it
/// releases the room. A message from any peer other than the selected one
/// forces the selection over to that peer and raises a timed notice.
use crate::error::{Result, SyncError};
use crate::identity::Principal;
use crate::reconcile::{self, EchoOutcome, Incoming};
use crate::rest::HistoryApi;
use crate::transport::{ChannelEvent, ChannelHandle, ClientEvent, Room, ServerEvent, TransportChannel};
use crate::types::{display_name_for, Conversation, DeliveryState, Message};
use crate::utils::{earliest, wait_until, Debounce};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const PREVIEW_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    None,
    Selecting(String),
}

impl Selection {
    pub fn peer(&self) -> Option<&str> {
        match self {
            Selection::None => None,
            Selection::Selecting(peer) => Some(peer),
        }
    }
}

/// One conversation partner in the operator's roster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub peer_id: String,
    pub display_name: String,
    pub preview: String,
    pub last_activity_at: DateTime<Utc>,
    pub is_typing: bool,
}

/// Host input for `OperatorView::run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Select(String),
    SetDraft(String),
    Keystroke,
    Send,
    Retry(String),
    Search(String),
    RefreshRoster,
    Deactivate,
}

enum Step {
    Command(Option<OperatorCommand>),
    Channel(Option<ChannelEvent>),
    Timer,
}

/// Build the roster from a full history snapshot: one entry per counterpart,
/// previewing its most recent message, most recent activity first.
pub fn derive_roster(self_id: &str, messages: &[Message]) -> Vec<RosterEntry> {
    let mut roster: Vec<RosterEntry> = Vec::new();
    for message in messages {
        patch_roster(&mut roster, self_id, message);
    }
    sort_roster(&mut roster);
    roster
}

fn sort_roster(roster: &mut [RosterEntry]) {
    roster.sort_by(|a, b| {
        b.last_activity_at
            .cmp(&a.last_activity_at)
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    });
}

/// Insert or refresh the roster entry for `message`'s counterpart. Does not sort.
fn patch_roster(roster: &mut Vec<RosterEntry>, self_id: &str, message: &Message) {
    let peer_id = message.counterpart(self_id);
    if peer_id == self_id {
        return;
    }
    match roster.iter_mut().find(|e| e.peer_id == peer_id) {
        Some(entry) => {
            if message.created_at >= entry.last_activity_at {
                entry.last_activity_at = message.created_at;
                entry.preview = message.preview(PREVIEW_CHARS);
            }
            if entry.display_name == entry.peer_id {
                entry.display_name = display_name_for(peer_id, message);
            }
        }
        None => roster.push(RosterEntry {
            peer_id: peer_id.to_string(),
            display_name: display_name_for(peer_id, message),
            preview: message.preview(PREVIEW_CHARS),
            last_activity_at: message.created_at,
            is_typing: false,
        }),
    }
}

pub struct OperatorView {
    principal: Principal,
    channel: ChannelHandle,
    api: Arc<dyn HistoryApi>,
    echo_window: Duration,
    echo_timeout: Duration,
    active: bool,
    connected: bool,
    stale: bool,

    roster: Vec<RosterEntry>,
    roster_loading: bool,
    roster_error: Option<String>,
    search_query: String,
    applied_filter: String,
    search: Debounce,

    selection: Selection,
    messages: Vec<Message>,
    history_loading: bool,
    history_error: Option<String>,
    /// Unconfirmed messages of peers that are not selected right now
    unsent: HashMap<String, Vec<Message>>,
    /// Placeholder id -> when it was emitted
    awaiting_echo: HashMap<String, Instant>,
    send_error: Option<String>,
    draft: String,

    auto_selected: bool,
    auto_notice: Debounce,
    typing: Debounce,
    typing_peer: Option<String>,
}

impl OperatorView {
    pub fn new(principal: Principal, channel: &TransportChannel, api: Arc<dyn HistoryApi>) -> Self {
        let config = channel.config();
        Self {
            echo_window: config.echo_window,
            echo_timeout: config.echo_timeout,
            search: Debounce::new(config.search_debounce),
            auto_notice: Debounce::new(config.auto_select_notice),
            typing: Debounce::new(config.typing_stop_delay),
            connected: channel.is_connected(),
            channel: channel.handle(&format!("operator:{}", principal.id)),
            principal,
            api,
            active: false,
            stale: false,
            roster: Vec::new(),
            roster_loading: false,
            roster_error: None,
            search_query: String::new(),
            applied_filter: String::new(),
            selection: Selection::None,
            messages: Vec::new(),
            history_loading: false,
            history_error: None,
            unsent: HashMap::new(),
            awaiting_echo: HashMap::new(),
            send_error: None,
            draft: String::new(),
            auto_selected: false,
            typing_peer: None,
        }
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn self_id(&self) -> &str {
        &self.principal.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The selected conversation as shown in the detail pane
    pub fn conversation(&self) -> Option<Conversation> {
        let peer_id = self.selection.peer()?;
        let display_name = self
            .roster
            .iter()
            .find(|e| e.peer_id == peer_id)
            .map_or_else(|| peer_id.to_string(), |e| e.display_name.clone());
        let mut conversation = Conversation {
            peer_id: peer_id.to_string(),
            peer_display_name: display_name,
            messages: self.messages.clone(),
            last_activity_at: None,
        };
        conversation.last_activity_at = conversation.last_message().map(|m| m.created_at);
        Some(conversation)
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    /// Roster entries matching the applied (debounced) search filter
    pub fn visible_roster(&self) -> Vec<&RosterEntry> {
        if self.applied_filter.is_empty() {
            return self.roster.iter().collect();
        }
        self.roster
            .iter()
            .filter(|e| {
                e.display_name.to_lowercase().contains(&self.applied_filter)
                    || e.peer_id.to_lowercase().contains(&self.applied_filter)
            })
            .collect()
    }

    pub fn is_auto_selected(&self) -> bool {
        self.auto_selected
    }

    pub fn is_peer_typing(&self, peer_id: &str) -> bool {
        self.roster
            .iter()
            .any(|e| e.peer_id == peer_id && e.is_typing)
    }

    /// Whether this operator is currently shown as typing to `peer_id`
    pub fn is_typing_to(&self, peer_id: &str) -> bool {
        self.typing.is_armed() && self.typing_peer.as_deref() == Some(peer_id)
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn roster_loading(&self) -> bool {
        self.roster_loading
    }

    pub fn roster_error(&self) -> Option<&str> {
        self.roster_error.as_deref()
    }

    pub fn history_loading(&self) -> bool {
        self.history_loading
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

    /// Join the operator inbox and build the roster from the full snapshot
    pub async fn activate(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.channel.subscribe(Room::Admin);
        self.refresh_roster().await;
    }

    pub async fn refresh_roster(&mut self) {
        self.roster_loading = true;
        let result = self.api.fetch_history(None).await;
        self.roster_loading = false;
        if !self.active {
            return;
        }
        match result {
            Ok(snapshot) => {
                let mut roster = derive_roster(&self.principal.id, &snapshot);
                // keep what pushes taught us since the snapshot was taken
                for entry in &self.roster {
                    if let Some(fresh) = roster.iter_mut().find(|e| e.peer_id == entry.peer_id) {
                        fresh.is_typing = entry.is_typing;
                        if entry.last_activity_at > fresh.last_activity_at {
                            fresh.last_activity_at = entry.last_activity_at;
                            fresh.preview = entry.preview.clone();
                        }
                    } else {
                        roster.push(entry.clone());
                    }
                }
                sort_roster(&mut roster);
                self.roster = roster;
                self.roster_error = None;
                info!("Roster loaded with {} peers", self.roster.len());
            }
            Err(e) => {
                warn!("Roster load failed: {}", e);
                self.roster_error = Some(e.user_message());
            }
        }
    }

    /// Explicit roster click
    pub async fn select(&mut self, peer_id: &str) {
        self.auto_selected = false;
        self.auto_notice.cancel();
        self.enter_peer(peer_id).await;
    }

    async fn enter_peer(&mut self, peer_id: &str) {
        if !self.active || self.selection.peer() == Some(peer_id) {
            return;
        }
        self.leave_selected();

        self.selection = Selection::Selecting(peer_id.to_string());
        self.messages = self.unsent.remove(peer_id).unwrap_or_default();
        self.history_error = None;
        self.channel.subscribe(Room::Chat(peer_id.to_string()));
        self.load_selected_history().await;
    }

    /// Release the selected peer's room and park its unconfirmed messages
    fn leave_selected(&mut self) {
        let Selection::Selecting(prev) = std::mem::replace(&mut self.selection, Selection::None) else {
            return;
        };
        if self.typing_peer.as_deref() == Some(prev.as_str()) {
            self.stop_typing();
        }
        self.channel.unsubscribe(&Room::Chat(prev.clone()));
        let unconfirmed: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|m| m.delivery_state != DeliveryState::Confirmed)
            .collect();
        if !unconfirmed.is_empty() {
            self.unsent.insert(prev, unconfirmed);
        }
    }

    async fn load_selected_history(&mut self) {
        let Some(peer_id) = self.selection.peer().map(str::to_string) else {
            return;
        };
        self.history_loading = true;
        let result = self.api.fetch_history(Some(&peer_id)).await;
        self.history_loading = false;

        if !self.active || self.selection.peer() != Some(peer_id.as_str()) {
            return;
        }
        match result {
            Ok(snapshot) => {
                self.messages = reconcile::merge(
                    &self.messages,
                    Incoming::Snapshot {
                        messages: snapshot,
                        window: self.echo_window,
                    },
                );
                let known: HashSet<String> = self
                    .messages
                    .iter()
                    .chain(self.unsent.values().flatten())
                    .map(|m| m.id.clone())
                    .collect();
                self.awaiting_echo.retain(|id, _| known.contains(id));
            }
            Err(e) => {
                warn!("History for {} failed: {}", peer_id, e);
                self.history_error = Some(e.user_message());
            }
        }
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    /// Emit `typing` to the selected peer and (re)arm the `stop_typing` timer
    pub fn keystroke(&mut self, now: Instant) {
        let Some(peer_id) = self.selection.peer().map(str::to_string) else {
            return;
        };
        if !self.active {
            return;
        }
        self.typing.touch(now);
        self.typing_peer = Some(peer_id.clone());
        self.emit_best_effort(ClientEvent::Typing { peer_id });
    }

    pub fn set_search(&mut self, query: impl Into<String>, now: Instant) {
        self.search_query = query.into();
        self.search.touch(now);
    }

    /// Append a pending placeholder and emit the send over the push channel
    pub fn send(&mut self, now: Instant) -> Result<()> {
        let Some(peer_id) = self.selection.peer().map(str::to_string) else {
            return Err(SyncError::Send("no conversation selected".to_string()));
        };
        let content = self.draft.trim().to_string();
        if content.is_empty() || !self.active {
            return Ok(());
        }
        self.draft.clear();
        self.stop_typing();

        let mut placeholder = Message::placeholder(&self.principal.id, &peer_id, &content, Utc::now());
        placeholder.sender_name = Some(self.principal.display_name.clone());
        let local_id = placeholder.id.clone();
        let client_key = placeholder.client_key.clone();

        patch_roster(&mut self.roster, &self.principal.id, &placeholder);
        sort_roster(&mut self.roster);
        self.messages = reconcile::merge_by_id(&self.messages, placeholder);

        self.emit_send(&local_id, peer_id, content, client_key, now)
    }

    /// Re-emit a failed message under its original client key
    pub fn retry(&mut self, local_id: &str, now: Instant) -> Result<()> {
        let Some(failed) = self
            .messages
            .iter()
            .find(|m| m.id == local_id && m.delivery_state == DeliveryState::Failed)
            .cloned()
        else {
            return Err(SyncError::Send(format!("no failed message {}", local_id)));
        };
        self.messages = reconcile::mark_pending(&self.messages, local_id);
        self.emit_send(
            local_id,
            failed.recipient_id,
            failed.content,
            failed.client_key,
            now,
        )
    }

    fn emit_send(
        &mut self,
        local_id: &str,
        recipient_id: String,
        content: String,
        client_key: Option<String>,
        now: Instant,
    ) -> Result<()> {
        let event = ClientEvent::SendMessage {
            recipient_id,
            content,
            client_key,
        };
        match self.channel.emit(event) {
            Ok(()) => {
                self.send_error = None;
                self.awaiting_echo.insert(local_id.to_string(), now);
                Ok(())
            }
            Err(e) => {
                warn!("Send of {} failed: {}", local_id, e);
                self.messages = reconcile::mark_failed(&self.messages, local_id);
                self.send_error = Some(e.user_message());
                Err(e)
            }
        }
    }

    pub async fn handle_event(&mut self, event: ChannelEvent, now: Instant) {
        if !self.active {
            return;
        }
        match event {
            ChannelEvent::Push {
                event: ServerEvent::NewMessage { message },
                ..
            } => self.on_message(message, now).await,
            ChannelEvent::Push {
                event: ServerEvent::UserTyping { peer_id, is_typing },
                ..
            } => {
                if let Some(entry) = self.roster.iter_mut().find(|e| e.peer_id == peer_id) {
                    entry.is_typing = is_typing;
                }
            }
            ChannelEvent::Push { .. } => {}
            ChannelEvent::Connected { .. } => {
                if !self.connected {
                    self.stale = true;
                }
                self.connected = true;
            }
            ChannelEvent::Disconnected { .. } => {
                self.connected = false;
                for entry in &mut self.roster {
                    entry.is_typing = false;
                }
            }
            ChannelEvent::Error { .. } => {}
        }
    }

    async fn on_message(&mut self, message: Message, now: Instant) {
        patch_roster(&mut self.roster, &self.principal.id, &message);
        sort_roster(&mut self.roster);

        if message.sender_id == self.principal.id {
            self.on_echo(message);
            return;
        }

        let peer_id = message.sender_id.clone();
        if let Some(entry) = self.roster.iter_mut().find(|e| e.peer_id == peer_id) {
            entry.is_typing = false;
        }
        if self.selection.peer() != Some(peer_id.as_str()) {
            info!("Auto-selecting {} on new message", peer_id);
            self.enter_peer(&peer_id).await;
            self.auto_selected = true;
            self.auto_notice.touch(now);
        }
        self.messages = reconcile::merge(&self.messages, Incoming::Push(message));
    }

    fn on_echo(&mut self, echo: Message) {
        let peer_id = echo.recipient_id.clone();
        if self.selection.peer() == Some(peer_id.as_str()) {
            let (next, outcome) = reconcile::reconcile_echo(&self.messages, echo, self.echo_window);
            self.messages = next;
            if let EchoOutcome::Replaced { local_id } = outcome {
                self.awaiting_echo.remove(&local_id);
            }
            return;
        }
        // echo for a parked conversation
        if let Some(parked) = self.unsent.get_mut(&peer_id) {
            let (next, outcome) = reconcile::reconcile_echo(parked, echo, self.echo_window);
            if let EchoOutcome::Replaced { local_id } = outcome {
                self.awaiting_echo.remove(&local_id);
                *parked = next
                    .into_iter()
                    .filter(|m| m.delivery_state != DeliveryState::Confirmed)
                    .collect();
            }
            if parked.is_empty() {
                self.unsent.remove(&peer_id);
            }
        }
    }

    pub fn poll_timers(&mut self, now: Instant) {
        if self.typing.fire(now) {
            if let Some(peer_id) = self.typing_peer.take() {
                self.emit_best_effort(ClientEvent::StopTyping { peer_id });
            }
        }
        if self.auto_notice.fire(now) {
            self.auto_selected = false;
        }
        if self.search.fire(now) {
            self.applied_filter = self.search_query.trim().to_lowercase();
        }

        let expired: Vec<String> = self
            .awaiting_echo
            .iter()
            .filter(|(_, since)| **since + self.echo_timeout <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for local_id in expired {
            debug!("No echo for {}, marking failed", local_id);
            self.awaiting_echo.remove(&local_id);
            self.messages = reconcile::mark_failed(&self.messages, &local_id);
            for parked in self.unsent.values_mut() {
                *parked = reconcile::mark_failed(parked, &local_id);
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let echo_deadline = self
            .awaiting_echo
            .values()
            .min()
            .map(|since| *since + self.echo_timeout);
        earliest([
            self.typing.deadline(),
            self.auto_notice.deadline(),
            self.search.deadline(),
            echo_deadline,
        ])
    }

    /// Leave every room, clear timers and stop reacting to late events
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.stop_typing();
        self.leave_selected();
        self.auto_notice.cancel();
        self.search.cancel();
        self.auto_selected = false;
        self.awaiting_echo.clear();
        self.active = false;
        self.channel.release();
        info!("Operator view for {} deactivated", self.principal.id);
    }

    /// Drive the view until the host sends `Deactivate` or drops the sender.
    /// Dropping this future aborts an in-flight REST call.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<OperatorCommand>) {
        self.activate().await;
        while self.step(&mut commands).await {}
        self.deactivate();
    }

    /// Handle one command, channel event or timer. Returns `false` once the
    /// host is done with the view.
    pub async fn step(&mut self, commands: &mut mpsc::UnboundedReceiver<OperatorCommand>) -> bool {
        let deadline = self.next_deadline();
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            event = self.channel.recv() => Step::Channel(event),
            _ = wait_until(deadline) => Step::Timer,
        };
        match step {
            Step::Command(None) | Step::Command(Some(OperatorCommand::Deactivate)) => return false,
            Step::Command(Some(command)) => self.apply(command).await,
            Step::Channel(Some(event)) => self.handle_event(event, Instant::now()).await,
            Step::Channel(None) => return false,
            Step::Timer => self.poll_timers(Instant::now()),
        }
        if self.stale {
            self.stale = false;
            self.refresh_roster().await;
            self.load_selected_history().await;
        }
        true
    }

    async fn apply(&mut self, command: OperatorCommand) {
        let now = Instant::now();
        match command {
            OperatorCommand::Select(peer_id) => self.select(&peer_id).await,
            OperatorCommand::SetDraft(text) => self.set_draft(text),
            OperatorCommand::Keystroke => self.keystroke(now),
            // failures are reflected as `failed` messages and send_error
            OperatorCommand::Send => {
                let _ = self.send(now);
            }
            OperatorCommand::Retry(local_id) => {
                let _ = self.retry(&local_id, now);
            }
            OperatorCommand::Search(query) => self.set_search(query, now),
            OperatorCommand::RefreshRoster => self.refresh_roster().await,
            OperatorCommand::Deactivate => self.deactivate(),
        }
    }

    fn stop_typing(&mut self) {
        if self.typing.is_armed() {
            self.typing.cancel();
            if let Some(peer_id) = self.typing_peer.take() {
                self.emit_best_effort(ClientEvent::StopTyping { peer_id });
            }
        }
    }

    fn emit_best_effort(&self, event: ClientEvent) {
        if let Err(e) = self.channel.emit(event) {
            debug!("Typing signal dropped: {}", e);
        }
    }
}
