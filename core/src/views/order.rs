/// Order tracking view: live status feed for one order
use crate::error::SyncError;
use crate::rest::HistoryApi;
use crate::transport::{ChannelEvent, ChannelHandle, Room, ServerEvent, TransportChannel};
use crate::types::{OrderSnapshot, OrderStatus, OrderStatusEvent};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderPhase {
    Loading,
    Tracking,
    /// Blocking error state; the host offers a way back
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Complete,
    Current,
    NotReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressStep {
    pub status: OrderStatus,
    pub state: StepState,
}

/// Host input for `OrderTrackingView::run`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderCommand {
    Retry,
    Deactivate,
}

enum Step {
    Command(Option<OrderCommand>),
    Channel(Option<ChannelEvent>),
}

pub struct OrderTrackingView {
    order_id: String,
    channel: ChannelHandle,
    api: Arc<dyn HistoryApi>,
    phase: OrderPhase,
    status: Option<OrderStatus>,
    updated_at: Option<DateTime<Utc>>,
    history: Vec<OrderStatusEvent>,
    connected: bool,
    active: bool,
}

impl OrderTrackingView {
    pub fn new(order_id: &str, channel: &TransportChannel, api: Arc<dyn HistoryApi>) -> Self {
        Self {
            order_id: order_id.trim().to_string(),
            connected: channel.is_connected(),
            channel: channel.handle(&format!("order:{}", order_id.trim())),
            api,
            phase: OrderPhase::Loading,
            status: None,
            updated_at: None,
            history: Vec::new(),
            active: false,
        }
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn phase(&self) -> &OrderPhase {
        &self.phase
    }

    pub fn status(&self) -> Option<OrderStatus> {
        self.status
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn history(&self) -> &[OrderStatusEvent] {
        &self.history
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub async fn activate(&mut self) {
        if self.active {
            return;
        }
        if self.order_id.is_empty() {
            self.phase = OrderPhase::Failed {
                message: "This order could not be identified.".to_string(),
            };
            return;
        }
        self.active = true;
        self.channel.subscribe(Room::Order(self.order_id.clone()));
        self.load().await;
    }

    /// Fetch the snapshot; it replaces the shown status. Pushes that arrive
    /// during the fetch stay queued on the handle and apply after it.
    pub async fn load(&mut self) {
        if !self.active {
            return;
        }
        if self.status.is_none() {
            self.phase = OrderPhase::Loading;
        }
        match self.api.fetch_order(&self.order_id).await {
            Ok(snapshot) => {
                if self.active {
                    self.apply_snapshot(snapshot);
                }
            }
            Err(e) => {
                if !self.active {
                    return;
                }
                warn!("Order {} unavailable: {}", self.order_id, e);
                self.phase = OrderPhase::Failed {
                    message: e.user_message(),
                };
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: OrderSnapshot) {
        let mut history = snapshot.history;
        for pushed in &self.history {
            if !history.contains(pushed) {
                history.push(pushed.clone());
            }
        }
        history.sort_by_key(|e| e.occurred_at);
        self.history = history;

        self.status = Some(snapshot.status);
        self.updated_at = Some(snapshot.updated_at);
        self.phase = OrderPhase::Tracking;
        info!("Tracking order {} at {:?}", self.order_id, self.status);
    }

    pub fn handle_event(&mut self, event: ChannelEvent) {
        if !self.active {
            return;
        }
        match event {
            ChannelEvent::Push {
                event:
                    ServerEvent::OrderStatusUpdate {
                        order_id,
                        status,
                        occurred_at,
                    },
                ..
            } => {
                if order_id.as_deref().is_some_and(|id| id != self.order_id) {
                    debug!("Ignoring status for another order");
                    return;
                }
                self.on_status(status, occurred_at);
            }
            ChannelEvent::Push { .. } => {}
            ChannelEvent::Connected { .. } => self.connected = true,
            ChannelEvent::Disconnected { .. } => self.connected = false,
            ChannelEvent::Error { .. } => {}
        }
    }

    /// Last observed wins: every push replaces the shown status
    fn on_status(&mut self, status: OrderStatus, occurred_at: Option<DateTime<Utc>>) {
        if let Some(current) = self.status {
            if !current.can_transition_to(status) {
                warn!(
                    "Order {} moved {} -> {}, showing it anyway",
                    self.order_id, current, status
                );
            }
        }
        // display only, never compared against server time
        let occurred_at = occurred_at.unwrap_or_else(Utc::now);
        self.history.push(OrderStatusEvent {
            order_id: self.order_id.clone(),
            status,
            occurred_at,
        });
        self.status = Some(status);
        self.updated_at = Some(occurred_at);
        if self.phase == OrderPhase::Loading {
            self.phase = OrderPhase::Tracking;
        }
    }

    /// One step per status. Cancelled is shown as a terminal step after the
    /// forward track.
    pub fn progress(&self) -> Vec<ProgressStep> {
        let Some(current) = self.status else {
            return Vec::new();
        };
        // cancelled: whatever the history shows was reached before it
        let reached_before_cancel = self.history.iter().filter_map(|e| e.status.rank()).max();

        let mut steps: Vec<ProgressStep> = OrderStatus::TRACK
            .iter()
            .enumerate()
            .map(|(rank, status)| {
                let state = match current.rank() {
                    Some(cur) if rank < cur => StepState::Complete,
                    Some(cur) if rank == cur => StepState::Current,
                    Some(_) => StepState::NotReached,
                    None if reached_before_cancel.is_some_and(|r| rank <= r) => StepState::Complete,
                    None => StepState::NotReached,
                };
                ProgressStep {
                    status: *status,
                    state,
                }
            })
            .collect();
        steps.push(ProgressStep {
            status: OrderStatus::Cancelled,
            state: if current == OrderStatus::Cancelled {
                StepState::Current
            } else {
                StepState::NotReached
            },
        });
        steps
    }

    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.channel.release();
        info!("Stopped tracking order {}", self.order_id);
    }

    /// Drive the view until the host sends `Deactivate` or drops the sender
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<OrderCommand>) {
        self.activate().await;
        while self.step(&mut commands).await {}
        self.deactivate();
    }

    /// Handle one command or channel event. Returns `false` once the host is
    /// done with the view.
    pub async fn step(&mut self, commands: &mut mpsc::UnboundedReceiver<OrderCommand>) -> bool {
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            event = self.channel.recv() => Step::Channel(event),
        };
        match step {
            Step::Command(None) | Step::Command(Some(OrderCommand::Deactivate)) => false,
            Step::Command(Some(OrderCommand::Retry)) => {
                self.load().await;
                true
            }
            Step::Channel(Some(event)) => {
                self.handle_event(event);
                true
            }
            Step::Channel(None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_states(view: &OrderTrackingView) -> Vec<(OrderStatus, StepState)> {
        view.progress().iter().map(|s| (s.status, s.state)).collect()
    }

    struct NoApi;

    #[async_trait::async_trait]
    impl HistoryApi for NoApi {
        async fn fetch_history(&self, _: Option<&str>) -> crate::Result<Vec<crate::Message>> {
            Ok(Vec::new())
        }
        async fn send_message(&self, _: &str, _: &str) -> crate::Result<crate::Message> {
            Err(SyncError::Send("unused".into()))
        }
        async fn fetch_order(&self, id: &str) -> crate::Result<OrderSnapshot> {
            Err(SyncError::OrderNotFound(id.to_string()))
        }
    }

    fn view_at(status: OrderStatus, history: &[OrderStatus]) -> OrderTrackingView {
        let channel = TransportChannel::new(crate::Config::default());
        let mut view = OrderTrackingView::new("ORD-1", &channel, Arc::new(NoApi));
        view.status = Some(status);
        view.history = history
            .iter()
            .map(|s| OrderStatusEvent {
                order_id: "ORD-1".into(),
                status: *s,
                occurred_at: Utc::now(),
            })
            .collect();
        view
    }

    #[test]
    fn test_progress_for_shipped() {
        let view = view_at(OrderStatus::Shipped, &[]);
        assert_eq!(
            step_states(&view),
            vec![
                (OrderStatus::Pending, StepState::Complete),
                (OrderStatus::Processing, StepState::Complete),
                (OrderStatus::Shipped, StepState::Current),
                (OrderStatus::Delivered, StepState::NotReached),
                (OrderStatus::Cancelled, StepState::NotReached),
            ]
        );
    }

    #[test]
    fn test_progress_for_cancelled_keeps_reached_steps() {
        let view = view_at(
            OrderStatus::Cancelled,
            &[OrderStatus::Pending, OrderStatus::Processing, OrderStatus::Cancelled],
        );
        assert_eq!(
            step_states(&view),
            vec![
                (OrderStatus::Pending, StepState::Complete),
                (OrderStatus::Processing, StepState::Complete),
                (OrderStatus::Shipped, StepState::NotReached),
                (OrderStatus::Delivered, StepState::NotReached),
                (OrderStatus::Cancelled, StepState::Current),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_order_id_is_blocking() {
        let channel = TransportChannel::new(crate::Config::default());
        let mut view = OrderTrackingView::new("  ", &channel, Arc::new(NoApi));
        view.activate().await;
        assert!(matches!(view.phase(), OrderPhase::Failed { .. }));
        assert!(!view.is_active());
    }
}
