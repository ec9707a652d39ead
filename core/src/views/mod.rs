/// View state machines driven by one task each
///
/// A view owns a `ChannelHandle`, talks to the REST collaborator through
/// `HistoryApi`, and is stepped by its `run` loop: commands from the host,
/// channel events and timer deadlines are handled one at a time, each as a
/// transform of the view's current state.
pub mod buyer;
pub mod operator;
pub mod order;

pub use buyer::{BuyerCommand, BuyerPhase, BuyerView};
pub use operator::{derive_roster, OperatorCommand, OperatorView, RosterEntry, Selection};
pub use order::{OrderCommand, OrderPhase, OrderTrackingView, ProgressStep, StepState};
