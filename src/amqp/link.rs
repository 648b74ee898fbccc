use std::collections::BTreeMap;
use std::time::Instant;

use fe2o3_amqp_types::definitions::{ReceiverSettleMode, SenderSettleMode};

use super::message::AmqpMessage;

/// Mirrors the subset of a real AMQP 1.0 library's link/sender/receiver
/// state enums that `process_state_changes` reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Opening,
    Open,
    Closing,
    Error,
}

/// The application's disposition decision for an inbound delivery, or the
/// messenger's own synthesized disposition on allocation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDisposition {
    Accepted,
    Rejected { reason: String },
    Released,
}

/// Outcome of a single outbound send as reported by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    Error,
}

/// Invoked by the library exactly once per `SenderLink::send` call, on the
/// same thread that drives `do_work` (§5: no internal threads or timers).
pub type SendCompletion = Box<dyn FnOnce(SendOutcome)>;

/// Invoked by the library for every inbound delivery on a receiver link,
/// with the delivery number and link name needed to build
/// [`crate::InboundDispositionInfo`]. Returning `None` means the messenger
/// should not emit a disposition response for this delivery (the
/// application returned `DispositionResult::None` and may dispose of it
/// later through [`ReceiverLink::dispose`]).
pub type OnMessage = Box<dyn FnMut(AmqpMessage, u64, String) -> Option<MessageDisposition>>;

/// Parameters used to attach either half of a link pair.
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub name: String,
    pub source: String,
    pub target: String,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub max_message_size: u64,
    pub attach_properties: BTreeMap<String, String>,
}

/// The sender half of a link pair.
pub trait SenderLink {
    fn state(&self) -> LinkState;
    fn last_state_change(&self) -> Instant;
    /// Enqueues `message` with the underlying library. A `Err` return means
    /// the send failed synchronously and `completion` will never be
    /// invoked; otherwise `completion` fires exactly once with the
    /// eventual outcome.
    fn send(&mut self, message: AmqpMessage, completion: SendCompletion) -> Result<(), String>;
    fn close(&mut self);
}

/// The receiver half of a link pair.
pub trait ReceiverLink {
    fn state(&self) -> LinkState;
    fn last_state_change(&self) -> Instant;
    /// Installs the bridge the library calls for every inbound delivery.
    fn set_on_message(&mut self, callback: OnMessage);
    /// Submits a (possibly deferred) disposition for a previously delivered
    /// message, keyed by delivery number.
    fn dispose(&mut self, delivery_id: u64, disposition: MessageDisposition) -> Result<(), String>;
    fn close(&mut self);
}

/// The AMQP session the messenger attaches its link pair to. Borrowed, not
/// owned: it must outlive the messenger while started.
pub trait Session {
    fn create_sender_link(&mut self, params: LinkParams) -> Result<Box<dyn SenderLink>, String>;
    fn create_receiver_link(
        &mut self,
        params: LinkParams,
    ) -> Result<Box<dyn ReceiverLink>, String>;
}
