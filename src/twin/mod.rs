//! The twin messenger (§4.2): request/response + subscription protocol
//! layered over [`crate::AmqpMessenger`], multiplexing PATCH/GET/PUT/DELETE
//! operations by correlation id and driving the twin subscription state
//! machine.

mod wire;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use wire::TwinOperation;

use crate::clock::Clock;
use crate::config::{LinkConfig, MessengerConfig};
use crate::error::MessengerError;
use crate::messenger::{
    AmqpMessenger, DispositionResult, SendCompleteCallback, SendReason, SendResult, SendStatus,
};

/// Mirrors [`crate::MessengerState`] one-for-one (§3).
pub type TwinState = crate::MessengerState;

const DEFAULT_MAX_SUBSCRIPTION_ERROR_COUNT: u32 = 3;
/// Shared with the underlying messenger's default send-enqueue timeout
/// (§9 `process_timeouts`).
const OP_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] crate::ConfigError),

    #[error(transparent)]
    Messenger(#[from] MessengerError),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// `GET complete properties → PUT subscribe for updates → SUBSCRIBED`, with
/// a parallel unsubscribe path (§3, §4.2.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinSubscriptionState {
    NotSubscribed,
    GetCompleteProperties,
    GettingCompleteProperties,
    SubscribeForUpdates,
    Subscribing,
    Subscribed,
    Unsubscribe,
    Unsubscribing,
}

/// Outcome reported to a `report_state_async` completion callback (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinReportStateResult {
    Success,
    Cancelled,
    Error,
}

/// Why a PATCH did not simply succeed (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinReportStateReason {
    None,
    FailSending,
    Timeout,
    MessengerDestroyed,
    InvalidResponse,
}

/// Whether a desired-properties delivery is the full document or an
/// incremental update (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinUpdateType {
    Complete,
    Partial,
}

/// Immutable twin identity, cloned in full by `create` (§3).
#[derive(Debug, Clone)]
pub struct TwinMessengerConfig {
    pub client_version: String,
    pub device_id: String,
    pub iothub_host_fqdn: String,
}

type PatchCompleteCallback = Box<dyn FnOnce(TwinReportStateResult, TwinReportStateReason, u32)>;
type DeltaCallback = Box<dyn FnMut(TwinUpdateType, Option<&[u8]>)>;

struct TwinOpContext {
    operation: TwinOperation,
    correlation_id: String,
    patch_complete: Option<PatchCompleteCallback>,
    created_at: std::time::Instant,
}

struct SubscriptionTracker {
    state: TwinSubscriptionState,
    error_count: u32,
}

/// Owns an [`AmqpMessenger`] configured for the twin link pair, an
/// in-flight operations list keyed by correlation id, and the subscription
/// state machine (§4.2).
pub struct TwinMessenger {
    #[allow(dead_code)]
    client_version: String,
    #[allow(dead_code)]
    device_id: String,
    #[allow(dead_code)]
    fqdn: String,
    state: TwinState,
    max_subscription_error_count: u32,

    subscription: Rc<RefCell<SubscriptionTracker>>,
    delta_callback: Rc<RefCell<Option<DeltaCallback>>>,
    operations: Rc<RefCell<Vec<TwinOpContext>>>,

    messenger: AmqpMessenger,
    clock: Box<dyn Clock>,
}

impl TwinMessenger {
    /// Builds the twin attach-properties (§4.2.1), the underlying
    /// [`AmqpMessenger`] for the `"twin/"` link pair, and an empty
    /// operations list (§4.2.3).
    pub fn create(config: TwinMessengerConfig, clock: impl Clock + Clone + 'static) -> Result<Self, TwinError> {
        if config.client_version.is_empty() {
            return Err(TwinError::InvalidArgument("client_version"));
        }
        if config.device_id.is_empty() {
            return Err(TwinError::InvalidArgument("device_id"));
        }
        if config.iothub_host_fqdn.is_empty() {
            return Err(TwinError::InvalidArgument("iothub_host_fqdn"));
        }

        let mut attach_properties = BTreeMap::new();
        attach_properties.insert(
            "com.microsoft:client-version".to_string(),
            config.client_version.clone(),
        );
        attach_properties.insert(
            "com.microsoft:channel-correlation-id".to_string(),
            format!("twin:{}", Uuid::new_v4()),
        );
        attach_properties.insert(
            "com.microsoft:api-version".to_string(),
            wire::API_VERSION.to_string(),
        );

        let messenger_config = MessengerConfig {
            client_version: config.client_version.clone(),
            device_id: config.device_id.clone(),
            iothub_host_fqdn: config.iothub_host_fqdn.clone(),
            send_link: LinkConfig::new("twin/", "twin/").with_attach_properties(attach_properties.clone()),
            receive_link: LinkConfig::new("twin/", "twin/").with_attach_properties(attach_properties),
        };
        let messenger = AmqpMessenger::create(messenger_config, clock.clone())?;

        Ok(TwinMessenger {
            client_version: config.client_version,
            device_id: config.device_id,
            fqdn: config.iothub_host_fqdn,
            state: TwinState::Stopped,
            max_subscription_error_count: DEFAULT_MAX_SUBSCRIPTION_ERROR_COUNT,
            subscription: Rc::new(RefCell::new(SubscriptionTracker {
                state: TwinSubscriptionState::NotSubscribed,
                error_count: 0,
            })),
            delta_callback: Rc::new(RefCell::new(None)),
            operations: Rc::new(RefCell::new(Vec::new())),
            messenger,
            clock: Box::new(clock),
        })
    }

    pub fn state(&self) -> TwinState {
        self.state
    }

    pub fn subscription_state(&self) -> TwinSubscriptionState {
        self.subscription.borrow().state
    }

    pub fn start(&mut self, session: Box<dyn crate::amqp::Session>) -> Result<(), TwinError> {
        self.messenger.start(session).map_err(TwinError::Messenger)
    }

    pub fn stop(&mut self) -> Result<(), TwinError> {
        self.messenger.stop().map_err(TwinError::Messenger)
    }

    /// Advances the subscription state machine, sweeps timed-out
    /// operations, then ticks the underlying messenger (§4.2.3): the
    /// subscription issue must run before the AMQP tick so a GET/PUT/DELETE
    /// it enqueues dispatches in the same `do_work` call.
    pub fn do_work(&mut self) {
        if self.state == TwinState::Started {
            self.advance_subscription();
        }

        self.process_timeouts();

        if self.subscription.borrow().error_count >= self.max_subscription_error_count {
            self.state = TwinState::Error;
            return;
        }

        self.messenger.do_work();
        if self.state != TwinState::Error {
            self.state = self.messenger.state();
        }
    }

    /// Creates a PATCH op with a fresh correlation id and sends it through
    /// the underlying messenger (§4.2.3).
    pub fn report_state_async(
        &mut self,
        data: &[u8],
        callback: impl FnOnce(TwinReportStateResult, TwinReportStateReason, u32) + 'static,
    ) -> Result<(), TwinError> {
        self.issue(TwinOperation::Patch, Some(data), Some(Box::new(callback)))
            .map(|_| ())
    }

    /// No-op if already subscribing/subscribed; otherwise installs the
    /// delta callback and starts the GET→PUT handshake (§4.2.3).
    pub fn subscribe(&mut self, callback: impl FnMut(TwinUpdateType, Option<&[u8]>) + 'static) {
        if self.subscription.borrow().state != TwinSubscriptionState::NotSubscribed {
            return;
        }
        *self.delta_callback.borrow_mut() = Some(Box::new(callback));
        let bridge = build_inbound_bridge(
            Rc::clone(&self.operations),
            Rc::clone(&self.subscription),
            Rc::clone(&self.delta_callback),
        );
        self.messenger.subscribe_for_messages(bridge);
        self.subscription.borrow_mut().state = TwinSubscriptionState::GetCompleteProperties;
    }

    pub fn unsubscribe(&mut self) {
        self.messenger.unsubscribe_for_messages();
        self.subscription.borrow_mut().state = TwinSubscriptionState::Unsubscribe;
        *self.delta_callback.borrow_mut() = None;
    }

    /// BUSY iff the operations list contains any PATCH (§4.2.3).
    pub fn get_send_status(&self) -> SendStatus {
        let busy = self
            .operations
            .borrow()
            .iter()
            .any(|op| op.operation == TwinOperation::Patch);
        if busy {
            SendStatus::Busy
        } else {
            SendStatus::Idle
        }
    }

    /// Cancels every pending op (PATCH fires once with
    /// `CANCELLED/MESSENGER_DESTROYED`; GET/PUT/DELETE are silently
    /// dropped) then destroys the underlying messenger (§4.2.6).
    pub fn destroy(self) {
        for op in self.operations.borrow_mut().drain(..) {
            if let Some(cb) = op.patch_complete {
                cb(TwinReportStateResult::Cancelled, TwinReportStateReason::MessengerDestroyed, 0);
            }
        }
        self.messenger.destroy();
    }

    fn issue(
        &mut self,
        operation: TwinOperation,
        body: Option<&[u8]>,
        patch_complete: Option<PatchCompleteCallback>,
    ) -> Result<String, TwinError> {
        let correlation_id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        self.operations.borrow_mut().push(TwinOpContext {
            operation,
            correlation_id: correlation_id.clone(),
            patch_complete,
            created_at: now,
        });

        let message = wire::build_request(operation, &correlation_id, body);
        let bridge = build_send_bridge(
            operation,
            correlation_id.clone(),
            Rc::clone(&self.operations),
            Rc::clone(&self.subscription),
        );

        if let Err(e) = self.messenger.send_async(message, bridge) {
            let removed = remove_op(&self.operations, &correlation_id);
            if let Some(op) = removed {
                if let Some(cb) = op.patch_complete {
                    cb(TwinReportStateResult::Error, TwinReportStateReason::FailSending, 0);
                }
            }
            return Err(TwinError::Messenger(e));
        }
        Ok(correlation_id)
    }

    fn process_timeouts(&mut self) {
        let now = self.clock.now();
        let max_age = Duration::from_secs(OP_TIMEOUT_SECS);
        let expired: Vec<TwinOpContext> = {
            let mut ops = self.operations.borrow_mut();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < ops.len() {
                if now.saturating_duration_since(ops[i].created_at) >= max_age {
                    expired.push(ops.remove(i));
                } else {
                    i += 1;
                }
            }
            expired
        };
        for op in expired {
            match op.operation {
                TwinOperation::Patch => {
                    if let Some(cb) = op.patch_complete {
                        cb(TwinReportStateResult::Error, TwinReportStateReason::Timeout, 0);
                    }
                }
                TwinOperation::Get => rollback(&self.subscription, TwinSubscriptionState::GetCompleteProperties),
                TwinOperation::Put => rollback(&self.subscription, TwinSubscriptionState::SubscribeForUpdates),
                TwinOperation::Delete => rollback(&self.subscription, TwinSubscriptionState::Unsubscribe),
            }
        }
    }

    fn advance_subscription(&mut self) {
        let current = self.subscription.borrow().state;
        match current {
            TwinSubscriptionState::GetCompleteProperties
                if self.issue(TwinOperation::Get, None, None).is_ok() =>
            {
                self.subscription.borrow_mut().state = TwinSubscriptionState::GettingCompleteProperties;
            }
            TwinSubscriptionState::SubscribeForUpdates
                if self.issue(TwinOperation::Put, None, None).is_ok() =>
            {
                self.subscription.borrow_mut().state = TwinSubscriptionState::Subscribing;
            }
            TwinSubscriptionState::Unsubscribe
                if self.issue(TwinOperation::Delete, None, None).is_ok() =>
            {
                self.subscription.borrow_mut().state = TwinSubscriptionState::Unsubscribing;
            }
            _ => {}
        }
    }
}

fn remove_op(operations: &Rc<RefCell<Vec<TwinOpContext>>>, correlation_id: &str) -> Option<TwinOpContext> {
    let mut ops = operations.borrow_mut();
    ops.iter()
        .position(|op| op.correlation_id == correlation_id)
        .map(|idx| ops.remove(idx))
}


fn rollback(subscription: &Rc<RefCell<SubscriptionTracker>>, next: TwinSubscriptionState) {
    let mut sub = subscription.borrow_mut();
    sub.state = next;
    sub.error_count += 1;
}

fn map_send_outcome(result: SendResult, reason: SendReason) -> (TwinReportStateResult, TwinReportStateReason) {
    match result {
        SendResult::Success => (TwinReportStateResult::Success, TwinReportStateReason::None),
        SendResult::Cancelled => (
            TwinReportStateResult::Cancelled,
            TwinReportStateReason::MessengerDestroyed,
        ),
        SendResult::Error => {
            let reason = match reason {
                SendReason::Timeout => TwinReportStateReason::Timeout,
                SendReason::MessengerDestroyed => TwinReportStateReason::MessengerDestroyed,
                SendReason::FailSending | SendReason::None => TwinReportStateReason::FailSending,
            };
            (TwinReportStateResult::Error, reason)
        }
    }
}

/// The AMQP-level send-completion bridge (§4.2.3 `report_state_async`,
/// §4.2.4 send-completion rollback). A `Success` here only means the
/// transport accepted the request; the op stays live awaiting the cloud's
/// correlated response.
fn build_send_bridge(
    operation: TwinOperation,
    correlation_id: String,
    operations: Rc<RefCell<Vec<TwinOpContext>>>,
    subscription: Rc<RefCell<SubscriptionTracker>>,
) -> SendCompleteCallback {
    Box::new(move |result, reason| {
        if matches!(result, SendResult::Success) {
            return;
        }
        let Some(op) = remove_op(&operations, &correlation_id) else {
            return;
        };
        match operation {
            TwinOperation::Patch => {
                if let Some(cb) = op.patch_complete {
                    let (twin_result, twin_reason) = map_send_outcome(result, reason);
                    cb(twin_result, twin_reason, 0);
                }
            }
            TwinOperation::Get => rollback(&subscription, TwinSubscriptionState::GetCompleteProperties),
            TwinOperation::Put => rollback(&subscription, TwinSubscriptionState::SubscribeForUpdates),
            TwinOperation::Delete => rollback(&subscription, TwinSubscriptionState::Unsubscribe),
        }
    })
}

/// The inbound-delivery bridge (§4.2.5). Always accepts; correlates
/// responses against the operations list, and routes uncorrelated bodies
/// to the delta callback as a partial update.
fn build_inbound_bridge(
    operations: Rc<RefCell<Vec<TwinOpContext>>>,
    subscription: Rc<RefCell<SubscriptionTracker>>,
    delta_callback: Rc<RefCell<Option<DeltaCallback>>>,
) -> impl FnMut(crate::amqp::AmqpMessage, crate::InboundDispositionInfo) -> DispositionResult + 'static {
    move |message, _info| {
        let response = wire::parse_response(&message);
        match response.correlation_id.clone() {
            Some(correlation_id) => match remove_op(&operations, &correlation_id) {
                Some(op) => handle_op_response(op, &response, &subscription, &delta_callback),
                None => log::warn!("twin response with unknown correlation id {correlation_id}"),
            },
            None => {
                if let Ok(Some(body)) = response.body {
                    if let Some(cb) = delta_callback.borrow_mut().as_mut() {
                        cb(TwinUpdateType::Partial, Some(body));
                    }
                }
            }
        }
        DispositionResult::Accepted
    }
}

fn handle_op_response(
    op: TwinOpContext,
    response: &wire::TwinResponse<'_>,
    subscription: &Rc<RefCell<SubscriptionTracker>>,
    delta_callback: &Rc<RefCell<Option<DeltaCallback>>>,
) {
    match op.operation {
        TwinOperation::Patch => {
            if let Some(cb) = op.patch_complete {
                match response.status {
                    Some(status) => cb(TwinReportStateResult::Success, TwinReportStateReason::None, status as u32),
                    None => cb(TwinReportStateResult::Error, TwinReportStateReason::InvalidResponse, 0),
                }
            }
        }
        TwinOperation::Get => match response.body {
            Ok(Some(body)) => {
                {
                    let mut sub = subscription.borrow_mut();
                    sub.state = TwinSubscriptionState::SubscribeForUpdates;
                    sub.error_count = 0;
                }
                if let Some(cb) = delta_callback.borrow_mut().as_mut() {
                    cb(TwinUpdateType::Complete, Some(body));
                }
            }
            _ => {
                {
                    let mut sub = subscription.borrow_mut();
                    sub.state = TwinSubscriptionState::GetCompleteProperties;
                    sub.error_count += 1;
                }
                if let Some(cb) = delta_callback.borrow_mut().as_mut() {
                    cb(TwinUpdateType::Complete, None);
                }
            }
        },
        TwinOperation::Put => {
            let success = response.status.map(wire::is_success_status).unwrap_or(false);
            let mut sub = subscription.borrow_mut();
            if success {
                sub.state = TwinSubscriptionState::Subscribed;
                sub.error_count = 0;
            } else {
                sub.state = TwinSubscriptionState::SubscribeForUpdates;
                sub.error_count += 1;
            }
        }
        TwinOperation::Delete => {
            let success = response.status.map(wire::is_success_status).unwrap_or(false);
            let mut sub = subscription.borrow_mut();
            if success {
                sub.state = TwinSubscriptionState::NotSubscribed;
                sub.error_count = 0;
            } else {
                sub.state = TwinSubscriptionState::Unsubscribe;
                sub.error_count += 1;
            }
        }
    }
}
