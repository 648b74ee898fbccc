//! The generic AMQP messenger (§4.1): one sender link, one optional
//! receiver link, a send queue, and a single coherent lifecycle state
//! reconciled on every `do_work` tick.

mod queue;
mod state;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use uuid::Uuid;

use crate::amqp::{
    AmqpMessage, LinkParams, MessageDisposition, ReceiverLink, SenderLink, Session,
};
use crate::clock::Clock;
use crate::error::MessengerError;
use crate::MessengerConfig;

pub use queue::SendCompleteCallback;
use queue::{SendQueue, SendQueueConfig};
use state::{process_state_changes, LinkSnapshot, DEFAULT_MAX_SEND_ERROR_COUNT};

const SEND_LINK_NAME_PREFIX: &str = "link-snd";
const RECEIVE_LINK_NAME_PREFIX: &str = "link-rcv";
const SENDER_MAX_LINK_SIZE: u64 = u64::MAX;
const RECEIVER_MAX_LINK_SIZE: u64 = 65536;

/// Lifecycle state of an [`AmqpMessenger`] (§3). Initial: `Stopped`.
/// `Error` is sticky until the owner destroys the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for MessengerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessengerState::Starting => "STARTING",
            MessengerState::Started => "STARTED",
            MessengerState::Stopping => "STOPPING",
            MessengerState::Stopped => "STOPPED",
            MessengerState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Whether the send queue has any pending or in-progress work (§4.1.1
/// `get_send_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Idle,
    Busy,
}

/// Outcome reported to a `send_async` completion callback (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Success,
    Error,
    Cancelled,
}

/// Why a `send_async` completion did not simply succeed (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReason {
    None,
    FailSending,
    Timeout,
    MessengerDestroyed,
}

/// The application's disposition decision for an inbound delivery (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionResult {
    None,
    Accepted,
    Rejected,
    Released,
}

/// Handed to the application on inbound delivery; must be consumed via
/// [`AmqpMessenger::send_message_disposition`] (§3).
#[derive(Debug, Clone)]
pub struct InboundDispositionInfo {
    pub message_id: u64,
    pub source: String,
}

/// The nested option bag returned by [`AmqpMessenger::retrieve_options`]
/// (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessengerOptions {
    pub amqp_message_queue_options: SendQueueOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendQueueOptions {
    pub max_message_enqueued_time_secs: u64,
}

type StateChangedCallback = Box<dyn FnMut(MessengerState, MessengerState)>;
type InboundMessageCallback = Box<dyn FnMut(AmqpMessage, InboundDispositionInfo) -> DispositionResult>;

/// Owns a sender link (always, once started) and a receiver link (only
/// while subscribed), and reconciles their library-reported states into
/// one coherent [`MessengerState`] on every [`AmqpMessenger::do_work`] tick
/// (§4.1).
pub struct AmqpMessenger {
    config: MessengerConfig,
    clock: Box<dyn Clock>,
    state: MessengerState,
    on_state_changed: Option<StateChangedCallback>,

    session: Option<Box<dyn Session>>,
    sender_link: Option<Box<dyn SenderLink>>,
    receiver_link: Option<Box<dyn ReceiverLink>>,

    receive_messages: bool,
    on_message_received: Rc<RefCell<Option<InboundMessageCallback>>>,

    send_queue: SendQueue,
    send_error_count: u32,
    max_send_error_count: u32,
}

impl AmqpMessenger {
    /// Validates `config` and returns a handle in state `Stopped` (§4.1.1).
    pub fn create(config: MessengerConfig, clock: impl Clock + 'static) -> Result<Self, MessengerError> {
        config.validate()?;
        Ok(AmqpMessenger {
            config,
            clock: Box::new(clock),
            state: MessengerState::Stopped,
            on_state_changed: None,
            session: None,
            sender_link: None,
            receiver_link: None,
            receive_messages: false,
            on_message_received: Rc::new(RefCell::new(None)),
            send_queue: SendQueue::new(SendQueueConfig::default()),
            send_error_count: 0,
            max_send_error_count: DEFAULT_MAX_SEND_ERROR_COUNT,
        })
    }

    pub fn state(&self) -> MessengerState {
        self.state
    }

    /// Installs the callback fired on every actual state transition (§4.1.6).
    pub fn set_state_changed_callback(
        &mut self,
        callback: impl FnMut(MessengerState, MessengerState) + 'static,
    ) {
        self.on_state_changed = Some(Box::new(callback));
    }

    /// Requires `Stopped`; stores `session` and transitions to `Starting`
    /// (§4.1.1).
    pub fn start(&mut self, session: Box<dyn Session>) -> Result<(), MessengerError> {
        if self.state != MessengerState::Stopped {
            return Err(MessengerError::InvalidStateForStart(self.state));
        }
        self.session = Some(session);
        self.send_error_count = 0;
        self.transition(MessengerState::Starting);
        Ok(())
    }

    /// Requires state != `Stopped`; synchronously tears down both links and
    /// returns in-progress sends to pending (§4.1.1).
    pub fn stop(&mut self) -> Result<(), MessengerError> {
        if self.state == MessengerState::Stopped {
            return Err(MessengerError::InvalidStateForStop);
        }
        self.transition(MessengerState::Stopping);

        if let Some(mut receiver) = self.receiver_link.take() {
            receiver.close();
        }
        if let Some(mut sender) = self.sender_link.take() {
            sender.close();
        }
        self.send_queue.move_in_progress_back_to_pending();
        self.session = None;

        self.transition(MessengerState::Stopped);
        Ok(())
    }

    /// Advances the state machine one tick: reconciles link states, creates
    /// or tears down links, and services the send queue (§4.1.3).
    pub fn do_work(&mut self) {
        let now = self.clock.now();

        let snapshot = LinkSnapshot {
            sender: self.sender_link.as_ref().map(|s| (s.state(), s.last_state_change())),
            receiver: self.receiver_link.as_ref().map(|r| (r.state(), r.last_state_change())),
        };
        if let Some(next) = process_state_changes(self.state, &snapshot, now) {
            self.transition(next);
        }

        if self.state == MessengerState::Starting && self.sender_link.is_none() {
            match self.create_sender_link() {
                Ok(link) => self.sender_link = Some(link),
                Err(_) => self.transition(MessengerState::Error),
            }
        }

        if self.state == MessengerState::Started {
            if self.receive_messages && self.receiver_link.is_none() {
                match self.create_receiver_link() {
                    Ok(link) => self.receiver_link = Some(link),
                    Err(e) => log::warn!("failed creating the message receiver: {e}"),
                }
            } else if !self.receive_messages {
                if let Some(mut receiver) = self.receiver_link.take() {
                    receiver.close();
                }
            }

            if let Some(sender) = self.sender_link.as_deref_mut() {
                let tick = self.send_queue.tick(sender, now);
                self.send_error_count += tick.errors;
            }

            if self.send_error_count >= self.max_send_error_count {
                log::error!("reached max number of consecutive send failures");
                self.transition(MessengerState::Error);
            }
        }
    }

    /// Clones `message`, wraps it in an outbound task, and enqueues it
    /// (§4.1.1, §4.1.5).
    pub fn send_async(
        &mut self,
        message: AmqpMessage,
        completion: SendCompleteCallback,
    ) -> Result<(), MessengerError> {
        let now = self.clock.now();
        self.send_queue.enqueue(message, completion, now);
        Ok(())
    }

    pub fn get_send_status(&self) -> SendStatus {
        if self.send_queue.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    /// Installs the inbound callback and sets the `receive_messages` flag;
    /// the receiver link itself is created asynchronously by `do_work`
    /// (§4.1.1).
    pub fn subscribe_for_messages(
        &mut self,
        callback: impl FnMut(AmqpMessage, InboundDispositionInfo) -> DispositionResult + 'static,
    ) {
        *self.on_message_received.borrow_mut() = Some(Box::new(callback));
        self.receive_messages = true;
    }

    pub fn unsubscribe_for_messages(&mut self) {
        self.receive_messages = false;
        *self.on_message_received.borrow_mut() = None;
    }

    /// Requires a receiver link present; `DispositionResult::None` emits no
    /// response at all (§4.1.1, §4.1.4).
    pub fn send_message_disposition(
        &mut self,
        info: InboundDispositionInfo,
        result: DispositionResult,
    ) -> Result<(), MessengerError> {
        let disposition = match result {
            DispositionResult::None => return Ok(()),
            DispositionResult::Accepted => MessageDisposition::Accepted,
            DispositionResult::Rejected => MessageDisposition::Rejected {
                reason: "Rejected by application".to_string(),
            },
            DispositionResult::Released => MessageDisposition::Released,
        };
        let receiver = self.receiver_link.as_deref_mut().ok_or(MessengerError::NoReceiver)?;
        receiver
            .dispose(info.message_id, disposition)
            .map_err(MessengerError::DispositionFailed)
    }

    /// The only recognized option is `"amqp_event_send_timeout_secs"` (§6).
    pub fn set_option(&mut self, name: &str, value_secs: u64) -> Result<(), MessengerError> {
        if name == "amqp_event_send_timeout_secs" {
            self.send_queue.set_max_message_enqueued_time_secs(value_secs);
            Ok(())
        } else {
            Err(MessengerError::InvalidArgument("unsupported option name"))
        }
    }

    pub fn retrieve_options(&self) -> MessengerOptions {
        MessengerOptions {
            amqp_message_queue_options: SendQueueOptions {
                max_message_enqueued_time_secs: self.send_queue.max_message_enqueued_time_secs(),
            },
        }
    }

    /// Stops (if not already stopped) and fail-callbacks any still-enqueued
    /// task with `Cancelled / MessengerDestroyed` (§4.1.1).
    pub fn destroy(mut self) {
        if self.state != MessengerState::Stopped {
            let _ = self.stop();
        }
        self.send_queue.cancel_all();
    }

    fn transition(&mut self, next: MessengerState) {
        if next == self.state {
            return;
        }
        let previous = self.state;
        self.state = next;
        if let Some(cb) = self.on_state_changed.as_mut() {
            cb(previous, next);
        }
    }

    fn create_sender_link(&mut self) -> Result<Box<dyn SenderLink>, MessengerError> {
        let link_name = generate_link_name(SEND_LINK_NAME_PREFIX, &self.config.device_id);
        let params = LinkParams {
            source: format!("{link_name}-source"),
            target: self.config.link_address(&self.config.send_link.target_suffix),
            name: link_name,
            snd_settle_mode: self.config.send_link.snd_settle_mode.clone(),
            rcv_settle_mode: self.config.send_link.rcv_settle_mode.clone(),
            max_message_size: SENDER_MAX_LINK_SIZE,
            attach_properties: self.config.send_link.attach_properties.clone(),
        };
        let session = self.session.as_deref_mut().ok_or(MessengerError::NoSession)?;
        session
            .create_sender_link(params)
            .map_err(MessengerError::LinkCreationFailed)
    }

    fn create_receiver_link(&mut self) -> Result<Box<dyn ReceiverLink>, MessengerError> {
        let link_name = generate_link_name(RECEIVE_LINK_NAME_PREFIX, &self.config.device_id);
        let params = LinkParams {
            source: self.config.link_address(&self.config.receive_link.source_suffix),
            target: format!("{link_name}-target"),
            name: link_name,
            snd_settle_mode: self.config.receive_link.snd_settle_mode.clone(),
            rcv_settle_mode: self.config.receive_link.rcv_settle_mode.clone(),
            max_message_size: RECEIVER_MAX_LINK_SIZE,
            attach_properties: self.config.receive_link.attach_properties.clone(),
        };
        let session = self.session.as_deref_mut().ok_or(MessengerError::NoSession)?;
        let mut link = session
            .create_receiver_link(params)
            .map_err(MessengerError::LinkCreationFailed)?;

        let on_message = Rc::clone(&self.on_message_received);
        link.set_on_message(Box::new(move |message, delivery_id, source| {
            let info = InboundDispositionInfo {
                message_id: delivery_id,
                source,
            };
            let mut callback = on_message.borrow_mut();
            let result = match callback.as_mut() {
                Some(cb) => cb(message, info),
                None => DispositionResult::Released,
            };
            match result {
                DispositionResult::None => None,
                DispositionResult::Accepted => Some(MessageDisposition::Accepted),
                DispositionResult::Rejected => Some(MessageDisposition::Rejected {
                    reason: "Rejected by application".to_string(),
                }),
                DispositionResult::Released => Some(MessageDisposition::Released),
            }
        }));
        Ok(link)
    }
}

fn generate_link_name(prefix: &str, device_id: &str) -> String {
    format!("{prefix}-{device_id}-{}", Uuid::new_v4())
}

#[cfg(test)]
mod scenario_tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use crate::amqp::message::data_body;
    use crate::amqp::LinkState;
    use crate::config::LinkConfig;
    use crate::test_util::{FakeClock, FakeReceiverLink, FakeSenderLink, FakeSession};
    use crate::MessengerConfig;

    use super::*;

    fn config() -> MessengerConfig {
        MessengerConfig {
            client_version: "t/1.0".to_string(),
            device_id: "dev1".to_string(),
            iothub_host_fqdn: "hub.example".to_string(),
            send_link: LinkConfig::new("messages/devicebound", "messages/events"),
            receive_link: LinkConfig::new("messages/devicebound", "messages/events"),
        }
    }

    /// Starts `messenger` against `session` and ticks it until the sender
    /// link reports OPEN (§4.1.3: one tick creates the link, the next
    /// observes it).
    fn start_until_started(messenger: &mut AmqpMessenger, session: FakeSession) {
        messenger.start(Box::new(session)).unwrap();
        messenger.do_work();
        messenger.do_work();
        assert_eq!(messenger.state(), MessengerState::Started);
    }

    #[test]
    fn send_timeout_fires_error_timeout() {
        let clock = FakeClock::new();
        let mut messenger = AmqpMessenger::create(config(), clock.clone()).unwrap();
        let sender = FakeSenderLink::new(clock.now());
        let receiver = FakeReceiverLink::new(clock.now());
        start_until_started(&mut messenger, FakeSession::new(sender, receiver));

        messenger.set_option("amqp_event_send_timeout_secs", 1).unwrap();

        let fired = Rc::new(RefCell::new(None));
        let fired_clone = Rc::clone(&fired);
        messenger
            .send_async(
                data_body(b"hi".to_vec()),
                Box::new(move |result, reason| *fired_clone.borrow_mut() = Some((result, reason))),
            )
            .unwrap();

        clock.advance(Duration::from_secs(2));
        messenger.do_work();

        assert_eq!(*fired.borrow(), Some((SendResult::Error, SendReason::Timeout)));
        assert_eq!(messenger.get_send_status(), SendStatus::Idle);
    }

    #[test]
    fn fail_fast_escalation_after_ten_consecutive_failures() {
        let clock = FakeClock::new();
        let mut messenger = AmqpMessenger::create(config(), clock.clone()).unwrap();
        let sender = FakeSenderLink::new(clock.now());
        let receiver = FakeReceiverLink::new(clock.now());
        start_until_started(&mut messenger, FakeSession::new(sender.clone(), receiver));

        let transitions: Rc<RefCell<Vec<(MessengerState, MessengerState)>>> =
            Rc::new(RefCell::new(Vec::new()));
        let transitions_clone = Rc::clone(&transitions);
        messenger.set_state_changed_callback(move |previous, next| {
            transitions_clone.borrow_mut().push((previous, next));
        });

        for _ in 0..10 {
            sender.fail_next_send();
            messenger
                .send_async(data_body(b"hi".to_vec()), Box::new(|_, _| {}))
                .unwrap();
            messenger.do_work();
        }

        assert_eq!(messenger.state(), MessengerState::Error);
        assert!(transitions
            .borrow()
            .contains(&(MessengerState::Started, MessengerState::Error)));
    }

    #[test]
    fn destroy_cancels_in_flight_sends() {
        let clock = FakeClock::new();
        let mut messenger = AmqpMessenger::create(config(), clock.clone()).unwrap();
        let sender = FakeSenderLink::new(clock.now());
        let receiver = FakeReceiverLink::new(clock.now());
        start_until_started(&mut messenger, FakeSession::new(sender.clone(), receiver));

        let results: Rc<RefCell<Vec<(SendResult, SendReason)>>> = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..3 {
            let results_clone = Rc::clone(&results);
            messenger
                .send_async(
                    data_body(b"hi".to_vec()),
                    Box::new(move |result, reason| results_clone.borrow_mut().push((result, reason))),
                )
                .unwrap();
        }
        messenger.do_work();
        assert_eq!(sender.sent_count(), 3);

        messenger.destroy();

        let results = results.borrow();
        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|(r, reason)| *r == SendResult::Cancelled && *reason == SendReason::MessengerDestroyed));
    }

    #[test]
    fn inbound_delivery_reaches_app_callback_and_translates_disposition() {
        let clock = FakeClock::new();
        let mut messenger = AmqpMessenger::create(config(), clock.clone()).unwrap();
        let sender = FakeSenderLink::new(clock.now());
        let receiver = FakeReceiverLink::new(clock.now());
        let receiver_clone = receiver.clone();
        messenger.subscribe_for_messages(|_message, _info| DispositionResult::Accepted);
        start_until_started(&mut messenger, FakeSession::new(sender, receiver));
        messenger.do_work();
        assert!(receiver_clone.has_callback());

        let disposition = receiver_clone.deliver(data_body(b"payload".to_vec()), 7, "link-rcv-dev1");
        assert_eq!(disposition, Some(MessageDisposition::Accepted));
    }

    #[test]
    fn deferred_disposition_is_applied_via_send_message_disposition() {
        let clock = FakeClock::new();
        let mut messenger = AmqpMessenger::create(config(), clock.clone()).unwrap();
        let sender = FakeSenderLink::new(clock.now());
        let receiver = FakeReceiverLink::new(clock.now());
        let receiver_clone = receiver.clone();
        messenger.subscribe_for_messages(|_message, _info| DispositionResult::None);
        start_until_started(&mut messenger, FakeSession::new(sender, receiver));
        messenger.do_work();

        let disposition = receiver_clone.deliver(data_body(b"payload".to_vec()), 9, "link-rcv-dev1");
        assert_eq!(disposition, None);

        messenger
            .send_message_disposition(
                InboundDispositionInfo {
                    message_id: 9,
                    source: "link-rcv-dev1".to_string(),
                },
                DispositionResult::Rejected,
            )
            .unwrap();

        assert_eq!(
            receiver_clone.dispositions(),
            vec![(
                9,
                MessageDisposition::Rejected {
                    reason: "Rejected by application".to_string()
                }
            )]
        );
    }

    #[test]
    fn sender_link_creation_failure_transitions_to_error() {
        let clock = FakeClock::new();
        let mut messenger = AmqpMessenger::create(config(), clock.clone()).unwrap();
        let sender = FakeSenderLink::new(clock.now());
        let receiver = FakeReceiverLink::new(clock.now());
        let session = FakeSession::new(sender, receiver);
        session.fail_next_sender_link();
        messenger.start(Box::new(session)).unwrap();

        messenger.do_work();

        assert_eq!(messenger.state(), MessengerState::Error);
    }

    #[test]
    fn receiver_link_creation_failure_logs_warning_but_stays_started() {
        let clock = FakeClock::new();
        let mut messenger = AmqpMessenger::create(config(), clock.clone()).unwrap();
        let sender = FakeSenderLink::new(clock.now());
        let receiver = FakeReceiverLink::new(clock.now());
        let session = FakeSession::new(sender, receiver);
        session.fail_next_receiver_link();
        messenger.subscribe_for_messages(|_message, _info| DispositionResult::Accepted);

        start_until_started(&mut messenger, session);

        messenger.do_work();
        assert_eq!(messenger.state(), MessengerState::Started);
    }

    #[test]
    fn sender_opening_timeout_transitions_to_error() {
        let clock = FakeClock::new();
        let mut messenger = AmqpMessenger::create(config(), clock.clone()).unwrap();
        let sender = FakeSenderLink::new(clock.now());
        let receiver = FakeReceiverLink::new(clock.now());
        let sender_clone = sender.clone();
        messenger
            .start(Box::new(FakeSession::new(sender, receiver)))
            .unwrap();
        messenger.do_work();

        sender_clone.set_state(LinkState::Opening, clock.now());
        clock.advance(Duration::from_secs(301));
        messenger.do_work();

        assert_eq!(messenger.state(), MessengerState::Error);
    }
}
