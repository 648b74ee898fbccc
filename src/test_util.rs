//! Hand-rolled test doubles for `AmqpMessenger`'s collaborator traits,
//! grounded on the teacher's own style of fake (a struct implementing the
//! real trait directly, e.g. `TestPropertiesUpdatedCallback` in
//! `spotflow/tests/twins.rs`) rather than a mocking framework.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::amqp::message::AmqpMessage;
use crate::amqp::{
    LinkParams, LinkState, MessageDisposition, OnMessage, ReceiverLink, SendCompletion,
    SendOutcome, SenderLink, Session,
};
use crate::Clock;

/// A `Clock` whose `now()` only moves when the test tells it to.
#[derive(Clone)]
pub(crate) struct FakeClock {
    now: Arc<Mutex<Instant>>,
}

impl FakeClock {
    pub(crate) fn new() -> Self {
        FakeClock {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub(crate) fn advance(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

struct SenderInner {
    state: LinkState,
    last_state_change: Instant,
    fail_next_send: bool,
    sent: Vec<AmqpMessage>,
    pending: VecDeque<SendCompletion>,
}

/// A sender link that records every message handed to it and lets the test
/// complete or fail sends on demand.
#[derive(Clone)]
pub(crate) struct FakeSenderLink {
    inner: Rc<RefCell<SenderInner>>,
}

impl FakeSenderLink {
    pub(crate) fn new(now: Instant) -> Self {
        FakeSenderLink {
            inner: Rc::new(RefCell::new(SenderInner {
                state: LinkState::Open,
                last_state_change: now,
                fail_next_send: false,
                sent: Vec::new(),
                pending: VecDeque::new(),
            })),
        }
    }

    pub(crate) fn set_state(&self, state: LinkState, at: Instant) {
        let mut inner = self.inner.borrow_mut();
        inner.state = state;
        inner.last_state_change = at;
    }

    /// The next call to `send` returns `Err` instead of enqueueing.
    pub(crate) fn fail_next_send(&self) {
        self.inner.borrow_mut().fail_next_send = true;
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.inner.borrow().sent.len()
    }

    pub(crate) fn last_sent(&self) -> Option<AmqpMessage> {
        self.inner.borrow().sent.last().cloned()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Resolves the oldest still-pending send with `outcome`.
    pub(crate) fn complete_oldest(&self, outcome: SendOutcome) {
        let completion = self.inner.borrow_mut().pending.pop_front();
        if let Some(completion) = completion {
            completion(outcome);
        }
    }
}

impl SenderLink for FakeSenderLink {
    fn state(&self) -> LinkState {
        self.inner.borrow().state
    }

    fn last_state_change(&self) -> Instant {
        self.inner.borrow().last_state_change
    }

    fn send(&mut self, message: AmqpMessage, completion: SendCompletion) -> Result<(), String> {
        let mut inner = self.inner.borrow_mut();
        if std::mem::take(&mut inner.fail_next_send) {
            return Err("fake send failure".to_string());
        }
        inner.sent.push(message);
        inner.pending.push_back(completion);
        Ok(())
    }

    fn close(&mut self) {
        self.inner.borrow_mut().state = LinkState::Closing;
    }
}

struct ReceiverInner {
    state: LinkState,
    last_state_change: Instant,
    on_message: Option<OnMessage>,
    dispositions: Vec<(u64, MessageDisposition)>,
}

/// A receiver link that lets the test push inbound deliveries through
/// whatever bridge `AmqpMessenger` installed.
#[derive(Clone)]
pub(crate) struct FakeReceiverLink {
    inner: Rc<RefCell<ReceiverInner>>,
}

impl FakeReceiverLink {
    pub(crate) fn new(now: Instant) -> Self {
        FakeReceiverLink {
            inner: Rc::new(RefCell::new(ReceiverInner {
                state: LinkState::Open,
                last_state_change: now,
                on_message: None,
                dispositions: Vec::new(),
            })),
        }
    }

    pub(crate) fn set_state(&self, state: LinkState, at: Instant) {
        let mut inner = self.inner.borrow_mut();
        inner.state = state;
        inner.last_state_change = at;
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.inner.borrow().on_message.is_some()
    }

    /// Delivers `message` to the installed bridge, returning the disposition
    /// it chose to apply synchronously (`None` means it deferred via
    /// `dispose`).
    pub(crate) fn deliver(
        &self,
        message: AmqpMessage,
        delivery_id: u64,
        source: &str,
    ) -> Option<MessageDisposition> {
        let mut inner = self.inner.borrow_mut();
        let callback = inner.on_message.as_mut()?;
        callback(message, delivery_id, source.to_string())
    }

    pub(crate) fn dispositions(&self) -> Vec<(u64, MessageDisposition)> {
        self.inner.borrow().dispositions.clone()
    }
}

impl ReceiverLink for FakeReceiverLink {
    fn state(&self) -> LinkState {
        self.inner.borrow().state
    }

    fn last_state_change(&self) -> Instant {
        self.inner.borrow().last_state_change
    }

    fn set_on_message(&mut self, callback: OnMessage) {
        self.inner.borrow_mut().on_message = Some(callback);
    }

    fn dispose(&mut self, delivery_id: u64, disposition: MessageDisposition) -> Result<(), String> {
        self.inner.borrow_mut().dispositions.push((delivery_id, disposition));
        Ok(())
    }

    fn close(&mut self) {
        self.inner.borrow_mut().state = LinkState::Closing;
    }
}

/// A session that always hands out a pre-built fake sender/receiver pair,
/// unless the test arms it to fail the next creation call.
pub(crate) struct FakeSession {
    sender: FakeSenderLink,
    receiver: FakeReceiverLink,
    fail_next_sender: Rc<RefCell<bool>>,
    fail_next_receiver: Rc<RefCell<bool>>,
}

impl FakeSession {
    pub(crate) fn new(sender: FakeSenderLink, receiver: FakeReceiverLink) -> Self {
        FakeSession {
            sender,
            receiver,
            fail_next_sender: Rc::new(RefCell::new(false)),
            fail_next_receiver: Rc::new(RefCell::new(false)),
        }
    }

    pub(crate) fn fail_next_sender_link(&self) {
        *self.fail_next_sender.borrow_mut() = true;
    }

    pub(crate) fn fail_next_receiver_link(&self) {
        *self.fail_next_receiver.borrow_mut() = true;
    }
}

impl Session for FakeSession {
    fn create_sender_link(&mut self, _params: LinkParams) -> Result<Box<dyn SenderLink>, String> {
        if std::mem::take(&mut *self.fail_next_sender.borrow_mut()) {
            return Err("fake sender link creation failure".to_string());
        }
        Ok(Box::new(self.sender.clone()))
    }

    fn create_receiver_link(
        &mut self,
        _params: LinkParams,
    ) -> Result<Box<dyn ReceiverLink>, String> {
        if std::mem::take(&mut *self.fail_next_receiver.borrow_mut()) {
            return Err("fake receiver link creation failure".to_string());
        }
        Ok(Box::new(self.receiver.clone()))
    }
}
