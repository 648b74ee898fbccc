use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::amqp::{AmqpMessage, SendOutcome, SenderLink};

use super::{SendReason, SendResult};

/// Fired exactly once per [`SendQueue::enqueue`]d task, per the
/// at-most-once-callback invariant.
pub type SendCompleteCallback = Box<dyn FnOnce(SendResult, SendReason)>;

pub(crate) struct OutboundTask {
    message: AmqpMessage,
    completion: Option<SendCompleteCallback>,
    enqueued_at: Instant,
    dispatched_at: Option<Instant>,
    outcome: Rc<RefCell<Option<SendOutcome>>>,
}

impl OutboundTask {
    fn fire(mut self, result: SendResult, reason: SendReason) {
        if let Some(cb) = self.completion.take() {
            cb(result, reason);
        }
    }
}

/// Configuration mirrored from the reference message queue's defaults.
#[derive(Debug, Clone)]
pub struct SendQueueConfig {
    pub max_retry_count: u32,
    pub max_message_enqueued_time_secs: u64,
    pub max_message_processing_time_secs: u64,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        SendQueueConfig {
            max_retry_count: 0,
            max_message_enqueued_time_secs: 600,
            max_message_processing_time_secs: 0,
        }
    }
}

/// Outcome of one [`SendQueue::tick`], used by the owning messenger to
/// maintain its consecutive-send-error counter (§4.1.3).
#[derive(Debug, Default, Clone, Copy)]
pub struct TickOutcome {
    pub successes: u32,
    pub errors: u32,
}

/// The outbound message queue: pending tasks waiting for dispatch, and
/// in-progress tasks handed to the sender link but not yet completed
/// (§3, §4.1.5).
pub struct SendQueue {
    config: SendQueueConfig,
    pending: VecDeque<OutboundTask>,
    in_progress: VecDeque<OutboundTask>,
}

impl SendQueue {
    pub fn new(config: SendQueueConfig) -> Self {
        SendQueue {
            config,
            pending: VecDeque::new(),
            in_progress: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_progress.is_empty()
    }

    pub fn set_max_message_enqueued_time_secs(&mut self, secs: u64) {
        self.config.max_message_enqueued_time_secs = secs;
    }

    pub fn max_message_enqueued_time_secs(&self) -> u64 {
        self.config.max_message_enqueued_time_secs
    }

    pub(crate) fn enqueue(
        &mut self,
        message: AmqpMessage,
        completion: SendCompleteCallback,
        now: Instant,
    ) {
        self.pending.push_back(OutboundTask {
            message,
            completion: Some(completion),
            enqueued_at: now,
            dispatched_at: None,
            outcome: Rc::new(RefCell::new(None)),
        });
    }

    /// Moves every in-progress task back to the head of pending, preserving
    /// submission order (§4.1.1 `stop`, §4.1.5).
    pub(crate) fn move_in_progress_back_to_pending(&mut self) {
        let mut moved: VecDeque<OutboundTask> = self.in_progress.drain(..).collect();
        moved.append(&mut self.pending);
        self.pending = moved;
    }

    /// Fires every still-queued task with `CANCELLED / MESSENGER_DESTROYED`
    /// (§4.1.1 `destroy`, §4.2.6).
    pub(crate) fn cancel_all(&mut self) {
        for task in self.pending.drain(..).chain(self.in_progress.drain(..)) {
            task.fire(SendResult::Cancelled, SendReason::MessengerDestroyed);
        }
    }

    /// Runs one do_work pass: times out stale pending tasks, dispatches the
    /// rest through `sender`, then reaps completed or timed-out in-progress
    /// tasks (§4.1.3 step 3, §4.1.5).
    pub(crate) fn tick(&mut self, sender: &mut dyn SenderLink, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let max_enqueued = Duration::from_secs(self.config.max_message_enqueued_time_secs);

        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        while let Some(task) = self.pending.pop_front() {
            if max_enqueued.as_secs() > 0 && now.saturating_duration_since(task.enqueued_at) >= max_enqueued {
                outcome.errors += 1;
                task.fire(SendResult::Error, SendReason::Timeout);
            } else {
                still_pending.push_back(task);
            }
        }
        self.pending = still_pending;

        while let Some(mut task) = self.pending.pop_front() {
            task.dispatched_at = Some(now);
            let bridge_outcome = Rc::clone(&task.outcome);
            let send_result = sender.send(
                task.message.clone(),
                Box::new(move |result| {
                    *bridge_outcome.borrow_mut() = Some(result);
                }),
            );
            match send_result {
                Ok(()) => self.in_progress.push_back(task),
                Err(_) => {
                    outcome.errors += 1;
                    task.fire(SendResult::Error, SendReason::FailSending);
                }
            }
        }

        let max_processing = Duration::from_secs(self.config.max_message_processing_time_secs);
        let mut still_in_progress = VecDeque::with_capacity(self.in_progress.len());
        while let Some(task) = self.in_progress.pop_front() {
            let completed = task.outcome.borrow_mut().take();
            if let Some(send_outcome) = completed {
                match send_outcome {
                    SendOutcome::Success => {
                        outcome.successes += 1;
                        task.fire(SendResult::Success, SendReason::None);
                    }
                    SendOutcome::Error => {
                        outcome.errors += 1;
                        task.fire(SendResult::Error, SendReason::FailSending);
                    }
                }
                continue;
            }

            let dispatched_at = task.dispatched_at.expect("in-progress task was dispatched");
            let processing_timed_out = max_processing.as_secs() > 0
                && now.saturating_duration_since(dispatched_at) >= max_processing;
            let enqueued_timed_out = max_enqueued.as_secs() > 0
                && now.saturating_duration_since(task.enqueued_at) >= max_enqueued;
            if processing_timed_out || enqueued_timed_out {
                outcome.errors += 1;
                task.fire(SendResult::Error, SendReason::Timeout);
            } else {
                still_in_progress.push_back(task);
            }
        }
        self.in_progress = still_in_progress;

        outcome
    }
}
