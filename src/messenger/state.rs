use std::time::{Duration, Instant};

use crate::amqp::LinkState;
use crate::MessengerState;

pub(crate) const MAX_SENDER_STATE_CHANGE_TIMEOUT_SECS: u64 = 300;
pub(crate) const MAX_RECEIVER_STATE_CHANGE_TIMEOUT_SECS: u64 = 300;
pub(crate) const DEFAULT_MAX_SEND_ERROR_COUNT: u32 = 10;

/// A snapshot of the library-reported link states `process_state_changes`
/// reasons about. `sender` is `None` only before the sender link has been
/// created for the first time.
pub(crate) struct LinkSnapshot {
    pub sender: Option<(LinkState, Instant)>,
    pub receiver: Option<(LinkState, Instant)>,
}

/// Pure reconciliation of the messenger state against its children's
/// reported states (§4.1.3 step 1). Returns `Some(next)` only on an actual
/// transition.
pub(crate) fn process_state_changes(
    state: MessengerState,
    links: &LinkSnapshot,
    now: Instant,
) -> Option<MessengerState> {
    match state {
        MessengerState::Started => {
            let (sender_state, _) = links.sender?;
            if sender_state != LinkState::Open {
                return Some(MessengerState::Error);
            }
            if let Some((receiver_state, receiver_change)) = links.receiver {
                if receiver_state != LinkState::Open {
                    match receiver_state {
                        LinkState::Opening => {
                            if elapsed(now, receiver_change)
                                >= Duration::from_secs(MAX_RECEIVER_STATE_CHANGE_TIMEOUT_SECS)
                            {
                                return Some(MessengerState::Error);
                            }
                        }
                        LinkState::Idle | LinkState::Error => {
                            return Some(MessengerState::Error);
                        }
                        LinkState::Closing => {}
                        LinkState::Open => unreachable!(),
                    }
                }
            }
            None
        }
        MessengerState::Starting => {
            let Some((sender_state, sender_change)) = links.sender else {
                return None;
            };
            match sender_state {
                LinkState::Open => Some(MessengerState::Started),
                LinkState::Opening => {
                    if elapsed(now, sender_change)
                        >= Duration::from_secs(MAX_SENDER_STATE_CHANGE_TIMEOUT_SECS)
                    {
                        Some(MessengerState::Error)
                    } else {
                        None
                    }
                }
                LinkState::Error | LinkState::Closing | LinkState::Idle => {
                    Some(MessengerState::Error)
                }
            }
        }
        MessengerState::Stopping | MessengerState::Stopped | MessengerState::Error => None,
    }
}

fn elapsed(now: Instant, since: Instant) -> Duration {
    now.saturating_duration_since(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(sender: Option<LinkState>, now: Instant) -> LinkSnapshot {
        LinkSnapshot {
            sender: sender.map(|s| (s, now)),
            receiver: None,
        }
    }

    #[test]
    fn starting_transitions_to_started_once_sender_opens() {
        let now = Instant::now();
        let snap = snapshot(Some(LinkState::Open), now);
        assert_eq!(
            process_state_changes(MessengerState::Starting, &snap, now),
            Some(MessengerState::Started)
        );
    }

    #[test]
    fn starting_waits_while_sender_is_absent() {
        let now = Instant::now();
        let snap = snapshot(None, now);
        assert_eq!(process_state_changes(MessengerState::Starting, &snap, now), None);
    }

    #[test]
    fn starting_errors_on_opening_timeout() {
        let start = Instant::now();
        let later = start + Duration::from_secs(MAX_SENDER_STATE_CHANGE_TIMEOUT_SECS + 1);
        let snap = snapshot(Some(LinkState::Opening), start);
        assert_eq!(
            process_state_changes(MessengerState::Starting, &snap, later),
            Some(MessengerState::Error)
        );
    }

    #[test]
    fn started_errors_when_sender_drops() {
        let now = Instant::now();
        let snap = snapshot(Some(LinkState::Error), now);
        assert_eq!(
            process_state_changes(MessengerState::Started, &snap, now),
            Some(MessengerState::Error)
        );
    }

    #[test]
    fn started_stays_started_when_children_open() {
        let now = Instant::now();
        let snap = LinkSnapshot {
            sender: Some((LinkState::Open, now)),
            receiver: Some((LinkState::Open, now)),
        };
        assert_eq!(process_state_changes(MessengerState::Started, &snap, now), None);
    }
}
