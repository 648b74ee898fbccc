use std::time::Instant;

/// Abstracts wall-clock time so link-startup and send-timeout accounting can
/// be driven deterministically in tests instead of racing a real clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Grounded on how the teacher injects `tokio::runtime::Handle` rather than
/// reaching for ambient globals: timeouts here are computed against whatever
/// `Clock` the owner supplies, defaulting to the real one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
