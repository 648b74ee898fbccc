use thiserror::Error;

/// Raised by [`crate::MessengerConfig`] validation and by
/// [`crate::AmqpMessenger::create`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{field}` must not be empty")]
    MissingField { field: &'static str },
}

/// Errors surfaced directly from `AmqpMessenger`'s public API calls.
///
/// Structural failures (link loss, repeated bad link states, exceeding error
/// caps) are *not* reported through this type: they are surfaced as a
/// transition to [`crate::MessengerState::Error`] via the state-changed
/// callback, per the propagation policy in the specification.
#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("messenger must be stopped to start, was {0}")]
    InvalidStateForStart(crate::MessengerState),

    #[error("messenger is already stopped")]
    InvalidStateForStop,

    #[error("a required argument was null or empty: {0}")]
    InvalidArgument(&'static str),

    #[error("no receiver link is attached")]
    NoReceiver,

    #[error("messenger has no session attached")]
    NoSession,

    #[error("failed to create link: {0}")]
    LinkCreationFailed(String),

    #[error("failed to move in-progress sends back to pending: {0}")]
    RequeueFailed(String),

    #[error("failed to submit disposition: {0}")]
    DispositionFailed(String),
}
