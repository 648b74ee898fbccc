//! Device-side AMQP messaging core.
//!
//! This crate mediates between a device application and a cloud IoT endpoint
//! over a pre-established AMQP session. It offers two layered services:
//!
//! - [`AmqpMessenger`]: owns a sender link and (optionally) a receiver link on
//!   a shared session, transports opaque application messages outbound with
//!   retry/timeout accounting, delivers inbound messages to the application,
//!   and reports link/sender/receiver lifecycle as a single coherent
//!   messenger state.
//! - [`TwinMessenger`]: layered over the generic messenger; implements a
//!   request/response + subscription protocol for reading, patching, and
//!   streaming a cloud-hosted device twin document.
//!
//! Both are driven entirely by an external, periodic `do_work` tick. There
//! are no background threads or timers inside this crate.

mod clock;
mod config;
mod error;

pub mod amqp;
pub mod messenger;
pub mod twin;

pub use clock::{Clock, SystemClock};
pub use config::{LinkConfig, MessengerConfig, MessengerConfigBuilder};
pub use error::{ConfigError, MessengerError};

pub use messenger::{
    AmqpMessenger, DispositionResult, InboundDispositionInfo, MessengerOptions, MessengerState,
    SendReason, SendResult, SendStatus,
};
pub use twin::{
    TwinError, TwinMessenger, TwinMessengerConfig, TwinReportStateReason, TwinReportStateResult,
    TwinState, TwinUpdateType,
};

#[cfg(test)]
pub(crate) mod test_util;
