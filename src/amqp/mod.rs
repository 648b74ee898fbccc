//! The external AMQP collaborator surface.
//!
//! This crate does not implement AMQP framing (connections, sessions,
//! links, SASL, TLS) — that is explicitly out of scope, "consumed as a
//! library". Instead it defines the trait contracts a framing library must
//! satisfy, so the messenger core stays runtime-agnostic and can be driven
//! by a synchronous `do_work` tick instead of an async executor.
//!
//! A caller who wants to run this crate over the real `fe2o3-amqp` crate
//! provides an adapter implementing [`Session`]; see `DESIGN.md`.

mod link;
pub mod message;

pub use link::{
    LinkParams, LinkState, MessageDisposition, OnMessage, ReceiverLink, SendCompletion,
    SendOutcome, Session, SenderLink,
};
pub use message::AmqpMessage;
