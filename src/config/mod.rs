use std::collections::BTreeMap;

use fe2o3_amqp_types::definitions::{ReceiverSettleMode, SenderSettleMode};

use crate::error::ConfigError;

mod builder;

pub use builder::MessengerConfigBuilder;

/// Per-link configuration shared by the send and the (optional) receive link
/// of an [`crate::AmqpMessenger`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Appended to the device base address to form this link's source, e.g.
    /// `"/messages/devicebound"`.
    pub source_suffix: String,
    /// Appended to the device base address to form this link's target, e.g.
    /// `"/messages/events"`.
    pub target_suffix: String,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub snd_settle_mode: SenderSettleMode,
    /// Attach-time metadata, serialized as an AMQP symbol->string map and set
    /// on the link before it is opened.
    pub attach_properties: BTreeMap<String, String>,
}

impl LinkConfig {
    pub fn new(source_suffix: impl Into<String>, target_suffix: impl Into<String>) -> Self {
        LinkConfig {
            source_suffix: source_suffix.into(),
            target_suffix: target_suffix.into(),
            rcv_settle_mode: ReceiverSettleMode::First,
            snd_settle_mode: SenderSettleMode::Settled,
            attach_properties: BTreeMap::new(),
        }
    }

    pub fn with_attach_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.attach_properties = properties;
        self
    }
}

/// Immutable configuration for an [`crate::AmqpMessenger`], cloned in full by
/// `create` so the caller's original is never aliased.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub client_version: String,
    pub device_id: String,
    pub iothub_host_fqdn: String,
    pub send_link: LinkConfig,
    pub receive_link: LinkConfig,
}

impl MessengerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_version.is_empty() {
            return Err(ConfigError::MissingField {
                field: "client_version",
            });
        }
        if self.device_id.is_empty() {
            return Err(ConfigError::MissingField { field: "device_id" });
        }
        if self.iothub_host_fqdn.is_empty() {
            return Err(ConfigError::MissingField {
                field: "iothub_host_fqdn",
            });
        }
        if self.receive_link.source_suffix.is_empty() {
            return Err(ConfigError::MissingField {
                field: "receive_link.source_suffix",
            });
        }
        if self.send_link.target_suffix.is_empty() {
            return Err(ConfigError::MissingField {
                field: "send_link.target_suffix",
            });
        }
        Ok(())
    }

    /// `amqps://<fqdn>/devices/<device_id>/<suffix>`
    pub fn link_address(&self, suffix: &str) -> String {
        format!(
            "amqps://{}/devices/{}/{}",
            self.iothub_host_fqdn, self.device_id, suffix
        )
    }
}
