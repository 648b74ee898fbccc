//! Ergonomic construction of a [`MessengerConfig`], mirroring the teacher's
//! `DeviceClientBuilder` (`ingress/builder.rs`): required fields go into
//! `new`, optional ones through `with_*` methods consuming `self`, and
//! `build` defers all validation to the end.

use super::{LinkConfig, MessengerConfig};
use crate::error::ConfigError;

pub struct MessengerConfigBuilder {
    client_version: String,
    device_id: String,
    iothub_host_fqdn: String,
    send_link: Option<LinkConfig>,
    receive_link: Option<LinkConfig>,
}

impl MessengerConfigBuilder {
    pub fn new(device_id: impl Into<String>, iothub_host_fqdn: impl Into<String>) -> Self {
        MessengerConfigBuilder {
            client_version: String::new(),
            device_id: device_id.into(),
            iothub_host_fqdn: iothub_host_fqdn.into(),
            send_link: None,
            receive_link: None,
        }
    }

    pub fn with_client_version(mut self, client_version: impl Into<String>) -> Self {
        self.client_version = client_version.into();
        self
    }

    pub fn with_send_link(mut self, send_link: LinkConfig) -> Self {
        self.send_link = Some(send_link);
        self
    }

    pub fn with_receive_link(mut self, receive_link: LinkConfig) -> Self {
        self.receive_link = Some(receive_link);
        self
    }

    pub fn build(self) -> Result<MessengerConfig, ConfigError> {
        let config = MessengerConfig {
            client_version: self.client_version,
            device_id: self.device_id,
            iothub_host_fqdn: self.iothub_host_fqdn,
            send_link: self
                .send_link
                .unwrap_or_else(|| LinkConfig::new("", "")),
            receive_link: self
                .receive_link
                .unwrap_or_else(|| LinkConfig::new("", "")),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_succeeds_once_both_links_are_set() {
        let config = MessengerConfigBuilder::new("dev1", "hub.example")
            .with_client_version("test/1.0")
            .with_send_link(LinkConfig::new("messages/devicebound", "messages/events"))
            .with_receive_link(LinkConfig::new("messages/devicebound", "messages/events"))
            .build()
            .unwrap();

        assert_eq!(config.device_id, "dev1");
        assert_eq!(config.send_link.target_suffix, "messages/events");
    }

    #[test]
    fn build_fails_when_a_required_link_is_missing() {
        let result = MessengerConfigBuilder::new("dev1", "hub.example")
            .with_client_version("test/1.0")
            .with_send_link(LinkConfig::new("messages/devicebound", "messages/events"))
            .build();

        assert!(matches!(result, Err(ConfigError::MissingField { .. })));
    }
}
