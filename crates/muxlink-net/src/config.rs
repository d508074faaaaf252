use std::collections::HashSet;

use muxlink_proto::{ChannelId, ServiceId};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// Declarative description of every transport a [`NetDriver`] should run.
///
/// Round-trips through JSON so a deployment can keep it in a file:
///
/// ```json
/// {
///   "transports": [
///     {
///       "name": "cache",
///       "role": "connect",
///       "endpoint": "/run/muxlink/cache.sock",
///       "bindings": [{ "channel": 1, "service": 10, "initiate": true }]
///     }
///   ]
/// }
/// ```
///
/// [`NetDriver`]: crate::NetDriver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    pub transports: Vec<TransportConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Routing key for [`NetDriver::send`]; unique within a config.
    ///
    /// [`NetDriver::send`]: crate::NetDriver::send
    pub name: String,
    pub role: TransportRole,
    /// Interpreted by the [`TransportConnector`]; for the shipped Unix
    /// socket connector this is a filesystem path.
    ///
    /// [`TransportConnector`]: crate::TransportConnector
    pub endpoint: String,
    pub bindings: Vec<BindingConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportRole {
    Listen,
    Connect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub channel: ChannelId,
    pub service: ServiceId,
    /// Whether this side opens the channel handshake.
    #[serde(default)]
    pub initiate: bool,
}

impl NetConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject ambiguous routing before any of the config is applied.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for transport in &self.transports {
            if !names.insert(transport.name.as_str()) {
                return Err(NetError::DuplicateTransport {
                    name: transport.name.clone(),
                });
            }
            let mut channels = HashSet::new();
            for binding in &transport.bindings {
                if !channels.insert(binding.channel) {
                    return Err(NetError::DuplicateChannel {
                        name: transport.name.clone(),
                        channel: binding.channel,
                    });
                }
            }
        }
        Ok(())
    }
}
