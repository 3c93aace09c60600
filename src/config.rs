//! Node configuration.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for an exchange node.
///
/// Every field has a default, so a JSON settings file only needs to name
/// what it wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to listen on for inbound sessions. Use port 0 for an
    /// ephemeral port.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Peers to dial at startup. Endpoint addresses only; identities are
    /// learned from the hello exchange.
    #[serde(default)]
    pub bootstrap: Vec<SocketAddr>,

    /// Cap on concurrent inbound connection workers. Sessions beyond the
    /// cap are refused.
    #[serde(default = "default_max_inbound_workers")]
    pub max_inbound_workers: usize,

    /// Total budget for a `get_block` call before it reports a timeout.
    #[serde(default = "default_get_block_timeout_secs")]
    pub get_block_timeout_secs: u64,

    /// Budget for dialling a peer when a message needs to go out.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:0".parse().expect("valid listen address")
}

fn default_max_inbound_workers() -> usize {
    25
}

fn default_get_block_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bootstrap: Vec::new(),
            max_inbound_workers: default_max_inbound_workers(),
            get_block_timeout_secs: default_get_block_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl NodeConfig {
    /// Config for tests: ephemeral port on localhost.
    pub fn test() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn get_block_timeout(&self) -> Duration {
        Duration::from_secs(self.get_block_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_contract() {
        let config = NodeConfig::default();
        assert_eq!(config.get_block_timeout(), Duration::from_secs(60));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_inbound_workers, 25);
        assert_eq!(config.listen.port(), 0);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config = NodeConfig::from_json(r#"{"listen":"0.0.0.0:4001","get_block_timeout_secs":5}"#).unwrap();
        assert_eq!(config.listen.port(), 4001);
        assert_eq!(config.get_block_timeout_secs, 5);
        assert_eq!(config.max_inbound_workers, 25);
        assert!(config.bootstrap.is_empty());
    }

    #[test]
    fn bad_json_is_an_error() {
        assert!(NodeConfig::from_json("not json").is_err());
    }
}
