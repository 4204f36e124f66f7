//! WAN group configuration
//!
//! The deployment is described by a JSON document using the `WAN_AGENT_*`
//! key names. Loading validates the document eagerly: a missing mandatory
//! key, an empty site list, or an unresolvable address is fatal before any
//! socket is opened.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::relay::types::SiteId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Covers malformed JSON and missing mandatory keys; serde names the
    /// offending `WAN_AGENT_*` key in the message.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{key} does not have any site entries")]
    EmptySites { key: &'static str },

    #[error("site {site_id} has an invalid ip address {ip:?}")]
    InvalidAddress { site_id: SiteId, ip: String },

    #[error("no remote server sites to send to")]
    NoRemotePeers,
}

/// One peer entry inside a site list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(rename = "WAN_AGENT_CONF_SITES_ID")]
    pub id: SiteId,
    #[serde(rename = "WAN_AGENT_CONF_SITES_IP")]
    pub ip: String,
    #[serde(rename = "WAN_AGENT_CONF_SITES_PORT")]
    pub port: u16,
}

impl SiteConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.ip.parse().map_err(|_| ConfigError::InvalidAddress {
            site_id: self.id,
            ip: self.ip.clone(),
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Validated WAN group configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanConfig {
    #[serde(rename = "WAN_AGENT_CONF_VERSION")]
    pub version: String,
    #[serde(rename = "WAN_AGENT_CONF_LOCAL_SITE_ID")]
    pub local_site_id: SiteId,
    #[serde(rename = "WAN_AGENT_CONF_PRIVATE_IP")]
    pub private_ip: String,
    #[serde(rename = "WAN_AGENT_CONF_PRIVATE_PORT")]
    pub private_port: u16,
    /// Peers this process connects to when acting as a sender.
    #[serde(rename = "WAN_AGENT_CONF_SERVER_SITES")]
    pub server_sites: Vec<SiteConfig>,
    /// Peers that connect to this process when it acts as a server.
    #[serde(rename = "WAN_AGENT_CONF_SENDER_SITES")]
    pub sender_sites: Vec<SiteConfig>,
    #[serde(rename = "WAN_AGENT_WINDOW_SIZE")]
    pub window_size: u64,
    #[serde(rename = "WAN_AGENT_MAX_PAYLOAD_SIZE")]
    pub max_payload_size: u64,
}

impl WanConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: WanConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender_sites.is_empty() {
            return Err(ConfigError::EmptySites { key: "WAN_AGENT_CONF_SENDER_SITES" });
        }
        if self.server_sites.is_empty() {
            return Err(ConfigError::EmptySites { key: "WAN_AGENT_CONF_SERVER_SITES" });
        }
        for site in self.server_sites.iter().chain(self.sender_sites.iter()) {
            site.socket_addr()?;
        }
        Ok(())
    }

    /// Local bind endpoint as `ip:port`.
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.private_ip, self.private_port)
    }

    /// Resolved server sites this process sends to, excluding itself.
    /// Empty output is fatal: a sender with no remote peers cannot relay.
    pub fn remote_server_sites(&self) -> Result<BTreeMap<SiteId, SocketAddr>, ConfigError> {
        let mut sites = BTreeMap::new();
        for site in &self.server_sites {
            if site.id != self.local_site_id {
                sites.insert(site.id, site.socket_addr()?);
            }
        }
        if sites.is_empty() {
            return Err(ConfigError::NoRemotePeers);
        }
        Ok(sites)
    }

    /// Number of sender connections the server side accepts before it
    /// reports ready: one per configured sender site.
    pub fn num_senders(&self) -> usize {
        self.sender_sites.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "WAN_AGENT_CONF_VERSION": "0.1",
            "WAN_AGENT_CONF_LOCAL_SITE_ID": 1,
            "WAN_AGENT_CONF_PRIVATE_IP": "127.0.0.1",
            "WAN_AGENT_CONF_PRIVATE_PORT": 38000,
            "WAN_AGENT_CONF_SERVER_SITES": [
                { "WAN_AGENT_CONF_SITES_ID": 1, "WAN_AGENT_CONF_SITES_IP": "127.0.0.1", "WAN_AGENT_CONF_SITES_PORT": 38000 },
                { "WAN_AGENT_CONF_SITES_ID": 2, "WAN_AGENT_CONF_SITES_IP": "127.0.0.1", "WAN_AGENT_CONF_SITES_PORT": 38001 }
            ],
            "WAN_AGENT_CONF_SENDER_SITES": [
                { "WAN_AGENT_CONF_SITES_ID": 1, "WAN_AGENT_CONF_SITES_IP": "127.0.0.1", "WAN_AGENT_CONF_SITES_PORT": 38000 }
            ],
            "WAN_AGENT_WINDOW_SIZE": 16,
            "WAN_AGENT_MAX_PAYLOAD_SIZE": 1024
        })
    }

    #[test]
    fn test_parse_full_config() {
        let config = WanConfig::from_json(&sample_json().to_string()).unwrap();
        assert_eq!(config.local_site_id, 1);
        assert_eq!(config.local_endpoint(), "127.0.0.1:38000");
        assert_eq!(config.num_senders(), 1);

        let remotes = config.remote_server_sites().unwrap();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[&2], "127.0.0.1:38001".parse().unwrap());
    }

    #[test]
    fn test_missing_mandatory_key_names_it() {
        let mut json = sample_json();
        json.as_object_mut()
            .unwrap()
            .remove("WAN_AGENT_CONF_LOCAL_SITE_ID");

        let err = WanConfig::from_json(&json.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(
            err.to_string().contains("WAN_AGENT_CONF_LOCAL_SITE_ID"),
            "error should name the missing key: {err}"
        );
    }

    #[test]
    fn test_missing_site_field_names_it() {
        let mut json = sample_json();
        json["WAN_AGENT_CONF_SERVER_SITES"][0]
            .as_object_mut()
            .unwrap()
            .remove("WAN_AGENT_CONF_SITES_PORT");

        let err = WanConfig::from_json(&json.to_string()).unwrap_err();
        assert!(err.to_string().contains("WAN_AGENT_CONF_SITES_PORT"), "{err}");
    }

    #[test]
    fn test_empty_site_list_rejected() {
        let mut json = sample_json();
        json["WAN_AGENT_CONF_SERVER_SITES"] = serde_json::json!([]);

        let err = WanConfig::from_json(&json.to_string()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::EmptySites { key: "WAN_AGENT_CONF_SERVER_SITES" }
        ));
    }

    #[test]
    fn test_invalid_ip_rejected() {
        let mut json = sample_json();
        json["WAN_AGENT_CONF_SERVER_SITES"][1]["WAN_AGENT_CONF_SITES_IP"] =
            serde_json::json!("not-an-ip");

        let err = WanConfig::from_json(&json.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { site_id: 2, .. }));
    }

    #[test]
    fn test_only_local_server_site_means_no_remote_peers() {
        let mut json = sample_json();
        json["WAN_AGENT_CONF_SERVER_SITES"] = serde_json::json!([
            { "WAN_AGENT_CONF_SITES_ID": 1, "WAN_AGENT_CONF_SITES_IP": "127.0.0.1", "WAN_AGENT_CONF_SITES_PORT": 38000 }
        ]);

        let config = WanConfig::from_json(&json.to_string()).unwrap();
        assert!(matches!(
            config.remote_server_sites(),
            Err(ConfigError::NoRemotePeers)
        ));
    }
}
