//! Configuration for the vault guard

pub mod endpoints;

use crate::submission::SubmissionChannel;
use crate::vault::VaultPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use endpoints::{Endpoint, EndpointConfig};

/// Environment variable holding the hex signing seed, unless overridden
pub const DEFAULT_SIGNING_KEY_ENV: &str = "VAULT_SIGNING_KEY";

/// A submission channel named in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub url: String,
    /// Environment variable holding a project id header for this channel
    #[serde(default)]
    pub project_id_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Per-channel timeout (milliseconds)
    #[serde(default = "default_channel_timeout_ms")]
    pub channel_timeout_ms: u64,
    /// Channels in fallback order; empty means read endpoints from the environment
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_channel_timeout_ms() -> u64 {
    30_000
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            channel_timeout_ms: default_channel_timeout_ms(),
            channels: Vec::new(),
        }
    }
}

impl SubmissionConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn endpoints(&self) -> crate::Result<EndpointConfig> {
        if self.channels.is_empty() {
            return Ok(EndpointConfig::from_env());
        }

        let endpoints = self
            .channels
            .iter()
            .map(|channel| {
                let project_id = channel
                    .project_id_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok());
                Endpoint::parse(channel.name.clone(), &channel.url, project_id).map_err(|e| {
                    crate::Error::Config(format!(
                        "channel {} has invalid url {}: {}",
                        channel.name, channel.url, e
                    ))
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(EndpointConfig::with_endpoints(endpoints))
    }

    pub fn build_channels(&self) -> crate::Result<Vec<Arc<dyn SubmissionChannel>>> {
        Ok(self.endpoints()?.to_channels())
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Protocol policy applied by the validator
    #[serde(default)]
    pub policy: VaultPolicy,
    #[serde(default)]
    pub submission: SubmissionConfig,
    /// Directory holding one JSON record per vault
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
    /// Path to audit log file
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: Option<String>,
    /// Environment variable the signing key is read from
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
}

fn default_store_dir() -> String {
    "vaults".to_string()
}

fn default_audit_log_path() -> Option<String> {
    Some("audit.jsonl".to_string())
}

fn default_signing_key_env() -> String {
    DEFAULT_SIGNING_KEY_ENV.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: VaultPolicy::default(),
            submission: SubmissionConfig::default(),
            store_dir: default_store_dir(),
            audit_log_path: default_audit_log_path(),
            signing_key_env: default_signing_key_env(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| crate::Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| crate::Error::Config(format!("{}: {}", path.display(), e)))?;
        config.check()?;
        Ok(config)
    }

    /// Reject settings that cannot work at all
    pub fn check(&self) -> crate::Result<()> {
        if self.submission.channel_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "submission.channel_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.policy.settlement_address.is_empty() {
            tracing::warn!("policy.settlement_address is empty; every agent trade will be rejected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::PROTOCOL_MIN_TRADE;

    #[test]
    fn empty_config_uses_defaults() {
        let parsed: Config = serde_json::from_value(serde_json::json!({})).expect("parse config");
        assert_eq!(parsed.policy.min_trade, PROTOCOL_MIN_TRADE);
        assert_eq!(parsed.submission.channel_timeout_ms, 30_000);
        assert!(parsed.submission.channels.is_empty());
        assert_eq!(parsed.store_dir, "vaults");
        assert_eq!(parsed.audit_log_path.as_deref(), Some("audit.jsonl"));
        assert_eq!(parsed.signing_key_env, DEFAULT_SIGNING_KEY_ENV);
    }

    #[test]
    fn explicit_config_parses() {
        let value = serde_json::json!({
            "policy": { "settlement_address": "addr_venue", "min_trade": 5 },
            "submission": {
                "channel_timeout_ms": 1500,
                "channels": [
                    { "name": "relay", "url": "https://relay.example/submit" },
                    { "name": "node", "url": "https://node.example/submit", "project_id_env": "NODE_ID" }
                ]
            },
            "store_dir": "/var/lib/vault-guard",
            "audit_log_path": null
        });
        let parsed: Config = serde_json::from_value(value).expect("parse config");
        assert_eq!(parsed.policy.settlement_address, "addr_venue");
        assert_eq!(parsed.policy.min_trade, 5);
        assert_eq!(parsed.submission.channel_timeout(), Duration::from_millis(1500));
        assert!(parsed.audit_log_path.is_none());

        let endpoints = parsed.submission.endpoints().unwrap();
        let names: Vec<_> = endpoints.endpoints().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["relay", "node"]);
    }

    #[test]
    fn invalid_channel_url_is_a_config_error() {
        let config = SubmissionConfig {
            channel_timeout_ms: 100,
            channels: vec![ChannelConfig {
                name: "broken".to_string(),
                url: "::nope".to_string(),
                project_id_env: None,
            }],
        };
        assert!(matches!(
            config.build_channels(),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = Config::default();
        config.submission.channel_timeout_ms = 0;
        assert!(config.check().is_err());
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{ "store_dir": "state" }"#)
            .await
            .unwrap();
        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.store_dir, "state");
    }
}
