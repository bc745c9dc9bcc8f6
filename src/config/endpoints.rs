//! Submission endpoint configuration
//!
//! Endpoints are read from the environment in priority order:
//! 1. WALLET_RELAY_URL, then WALLET_RELAY_FALLBACK_URL
//! 2. LEDGER_NODE_URL (with LEDGER_NODE_PROJECT_ID sent as a header)
//! 3. A public node, only when nothing else is configured (for testing only)
//!
//! # Examples
//!
//! ```bash
//! # Relay first, own node as fallback (recommended for production)
//! export WALLET_RELAY_URL="https://relay.example.com/submit"
//! export LEDGER_NODE_URL="https://cardano-mainnet.blockfrost.io/api/v0/tx/submit"
//! export LEDGER_NODE_PROJECT_ID="mainnetXXXX"
//!
//! # No env vars: uses the public node (rate limited, for testing only)
//! ```

use crate::submission::{HttpChannel, SubmissionChannel};
use std::sync::Arc;
use url::Url;

/// Header carrying the node project id
pub const PROJECT_ID_HEADER: &str = "project_id";

/// Environment variable names
pub mod env_vars {
    pub const WALLET_RELAY_URL: &str = "WALLET_RELAY_URL";
    pub const WALLET_RELAY_FALLBACK_URL: &str = "WALLET_RELAY_FALLBACK_URL";
    pub const LEDGER_NODE_URL: &str = "LEDGER_NODE_URL";
    pub const LEDGER_NODE_PROJECT_ID: &str = "LEDGER_NODE_PROJECT_ID";
}

/// Public submit endpoint (rate limited, for testing only)
pub const PUBLIC_NODE_URL: &str = "https://preprod.koios.rest/api/v1/submittx";

#[derive(Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: Url,
    project_id: Option<String>,
}

impl Endpoint {
    pub fn parse(
        name: impl Into<String>,
        url: &str,
        project_id: Option<String>,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            name: name.into(),
            url: Url::parse(url)?,
            project_id,
        })
    }

    pub fn has_project_id(&self) -> bool {
        self.project_id.is_some()
    }

    pub fn to_channel(&self) -> Arc<dyn SubmissionChannel> {
        let channel = HttpChannel::new(self.name.clone(), self.url.clone());
        match &self.project_id {
            Some(id) => Arc::new(channel.with_header(PROJECT_ID_HEADER, id.clone())),
            None => Arc::new(channel),
        }
    }
}

// Project ids are credentials
impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("url", &self.url.as_str())
            .field(
                "project_id",
                &self.project_id.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Ordered submission endpoints
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    endpoints: Vec<Endpoint>,
}

impl EndpointConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` uses the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut endpoints = Vec::new();
        let mut push = |name: &str, var: &str, project_id: Option<String>| {
            let Some(raw) = lookup(var).filter(|v| !v.trim().is_empty()) else {
                return;
            };
            match Endpoint::parse(name, raw.trim(), project_id) {
                Ok(endpoint) => {
                    tracing::debug!(endpoint = name, "Using {} for submission", var);
                    endpoints.push(endpoint);
                }
                Err(e) => {
                    tracing::warn!(variable = var, error = %e, "Invalid endpoint URL; skipping");
                }
            }
        };

        push("wallet-relay", env_vars::WALLET_RELAY_URL, None);
        push(
            "wallet-relay-fallback",
            env_vars::WALLET_RELAY_FALLBACK_URL,
            None,
        );
        push(
            "ledger-node",
            env_vars::LEDGER_NODE_URL,
            lookup(env_vars::LEDGER_NODE_PROJECT_ID),
        );

        if endpoints.is_empty() {
            tracing::warn!("No submission endpoint configured, using public node (rate limited)");
            if let Ok(endpoint) = Endpoint::parse("public-node", PUBLIC_NODE_URL, None) {
                endpoints.push(endpoint);
            }
        }

        Self { endpoints }
    }

    pub fn with_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn to_channels(&self) -> Vec<Arc<dyn SubmissionChannel>> {
        self.endpoints.iter().map(Endpoint::to_channel).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn relays_come_before_ledger_node() {
        let config = EndpointConfig::from_lookup(lookup(&[
            (env_vars::LEDGER_NODE_URL, "https://node.example/submit"),
            (env_vars::LEDGER_NODE_PROJECT_ID, "preprodSecret"),
            (env_vars::WALLET_RELAY_URL, "https://relay.example/submit"),
            (
                env_vars::WALLET_RELAY_FALLBACK_URL,
                "https://relay2.example/submit",
            ),
        ]));

        let names: Vec<_> = config.endpoints().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["wallet-relay", "wallet-relay-fallback", "ledger-node"]
        );
        assert!(config.endpoints()[2].has_project_id());
        assert_eq!(config.to_channels().len(), 3);
    }

    #[test]
    fn public_node_fallback_when_unconfigured() {
        let config = EndpointConfig::from_lookup(lookup(&[]));
        assert_eq!(config.endpoints().len(), 1);
        assert_eq!(config.endpoints()[0].url.as_str(), PUBLIC_NODE_URL);
    }

    #[test]
    fn invalid_urls_are_skipped() {
        let config = EndpointConfig::from_lookup(lookup(&[
            (env_vars::WALLET_RELAY_URL, "not a url"),
            (env_vars::LEDGER_NODE_URL, "https://node.example/submit"),
        ]));
        assert_eq!(config.endpoints().len(), 1);
        assert_eq!(config.endpoints()[0].name, "ledger-node");
    }

    #[test]
    fn debug_redacts_project_id() {
        let endpoint = Endpoint::parse(
            "ledger-node",
            "https://node.example/submit",
            Some("preprodSecret".to_string()),
        )
        .unwrap();
        let debug_str = format!("{:?}", endpoint);
        assert!(!debug_str.contains("preprodSecret"));
        assert!(debug_str.contains("[REDACTED]"));
    }
}
