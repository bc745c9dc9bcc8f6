//! HTTP submission channel
//!
//! Works against wallet relays and ledger node submit endpoints. Both take
//! the signed transaction as JSON and answer with the accepted id, or with an
//! error payload the ledger produced.

use super::{ChannelError, FailureClass, SubmissionChannel};
use crate::tx::{SignedTransaction, TxId};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use url::Url;

/// Error payload fragments that mean the ledger rejected the transaction
/// itself. Checked before anything else, so they win even on a 5xx.
const PERMANENT_MARKERS: [&str; 6] = [
    "badinputsutxo",
    "valuenotconserved",
    "double spend",
    "already spent",
    "malformed",
    "scriptfailure",
];

const TRANSIENT_MARKERS: [&str; 3] = ["busy", "timeout", "try again"];

/// Classify a failed submission from its HTTP status (if any) and body
pub fn classify_failure(status: Option<u16>, body: &str) -> FailureClass {
    let body = body.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| body.contains(m)) {
        return FailureClass::Permanent;
    }
    if TRANSIENT_MARKERS.iter().any(|m| body.contains(m)) {
        return FailureClass::Transient;
    }
    match status {
        Some(408 | 425 | 429) => FailureClass::Transient,
        Some(s) if (400..500).contains(&s) => FailureClass::Permanent,
        _ => FailureClass::Transient,
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default, alias = "txId", alias = "hash")]
    tx_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpChannel {
    name: String,
    endpoint: Url,
    client: Client,
    /// Extra header sent with every request, e.g. a node project id
    header: Option<(String, String)>,
}

impl HttpChannel {
    pub fn new(name: impl Into<String>, endpoint: Url) -> Self {
        Self::with_client(name, endpoint, Client::new())
    }

    pub fn with_client(name: impl Into<String>, endpoint: Url, client: Client) -> Self {
        Self {
            name: name.into(),
            endpoint,
            client,
            header: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header = Some((name.into(), value.into()));
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SubmissionChannel for HttpChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<TxId, ChannelError> {
        let expected = tx.tx_id();
        let mut request = self.client.post(self.endpoint.clone()).json(&json!({
            "tx_id": expected,
            "transaction": tx,
        }));
        if let Some((name, value)) = &self.header {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::transient(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChannelError::transient(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            let class = classify_failure(Some(status.as_u16()), &body);
            tracing::debug!(
                channel = %self.name,
                status = status.as_u16(),
                class = %class,
                "Submission endpoint returned an error"
            );
            return Err(ChannelError {
                class,
                message: format!("HTTP {}: {}", status.as_u16(), body.trim()),
            });
        }

        // Some endpoints answer 200 with an error document
        let class = classify_failure(None, &body);
        if class == FailureClass::Permanent {
            return Err(ChannelError::permanent(body.trim().to_string()));
        }

        let reported = serde_json::from_str::<SubmitResponse>(&body)
            .ok()
            .and_then(|r| r.tx_id)
            .or_else(|| {
                let raw = body.trim().trim_matches('"');
                (!raw.is_empty() && raw.bytes().all(|b| b.is_ascii_hexdigit()))
                    .then(|| raw.to_lowercase())
            });

        Ok(reported.map(TxId).unwrap_or(expected))
    }
}
