//! Audit log
//!
//! Append-only JSONL record of every validation decision, assembly outcome,
//! submission attempt and state revert. Writing never blocks the operation being audited.

use crate::submission::{SubmissionError, SubmissionReceipt};
use crate::tx::{AssemblyError, BodyHash, SignedTransaction};
use crate::vault::{OperationKind, RejectReason, StoreError, VaultId, VaultRecord, VaultState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Entry in the audit log
#[derive(Debug, Serialize)]
struct AuditEntry {
    id: Uuid,
    timestamp: DateTime<Utc>,
    entry_type: &'static str,
    vault_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<OperationKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tx_id: Option<String>,
    detail: Value,
    status: &'static str,
}

impl AuditEntry {
    fn new(entry_type: &'static str, vault_id: &VaultId, status: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            entry_type,
            vault_id: vault_id.to_string(),
            operation: None,
            tx_id: None,
            detail: Value::Null,
            status,
        }
    }
}

/// Writer for audit log entries
struct AuditLogWriter {
    path: PathBuf,
}

impl AuditLogWriter {
    fn write(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct AuditLog {
    writer: Arc<Mutex<AuditLogWriter>>,
}

impl AuditLog {
    /// # Arguments
    /// * `log_path` - Path to the audit log file (JSONL format)
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(AuditLogWriter {
                path: log_path.into(),
            })),
        }
    }

    async fn append(&self, entry: AuditEntry) {
        let writer = self.writer.lock().await;
        if let Err(e) = writer.write(&entry) {
            tracing::warn!(error = %e, "Failed to write audit log entry");
        }
    }

    pub async fn vault_opened(&self, vault_id: &VaultId, outcome: Result<&VaultState, &RejectReason>) {
        let mut entry = match outcome {
            Ok(state) => {
                let mut entry = AuditEntry::new("vault_opened", vault_id, "accepted");
                entry.detail = json!({
                    "owner": state.owner_identity,
                    "agent": state.agent_identity,
                    "deposit": state.total_deposited,
                    "max_trade_amount": state.max_trade_amount,
                    "leverage_limit": state.leverage_limit,
                });
                entry
            }
            Err(reason) => {
                let mut entry = AuditEntry::new("vault_opened", vault_id, "rejected");
                entry.detail = reason_detail(reason);
                entry
            }
        };
        entry.operation = Some(OperationKind::Deposit);
        self.append(entry).await;
    }

    pub async fn validation(
        &self,
        vault_id: &VaultId,
        operation: OperationKind,
        body_hash: Option<&BodyHash>,
        outcome: Result<&VaultState, &RejectReason>,
    ) {
        let (status, detail) = match outcome {
            Ok(state) => (
                "accepted",
                json!({
                    "total_deposited": state.total_deposited,
                    "available_balance": state.available_balance,
                    "trade_count": state.trade_count,
                    "emergency_stop": state.emergency_stop,
                }),
            ),
            Err(reason) => ("rejected", reason_detail(reason)),
        };
        let mut entry = AuditEntry::new("validation", vault_id, status);
        entry.operation = Some(operation);
        entry.tx_id = body_hash.map(BodyHash::to_hex);
        entry.detail = detail;
        self.append(entry).await;
    }

    pub async fn assembly(
        &self,
        vault_id: &VaultId,
        body_hash: &BodyHash,
        outcome: Result<&SignedTransaction, &AssemblyError>,
    ) {
        let (status, detail) = match outcome {
            Ok(signed) => (
                "assembled",
                json!({
                    "signatures": signed.witnesses.vkeys.len(),
                    "redeemers": signed.witnesses.redeemers.len(),
                    "scripts": signed.witnesses.scripts.len(),
                    "datums": signed.witnesses.datums.len(),
                }),
            ),
            Err(e) => ("failed", json!({ "error": e.to_string() })),
        };
        let mut entry = AuditEntry::new("assembly", vault_id, status);
        entry.tx_id = Some(body_hash.to_hex());
        entry.detail = detail;
        self.append(entry).await;
    }

    pub async fn submission(
        &self,
        vault_id: &VaultId,
        body_hash: &BodyHash,
        outcome: Result<&SubmissionReceipt, &SubmissionError>,
    ) {
        let (status, detail) = match outcome {
            Ok(receipt) => (
                "accepted",
                json!({
                    "channel": receipt.channel,
                    "ledger_tx_id": receipt.tx_id,
                    "attempts": receipt.attempts,
                    "trail": receipt.trail,
                }),
            ),
            Err(e) => (
                match e {
                    SubmissionError::NoChannels => "no_channels",
                    SubmissionError::Exhausted { .. } => "exhausted",
                    SubmissionError::Permanent { .. } => "aborted",
                    SubmissionError::Cancelled { .. } => "cancelled",
                },
                json!({ "error": e.to_string(), "attempts": e.attempts() }),
            ),
        };
        let mut entry = AuditEntry::new("submission", vault_id, status);
        entry.tx_id = Some(body_hash.to_hex());
        entry.detail = detail;
        self.append(entry).await;
    }

    /// A committed state was rolled back after the ledger refused the transaction
    pub async fn reverted(
        &self,
        vault_id: &VaultId,
        body_hash: &BodyHash,
        outcome: Result<&VaultRecord, &StoreError>,
    ) {
        let (status, detail) = match outcome {
            Ok(record) => (
                "reverted",
                json!({
                    "version": record.version,
                    "available_balance": record.state.available_balance,
                    "total_deposited": record.state.total_deposited,
                }),
            ),
            Err(e) => ("failed", json!({ "error": e.to_string() })),
        };
        let mut entry = AuditEntry::new("revert", vault_id, status);
        entry.tx_id = Some(body_hash.to_hex());
        entry.detail = detail;
        self.append(entry).await;
    }
}

fn reason_detail(reason: &RejectReason) -> Value {
    json!({
        "reason": serde_json::to_value(reason).unwrap_or(Value::Null),
        "message": reason.to_string(),
    })
}
