//! Ledger submission
//!
//! A signed transaction is offered to an ordered list of channels (wallet
//! relays, ledger nodes) one at a time. Transient failures fall through to
//! the next channel; a permanent failure means the transaction itself is bad
//! and ends the chain.

mod coordinator;
mod http;

pub use coordinator::{cancel_pair, CancelHandle, CancelSignal, SubmissionCoordinator};
pub use http::{classify_failure, HttpChannel};

use crate::tx::{SignedTransaction, TxId};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The channel could not take the transaction right now; try the next one
    Transient,
    /// The ledger will never accept this transaction
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => f.write_str("transient"),
            FailureClass::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} failure: {message}")]
pub struct ChannelError {
    pub class: FailureClass,
    pub message: String,
}

impl ChannelError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait SubmissionChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, tx: &SignedTransaction) -> Result<TxId, ChannelError>;
}

/// One failed attempt, as recorded in receipts, errors and the audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelFailure {
    pub channel: String,
    pub class: FailureClass,
    pub message: String,
    pub elapsed_ms: u64,
}

/// Submission progress; every transition is kept in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    Pending,
    Trying { index: usize, channel: String },
    Accepted { channel: String, tx_id: TxId },
    Exhausted,
    Aborted { channel: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub tx_id: TxId,
    /// Channel that accepted the transaction
    pub channel: String,
    /// Failed attempts that preceded acceptance
    pub attempts: Vec<ChannelFailure>,
    pub trail: Vec<SubmissionState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("no submission channels configured")]
    NoChannels,

    #[error("all {} channel(s) failed transiently", .failures.len())]
    Exhausted { failures: Vec<ChannelFailure> },

    #[error("{} rejected the transaction permanently: {}", .failure.channel, .failure.message)]
    Permanent {
        failure: ChannelFailure,
        prior: Vec<ChannelFailure>,
    },

    #[error("submission cancelled after {} attempt(s)", .failures.len())]
    Cancelled { failures: Vec<ChannelFailure> },
}

impl SubmissionError {
    /// Every attempt made before the chain stopped
    pub fn attempts(&self) -> Vec<ChannelFailure> {
        match self {
            SubmissionError::NoChannels => Vec::new(),
            SubmissionError::Exhausted { failures } | SubmissionError::Cancelled { failures } => {
                failures.clone()
            }
            SubmissionError::Permanent { failure, prior } => {
                let mut all = prior.clone();
                all.push(failure.clone());
                all
            }
        }
    }
}
