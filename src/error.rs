//! Error types for the vault guard

use crate::submission::{ChannelFailure, SubmissionError};
use crate::tx::AssemblyError;
use crate::vault::{RejectReason, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation rejected: {0}")]
    ValidationRejected(#[from] RejectReason),

    #[error("Assembly failed: {0}")]
    AssemblyFailed(#[from] AssemblyError),

    #[error("Submission exhausted after {} channel(s)", .attempts.len())]
    SubmissionExhausted { attempts: Vec<ChannelFailure> },

    #[error("Submission permanently rejected by {}: {}", .failure.channel, .failure.message)]
    SubmissionPermanent {
        failure: ChannelFailure,
        prior: Vec<ChannelFailure>,
    },

    #[error("Submission cancelled after {} failed attempt(s)", .attempts.len())]
    SubmissionCancelled { attempts: Vec<ChannelFailure> },

    #[error("No submission channels configured")]
    NoChannels,

    #[error("Vault store error: {0}")]
    Store(#[from] StoreError),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SubmissionError> for Error {
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::NoChannels => Error::NoChannels,
            SubmissionError::Exhausted { failures } => Error::SubmissionExhausted {
                attempts: failures,
            },
            SubmissionError::Permanent { failure, prior } => {
                Error::SubmissionPermanent { failure, prior }
            }
            SubmissionError::Cancelled { failures } => Error::SubmissionCancelled {
                attempts: failures,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
