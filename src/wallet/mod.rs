//! Key holders
//!
//! The vault never sees private keys. A [`KeyHolder`] signs unsigned
//! transactions and answers either with a bare signature witness or with a
//! fully signed transaction; [`crate::tx::resolve`] accepts both.

mod signer;

pub use signer::{LocalKeyHolder, ResponseShape};

use crate::tx::{SignatureWitness, SignedTransaction, UnsignedTransaction};
use crate::vault::Credential;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("environment variable {0} not set")]
    MissingKey(String),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

impl From<WalletError> for crate::Error {
    fn from(err: WalletError) -> Self {
        crate::Error::Wallet(err.to_string())
    }
}

/// The two shapes a key holder may answer with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletResponse {
    /// A fully signed transaction (wallet fast path)
    Signed(SignedTransaction),
    /// Signatures only; the caller assembles the transaction
    Witness(SignatureWitness),
}

#[async_trait]
pub trait KeyHolder: Send + Sync {
    /// Credential of the key this holder signs with
    fn credential(&self) -> Credential;

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<WalletResponse, WalletError>;
}
