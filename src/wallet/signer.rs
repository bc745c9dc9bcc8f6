//! Local Ed25519 key holder
//!
//! SECURITY: the seed lives in a `SecretBox` and is only exposed for the
//! duration of a signing call.
//! - Never serialized
//! - Never logged; `Debug` prints the credential only

use super::{KeyHolder, WalletError, WalletResponse};
use crate::tx::{SignatureWitness, SignedTransaction, UnsignedTransaction, VKeyWitness, WitnessSet};
use crate::vault::Credential;
use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use secrecy::{ExposeSecret, SecretBox};

/// Which response shape [`LocalKeyHolder`] answers with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseShape {
    #[default]
    Witness,
    Signed,
}

pub struct LocalKeyHolder {
    seed: SecretBox<[u8; 32]>,
    credential: Credential,
    vkey: [u8; 32],
    shape: ResponseShape,
}

impl LocalKeyHolder {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let vkey = SigningKey::from_bytes(&seed).verifying_key().to_bytes();
        Self {
            seed: SecretBox::new(Box::new(seed)),
            credential: Credential::from_vkey(&vkey),
            vkey,
            shape: ResponseShape::default(),
        }
    }

    /// Create a key holder from a hex-encoded 32-byte Ed25519 seed
    pub fn from_hex(key_hex: &str) -> Result<Self, WalletError> {
        let key_hex = key_hex.trim();
        let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);
        let bytes = hex::decode(key_hex).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            WalletError::InvalidKey(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(Self::from_seed(seed))
    }

    /// Create a key holder from an environment variable holding a hex seed
    pub fn from_env(var_name: &str) -> Result<Self, WalletError> {
        let key_hex =
            std::env::var(var_name).map_err(|_| WalletError::MissingKey(var_name.to_string()))?;
        Self::from_hex(&key_hex)
    }

    pub fn with_shape(mut self, shape: ResponseShape) -> Self {
        self.shape = shape;
        self
    }

    /// Hex-encoded verification key (safe to share)
    pub fn vkey_hex(&self) -> String {
        hex::encode(self.vkey)
    }

    fn witness_for(&self, tx: &UnsignedTransaction) -> SignatureWitness {
        let body_hash = tx.body_hash();
        let key = SigningKey::from_bytes(self.seed.expose_secret());
        let signature = key.sign(&body_hash.0);
        SignatureWitness {
            body_hash,
            signatures: vec![VKeyWitness {
                vkey: self.vkey_hex(),
                signature: hex::encode(signature.to_bytes()),
            }],
        }
    }
}

#[async_trait]
impl KeyHolder for LocalKeyHolder {
    fn credential(&self) -> Credential {
        self.credential.clone()
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<WalletResponse, WalletError> {
        if !tx.body.required_signers.contains(&self.credential) {
            tracing::warn!(
                credential = %self.credential,
                "Signing a transaction that does not require this key"
            );
        }

        let witness = self.witness_for(tx);
        tracing::debug!(
            credential = %self.credential,
            body_hash = %witness.body_hash,
            shape = ?self.shape,
            "Signed transaction body"
        );

        Ok(match self.shape {
            ResponseShape::Witness => WalletResponse::Witness(witness),
            ResponseShape::Signed => {
                let own = WitnessSet {
                    vkeys: witness.signatures.into_iter().collect(),
                    ..WitnessSet::default()
                };
                WalletResponse::Signed(SignedTransaction {
                    body: tx.body.clone(),
                    witnesses: tx.witnesses.union(&own),
                    auxiliary_data: tx.auxiliary_data.clone(),
                })
            }
        })
    }
}

impl std::fmt::Debug for LocalKeyHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyHolder")
            .field("credential", &self.credential)
            .field("seed", &"[REDACTED]")
            .field("shape", &self.shape)
            .finish()
    }
}
