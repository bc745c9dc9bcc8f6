//! Vault ledger model and authorization
//!
//! A vault holds one user's delegated trading funds. Every mutation of a
//! [`VaultState`] goes through [`Validator::validate`], a pure function over
//! the current state, a closed [`Operation`], and the [`TxClaims`] re-derived
//! from the transaction that carries it.

mod claims;
mod operation;
pub mod store;
mod validator;

pub use claims::{ClaimedPayment, TxClaims};
pub use operation::{Direction, Operation, OperationKind, OrderTerms, VenueProof};
pub use store::{FileVaultStore, MemoryVaultStore, StoreError, VaultRecord, VaultStore};
pub use validator::{validate, RejectReason, Role, Validator, VaultPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol-wide leverage ceiling. No vault setting may exceed it.
pub const PROTOCOL_MAX_LEVERAGE: u64 = 2;

/// Smallest trade the protocol accepts, in the smallest currency unit.
pub const PROTOCOL_MIN_TRADE: u64 = 1;

/// Length in bytes of a credential (public-key hash).
pub const CREDENTIAL_LEN: usize = 28;

/// Opaque identity credential, the hex-encoded hash of a verification key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(hex_hash: impl Into<String>) -> Self {
        Self(hex_hash.into().to_lowercase())
    }

    /// Derive the credential of an Ed25519 verification key
    pub fn from_vkey(vkey: &[u8; 32]) -> Self {
        let digest = blake3::hash(vkey);
        Self(hex::encode(&digest.as_bytes()[..CREDENTIAL_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a vault, used as the store key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VaultId(String);

impl VaultId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Vault ids become file names, so only `[A-Za-z0-9_-]` is allowed
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == b'_' || ch == b'-')
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner-controlled trading limits applied when a vault is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSettings {
    pub max_trade_amount: u64,
    pub leverage_limit: u64,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            max_trade_amount: 0,
            leverage_limit: PROTOCOL_MAX_LEVERAGE,
        }
    }
}

/// Persistent state attached to a vault's custodial funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultState {
    pub owner_identity: Credential,
    pub agent_identity: Credential,
    pub agent_authorized: bool,
    pub total_deposited: u64,
    pub available_balance: u64,
    pub max_trade_amount: u64,
    pub leverage_limit: u64,
    pub emergency_stop: bool,
    pub created_at: DateTime<Utc>,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub trade_count: u64,
}

impl VaultState {
    /// Open a vault with its first deposit.
    ///
    /// The agent starts unauthorized; the owner grants trading authority
    /// later through [`Operation::UpdateSettings`].
    pub fn open(
        owner: Credential,
        agent: Credential,
        settings: VaultSettings,
        deposit: u64,
        created_at: DateTime<Utc>,
    ) -> Result<Self, RejectReason> {
        if owner == agent {
            return Err(RejectReason::IdentityCollision);
        }
        if deposit == 0 {
            return Err(RejectReason::ZeroAmount);
        }
        if settings.leverage_limit > PROTOCOL_MAX_LEVERAGE {
            return Err(RejectReason::LeverageAboveProtocolMax {
                requested: settings.leverage_limit,
            });
        }

        Ok(Self {
            owner_identity: owner,
            agent_identity: agent,
            agent_authorized: false,
            total_deposited: deposit,
            available_balance: deposit,
            max_trade_amount: settings.max_trade_amount,
            leverage_limit: settings.leverage_limit,
            emergency_stop: false,
            created_at,
            last_trade_at: None,
            trade_count: 0,
        })
    }

    /// Balance and leverage invariants that every stored state satisfies
    pub fn check_invariants(&self) -> bool {
        self.available_balance <= self.total_deposited
            && self.leverage_limit <= PROTOCOL_MAX_LEVERAGE
            && self.owner_identity != self.agent_identity
    }
}
