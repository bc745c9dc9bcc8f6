//! Vault Guard
//!
//! Off-chain guard for custodial trading vaults whose funds an autonomous
//! agent may trade within owner-set limits:
//! - Authorize every vault operation against the vault's invariants
//! - Merge key-holder signatures into venue-built transactions
//! - Submit through ordered fallback channels
//!
//! # Security Model
//!
//! - Deny by default: only a closed set of operations is ever accepted
//! - Transaction claims are re-derived from the transaction, never trusted
//! - Private keys never leave the wallet module
//! - Full audit trail of all decisions

pub mod audit_log;
pub mod config;
pub mod service;
pub mod submission;
pub mod tx;
pub mod vault;
pub mod wallet;

mod error;

// Re-export commonly used types
pub use config::{Config, EndpointConfig};
pub use error::{Error, Result};
pub use service::{ExecutionReport, VaultService};
