//! The closed set of vault operations
//!
//! Operations arrive from outside the process as JSON. Decoding is
//! deny-by-default: anything that is not exactly one of the known kinds with
//! well-formed fields is rejected as [`RejectReason::UnknownOrMalformed`].

use super::RejectReason;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Position direction on the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

/// Order terms as the venue encodes them on its settlement output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderTerms {
    /// Collateral posted, in the smallest currency unit
    pub collateral: u64,
    pub leverage: u64,
    pub direction: Direction,
}

/// The venue's statement of the position an agent trade opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueProof {
    pub settlement_address: String,
    pub order: OrderTerms,
}

/// Every way a vault may change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    UserDeposit {
        amount: u64,
    },
    UserWithdraw {
        amount: u64,
    },
    AgentTrade {
        amount: u64,
        leverage: u64,
        direction: Direction,
        venue_proof: VenueProof,
    },
    EmergencyStop,
    UpdateSettings {
        max_trade_amount: u64,
        leverage_limit: u64,
        /// Grant (`true`) or revoke (`false`) agent trading; `None` leaves it
        #[serde(default)]
        agent_authorized: Option<bool>,
    },
}

/// Discriminant of an [`Operation`], also carried by vault redeemers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Deposit,
    Withdraw,
    AgentTrade,
    EmergencyStop,
    UpdateSettings,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "deposit",
            OperationKind::Withdraw => "withdraw",
            OperationKind::AgentTrade => "agent_trade",
            OperationKind::EmergencyStop => "emergency_stop",
            OperationKind::UpdateSettings => "update_settings",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const KNOWN_KINDS: [&str; 5] = [
    "user_deposit",
    "user_withdraw",
    "agent_trade",
    "emergency_stop",
    "update_settings",
];

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::UserDeposit { .. } => OperationKind::Deposit,
            Operation::UserWithdraw { .. } => OperationKind::Withdraw,
            Operation::AgentTrade { .. } => OperationKind::AgentTrade,
            Operation::EmergencyStop => OperationKind::EmergencyStop,
            Operation::UpdateSettings { .. } => OperationKind::UpdateSettings,
        }
    }

    /// Whether this operation is initiated by the delegated agent
    pub fn is_agent_operation(&self) -> bool {
        matches!(self, Operation::AgentTrade { .. })
    }

    /// Decode an operation from its wire form
    pub fn from_wire(value: Value) -> Result<Self, RejectReason> {
        let kind = value.get("kind").and_then(|v| v.as_str());
        match kind {
            Some(kind) if KNOWN_KINDS.contains(&kind) => {}
            other => {
                tracing::warn!(kind = ?other, "Rejecting operation of unknown kind");
                return Err(RejectReason::UnknownOrMalformed);
            }
        }

        serde_json::from_value(value).map_err(|e| {
            tracing::warn!(error = %e, "Rejecting malformed operation");
            RejectReason::UnknownOrMalformed
        })
    }

    pub fn from_json_str(input: &str) -> Result<Self, RejectReason> {
        let value: Value =
            serde_json::from_str(input).map_err(|_| RejectReason::UnknownOrMalformed)?;
        Self::from_wire(value)
    }
}
