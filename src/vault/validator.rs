//! Authorization validator
//!
//! Decides whether an operation may be applied to a vault and, if so, what
//! the vault looks like afterwards. Nothing here performs IO; the caller
//! persists the returned state.
//!
//! Checks run in a fixed order and the first violation wins:
//!
//! 1. the transaction's claims match the operation kind
//! 2. the required identity signed
//! 3. agent authorization, then the emergency stop
//! 4. leverage
//! 5. per-trade limits
//! 6. available balance
//! 7. venue proof or recall outputs
//! 8. the vault's continuing output and every other output are accounted for
//! 9. checked arithmetic

use super::{
    ClaimedPayment, Credential, Direction, Operation, OperationKind, OrderTerms, TxClaims,
    VaultState, VenueProof, PROTOCOL_MAX_LEVERAGE, PROTOCOL_MIN_TRADE,
};
use crate::tx::Destination;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity whose signature an operation requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Agent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Owner => f.write_str("owner"),
            Role::Agent => f.write_str("agent"),
        }
    }
}

/// Why an operation was refused. Rejections are final and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("unknown or malformed operation")]
    UnknownOrMalformed,

    #[error("missing {required} signature")]
    MissingSignature { required: Role },

    #[error("agent is not authorized to trade")]
    AgentNotAuthorized,

    #[error("emergency stop is active")]
    EmergencyStopActive,

    #[error("leverage {requested} exceeds vault limit {limit}")]
    LeverageExceeded { requested: u64, limit: u64 },

    #[error("leverage limit {requested} exceeds the protocol maximum")]
    LeverageAboveProtocolMax { requested: u64 },

    #[error("amount exceeds the vault's per-trade limit")]
    AmountExceedsTradeLimit,

    #[error("amount is below the minimum trade")]
    BelowMinimumTrade,

    #[error("amount exceeds available balance")]
    InsufficientBalance,

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("venue proof does not match the transaction")]
    VenueProofMismatch,

    #[error("recall routes {routed} to the owner, {required} required")]
    RecallIncomplete { required: u64, routed: u64 },

    #[error("transaction time precedes the last trade")]
    ClockRegression,

    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    #[error("resulting state violates vault invariants")]
    InvariantViolated,

    #[error("owner and agent identities must differ")]
    IdentityCollision,
}

/// Protocol-level policy shared by every vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultPolicy {
    /// Venue address that agent trades must settle to
    #[serde(default)]
    pub settlement_address: String,

    /// Smallest accepted trade; never below [`PROTOCOL_MIN_TRADE`]
    #[serde(default = "default_min_trade")]
    pub min_trade: u64,
}

fn default_min_trade() -> u64 {
    PROTOCOL_MIN_TRADE
}

impl Default for VaultPolicy {
    fn default() -> Self {
        Self {
            settlement_address: String::new(),
            min_trade: default_min_trade(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    policy: VaultPolicy,
}

impl Validator {
    pub fn new(mut policy: VaultPolicy) -> Self {
        if policy.min_trade < PROTOCOL_MIN_TRADE {
            tracing::warn!(
                configured = policy.min_trade,
                floor = PROTOCOL_MIN_TRADE,
                "Minimum trade below protocol floor, clamping"
            );
            policy.min_trade = PROTOCOL_MIN_TRADE;
        }
        Self { policy }
    }

    pub fn policy(&self) -> &VaultPolicy {
        &self.policy
    }

    /// Validate `op` against `state` and return the state it produces.
    ///
    /// `claims` must be derived from the transaction that carries `op`.
    pub fn validate(
        &self,
        state: &VaultState,
        op: &Operation,
        claims: &TxClaims,
    ) -> Result<VaultState, RejectReason> {
        let outcome = match op {
            Operation::UserDeposit { amount } => self.deposit(state, *amount, claims),
            Operation::UserWithdraw { amount } => self.withdraw(state, *amount, claims),
            Operation::AgentTrade {
                amount,
                leverage,
                direction,
                venue_proof,
            } => self.agent_trade(state, *amount, *leverage, *direction, venue_proof, claims),
            Operation::EmergencyStop => self.emergency_stop(state, claims),
            Operation::UpdateSettings {
                max_trade_amount,
                leverage_limit,
                agent_authorized,
            } => self.update_settings(
                state,
                *max_trade_amount,
                *leverage_limit,
                *agent_authorized,
                claims,
            ),
        };

        match outcome {
            Ok(next) if !next.check_invariants() => {
                tracing::error!(
                    operation = %op.kind(),
                    total_deposited = next.total_deposited,
                    available_balance = next.available_balance,
                    leverage_limit = next.leverage_limit,
                    "Operation would break vault invariants"
                );
                Err(RejectReason::InvariantViolated)
            }
            Ok(next) => {
                tracing::debug!(
                    operation = %op.kind(),
                    available_balance = next.available_balance,
                    total_deposited = next.total_deposited,
                    trade_count = next.trade_count,
                    "Operation accepted"
                );
                Ok(next)
            }
            Err(reason) => {
                tracing::info!(operation = %op.kind(), reason = %reason, "Operation rejected");
                Err(reason)
            }
        }
    }

    fn deposit(
        &self,
        state: &VaultState,
        amount: u64,
        claims: &TxClaims,
    ) -> Result<VaultState, RejectReason> {
        // Without a vault spend only the new funds arrive; spending the vault
        // output means all of it must come back alongside them.
        let continuing = match claims.action {
            None => amount,
            Some(OperationKind::Deposit) => state
                .available_balance
                .checked_add(amount)
                .ok_or(RejectReason::ArithmeticOverflow)?,
            Some(_) => return Err(RejectReason::UnknownOrMalformed),
        };
        if amount == 0 {
            return Err(RejectReason::ZeroAmount);
        }
        // Change outputs are funded by the depositor's own inputs.
        check_accounting(claims, continuing, |_| true)?;

        let mut next = state.clone();
        next.total_deposited = state
            .total_deposited
            .checked_add(amount)
            .ok_or(RejectReason::ArithmeticOverflow)?;
        next.available_balance = state
            .available_balance
            .checked_add(amount)
            .ok_or(RejectReason::ArithmeticOverflow)?;
        Ok(next)
    }

    fn withdraw(
        &self,
        state: &VaultState,
        amount: u64,
        claims: &TxClaims,
    ) -> Result<VaultState, RejectReason> {
        expect_action(claims, OperationKind::Withdraw)?;
        require_signer(claims, &state.owner_identity, Role::Owner)?;
        if amount == 0 {
            return Err(RejectReason::ZeroAmount);
        }
        if amount > state.available_balance {
            return Err(RejectReason::InsufficientBalance);
        }

        let routed = claims
            .paid_to(&state.owner_identity)
            .ok_or(RejectReason::ArithmeticOverflow)?;
        if routed != amount {
            tracing::warn!(amount, routed, "Withdrawal does not pay the owner the amount");
            return Err(RejectReason::UnknownOrMalformed);
        }
        let owner = &state.owner_identity;
        check_accounting(claims, state.available_balance - amount, |p| {
            matches!(&p.destination, Destination::Credential(c) if c == owner)
        })?;

        let mut next = state.clone();
        next.total_deposited = state
            .total_deposited
            .checked_sub(amount)
            .ok_or(RejectReason::ArithmeticOverflow)?;
        next.available_balance = state
            .available_balance
            .checked_sub(amount)
            .ok_or(RejectReason::ArithmeticOverflow)?;
        Ok(next)
    }

    fn agent_trade(
        &self,
        state: &VaultState,
        amount: u64,
        leverage: u64,
        direction: Direction,
        venue_proof: &VenueProof,
        claims: &TxClaims,
    ) -> Result<VaultState, RejectReason> {
        expect_action(claims, OperationKind::AgentTrade)?;
        require_signer(claims, &state.agent_identity, Role::Agent)?;

        if !state.agent_authorized {
            return Err(RejectReason::AgentNotAuthorized);
        }
        if state.emergency_stop {
            return Err(RejectReason::EmergencyStopActive);
        }
        if let Some(last) = state.last_trade_at {
            if claims.now < last {
                return Err(RejectReason::ClockRegression);
            }
        }

        if leverage == 0 {
            return Err(RejectReason::UnknownOrMalformed);
        }
        if leverage > state.leverage_limit {
            return Err(RejectReason::LeverageExceeded {
                requested: leverage,
                limit: state.leverage_limit,
            });
        }

        if amount > state.max_trade_amount {
            return Err(RejectReason::AmountExceedsTradeLimit);
        }
        if amount < self.policy.min_trade {
            return Err(RejectReason::BelowMinimumTrade);
        }

        if amount > state.available_balance {
            return Err(RejectReason::InsufficientBalance);
        }

        let order = OrderTerms {
            collateral: amount,
            leverage,
            direction,
        };
        self.check_venue_proof(&order, venue_proof, claims)?;
        let settlement = self.policy.settlement_address.as_str();
        check_accounting(claims, state.available_balance - amount, |p| {
            matches!(&p.destination, Destination::External(addr) if addr == settlement)
        })?;

        let mut next = state.clone();
        next.available_balance = state
            .available_balance
            .checked_sub(amount)
            .ok_or(RejectReason::ArithmeticOverflow)?;
        next.trade_count = state
            .trade_count
            .checked_add(1)
            .ok_or(RejectReason::ArithmeticOverflow)?;
        next.last_trade_at = Some(claims.now);
        Ok(next)
    }

    fn emergency_stop(
        &self,
        state: &VaultState,
        claims: &TxClaims,
    ) -> Result<VaultState, RejectReason> {
        expect_action(claims, OperationKind::EmergencyStop)?;
        require_signer(claims, &state.owner_identity, Role::Owner)?;

        let routed = claims
            .paid_to(&state.owner_identity)
            .ok_or(RejectReason::ArithmeticOverflow)?;
        if routed < state.available_balance {
            return Err(RejectReason::RecallIncomplete {
                required: state.available_balance,
                routed,
            });
        }
        let owner = &state.owner_identity;
        check_accounting(claims, 0, |p| {
            matches!(&p.destination, Destination::Credential(c) if c == owner)
        })?;

        let mut next = state.clone();
        next.emergency_stop = true;
        next.total_deposited = state
            .total_deposited
            .checked_sub(state.available_balance)
            .ok_or(RejectReason::ArithmeticOverflow)?;
        next.available_balance = 0;
        Ok(next)
    }

    fn update_settings(
        &self,
        state: &VaultState,
        max_trade_amount: u64,
        leverage_limit: u64,
        agent_authorized: Option<bool>,
        claims: &TxClaims,
    ) -> Result<VaultState, RejectReason> {
        expect_action(claims, OperationKind::UpdateSettings)?;
        require_signer(claims, &state.owner_identity, Role::Owner)?;

        // A stop is permanent; trading can only be revoked afterwards.
        if state.emergency_stop && agent_authorized == Some(true) {
            return Err(RejectReason::EmergencyStopActive);
        }
        if leverage_limit > PROTOCOL_MAX_LEVERAGE {
            return Err(RejectReason::LeverageAboveProtocolMax {
                requested: leverage_limit,
            });
        }
        check_accounting(claims, state.available_balance, |_| false)?;

        let mut next = state.clone();
        next.max_trade_amount = max_trade_amount;
        next.leverage_limit = leverage_limit;
        if let Some(authorized) = agent_authorized {
            next.agent_authorized = authorized;
        }
        Ok(next)
    }

    /// The proof must name the configured venue and the requested order, and
    /// the transaction must carry exactly one settlement output backing it.
    fn check_venue_proof(
        &self,
        order: &OrderTerms,
        proof: &VenueProof,
        claims: &TxClaims,
    ) -> Result<(), RejectReason> {
        let settlement = self.policy.settlement_address.as_str();
        if settlement.is_empty() || proof.settlement_address != settlement || proof.order != *order
        {
            tracing::warn!(
                proof_address = %proof.settlement_address,
                expected_address = %settlement,
                "Venue proof does not describe the requested order"
            );
            return Err(RejectReason::VenueProofMismatch);
        }

        let mut outputs = claims.settlements(settlement);
        match (outputs.next(), outputs.next()) {
            (Some(payment), None)
                if payment.amount == order.collateral && payment.order.as_ref() == Some(order) =>
            {
                Ok(())
            }
            _ => {
                tracing::warn!(
                    settlement = %settlement,
                    "Settlement outputs do not match the venue proof"
                );
                Err(RejectReason::VenueProofMismatch)
            }
        }
    }
}

fn expect_action(claims: &TxClaims, kind: OperationKind) -> Result<(), RejectReason> {
    if claims.action == Some(kind) {
        Ok(())
    } else {
        tracing::warn!(
            expected = %kind,
            claimed = ?claims.action,
            "Transaction redeemer does not match operation"
        );
        Err(RejectReason::UnknownOrMalformed)
    }
}

/// The vault's continuing output must carry exactly `continuing`, and every
/// other output must be one the operation accounts for.
fn check_accounting(
    claims: &TxClaims,
    continuing: u64,
    accounted: impl Fn(&ClaimedPayment) -> bool,
) -> Result<(), RejectReason> {
    if claims.vault_inflow != continuing {
        tracing::warn!(
            expected = continuing,
            actual = claims.vault_inflow,
            "Vault continuing output does not match the resulting balance"
        );
        return Err(RejectReason::UnknownOrMalformed);
    }
    if let Some(stray) = claims.payments.iter().find(|p| !accounted(*p)) {
        tracing::warn!(
            destination = ?stray.destination,
            amount = stray.amount,
            "Transaction pays an output the operation does not account for"
        );
        return Err(RejectReason::UnknownOrMalformed);
    }
    Ok(())
}

fn require_signer(claims: &TxClaims, identity: &Credential, role: Role) -> Result<(), RejectReason> {
    if claims.signed_by(identity) {
        Ok(())
    } else {
        Err(RejectReason::MissingSignature { required: role })
    }
}

/// Validate with a one-off [`Validator`] built from `policy`
pub fn validate(
    policy: &VaultPolicy,
    state: &VaultState,
    op: &Operation,
    claims: &TxClaims,
) -> Result<VaultState, RejectReason> {
    Validator::new(policy.clone()).validate(state, op, claims)
}
