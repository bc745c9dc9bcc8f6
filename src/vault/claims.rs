//! Claims a transaction makes about a vault operation
//!
//! Venue-supplied metadata is never trusted. Everything the validator knows
//! about a transaction is re-derived here from its body and redeemers.

use super::{Credential, OperationKind, OrderTerms, RejectReason, VaultId};
use crate::tx::{Destination, OutputDatum, RedeemerAction, RedeemerTag, UnsignedTransaction};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// A non-vault output of the transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedPayment {
    pub destination: Destination,
    pub amount: u64,
    pub order: Option<OrderTerms>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxClaims {
    /// Credentials the ledger will require signatures from
    pub signers: BTreeSet<Credential>,
    /// The vault action named by the transaction's spend redeemer
    pub action: Option<OperationKind>,
    /// Total paid back into the vault
    pub vault_inflow: u64,
    pub payments: Vec<ClaimedPayment>,
    pub now: DateTime<Utc>,
}

impl TxClaims {
    /// Empty claims at `now`; used with the builder methods below
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            signers: BTreeSet::new(),
            action: None,
            vault_inflow: 0,
            payments: Vec::new(),
            now,
        }
    }

    pub fn signer(mut self, credential: Credential) -> Self {
        self.signers.insert(credential);
        self
    }

    pub fn action(mut self, kind: OperationKind) -> Self {
        self.action = Some(kind);
        self
    }

    pub fn vault_inflow(mut self, amount: u64) -> Self {
        self.vault_inflow = amount;
        self
    }

    pub fn payment(mut self, destination: Destination, amount: u64) -> Self {
        self.payments.push(ClaimedPayment {
            destination,
            amount,
            order: None,
        });
        self
    }

    pub fn order(mut self, settlement_address: &str, amount: u64, order: OrderTerms) -> Self {
        self.payments.push(ClaimedPayment {
            destination: Destination::External(settlement_address.to_string()),
            amount,
            order: Some(order),
        });
        self
    }

    /// Derive claims for `vault_id` from an unsigned transaction.
    ///
    /// `fallback_now` is used when the body carries no validity start.
    pub fn derive(
        tx: &UnsignedTransaction,
        vault_id: &VaultId,
        fallback_now: DateTime<Utc>,
    ) -> Result<Self, RejectReason> {
        let actions: BTreeSet<OperationKind> = tx
            .witnesses
            .redeemers
            .iter()
            .filter(|r| r.tag == RedeemerTag::Spend)
            .filter_map(|r| match &r.action {
                RedeemerAction::Vault(kind) => Some(*kind),
                RedeemerAction::Opaque(_) => None,
            })
            .collect();

        if actions.len() > 1 {
            tracing::warn!(
                vault_id = %vault_id,
                actions = ?actions,
                "Transaction names conflicting vault actions"
            );
            return Err(RejectReason::UnknownOrMalformed);
        }

        let mut vault_inflow: u64 = 0;
        let mut payments = Vec::new();
        for output in &tx.body.outputs {
            match &output.destination {
                Destination::Vault(id) if id == vault_id => {
                    vault_inflow = vault_inflow
                        .checked_add(output.amount)
                        .ok_or(RejectReason::ArithmeticOverflow)?;
                }
                destination => payments.push(ClaimedPayment {
                    destination: destination.clone(),
                    amount: output.amount,
                    order: match &output.datum {
                        Some(OutputDatum::Order(order)) => Some(*order),
                        _ => None,
                    },
                }),
            }
        }

        Ok(Self {
            signers: tx.body.required_signers.iter().cloned().collect(),
            action: actions.into_iter().next(),
            vault_inflow,
            payments,
            now: tx.body.validity_start.unwrap_or(fallback_now),
        })
    }

    pub fn signed_by(&self, credential: &Credential) -> bool {
        self.signers.contains(credential)
    }

    /// Checked total paid to a key-locked credential
    pub fn paid_to(&self, credential: &Credential) -> Option<u64> {
        self.payments
            .iter()
            .filter(|p| matches!(&p.destination, Destination::Credential(c) if c == credential))
            .try_fold(0u64, |acc, p| acc.checked_add(p.amount))
    }

    /// Payments to an external settlement address
    pub fn settlements<'a>(
        &'a self,
        settlement_address: &'a str,
    ) -> impl Iterator<Item = &'a ClaimedPayment> + 'a {
        self.payments.iter().filter(move |p| {
            matches!(&p.destination, Destination::External(addr) if addr == settlement_address)
        })
    }
}
