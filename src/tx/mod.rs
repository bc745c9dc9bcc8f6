//! Transaction model
//!
//! An [`UnsignedTransaction`] is a body plus the script bundle the vault's
//! spending validator needs (redeemers, scripts, datums). Key holders sign the
//! body hash; the [`assembler`] merges their signatures back in without
//! touching the script bundle.
//!
//! Witness components live in `BTreeSet`s so that merging is a set union and
//! equality is independent of the order a wallet or venue emitted them in.

pub mod assembler;

pub use assembler::{assemble, resolve, AssemblyError};

use crate::vault::{Credential, Direction, OperationKind, OrderTerms, VaultId};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// BLAKE3 hash of a body's canonical encoding; the message key holders sign
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyHash(#[serde(with = "hex::serde")] pub [u8; 32]);

impl BodyHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BodyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BodyHash({})", self.to_hex())
    }
}

impl fmt::Display for BodyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Ledger transaction identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub String);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub tx_id: String,
    pub index: u32,
}

/// Where an output's funds go
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Destination {
    /// Back under the vault's spending script
    Vault(VaultId),
    /// A key-locked address
    Credential(Credential),
    /// Any other address, e.g. a venue settlement address
    External(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputDatum {
    Order(OrderTerms),
    DatumHash { hash: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub destination: Destination,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datum: Option<OutputDatum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBody {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub fee: u64,
    #[serde(default)]
    pub required_signers: Vec<Credential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_start: Option<DateTime<Utc>>,
}

impl TxBody {
    /// Deterministic, length-prefixed encoding of every body field
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        put_u64(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            put_str(&mut out, &input.tx_id);
            put_u64(&mut out, input.index as u64);
        }

        put_u64(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            match &output.destination {
                Destination::Vault(id) => {
                    out.push(0);
                    put_str(&mut out, id.as_str());
                }
                Destination::Credential(cred) => {
                    out.push(1);
                    put_str(&mut out, cred.as_str());
                }
                Destination::External(addr) => {
                    out.push(2);
                    put_str(&mut out, addr);
                }
            }
            put_u64(&mut out, output.amount);
            match &output.datum {
                None => out.push(0),
                Some(OutputDatum::Order(order)) => {
                    out.push(1);
                    put_u64(&mut out, order.collateral);
                    put_u64(&mut out, order.leverage);
                    out.push(match order.direction {
                        Direction::Long => 0,
                        Direction::Short => 1,
                    });
                }
                Some(OutputDatum::DatumHash { hash }) => {
                    out.push(2);
                    put_str(&mut out, hash);
                }
            }
        }

        put_u64(&mut out, self.fee);
        put_u64(&mut out, self.required_signers.len() as u64);
        for signer in &self.required_signers {
            put_str(&mut out, signer.as_str());
        }

        match self.validity_start {
            None => out.push(0),
            Some(start) => {
                out.push(1);
                out.extend_from_slice(&start.timestamp_millis().to_be_bytes());
            }
        }
        out
    }

    pub fn hash(&self) -> BodyHash {
        BodyHash(*blake3::hash(&self.canonical_bytes()).as_bytes())
    }
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_u64(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedeemerTag {
    Spend,
    Mint,
    Cert,
    Reward,
}

/// What a redeemer asks a script to accept
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RedeemerAction {
    /// An action understood by the vault's spending validator
    Vault(OperationKind),
    /// Hex-encoded data for some other script
    Opaque(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExUnits {
    pub mem: u64,
    pub steps: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Redeemer {
    pub tag: RedeemerTag,
    pub index: u32,
    pub action: RedeemerAction,
    #[serde(default)]
    pub ex_units: ExUnits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    Native,
    PlutusV1,
    PlutusV2,
    PlutusV3,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Script {
    pub language: ScriptLanguage,
    /// Hex-encoded script bytes
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Datum {
    /// Hex-encoded datum bytes
    pub bytes: String,
}

/// An Ed25519 verification key and its signature over a body hash
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VKeyWitness {
    pub vkey: String,
    pub signature: String,
}

impl VKeyWitness {
    pub fn vkey_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.vkey).ok()?;
        bytes.try_into().ok()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.vkey_bytes().map(|vkey| Credential::from_vkey(&vkey))
    }

    /// Strict Ed25519 verification over the body hash
    pub fn verifies(&self, body_hash: &BodyHash) -> bool {
        let Some(vkey) = self.vkey_bytes() else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&vkey) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&self.signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        key.verify_strict(&body_hash.0, &signature).is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSet {
    #[serde(default)]
    pub vkeys: BTreeSet<VKeyWitness>,
    #[serde(default)]
    pub redeemers: BTreeSet<Redeemer>,
    #[serde(default)]
    pub scripts: BTreeSet<Script>,
    #[serde(default)]
    pub datums: BTreeSet<Datum>,
}

impl WitnessSet {
    /// Set union of two witness sets.
    ///
    /// Redeemers are keyed by `(tag, index)`: the ledger allows one per
    /// slot, so when both sides carry one for the same slot, `self` wins.
    pub fn union(&self, other: &WitnessSet) -> WitnessSet {
        let mut redeemers = self.redeemers.clone();
        for redeemer in &other.redeemers {
            if !self.has_redeemer_for(redeemer.tag, redeemer.index) {
                redeemers.insert(redeemer.clone());
            }
        }
        WitnessSet {
            vkeys: self.vkeys.union(&other.vkeys).cloned().collect(),
            redeemers,
            scripts: self.scripts.union(&other.scripts).cloned().collect(),
            datums: self.datums.union(&other.datums).cloned().collect(),
        }
    }

    fn has_redeemer_for(&self, tag: RedeemerTag, index: u32) -> bool {
        self.redeemers
            .iter()
            .any(|r| r.tag == tag && r.index == index)
    }

    /// Whether every redeemer, script, and datum of `other` is present here
    pub fn retains_scripts_of(&self, other: &WitnessSet) -> bool {
        self.redeemers.is_superset(&other.redeemers)
            && self.scripts.is_superset(&other.scripts)
            && self.datums.is_superset(&other.datums)
    }

    pub fn signers(&self) -> BTreeSet<Credential> {
        self.vkeys.iter().filter_map(|w| w.credential()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryData {
    #[serde(default)]
    pub metadata: BTreeMap<u64, String>,
}

/// A venue-built transaction awaiting key-holder signatures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub body: TxBody,
    #[serde(default)]
    pub witnesses: WitnessSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_data: Option<AuxiliaryData>,
}

impl UnsignedTransaction {
    pub fn body_hash(&self) -> BodyHash {
        self.body.hash()
    }
}

/// Signature-only bundle returned by a key holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureWitness {
    pub body_hash: BodyHash,
    pub signatures: Vec<VKeyWitness>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub body: TxBody,
    pub witnesses: WitnessSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_data: Option<AuxiliaryData>,
}

impl SignedTransaction {
    pub fn tx_id(&self) -> TxId {
        TxId(self.body.hash().to_hex())
    }

    /// Required signers with no signature in the witness set
    pub fn missing_signers(&self) -> Vec<Credential> {
        let present = self.witnesses.signers();
        self.body
            .required_signers
            .iter()
            .filter(|c| !present.contains(*c))
            .cloned()
            .collect()
    }
}
