//! Witness assembly
//!
//! A transaction that spends from the vault script is only valid with its
//! redeemers, scripts, and datums present, however many signatures it
//! carries. Assembly therefore never replaces the venue's script bundle; it
//! takes the set union of that bundle and the key holder's signatures.

use super::{BodyHash, SignatureWitness, SignedTransaction, UnsignedTransaction, WitnessSet};
use crate::wallet::WalletResponse;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("witness was computed over body {actual}, expected {expected}")]
    IncompatibleBody {
        expected: BodyHash,
        actual: BodyHash,
    },

    #[error("witness carries no signatures")]
    EmptySignatures,

    #[error("signature by vkey {vkey} does not verify against the body hash")]
    InvalidSignature { vkey: String },

    #[error("required signer {credential} has not signed")]
    MissingRequiredSigner { credential: String },
}

/// Merge a signature-only witness into an unsigned transaction
pub fn assemble(
    unsigned: &UnsignedTransaction,
    new_witness: &SignatureWitness,
) -> Result<SignedTransaction, AssemblyError> {
    let expected = unsigned.body_hash();
    if new_witness.body_hash != expected {
        return Err(AssemblyError::IncompatibleBody {
            expected,
            actual: new_witness.body_hash,
        });
    }

    if new_witness.signatures.is_empty() {
        return Err(AssemblyError::EmptySignatures);
    }

    for signature in &new_witness.signatures {
        if !signature.verifies(&expected) {
            return Err(AssemblyError::InvalidSignature {
                vkey: signature.vkey.clone(),
            });
        }
    }

    let incoming = WitnessSet {
        vkeys: new_witness.signatures.iter().cloned().collect(),
        ..WitnessSet::default()
    };
    let merged = unsigned.witnesses.union(&incoming);

    tracing::debug!(
        body_hash = %expected,
        redeemers = merged.redeemers.len(),
        scripts = merged.scripts.len(),
        datums = merged.datums.len(),
        signatures = merged.vkeys.len(),
        "Assembled witness set"
    );

    Ok(SignedTransaction {
        body: unsigned.body.clone(),
        witnesses: merged,
        auxiliary_data: unsigned.auxiliary_data.clone(),
    })
}

/// Turn either key-holder response shape into a complete signed transaction.
///
/// A full signed transaction is accepted only for the same body, and its
/// witness set is still unioned with the unsigned bundle: some wallets return
/// a transaction with their own signatures but the script data stripped.
pub fn resolve(
    unsigned: &UnsignedTransaction,
    response: WalletResponse,
) -> Result<SignedTransaction, AssemblyError> {
    match response {
        WalletResponse::Witness(witness) => assemble(unsigned, &witness),
        WalletResponse::Signed(signed) => {
            let expected = unsigned.body_hash();
            let actual = signed.body.hash();
            if actual != expected {
                return Err(AssemblyError::IncompatibleBody { expected, actual });
            }
            if signed.witnesses.vkeys.is_empty() {
                return Err(AssemblyError::EmptySignatures);
            }
            for signature in signed.witnesses.vkeys.difference(&unsigned.witnesses.vkeys) {
                if !signature.verifies(&expected) {
                    return Err(AssemblyError::InvalidSignature {
                        vkey: signature.vkey.clone(),
                    });
                }
            }

            if !signed.witnesses.retains_scripts_of(&unsigned.witnesses) {
                tracing::warn!(
                    body_hash = %expected,
                    "Wallet returned a signed transaction without the full script bundle; restoring it"
                );
            }

            // The body hash does not cover auxiliary data, so the wallet's
            // copy is never used.
            if signed.auxiliary_data != unsigned.auxiliary_data {
                tracing::warn!(
                    body_hash = %expected,
                    "Wallet returned different auxiliary data; keeping the original"
                );
            }

            Ok(SignedTransaction {
                witnesses: unsigned.witnesses.union(&signed.witnesses),
                auxiliary_data: unsigned.auxiliary_data.clone(),
                body: signed.body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{
        AuxiliaryData, Datum, Destination, ExUnits, Redeemer, RedeemerAction, RedeemerTag, Script,
        ScriptLanguage, TxBody, TxInput, TxOutput, VKeyWitness,
    };
    use crate::vault::{Credential, OperationKind, VaultId};
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::BTreeSet;

    fn body() -> TxBody {
        TxBody {
            inputs: vec![TxInput {
                tx_id: "01".repeat(32),
                index: 1,
            }],
            outputs: vec![TxOutput {
                destination: Destination::Vault(VaultId::new("vault-a")),
                amount: 1_000,
                datum: None,
            }],
            fee: 170_000,
            required_signers: vec![],
            validity_start: None,
        }
    }

    fn redeemer(index: u32) -> Redeemer {
        Redeemer {
            tag: RedeemerTag::Spend,
            index,
            action: RedeemerAction::Vault(OperationKind::AgentTrade),
            ex_units: ExUnits {
                mem: 14_000,
                steps: 10_000_000,
            },
        }
    }

    fn script(code: &str) -> Script {
        Script {
            language: ScriptLanguage::PlutusV2,
            code: code.to_string(),
        }
    }

    fn unsigned_with(redeemers: u32, scripts: u32) -> UnsignedTransaction {
        let mut witnesses = WitnessSet::default();
        for i in 0..redeemers {
            witnesses.redeemers.insert(redeemer(i));
        }
        for i in 0..scripts {
            witnesses.scripts.insert(script(&format!("5901{:02x}", i)));
        }
        witnesses.datums.insert(Datum {
            bytes: "d87980".to_string(),
        });
        UnsignedTransaction {
            body: body(),
            witnesses,
            auxiliary_data: None,
        }
    }

    fn sign(seed: u8, hash: &BodyHash) -> VKeyWitness {
        let key = SigningKey::from_bytes(&[seed; 32]);
        VKeyWitness {
            vkey: hex::encode(key.verifying_key().to_bytes()),
            signature: hex::encode(key.sign(&hash.0).to_bytes()),
        }
    }

    fn witness(seeds: &[u8], hash: BodyHash) -> SignatureWitness {
        SignatureWitness {
            body_hash: hash,
            signatures: seeds.iter().map(|s| sign(*s, &hash)).collect(),
        }
    }

    #[test]
    fn merged_set_contains_every_redeemer_script_and_signature() {
        let (n, m, k) = (3u32, 2u32, 2usize);
        let unsigned = unsigned_with(n, m);
        let new_witness = witness(&[1, 2], unsigned.body_hash());

        let signed = assemble(&unsigned, &new_witness).unwrap();

        assert_eq!(signed.witnesses.redeemers, unsigned.witnesses.redeemers);
        assert_eq!(signed.witnesses.scripts, unsigned.witnesses.scripts);
        assert_eq!(signed.witnesses.datums, unsigned.witnesses.datums);
        assert_eq!(signed.witnesses.redeemers.len(), n as usize);
        assert_eq!(signed.witnesses.scripts.len(), m as usize);
        assert_eq!(signed.witnesses.vkeys.len(), k);
        let expected: BTreeSet<_> = new_witness.signatures.iter().cloned().collect();
        assert_eq!(signed.witnesses.vkeys, expected);
        assert_eq!(signed.body, unsigned.body);
    }

    #[test]
    fn assembly_is_idempotent() {
        let unsigned = unsigned_with(2, 1);
        let new_witness = witness(&[9], unsigned.body_hash());

        let once = assemble(&unsigned, &new_witness).unwrap();
        let again = UnsignedTransaction {
            body: once.body.clone(),
            witnesses: once.witnesses.clone(),
            auxiliary_data: once.auxiliary_data.clone(),
        };
        let twice = assemble(&again, &new_witness).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn assembly_ignores_signature_order() {
        let unsigned = unsigned_with(1, 1);
        let hash = unsigned.body_hash();
        let forward = assemble(&unsigned, &witness(&[1, 2, 3], hash)).unwrap();
        let backward = assemble(&unsigned, &witness(&[3, 2, 1], hash)).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn keeps_pre_existing_signatures() {
        let mut unsigned = unsigned_with(1, 1);
        let hash = unsigned.body_hash();
        unsigned.witnesses.vkeys.insert(sign(5, &hash));

        let signed = assemble(&unsigned, &witness(&[6], hash)).unwrap();
        assert_eq!(signed.witnesses.vkeys.len(), 2);
    }

    #[test]
    fn rejects_witness_for_another_body() {
        let unsigned = unsigned_with(1, 1);
        let mut other = body();
        other.fee += 1;
        let err = assemble(&unsigned, &witness(&[1], other.hash())).unwrap_err();
        assert!(matches!(err, AssemblyError::IncompatibleBody { .. }));
    }

    #[test]
    fn rejects_empty_witness() {
        let unsigned = unsigned_with(1, 1);
        let err = assemble(&unsigned, &witness(&[], unsigned.body_hash())).unwrap_err();
        assert_eq!(err, AssemblyError::EmptySignatures);
    }

    #[test]
    fn rejects_forged_signature() {
        let unsigned = unsigned_with(1, 1);
        let hash = unsigned.body_hash();
        let mut forged = sign(1, &hash);
        forged.vkey = sign(2, &hash).vkey;
        let err = assemble(
            &unsigned,
            &SignatureWitness {
                body_hash: hash,
                signatures: vec![forged],
            },
        )
        .unwrap_err();
        assert!(matches!(err, AssemblyError::InvalidSignature { .. }));
    }

    #[test]
    fn resolve_restores_scripts_stripped_by_wallet() {
        let unsigned = unsigned_with(2, 2);
        let hash = unsigned.body_hash();
        let mut stripped = WitnessSet::default();
        stripped.vkeys.insert(sign(4, &hash));

        let signed = resolve(
            &unsigned,
            WalletResponse::Signed(SignedTransaction {
                body: unsigned.body.clone(),
                witnesses: stripped,
                auxiliary_data: None,
            }),
        )
        .unwrap();

        assert!(signed.witnesses.retains_scripts_of(&unsigned.witnesses));
        assert_eq!(signed.witnesses.vkeys.len(), 1);
    }

    #[test]
    fn resolve_keeps_unsigned_redeemer_budgets() {
        let unsigned = unsigned_with(1, 1);
        let hash = unsigned.body_hash();
        let mut rebudgeted = unsigned.witnesses.clone();
        rebudgeted.redeemers = rebudgeted
            .redeemers
            .into_iter()
            .map(|mut r| {
                r.ex_units.mem *= 2;
                r
            })
            .collect();
        rebudgeted.vkeys.insert(sign(4, &hash));

        let signed = resolve(
            &unsigned,
            WalletResponse::Signed(SignedTransaction {
                body: unsigned.body.clone(),
                witnesses: rebudgeted,
                auxiliary_data: None,
            }),
        )
        .unwrap();

        assert_eq!(signed.witnesses.redeemers, unsigned.witnesses.redeemers);
    }

    #[test]
    fn resolve_ignores_wallet_auxiliary_data() {
        let mut unsigned = unsigned_with(1, 1);
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(674, "vault trade".to_string());
        unsigned.auxiliary_data = Some(AuxiliaryData { metadata });
        let hash = unsigned.body_hash();

        let mut swapped = std::collections::BTreeMap::new();
        swapped.insert(674, "pay elsewhere".to_string());
        let mut witnesses = unsigned.witnesses.clone();
        witnesses.vkeys.insert(sign(4, &hash));

        let signed = resolve(
            &unsigned,
            WalletResponse::Signed(SignedTransaction {
                body: unsigned.body.clone(),
                witnesses,
                auxiliary_data: Some(AuxiliaryData { metadata: swapped }),
            }),
        )
        .unwrap();

        assert_eq!(signed.auxiliary_data, unsigned.auxiliary_data);

        let stripped = resolve(
            &unsigned,
            WalletResponse::Signed(SignedTransaction {
                body: unsigned.body.clone(),
                witnesses: signed.witnesses.clone(),
                auxiliary_data: None,
            }),
        )
        .unwrap();
        assert_eq!(stripped.auxiliary_data, unsigned.auxiliary_data);
    }

    #[test]
    fn resolve_rejects_signed_transaction_for_another_body() {
        let unsigned = unsigned_with(1, 0);
        let mut other = body();
        other.outputs[0].amount = 1;
        let hash = other.hash();
        let mut witnesses = WitnessSet::default();
        witnesses.vkeys.insert(sign(4, &hash));

        let err = resolve(
            &unsigned,
            WalletResponse::Signed(SignedTransaction {
                body: other,
                witnesses,
                auxiliary_data: None,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, AssemblyError::IncompatibleBody { .. }));
    }

    #[test]
    fn resolve_witness_path_matches_assemble() {
        let unsigned = unsigned_with(1, 1);
        let new_witness = witness(&[8], unsigned.body_hash());
        let via_resolve = resolve(&unsigned, WalletResponse::Witness(new_witness.clone())).unwrap();
        assert_eq!(via_resolve, assemble(&unsigned, &new_witness).unwrap());

        let vkey = SigningKey::from_bytes(&[8; 32]).verifying_key().to_bytes();
        assert!(via_resolve
            .witnesses
            .signers()
            .contains(&Credential::from_vkey(&vkey)));
    }
}
