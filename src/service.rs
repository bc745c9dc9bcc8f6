//! Vault service
//!
//! Drives one operation end to end: validate, sign, assemble, persist,
//! submit. The new state is committed before submission so that a
//! transaction the ledger accepts is never missing from the store. A
//! transaction that can never settle has its commit reverted.

use crate::audit_log::AuditLog;
use crate::submission::{
    CancelSignal, SubmissionChannel, SubmissionCoordinator, SubmissionReceipt,
};
use crate::tx::{resolve, AssemblyError, SignedTransaction, UnsignedTransaction};
use crate::vault::{
    Credential, Operation, StoreError, TxClaims, Validator, VaultId, VaultPolicy, VaultRecord,
    VaultSettings, VaultState, VaultStore,
};
use crate::wallet::KeyHolder;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Attempts at committing a validated state before giving up on contention
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Outcome of a successful [`VaultService::execute`]
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub record: VaultRecord,
    pub signed: SignedTransaction,
    pub receipt: SubmissionReceipt,
}

pub struct VaultService {
    store: Arc<dyn VaultStore>,
    validator: Validator,
    coordinator: SubmissionCoordinator,
    key_holder: Option<Arc<dyn KeyHolder>>,
    channels: Vec<Arc<dyn SubmissionChannel>>,
    audit: Option<AuditLog>,
}

impl VaultService {
    pub fn new(policy: VaultPolicy, store: Arc<dyn VaultStore>) -> Self {
        Self {
            store,
            validator: Validator::new(policy),
            coordinator: SubmissionCoordinator::default(),
            key_holder: None,
            channels: Vec::new(),
            audit: None,
        }
    }

    pub fn with_key_holder(mut self, key_holder: Arc<dyn KeyHolder>) -> Self {
        self.key_holder = Some(key_holder);
        self
    }

    pub fn with_channels(mut self, channels: Vec<Arc<dyn SubmissionChannel>>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_coordinator(mut self, coordinator: SubmissionCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Create a vault with its first deposit
    pub async fn open_vault(
        &self,
        vault_id: &VaultId,
        owner: Credential,
        agent: Credential,
        settings: VaultSettings,
        deposit: u64,
        created_at: DateTime<Utc>,
    ) -> Result<VaultRecord> {
        if !vault_id.is_valid() {
            return Err(Error::InvalidArgument(format!("invalid vault id: {}", vault_id)));
        }

        let opened = VaultState::open(owner, agent, settings, deposit, created_at);
        if let Some(audit) = &self.audit {
            audit.vault_opened(vault_id, opened.as_ref()).await;
        }
        let record = self.store.create(vault_id, opened?).await?;

        info!(
            vault_id = %vault_id,
            deposit,
            leverage_limit = record.state.leverage_limit,
            "Vault opened"
        );
        Ok(record)
    }

    pub async fn load(&self, vault_id: &VaultId) -> Result<VaultRecord> {
        self.store
            .load(vault_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(vault_id.clone()).into())
    }

    /// Validate without signing or persisting anything.
    ///
    /// Returns the current record and the state the operation would produce.
    pub async fn authorize(
        &self,
        vault_id: &VaultId,
        op: &Operation,
        tx: &UnsignedTransaction,
    ) -> Result<(VaultRecord, VaultState)> {
        let record = self.load(vault_id).await?;
        let claims = TxClaims::derive(tx, vault_id, Utc::now())?;
        let next = self.validate_and_audit(&record, op, &claims, tx).await?;
        Ok((record, next))
    }

    /// Validate, sign, assemble, commit and submit one operation
    pub async fn execute(
        &self,
        vault_id: &VaultId,
        op: &Operation,
        tx: &UnsignedTransaction,
        cancel: &CancelSignal,
    ) -> Result<ExecutionReport> {
        let record = self.load(vault_id).await?;
        let claims = TxClaims::derive(tx, vault_id, Utc::now())?;
        let next = self.validate_and_audit(&record, op, &claims, tx).await?;

        let key_holder = self
            .key_holder
            .as_ref()
            .ok_or_else(|| Error::Wallet("no key holder configured".to_string()))?;
        let signed = self.sign_and_assemble(vault_id, key_holder.as_ref(), tx).await?;

        let (previous, committed) = self
            .commit_validated(vault_id, op, &claims, record, next)
            .await?;

        let receipt = match self.submit(vault_id, &signed, cancel).await {
            Ok(receipt) => receipt,
            Err(e @ (Error::SubmissionPermanent { .. } | Error::NoChannels)) => {
                self.revert(vault_id, &signed, &committed, previous).await;
                return Err(e);
            }
            Err(e) => {
                warn!(
                    vault_id = %vault_id,
                    version = committed.version,
                    error = %e,
                    "State committed but submission is unconfirmed; the transaction may still settle"
                );
                return Err(e);
            }
        };

        info!(
            vault_id = %vault_id,
            operation = %op.kind(),
            version = committed.version,
            tx_id = %receipt.tx_id,
            channel = %receipt.channel,
            "Operation executed"
        );

        Ok(ExecutionReport {
            record: committed,
            signed,
            receipt,
        })
    }

    /// Submit an already signed transaction through the configured channels
    pub async fn submit(
        &self,
        vault_id: &VaultId,
        signed: &SignedTransaction,
        cancel: &CancelSignal,
    ) -> Result<SubmissionReceipt> {
        let outcome = self
            .coordinator
            .submit(signed, &self.channels, cancel)
            .await;
        if let Some(audit) = &self.audit {
            audit
                .submission(vault_id, &signed.body.hash(), outcome.as_ref())
                .await;
        }
        Ok(outcome?)
    }

    async fn validate_and_audit(
        &self,
        record: &VaultRecord,
        op: &Operation,
        claims: &TxClaims,
        tx: &UnsignedTransaction,
    ) -> Result<VaultState> {
        let outcome = self.validator.validate(&record.state, op, claims);
        if let Some(audit) = &self.audit {
            audit
                .validation(
                    &record.vault_id,
                    op.kind(),
                    Some(&tx.body_hash()),
                    outcome.as_ref(),
                )
                .await;
        }
        Ok(outcome?)
    }

    async fn sign_and_assemble(
        &self,
        vault_id: &VaultId,
        key_holder: &dyn KeyHolder,
        tx: &UnsignedTransaction,
    ) -> Result<SignedTransaction> {
        let response = key_holder.sign(tx).await?;
        let outcome = resolve(tx, response).and_then(|signed| {
            match signed.missing_signers().into_iter().next() {
                Some(missing) => Err(AssemblyError::MissingRequiredSigner {
                    credential: missing.to_string(),
                }),
                None => Ok(signed),
            }
        });
        if let Some(audit) = &self.audit {
            audit
                .assembly(vault_id, &tx.body_hash(), outcome.as_ref())
                .await;
        }
        Ok(outcome?)
    }

    /// Commit `next`, re-validating against fresh state whenever another
    /// writer moved the vault on first.
    ///
    /// Returns the state the commit replaced along with the new record.
    async fn commit_validated(
        &self,
        vault_id: &VaultId,
        op: &Operation,
        claims: &TxClaims,
        mut record: VaultRecord,
        mut next: VaultState,
    ) -> Result<(VaultState, VaultRecord)> {
        let mut attempt = 1;
        loop {
            match self.store.commit(vault_id, record.version, next).await {
                Ok(committed) => return Ok((record.state, committed)),
                Err(StoreError::VersionConflict { actual, .. }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(
                        vault_id = %vault_id,
                        expected = record.version,
                        actual,
                        attempt,
                        "Vault changed during execution, re-validating"
                    );
                    attempt += 1;
                    record = self.load(vault_id).await?;
                    next = self.validator.validate(&record.state, op, claims)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Restore `previous` after the ledger refused the transaction for good.
    ///
    /// A failed revert is logged and audited; the caller still gets the
    /// submission error.
    async fn revert(
        &self,
        vault_id: &VaultId,
        signed: &SignedTransaction,
        committed: &VaultRecord,
        previous: VaultState,
    ) {
        let outcome = self
            .store
            .commit(vault_id, committed.version, previous)
            .await;
        match &outcome {
            Ok(reverted) => warn!(
                vault_id = %vault_id,
                version = reverted.version,
                available_balance = reverted.state.available_balance,
                "Transaction refused, vault state reverted"
            ),
            Err(e) => error!(
                vault_id = %vault_id,
                version = committed.version,
                error = %e,
                "Transaction refused and vault state could not be reverted"
            ),
        }
        if let Some(audit) = &self.audit {
            audit
                .reverted(vault_id, &signed.body.hash(), outcome.as_ref())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::{ChannelError, FailureClass};
    use crate::tx::{
        Destination, ExUnits, OutputDatum, Redeemer, RedeemerAction, RedeemerTag, Script,
        ScriptLanguage, TxBody, TxId, TxInput, TxOutput, WitnessSet,
    };
    use crate::vault::{
        Direction, MemoryVaultStore, OperationKind, OrderTerms, VenueProof,
    };
    use crate::wallet::LocalKeyHolder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const VENUE: &str = "addr_test1_venue";

    fn owner_key() -> LocalKeyHolder {
        LocalKeyHolder::from_seed([1; 32])
    }

    fn agent_key() -> LocalKeyHolder {
        LocalKeyHolder::from_seed([2; 32])
    }

    fn vault_id() -> VaultId {
        VaultId::new("vault-main")
    }

    fn policy() -> VaultPolicy {
        VaultPolicy {
            settlement_address: VENUE.to_string(),
            min_trade: 1,
        }
    }

    struct CountingChannel {
        class: Option<FailureClass>,
        calls: AtomicUsize,
    }

    impl CountingChannel {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                class: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(class: FailureClass) -> Arc<Self> {
            Arc::new(Self {
                class: Some(class),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SubmissionChannel for CountingChannel {
        fn name(&self) -> &str {
            "counting"
        }

        async fn submit(&self, tx: &SignedTransaction) -> std::result::Result<TxId, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.class {
                None => Ok(tx.tx_id()),
                Some(class) => Err(ChannelError {
                    class,
                    message: "refused".to_string(),
                }),
            }
        }
    }

    /// Commits a deposit of its own right before the service's first commit
    struct ContendedStore {
        inner: MemoryVaultStore,
        interfered: AtomicBool,
    }

    #[async_trait]
    impl VaultStore for ContendedStore {
        async fn load(
            &self,
            vault_id: &VaultId,
        ) -> std::result::Result<Option<VaultRecord>, StoreError> {
            self.inner.load(vault_id).await
        }

        async fn create(
            &self,
            vault_id: &VaultId,
            state: VaultState,
        ) -> std::result::Result<VaultRecord, StoreError> {
            self.inner.create(vault_id, state).await
        }

        async fn commit(
            &self,
            vault_id: &VaultId,
            expected_version: u64,
            state: VaultState,
        ) -> std::result::Result<VaultRecord, StoreError> {
            if !self.interfered.swap(true, Ordering::SeqCst) {
                let current = self.inner.load(vault_id).await?.unwrap();
                let mut bumped = current.state.clone();
                bumped.total_deposited += 10;
                bumped.available_balance += 10;
                self.inner
                    .commit(vault_id, current.version, bumped)
                    .await?;
            }
            self.inner.commit(vault_id, expected_version, state).await
        }
    }

    fn trade_op(amount: u64, leverage: u64) -> Operation {
        Operation::AgentTrade {
            amount,
            leverage,
            direction: Direction::Long,
            venue_proof: VenueProof {
                settlement_address: VENUE.to_string(),
                order: OrderTerms {
                    collateral: amount,
                    leverage,
                    direction: Direction::Long,
                },
            },
        }
    }

    fn trade_tx(amount: u64, leverage: u64, remainder: u64) -> UnsignedTransaction {
        let mut witnesses = WitnessSet::default();
        witnesses.redeemers.insert(Redeemer {
            tag: RedeemerTag::Spend,
            index: 0,
            action: RedeemerAction::Vault(OperationKind::AgentTrade),
            ex_units: ExUnits {
                mem: 500_000,
                steps: 200_000_000,
            },
        });
        witnesses.scripts.insert(Script {
            language: ScriptLanguage::PlutusV2,
            code: "59014f0100003232".to_string(),
        });
        UnsignedTransaction {
            body: TxBody {
                inputs: vec![TxInput {
                    tx_id: "ab".repeat(32),
                    index: 0,
                }],
                outputs: vec![
                    TxOutput {
                        destination: Destination::External(VENUE.to_string()),
                        amount,
                        datum: Some(OutputDatum::Order(OrderTerms {
                            collateral: amount,
                            leverage,
                            direction: Direction::Long,
                        })),
                    },
                    TxOutput {
                        destination: Destination::Vault(vault_id()),
                        amount: remainder,
                        datum: None,
                    },
                ],
                fee: 180_000,
                required_signers: vec![agent_key().credential()],
                validity_start: None,
            },
            witnesses,
            auxiliary_data: None,
        }
    }

    async fn service_with(
        store: Arc<dyn VaultStore>,
        channel: Arc<CountingChannel>,
        audit: Option<AuditLog>,
    ) -> VaultService {
        let mut service = VaultService::new(policy(), store)
            .with_key_holder(Arc::new(agent_key()))
            .with_channels(vec![channel as Arc<dyn SubmissionChannel>]);
        if let Some(audit) = audit {
            service = service.with_audit_log(audit);
        }

        let opened = service
            .open_vault(
                &vault_id(),
                owner_key().credential(),
                agent_key().credential(),
                VaultSettings {
                    max_trade_amount: 50,
                    leverage_limit: 2,
                },
                100,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(opened.version, 1);
        service
    }

    async fn authorize_agent(service: &VaultService) {
        let record = service.load(&vault_id()).await.unwrap();
        let mut state = record.state.clone();
        state.agent_authorized = true;
        service
            .store
            .commit(&vault_id(), record.version, state)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn executes_agent_trade_end_to_end() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let channel = CountingChannel::accepting();
        let service = service_with(
            Arc::new(MemoryVaultStore::new()),
            channel.clone(),
            Some(AuditLog::new(temp_file.path())),
        )
        .await;
        authorize_agent(&service).await;

        let tx = trade_tx(40, 2, 60);
        let report = service
            .execute(&vault_id(), &trade_op(40, 2), &tx, &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(report.record.state.available_balance, 60);
        assert_eq!(report.record.state.trade_count, 1);
        assert_eq!(report.record.version, 3);
        assert_eq!(report.receipt.tx_id, TxId(tx.body.hash().to_hex()));
        assert!(report.signed.witnesses.retains_scripts_of(&tx.witnesses));
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);

        let audit = std::fs::read_to_string(temp_file.path()).unwrap();
        for entry_type in ["vault_opened", "validation", "assembly", "submission"] {
            assert!(audit.contains(entry_type), "missing {entry_type}");
        }
    }

    #[tokio::test]
    async fn rejected_operation_is_neither_signed_nor_stored() {
        let channel = CountingChannel::accepting();
        let service = service_with(Arc::new(MemoryVaultStore::new()), channel.clone(), None).await;
        authorize_agent(&service).await;

        let err = service
            .execute(
                &vault_id(),
                &trade_op(40, 3),
                &trade_tx(40, 3, 60),
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ValidationRejected(crate::vault::RejectReason::LeverageExceeded { .. })
        ));
        let record = service.load(&vault_id()).await.unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.state.available_balance, 100);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unconfirmed_submission_keeps_committed_state() {
        let channel = CountingChannel::failing(FailureClass::Transient);
        let service = service_with(Arc::new(MemoryVaultStore::new()), channel, None).await;
        authorize_agent(&service).await;

        let err = service
            .execute(
                &vault_id(),
                &trade_op(40, 2),
                &trade_tx(40, 2, 60),
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SubmissionExhausted { ref attempts } if attempts.len() == 1));
        let record = service.load(&vault_id()).await.unwrap();
        assert_eq!(record.state.available_balance, 60);
    }

    #[tokio::test]
    async fn wrong_key_holder_fails_assembly() {
        let channel = CountingChannel::accepting();
        let store: Arc<dyn VaultStore> = Arc::new(MemoryVaultStore::new());
        let service = service_with(store.clone(), channel.clone(), None)
            .await
            .with_key_holder(Arc::new(owner_key()));
        authorize_agent(&service).await;

        let err = service
            .execute(
                &vault_id(),
                &trade_op(40, 2),
                &trade_tx(40, 2, 60),
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::AssemblyFailed(AssemblyError::MissingRequiredSigner { .. })
        ));
        assert_eq!(service.load(&vault_id()).await.unwrap().version, 2);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transaction_built_on_stale_vault_is_rejected() {
        let store = Arc::new(ContendedStore {
            inner: MemoryVaultStore::new(),
            interfered: AtomicBool::new(true),
        });
        let channel = CountingChannel::accepting();
        let service = service_with(store.clone(), channel.clone(), None).await;
        authorize_agent(&service).await;
        store.interfered.store(false, Ordering::SeqCst);

        let err = service
            .execute(
                &vault_id(),
                &trade_op(40, 2),
                &trade_tx(40, 2, 60),
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ValidationRejected(crate::vault::RejectReason::UnknownOrMalformed)
        ));
        let record = service.load(&vault_id()).await.unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.state.available_balance, 110);
        assert_eq!(record.state.trade_count, 0);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permanent_refusal_reverts_committed_state() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let channel = CountingChannel::failing(FailureClass::Permanent);
        let service = service_with(
            Arc::new(MemoryVaultStore::new()),
            channel.clone(),
            Some(AuditLog::new(temp_file.path())),
        )
        .await;
        authorize_agent(&service).await;

        let err = service
            .execute(
                &vault_id(),
                &trade_op(40, 2),
                &trade_tx(40, 2, 60),
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SubmissionPermanent { .. }));
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
        let record = service.load(&vault_id()).await.unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(record.state.available_balance, 100);
        assert_eq!(record.state.trade_count, 0);
        assert_eq!(record.state.last_trade_at, None);

        let audit = std::fs::read_to_string(temp_file.path()).unwrap();
        assert!(audit.contains("\"entry_type\":\"revert\""));
    }

    #[tokio::test]
    async fn missing_channels_revert_committed_state() {
        let service =
            service_with(Arc::new(MemoryVaultStore::new()), CountingChannel::accepting(), None)
                .await
                .with_channels(Vec::new());
        authorize_agent(&service).await;

        let err = service
            .execute(
                &vault_id(),
                &trade_op(40, 2),
                &trade_tx(40, 2, 60),
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoChannels));
        let record = service.load(&vault_id()).await.unwrap();
        assert_eq!(record.state.available_balance, 100);
        assert_eq!(record.state.trade_count, 0);
    }

    #[tokio::test]
    async fn authorize_is_a_dry_run() {
        let service =
            service_with(Arc::new(MemoryVaultStore::new()), CountingChannel::accepting(), None)
                .await;
        authorize_agent(&service).await;

        let (record, next) = service
            .authorize(&vault_id(), &trade_op(40, 2), &trade_tx(40, 2, 60))
            .await
            .unwrap();
        assert_eq!(record.state.available_balance, 100);
        assert_eq!(next.available_balance, 60);
        assert_eq!(service.load(&vault_id()).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn opening_twice_fails() {
        let service =
            service_with(Arc::new(MemoryVaultStore::new()), CountingChannel::accepting(), None)
                .await;
        let err = service
            .open_vault(
                &vault_id(),
                owner_key().credential(),
                agent_key().credential(),
                VaultSettings::default(),
                5,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::AlreadyExists(_))));
    }
}
