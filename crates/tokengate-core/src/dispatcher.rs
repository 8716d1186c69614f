//! Settlement dispatcher: turns a validated payment event into tokens in the
//! buyer's wallet.
//!
//! Per payment the pipeline is: event dedupe → atomic payment-row creation →
//! inventory reservation → delivery (direct transfer for ready receivers,
//! funding + inbox deposit otherwise) → ledger finalization and inventory
//! commit. Every failure is recorded before it surfaces; an unrecorded
//! failure would orphan the reservation.

use std::sync::Arc;

use alloy::primitives::Address;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::cache::{InMemoryTtlCache, TtlCache};
use crate::chain::ChainClient;
use crate::config::SettleConfig;
use crate::db::Db;
use crate::gateway::{self, WebhookEvent};
use crate::payment::{
    BalanceDirection, PaymentStatus, PaymentTransaction, TransferKind, TransferRowStatus,
    TransferStatus,
};
use crate::SettleError;

/// How `process_event` disposed of a delivery. The HTTP layer maps these to
/// 2xx responses; errors map to 4xx/5xx by [`SettleError::is_retryable`].
#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    /// Direct transfer confirmed; payment completed.
    Settled {
        payment_reference: String,
        tx_id: String,
    },
    /// Deposited into the receiver's inbox; awaiting their claim.
    AwaitingClaim {
        payment_reference: String,
        tx_id: String,
    },
    /// Chain outcome unknown; the reconciler owns resolution.
    Monitoring {
        payment_reference: String,
        tx_id: Option<String>,
    },
    /// Business rejection, recorded as a failed payment. Not retryable.
    Rejected {
        payment_reference: String,
        reason: String,
    },
    /// Event or payment already handled; no effect applied.
    Duplicate,
    /// Event kind this pipeline acknowledges without processing.
    Ignored,
}

/// Result of the delivery step proper.
enum Delivery {
    Direct { tx_id: String },
    Inbox { tx_id: String },
}

/// A failed delivery step, tagged with the on-chain movement that was being
/// attempted (`None` for pre-flight failures that moved nothing).
struct StepFailure {
    movement: Option<TransferKind>,
    error: SettleError,
}

impl StepFailure {
    fn preflight(error: SettleError) -> Self {
        Self {
            movement: None,
            error,
        }
    }
}

/// Readiness and registration facts are monotone on-chain; cache them for a
/// day to skip repeat lookups.
const MEMO_TTL: Duration = Duration::from_secs(86_400);

/// Maximum number of concurrent payment locks to prevent memory exhaustion.
const MAX_PAYMENT_LOCKS: usize = 100_000;

pub struct SettlementDispatcher<C> {
    chain: C,
    db: Arc<Db>,
    config: SettleConfig,
    /// Per-payment-reference mutex for atomic create+reserve+settle.
    payment_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    readiness_cache: InMemoryTtlCache<Address>,
    router_cache: InMemoryTtlCache<Address>,
}

impl<C> SettlementDispatcher<C> {
    pub fn new(chain: C, db: Arc<Db>, config: SettleConfig) -> Self {
        Self {
            chain,
            db,
            config,
            payment_locks: Arc::new(DashMap::new()),
            readiness_cache: InMemoryTtlCache::new(MEMO_TTL),
            router_cache: InMemoryTtlCache::new(MEMO_TTL),
        }
    }

    pub fn config(&self) -> &SettleConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Get or create the per-reference mutex. The len() + contains_key()
    /// check is not atomic with entry(), so the cap can be overshot by the
    /// number of concurrent workers; the cleanup pass reclaims idle locks.
    fn payment_lock(&self, reference: &str) -> Result<Arc<Mutex<()>>, SettleError> {
        if self.payment_locks.len() >= MAX_PAYMENT_LOCKS
            && !self.payment_locks.contains_key(reference)
        {
            return Err(SettleError::Overloaded(
                "too many concurrent payments — try again later".to_string(),
            ));
        }
        Ok(self
            .payment_locks
            .entry(reference.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Drop idle payment locks and expired memo entries. Called by the
    /// reconciler loop.
    pub fn purge_idle_state(&self) {
        let before = self.payment_locks.len();
        self.payment_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        let removed = before - self.payment_locks.len();
        if removed > 0 {
            tracing::debug!(removed, "cleaned up idle payment locks");
        }
        self.readiness_cache.purge_expired();
        self.router_cache.purge_expired();
    }

    fn asset_id(&self) -> String {
        format!("{:#x}", self.config.asset)
    }
}

impl<C: ChainClient> SettlementDispatcher<C> {
    /// RPC connectivity probe for the health endpoint.
    pub async fn health_check(&self) -> Result<u64, SettleError> {
        self.chain.latest_block().await
    }

    /// Apply one webhook delivery end to end.
    ///
    /// Safe under concurrent duplicate deliveries: the event id dedupe and
    /// the UNIQUE payment-reference insert each apply at most once, and the
    /// per-reference lock serializes the settlement sequence.
    pub async fn process_event(
        &self,
        event: &WebhookEvent,
    ) -> Result<SettlementOutcome, SettleError> {
        self.db.record_event(&event.event_id, &event.event_type)?;
        if self.db.already_processed(&event.event_id)? {
            tracing::info!(event = %event.event_id, "duplicate event delivery, skipping");
            return Ok(SettlementOutcome::Duplicate);
        }

        let payment_event = match gateway::payment_event(event) {
            Ok(Some(pe)) => pe,
            Ok(None) => {
                tracing::debug!(kind = %event.event_type, "acknowledging non-settlement event");
                self.db.mark_processed(&event.event_id, &event.event_type)?;
                return Ok(SettlementOutcome::Ignored);
            }
            Err(e) => {
                // Deliberately skipped: re-deliveries of a malformed event
                // will never become valid.
                tracing::warn!(event = %event.event_id, error = %e, "rejecting malformed settlement event");
                self.db.mark_processed(&event.event_id, &event.event_type)?;
                return Err(e);
            }
        };

        let lock = self.payment_lock(&payment_event.payment_reference)?;
        let _guard = lock.lock().await;

        // Re-check under the lock: a concurrent delivery may have finished.
        if self.db.already_processed(&event.event_id)? {
            return Ok(SettlementOutcome::Duplicate);
        }

        let payment = match self.db.create_payment_transaction(&payment_event)? {
            Some(p) => p,
            None => {
                // Known reference: in-flight or terminal. Never a second
                // reservation for the same payment.
                tracing::info!(
                    reference = %payment_event.payment_reference,
                    "duplicate delivery for known payment reference"
                );
                self.db.mark_processed(&event.event_id, &event.event_type)?;
                return Ok(SettlementOutcome::Duplicate);
            }
        };

        if let Err(e) = self.db.reserve(
            &self.config.network,
            &self.asset_id(),
            &payment.id,
            payment.token_amount,
        ) {
            return match e {
                SettleError::InsufficientInventory {
                    requested,
                    available,
                } => {
                    let reason = format!(
                        "insufficient inventory: requested {requested}, available {available}"
                    );
                    tracing::warn!(reference = %payment.payment_reference, %reason, "payment rejected");
                    self.db.update_token_transfer_status(
                        &payment.id,
                        TransferStatus::Failed,
                        None,
                        Some(&reason),
                    )?;
                    self.db
                        .update_payment_status(&payment.id, PaymentStatus::Failed, None)?;
                    self.db.mark_processed(&event.event_id, &event.event_type)?;
                    Ok(SettlementOutcome::Rejected {
                        payment_reference: payment.payment_reference,
                        reason,
                    })
                }
                // Storage errors leave the event unprocessed so the provider
                // retry can re-drive it.
                other => Err(other),
            };
        }

        let outcome = self.settle_payment(&payment).await;
        // The effect (or its recorded failure) is durable either way.
        self.db.mark_processed(&event.event_id, &event.event_type)?;
        outcome
    }

    /// Deliver tokens for a reserved payment and finalize the ledger.
    async fn settle_payment(
        &self,
        payment: &PaymentTransaction,
    ) -> Result<SettlementOutcome, SettleError> {
        let receiver = payment.user_wallet_address;
        let custodial = self.config.custodial_address;
        let asset_id = self.asset_id();

        match self.deliver(payment).await {
            Ok(Delivery::Direct { tx_id }) => {
                self.db.record_token_transfer(
                    &payment.id,
                    TransferKind::Direct,
                    custodial,
                    receiver,
                    &asset_id,
                    payment.token_amount,
                    Some(&tx_id),
                    TransferRowStatus::Completed,
                    None,
                )?;
                self.db.update_user_wallet_balance(
                    receiver,
                    &self.config.network,
                    &asset_id,
                    payment.token_amount,
                    BalanceDirection::Credit,
                )?;
                self.db.update_token_transfer_status(
                    &payment.id,
                    TransferStatus::DirectTransferred,
                    Some(&tx_id),
                    None,
                )?;
                self.db
                    .update_payment_status(&payment.id, PaymentStatus::Completed, None)?;
                self.db.commit_reservation(&payment.id)?;
                tracing::info!(
                    reference = %payment.payment_reference,
                    tx = %tx_id,
                    amount = payment.token_amount,
                    "settled by direct transfer"
                );
                Ok(SettlementOutcome::Settled {
                    payment_reference: payment.payment_reference.clone(),
                    tx_id,
                })
            }
            Ok(Delivery::Inbox { tx_id }) => {
                self.db.record_token_transfer(
                    &payment.id,
                    TransferKind::InboxDeposit,
                    custodial,
                    receiver,
                    &asset_id,
                    payment.token_amount,
                    Some(&tx_id),
                    TransferRowStatus::Completed,
                    None,
                )?;
                self.db.update_user_wallet_balance(
                    receiver,
                    &self.config.network,
                    &asset_id,
                    payment.token_amount,
                    BalanceDirection::Credit,
                )?;
                self.db.update_token_transfer_status(
                    &payment.id,
                    TransferStatus::InInbox,
                    Some(&tx_id),
                    None,
                )?;
                self.db
                    .update_payment_status(&payment.id, PaymentStatus::Paid, None)?;
                self.db.commit_reservation(&payment.id)?;
                tracing::info!(
                    reference = %payment.payment_reference,
                    tx = %tx_id,
                    amount = payment.token_amount,
                    "deposited to inbox, awaiting claim"
                );
                Ok(SettlementOutcome::AwaitingClaim {
                    payment_reference: payment.payment_reference.clone(),
                    tx_id,
                })
            }
            Err(StepFailure {
                movement: Some(kind),
                error: SettleError::ChainIndeterminate { tx_hash: Some(hash) },
            }) => {
                // Submitted but unconfirmed: keep the reservation and park
                // the payment for the reconciler instead of guessing.
                self.db.record_token_transfer(
                    &payment.id,
                    kind,
                    custodial,
                    receiver,
                    &asset_id,
                    payment.token_amount,
                    Some(&hash),
                    TransferRowStatus::Pending,
                    None,
                )?;
                self.db.update_token_transfer_status(
                    &payment.id,
                    TransferStatus::Pending,
                    Some(&hash),
                    Some("confirmation timed out; awaiting reconciliation"),
                )?;
                self.db
                    .update_payment_status(&payment.id, PaymentStatus::Monitoring, None)?;
                tracing::warn!(
                    reference = %payment.payment_reference,
                    tx = %hash,
                    "transfer unconfirmed, parked for reconciliation"
                );
                Ok(SettlementOutcome::Monitoring {
                    payment_reference: payment.payment_reference.clone(),
                    tx_id: Some(hash),
                })
            }
            Err(StepFailure { movement, error }) => {
                let reason = error.to_string();
                if let Some(kind) = movement {
                    self.db.record_token_transfer(
                        &payment.id,
                        kind,
                        custodial,
                        receiver,
                        &asset_id,
                        payment.token_amount,
                        None,
                        TransferRowStatus::Failed,
                        Some(&reason),
                    )?;
                }
                self.db.update_token_transfer_status(
                    &payment.id,
                    TransferStatus::Failed,
                    None,
                    Some(&reason),
                )?;
                self.db
                    .update_payment_status(&payment.id, PaymentStatus::Failed, None)?;
                self.db.release(&payment.id)?;
                tracing::error!(
                    reference = %payment.payment_reference,
                    error = %reason,
                    "settlement failed, reservation released"
                );
                Err(error)
            }
        }
    }

    /// Execute the delivery steps against the chain. Records the funding
    /// movement (a side payment, not the settlement itself) as it happens.
    async fn deliver(&self, payment: &PaymentTransaction) -> Result<Delivery, StepFailure> {
        let receiver = payment.user_wallet_address;
        let custodial = self.config.custodial_address;
        let asset = self.config.asset;

        let ready = self
            .receiver_ready(receiver)
            .await
            .map_err(StepFailure::preflight)?;

        if ready {
            let tx_id = self
                .chain
                .direct_transfer(custodial, receiver, asset, payment.token_amount)
                .await
                .map_err(|error| StepFailure {
                    movement: Some(TransferKind::Direct),
                    error,
                })?;
            return Ok(Delivery::Direct { tx_id });
        }

        // Receiver cannot hold the asset yet: route through the inbox.
        self.db
            .update_token_transfer_status(&payment.id, TransferStatus::RequiresOptIn, None, None)
            .map_err(StepFailure::preflight)?;

        self.ensure_router_registration()
            .await
            .map_err(StepFailure::preflight)?;
        self.fund_receiver_if_needed(payment, receiver)
            .await
            .map_err(StepFailure::preflight)?;

        let tx_id = self
            .chain
            .deposit_to_inbox(custodial, receiver, asset, payment.token_amount)
            .await
            .map_err(|error| StepFailure {
                movement: Some(TransferKind::InboxDeposit),
                error,
            })?;
        Ok(Delivery::Inbox { tx_id })
    }

    async fn receiver_ready(&self, receiver: Address) -> Result<bool, SettleError> {
        if self.readiness_cache.contains(&receiver) {
            return Ok(true);
        }
        let ready = self.chain.check_receiver_ready(receiver).await?;
        if ready {
            self.readiness_cache.insert(receiver);
        }
        Ok(ready)
    }

    /// One-time custodian registration with the inbox router. Idempotent:
    /// skipped when already registered, memoized after the first check.
    async fn ensure_router_registration(&self) -> Result<(), SettleError> {
        let custodian = self.config.custodial_address;
        if self.router_cache.contains(&custodian) {
            return Ok(());
        }
        if !self.chain.is_router_registered(custodian).await? {
            let tx = self.chain.register_with_router().await.map_err(|e| match e {
                // Registration has no reconciliation path; an unconfirmed
                // registration is a plain failure for this payment.
                SettleError::ChainIndeterminate { .. } => {
                    SettleError::Chain("router registration unconfirmed".to_string())
                }
                other => other,
            })?;
            tracing::info!(%custodian, %tx, "registered custodial wallet with inbox router");
        }
        self.router_cache.insert(custodian);
        Ok(())
    }

    /// Top up the receiver to the funding threshold when its spendable
    /// native balance is below it. The top-up is exactly the gap, sent as a
    /// single transaction.
    async fn fund_receiver_if_needed(
        &self,
        payment: &PaymentTransaction,
        receiver: Address,
    ) -> Result<(), SettleError> {
        let spendable = self.chain.get_spendable_balance(receiver).await?;
        let gap = self.config.funding_gap(spendable);
        if gap.is_zero() {
            return Ok(());
        }

        let tx_id = self
            .chain
            .fund_native_currency(self.config.custodial_address, receiver, gap)
            .await
            .map_err(|e| match e {
                SettleError::ChainIndeterminate { .. } => {
                    SettleError::Chain("receiver funding unconfirmed".to_string())
                }
                other => other,
            })?;

        self.db.record_token_transfer(
            &payment.id,
            TransferKind::NativeFunding,
            self.config.custodial_address,
            receiver,
            "native",
            u64::try_from(gap).unwrap_or(u64::MAX),
            Some(&tx_id),
            TransferRowStatus::Completed,
            None,
        )?;
        tracing::info!(
            reference = %payment.payment_reference,
            %receiver,
            amount = %gap,
            tx = %tx_id,
            "funded receiver for inbox claim"
        );
        Ok(())
    }

    /// Resolve payments left unresolved past the reconcile window: parked in
    /// `monitoring` after an indeterminate transfer, or stranded in
    /// `processing` by a crash between reservation and finalization. Asks the
    /// chain whether the recorded transaction confirmed and finalizes either
    /// way; with no transaction on record the payment fails and its
    /// reservation is returned. Returns the number of payments resolved.
    pub async fn reconcile_once(&self) -> Result<usize, SettleError> {
        let window = ChronoDuration::seconds(self.config.reconcile_after_secs as i64);
        let cutoff = Utc::now() - window;
        let stale = self.db.stale_unresolved_payments(cutoff)?;

        let mut resolved = 0;
        for payment in stale {
            let lock = self.payment_lock(&payment.payment_reference)?;
            let _guard = lock.lock().await;

            // Re-fetch under the lock: an in-flight settlement may have
            // finished while the sweep waited.
            let Some(payment) = self.db.get_payment(&payment.id)? else {
                continue;
            };
            if payment.payment_status.is_terminal() {
                continue;
            }

            match self.reconcile_payment(&payment).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        reference = %payment.payment_reference,
                        error = %e,
                        "reconciliation attempt failed, will retry next sweep"
                    );
                }
            }
        }
        Ok(resolved)
    }

    async fn reconcile_payment(&self, payment: &PaymentTransaction) -> Result<bool, SettleError> {
        let Some(pending) = self.db.latest_pending_transfer(&payment.id)? else {
            // Nothing on chain to wait for; close the payment out.
            self.fail_unresolved(payment, "no pending transfer to reconcile")?;
            return Ok(true);
        };
        let Some(hash) = pending.transaction_hash.clone() else {
            self.fail_unresolved(payment, "pending transfer has no transaction hash")?;
            return Ok(true);
        };

        match self.chain.transaction_confirmed(&hash).await? {
            Some(true) => {
                self.db
                    .finalize_token_transfer(&pending.id, TransferRowStatus::Completed, None)?;
                self.db.update_user_wallet_balance(
                    payment.user_wallet_address,
                    &self.config.network,
                    &self.asset_id(),
                    payment.token_amount,
                    BalanceDirection::Credit,
                )?;
                let (transfer_status, payment_status) = match pending.kind {
                    TransferKind::Direct => {
                        (TransferStatus::DirectTransferred, PaymentStatus::Completed)
                    }
                    TransferKind::InboxDeposit => (TransferStatus::InInbox, PaymentStatus::Paid),
                    TransferKind::NativeFunding => {
                        // Funding never parks a payment; treat as corrupt.
                        self.fail_unresolved(payment, "unexpected pending funding transfer")?;
                        return Ok(true);
                    }
                };
                self.db.update_token_transfer_status(
                    &payment.id,
                    transfer_status,
                    Some(&hash),
                    None,
                )?;
                self.db
                    .update_payment_status(&payment.id, payment_status, None)?;
                self.db.commit_reservation(&payment.id)?;
                tracing::info!(
                    reference = %payment.payment_reference,
                    tx = %hash,
                    "reconciled: transfer confirmed on chain"
                );
                Ok(true)
            }
            Some(false) => {
                self.db.finalize_token_transfer(
                    &pending.id,
                    TransferRowStatus::Failed,
                    Some("transaction reverted"),
                )?;
                self.fail_unresolved(payment, "transaction reverted")?;
                tracing::warn!(
                    reference = %payment.payment_reference,
                    tx = %hash,
                    "reconciled: transfer reverted, reservation released"
                );
                Ok(true)
            }
            None => {
                // Unseen by the chain. Give it one extra window, then fail.
                let deadline = pending.created_at
                    + ChronoDuration::seconds(2 * self.config.reconcile_after_secs as i64);
                if Utc::now() > deadline {
                    self.db.finalize_token_transfer(
                        &pending.id,
                        TransferRowStatus::Failed,
                        Some("never confirmed on chain"),
                    )?;
                    self.fail_unresolved(payment, "transfer never confirmed on chain")?;
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    fn fail_unresolved(
        &self,
        payment: &PaymentTransaction,
        reason: &str,
    ) -> Result<(), SettleError> {
        self.db.update_token_transfer_status(
            &payment.id,
            TransferStatus::Failed,
            None,
            Some(reason),
        )?;
        self.db
            .update_payment_status(&payment.id, PaymentStatus::Failed, None)?;
        self.db.release(&payment.id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SETTLEMENT_EVENT_TYPE;
    use alloy::primitives::U256;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const WALLET: &str = "0x00000000000000000000000000000000000000aa";
    const CUSTODIAN: &str = "0x00000000000000000000000000000000000000cc";

    #[derive(Clone, Copy)]
    enum DirectBehavior {
        Succeed,
        FailChain,
        Timeout,
    }

    struct MockState {
        ready: bool,
        registered: AtomicBool,
        spendable: U256,
        direct: DirectBehavior,
        confirmed: StdMutex<HashMap<String, bool>>,
        direct_calls: AtomicUsize,
        deposit_calls: AtomicUsize,
        register_calls: AtomicUsize,
        funding_amounts: StdMutex<Vec<U256>>,
    }

    #[derive(Clone)]
    struct MockChain(Arc<MockState>);

    impl MockChain {
        fn ready() -> Self {
            Self::build(true, U256::MAX, true, DirectBehavior::Succeed)
        }

        fn not_ready(spendable: U256, registered: bool) -> Self {
            Self::build(false, spendable, registered, DirectBehavior::Succeed)
        }

        fn direct_behavior(behavior: DirectBehavior) -> Self {
            Self::build(true, U256::MAX, true, behavior)
        }

        fn build(ready: bool, spendable: U256, registered: bool, direct: DirectBehavior) -> Self {
            Self(Arc::new(MockState {
                ready,
                registered: AtomicBool::new(registered),
                spendable,
                direct,
                confirmed: StdMutex::new(HashMap::new()),
                direct_calls: AtomicUsize::new(0),
                deposit_calls: AtomicUsize::new(0),
                register_calls: AtomicUsize::new(0),
                funding_amounts: StdMutex::new(Vec::new()),
            }))
        }

        fn confirm(&self, hash: &str, outcome: bool) {
            self.0
                .confirmed
                .lock()
                .unwrap()
                .insert(hash.to_string(), outcome);
        }
    }

    impl ChainClient for MockChain {
        async fn check_receiver_ready(&self, _receiver: Address) -> Result<bool, SettleError> {
            Ok(self.0.ready)
        }

        async fn direct_transfer(
            &self,
            _from: Address,
            _to: Address,
            _asset: Address,
            _amount: u64,
        ) -> Result<String, SettleError> {
            self.0.direct_calls.fetch_add(1, Ordering::SeqCst);
            match self.0.direct {
                DirectBehavior::Succeed => Ok("0xdirect".to_string()),
                DirectBehavior::FailChain => Err(SettleError::Chain("rpc exploded".to_string())),
                DirectBehavior::Timeout => Err(SettleError::ChainIndeterminate {
                    tx_hash: Some("0xstuck".to_string()),
                }),
            }
        }

        async fn deposit_to_inbox(
            &self,
            _from: Address,
            _to: Address,
            _asset: Address,
            _amount: u64,
        ) -> Result<String, SettleError> {
            self.0.deposit_calls.fetch_add(1, Ordering::SeqCst);
            Ok("0xdeposit".to_string())
        }

        async fn fund_native_currency(
            &self,
            _from: Address,
            _to: Address,
            amount: U256,
        ) -> Result<String, SettleError> {
            self.0.funding_amounts.lock().unwrap().push(amount);
            Ok("0xfund".to_string())
        }

        async fn get_spendable_balance(&self, _address: Address) -> Result<U256, SettleError> {
            Ok(self.0.spendable)
        }

        async fn is_router_registered(&self, _custodian: Address) -> Result<bool, SettleError> {
            Ok(self.0.registered.load(Ordering::SeqCst))
        }

        async fn register_with_router(&self) -> Result<String, SettleError> {
            self.0.register_calls.fetch_add(1, Ordering::SeqCst);
            self.0.registered.store(true, Ordering::SeqCst);
            Ok("0xreg".to_string())
        }

        async fn transaction_confirmed(&self, tx_hash: &str) -> Result<Option<bool>, SettleError> {
            Ok(self.0.confirmed.lock().unwrap().get(tx_hash).copied())
        }

        async fn latest_block(&self) -> Result<u64, SettleError> {
            Ok(12_345)
        }
    }

    fn test_config() -> SettleConfig {
        SettleConfig {
            network: "testnet".to_string(),
            custodial_address: CUSTODIAN.parse().unwrap(),
            reconcile_after_secs: 0,
            ..SettleConfig::default()
        }
    }

    fn dispatcher(chain: MockChain, supply: u64) -> SettlementDispatcher<MockChain> {
        let config = test_config();
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.provision_inventory(
            &config.network,
            &format!("{:#x}", config.asset),
            supply,
            CUSTODIAN,
        )
        .unwrap();
        SettlementDispatcher::new(chain, db, config)
    }

    fn settlement_event(event_id: &str, reference: &str, amount: u64) -> WebhookEvent {
        WebhookEvent {
            event_id: event_id.to_string(),
            event_type: SETTLEMENT_EVENT_TYPE.to_string(),
            payload: serde_json::json!({ "object": {
                "id": "cs_1",
                "payment_intent": "pi_1",
                "amount_subtotal": 5000,
                "amount_total": 5150,
                "currency": "usd",
                "metadata": {
                    "paymentReference": reference,
                    "tokenAmount": amount.to_string(),
                    "walletAddress": WALLET,
                }
            }}),
            received_at: Utc::now(),
        }
    }

    fn inventory_levels(dispatcher: &SettlementDispatcher<MockChain>) -> (u64, u64, u64) {
        let conn = dispatcher.db.lock();
        conn.query_row(
            "SELECT total_supply, available_balance, reserved_balance FROM token_inventory",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn direct_transfer_settles_and_commits() {
        let chain = MockChain::ready();
        let d = dispatcher(chain.clone(), 1000);

        let outcome = d
            .process_event(&settlement_event("evt-1", "ref-1", 500))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SettlementOutcome::Settled { ref tx_id, .. } if tx_id == "0xdirect"
        ));

        let payment = d.db.get_payment_by_reference("ref-1").unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Completed);
        assert_eq!(
            payment.token_transfer_status,
            TransferStatus::DirectTransferred
        );
        assert_eq!(payment.token_transfer_tx_id.as_deref(), Some("0xdirect"));

        // Committed: reserved stock left the tracked pool.
        assert_eq!(inventory_levels(&d), (500, 500, 0));
        let wallet: Address = WALLET.parse().unwrap();
        assert_eq!(
            d.db.user_wallet_balance(wallet, &d.config.network, &d.asset_id())
                .unwrap(),
            500
        );
        assert_eq!(chain.0.direct_calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.0.deposit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replayed_event_id_applies_once() {
        let chain = MockChain::ready();
        let d = dispatcher(chain.clone(), 1000);
        let event = settlement_event("evt-1", "ref-1", 500);

        let first = d.process_event(&event).await.unwrap();
        let second = d.process_event(&event).await.unwrap();
        assert!(matches!(first, SettlementOutcome::Settled { .. }));
        assert!(matches!(second, SettlementOutcome::Duplicate));

        assert_eq!(chain.0.direct_calls.load(Ordering::SeqCst), 1);
        assert_eq!(inventory_levels(&d), (500, 500, 0));
    }

    #[tokio::test]
    async fn distinct_events_same_reference_settle_once() {
        let chain = MockChain::ready();
        let d = Arc::new(dispatcher(chain.clone(), 1000));

        let a = settlement_event("evt-a", "ref-1", 500);
        let b = settlement_event("evt-b", "ref-1", 500);
        let (ra, rb) = tokio::join!(d.process_event(&a), d.process_event(&b));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        let settled = [&ra, &rb]
            .iter()
            .filter(|o| matches!(o, SettlementOutcome::Settled { .. }))
            .count();
        let duplicates = [&ra, &rb]
            .iter()
            .filter(|o| matches!(o, SettlementOutcome::Duplicate))
            .count();
        assert_eq!((settled, duplicates), (1, 1));

        let conn = d.db.lock();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM payment_transactions", [], |r| {
                r.get(0)
            })
            .unwrap();
        drop(conn);
        assert_eq!(rows, 1);
        assert_eq!(chain.0.direct_calls.load(Ordering::SeqCst), 1);
        assert_eq!(inventory_levels(&d), (500, 500, 0));
    }

    #[tokio::test]
    async fn unready_receiver_is_funded_and_deposited() {
        let config = test_config();
        let gap = U256::from(1000u64);
        let chain = MockChain::not_ready(config.funding_threshold() - gap, false);
        let d = dispatcher(chain.clone(), 1000);

        let outcome = d
            .process_event(&settlement_event("evt-1", "ref-1", 500))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SettlementOutcome::AwaitingClaim { ref tx_id, .. } if tx_id == "0xdeposit"
        ));

        assert_eq!(chain.0.register_calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.0.deposit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.0.direct_calls.load(Ordering::SeqCst), 0);
        // Top-up is exactly the gap, sent once.
        assert_eq!(*chain.0.funding_amounts.lock().unwrap(), vec![gap]);

        let payment = d.db.get_payment_by_reference("ref-1").unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Paid);
        assert_eq!(payment.token_transfer_status, TransferStatus::InInbox);
        assert_eq!(inventory_levels(&d), (500, 500, 0));

        // Audit trail holds the funding movement and the deposit.
        let conn = d.db.lock();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM token_transfers", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn funded_receiver_skips_topup() {
        let config = test_config();
        let chain = MockChain::not_ready(config.funding_threshold(), true);
        let d = dispatcher(chain.clone(), 1000);

        let outcome = d
            .process_event(&settlement_event("evt-1", "ref-1", 500))
            .await
            .unwrap();
        assert!(matches!(outcome, SettlementOutcome::AwaitingClaim { .. }));
        assert!(chain.0.funding_amounts.lock().unwrap().is_empty());
        assert_eq!(chain.0.register_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_failure_records_and_releases() {
        let chain = MockChain::direct_behavior(DirectBehavior::FailChain);
        let d = dispatcher(chain.clone(), 1000);
        let event = settlement_event("evt-1", "ref-1", 500);

        let err = d.process_event(&event).await.unwrap_err();
        assert!(matches!(err, SettleError::Chain(_)));

        let payment = d.db.get_payment_by_reference("ref-1").unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Failed);
        assert_eq!(payment.token_transfer_status, TransferStatus::Failed);
        assert!(payment
            .token_transfer_error
            .as_deref()
            .unwrap()
            .contains("rpc exploded"));
        // Reservation fully returned to the pool.
        assert_eq!(inventory_levels(&d), (1000, 1000, 0));

        // The failure is durable; a provider retry is a no-op.
        let retry = d.process_event(&event).await.unwrap();
        assert!(matches!(retry, SettlementOutcome::Duplicate));
        assert_eq!(chain.0.direct_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn insufficient_inventory_rejects_before_chain() {
        let chain = MockChain::ready();
        let d = dispatcher(chain.clone(), 100);

        let outcome = d
            .process_event(&settlement_event("evt-1", "ref-1", 500))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SettlementOutcome::Rejected { ref reason, .. } if reason.contains("insufficient")
        ));

        let payment = d.db.get_payment_by_reference("ref-1").unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Failed);
        assert_eq!(chain.0.direct_calls.load(Ordering::SeqCst), 0);
        assert_eq!(inventory_levels(&d), (100, 100, 0));
    }

    #[tokio::test]
    async fn non_settlement_event_is_acknowledged() {
        let chain = MockChain::ready();
        let d = dispatcher(chain, 1000);
        let event = WebhookEvent {
            event_id: "evt-refund".to_string(),
            event_type: "charge.refund.updated".to_string(),
            payload: serde_json::json!({}),
            received_at: Utc::now(),
        };

        let outcome = d.process_event(&event).await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::Ignored));
        assert!(d.db.already_processed("evt-refund").unwrap());
    }

    #[tokio::test]
    async fn malformed_metadata_is_terminal_for_the_event() {
        let chain = MockChain::ready();
        let d = dispatcher(chain, 1000);
        let event = WebhookEvent {
            event_id: "evt-bad".to_string(),
            event_type: SETTLEMENT_EVENT_TYPE.to_string(),
            payload: serde_json::json!({ "object": { "metadata": {} } }),
            received_at: Utc::now(),
        };

        let err = d.process_event(&event).await.unwrap_err();
        assert!(matches!(err, SettleError::Validation(_)));

        // Re-delivery of a malformed event will never become valid.
        let retry = d.process_event(&event).await.unwrap();
        assert!(matches!(retry, SettlementOutcome::Duplicate));
    }

    #[tokio::test]
    async fn indeterminate_transfer_parks_then_reconciles_confirmed() {
        let chain = MockChain::direct_behavior(DirectBehavior::Timeout);
        let d = dispatcher(chain.clone(), 1000);

        let outcome = d
            .process_event(&settlement_event("evt-1", "ref-1", 500))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SettlementOutcome::Monitoring { tx_id: Some(ref h), .. } if h == "0xstuck"
        ));

        let payment = d.db.get_payment_by_reference("ref-1").unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Monitoring);
        // Reservation stays held while the outcome is unknown.
        assert_eq!(inventory_levels(&d), (1000, 500, 500));

        chain.confirm("0xstuck", true);
        assert_eq!(d.reconcile_once().await.unwrap(), 1);

        let payment = d.db.get_payment_by_reference("ref-1").unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Completed);
        assert_eq!(
            payment.token_transfer_status,
            TransferStatus::DirectTransferred
        );
        assert_eq!(inventory_levels(&d), (500, 500, 0));
        let wallet: Address = WALLET.parse().unwrap();
        assert_eq!(
            d.db.user_wallet_balance(wallet, &d.config.network, &d.asset_id())
                .unwrap(),
            500
        );
    }

    #[tokio::test]
    async fn reconcile_reverted_transfer_releases() {
        let chain = MockChain::direct_behavior(DirectBehavior::Timeout);
        let d = dispatcher(chain.clone(), 1000);

        d.process_event(&settlement_event("evt-1", "ref-1", 500))
            .await
            .unwrap();
        chain.confirm("0xstuck", false);
        assert_eq!(d.reconcile_once().await.unwrap(), 1);

        let payment = d.db.get_payment_by_reference("ref-1").unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Failed);
        assert_eq!(payment.token_transfer_status, TransferStatus::Failed);
        assert_eq!(inventory_levels(&d), (1000, 1000, 0));
    }

    #[tokio::test]
    async fn reconcile_gives_up_on_never_seen_transaction() {
        let chain = MockChain::direct_behavior(DirectBehavior::Timeout);
        let d = dispatcher(chain, 1000);

        d.process_event(&settlement_event("evt-1", "ref-1", 500))
            .await
            .unwrap();
        // The chain never sees the hash; with a zero reconcile window the
        // extra grace period has already elapsed.
        assert_eq!(d.reconcile_once().await.unwrap(), 1);

        let payment = d.db.get_payment_by_reference("ref-1").unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Failed);
        assert_eq!(inventory_levels(&d), (1000, 1000, 0));
    }

    fn orphan_payment(d: &SettlementDispatcher<MockChain>, reference: &str) -> PaymentTransaction {
        // Simulate a crash after reservation: the payment row and the hold
        // exist, but settlement never ran and no transfer row was recorded.
        let pe = crate::payment::PaymentEvent {
            event_id: format!("evt-{reference}"),
            payment_reference: reference.to_string(),
            session_id: None,
            payment_intent_id: None,
            token_amount: 500,
            price_per_token: 10,
            subtotal: 5000,
            processing_fee: 150,
            total_amount: 5150,
            currency: "usd".to_string(),
            user_wallet_address: WALLET.parse().unwrap(),
            user_email: None,
        };
        let payment = d.db.create_payment_transaction(&pe).unwrap().unwrap();
        d.db.reserve(&d.config.network, &d.asset_id(), &payment.id, 500)
            .unwrap();
        payment
    }

    #[tokio::test]
    async fn stuck_processing_payment_is_released_by_sweep() {
        let chain = MockChain::ready();
        let d = dispatcher(chain, 1000);

        let payment = orphan_payment(&d, "ref-orphan");
        assert_eq!(inventory_levels(&d), (1000, 500, 500));

        assert_eq!(d.reconcile_once().await.unwrap(), 1);

        let payment = d.db.get_payment(&payment.id).unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Failed);
        assert_eq!(payment.token_transfer_status, TransferStatus::Failed);
        assert_eq!(inventory_levels(&d), (1000, 1000, 0));
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_processing_payments_alone() {
        let chain = MockChain::ready();
        let config = SettleConfig {
            reconcile_after_secs: 300,
            ..test_config()
        };
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.provision_inventory(
            &config.network,
            &format!("{:#x}", config.asset),
            1000,
            CUSTODIAN,
        )
        .unwrap();
        let d = SettlementDispatcher::new(chain, db, config);

        let payment = orphan_payment(&d, "ref-fresh");
        assert_eq!(d.reconcile_once().await.unwrap(), 0);

        let payment = d.db.get_payment(&payment.id).unwrap().unwrap();
        assert_eq!(payment.payment_status, PaymentStatus::Processing);
        assert_eq!(inventory_levels(&d), (1000, 500, 500));
    }

    #[tokio::test]
    async fn health_check_reports_block_height() {
        let chain = MockChain::ready();
        let d = dispatcher(chain, 1000);
        assert_eq!(d.health_check().await.unwrap(), 12_345);
    }
}
