//! Chain client capability: the on-chain surface the dispatcher needs,
//! expressed as a trait so settlement logic never depends on a concrete
//! node library. [`EvmChainClient`] is the production implementation.
//!
//! Nonce/sequence ordering for the custodial signer is the provider's
//! responsibility; every call here is stateless.

use std::future::Future;
use std::time::Duration;

use alloy::network::{Ethereum, TransactionBuilder};
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{PendingTransactionBuilder, Provider};
use alloy::rpc::types::TransactionRequest;

use crate::{GateToken, InboxRouter, SettleError};

/// On-chain operations used by the settlement dispatcher.
///
/// Implementations must be thread-safe (`Send + Sync`); the dispatcher is
/// shared across concurrent webhook deliveries and the reconciler task.
pub trait ChainClient: Send + Sync {
    /// Is the receiver already configured to hold the asset directly?
    fn check_receiver_ready(
        &self,
        receiver: Address,
    ) -> impl Future<Output = Result<bool, SettleError>> + Send;

    /// Move `amount` base units of the asset from the custodial wallet to a
    /// ready receiver. Returns the transaction hash.
    fn direct_transfer(
        &self,
        from: Address,
        to: Address,
        asset: Address,
        amount: u64,
    ) -> impl Future<Output = Result<String, SettleError>> + Send;

    /// Deposit `amount` base units into the receiver's inbox via the router,
    /// to be claimed after the receiver opts in.
    fn deposit_to_inbox(
        &self,
        from: Address,
        to: Address,
        asset: Address,
        amount: u64,
    ) -> impl Future<Output = Result<String, SettleError>> + Send;

    /// Top up the receiver's native balance from the custodial wallet.
    fn fund_native_currency(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> impl Future<Output = Result<String, SettleError>> + Send;

    /// Spendable native balance of an account, in smallest units.
    fn get_spendable_balance(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<U256, SettleError>> + Send;

    /// One-time custodian registration state with the inbox router.
    fn is_router_registered(
        &self,
        custodian: Address,
    ) -> impl Future<Output = Result<bool, SettleError>> + Send;

    /// Register the custodial wallet with the router. Idempotent on-chain.
    fn register_with_router(&self) -> impl Future<Output = Result<String, SettleError>> + Send;

    /// Did a previously submitted transaction confirm? `None` means the
    /// chain has not seen it (yet).
    fn transaction_confirmed(
        &self,
        tx_hash: &str,
    ) -> impl Future<Output = Result<Option<bool>, SettleError>> + Send;

    /// Latest block number, used as the health probe.
    fn latest_block(&self) -> impl Future<Output = Result<u64, SettleError>> + Send;
}

/// Production chain client backed by an alloy provider whose wallet filler
/// signs with the custodial key.
pub struct EvmChainClient<P> {
    provider: P,
    asset: Address,
    router: Address,
    send_timeout: Duration,
    receipt_timeout: Duration,
}

impl<P> EvmChainClient<P> {
    pub fn new(provider: P, asset: Address, router: Address) -> Self {
        Self {
            provider,
            asset,
            router,
            send_timeout: Duration::from_secs(30),
            receipt_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }
}

impl<P: Provider> EvmChainClient<P> {
    /// Await the receipt with a bounded timeout. A timeout here is
    /// indeterminate, not failed: the transaction is in the mempool and may
    /// still confirm, so the submitted hash is preserved for the reconciler.
    async fn confirm(
        &self,
        label: &str,
        pending: PendingTransactionBuilder<Ethereum>,
    ) -> Result<String, SettleError> {
        let hash = *pending.tx_hash();
        let receipt = match tokio::time::timeout(self.receipt_timeout, pending.get_receipt()).await
        {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                return Err(SettleError::Chain(format!("{label} receipt failed: {e}")))
            }
            Err(_) => {
                tracing::warn!(%hash, "{label} receipt timed out — outcome unknown");
                return Err(SettleError::ChainIndeterminate {
                    tx_hash: Some(format!("{hash:#x}")),
                });
            }
        };

        if !receipt.status() {
            return Err(SettleError::Chain(format!("{label} reverted")));
        }
        Ok(format!("{:#x}", receipt.transaction_hash))
    }
}

impl<P: Provider> ChainClient for EvmChainClient<P> {
    async fn check_receiver_ready(&self, receiver: Address) -> Result<bool, SettleError> {
        let contract = GateToken::new(self.asset, &self.provider);
        contract
            .isAuthorizedHolder(receiver)
            .call()
            .await
            .map_err(|e| SettleError::Chain(format!("isAuthorizedHolder failed: {e}")))
    }

    async fn direct_transfer(
        &self,
        from: Address,
        to: Address,
        asset: Address,
        amount: u64,
    ) -> Result<String, SettleError> {
        tracing::debug!(%from, %to, amount, "submitting direct transfer");
        let contract = GateToken::new(asset, &self.provider);
        let pending = tokio::time::timeout(
            self.send_timeout,
            contract.transfer(to, U256::from(amount)).send(),
        )
        .await
        .map_err(|_| SettleError::ChainIndeterminate { tx_hash: None })?
        .map_err(|e| SettleError::Chain(format!("transfer send failed: {e}")))?;

        self.confirm("transfer", pending).await
    }

    async fn deposit_to_inbox(
        &self,
        from: Address,
        to: Address,
        asset: Address,
        amount: u64,
    ) -> Result<String, SettleError> {
        tracing::debug!(%from, %to, amount, "submitting inbox deposit");
        let contract = InboxRouter::new(self.router, &self.provider);
        let pending = tokio::time::timeout(
            self.send_timeout,
            contract.depositFor(to, asset, U256::from(amount)).send(),
        )
        .await
        .map_err(|_| SettleError::ChainIndeterminate { tx_hash: None })?
        .map_err(|e| SettleError::Chain(format!("depositFor send failed: {e}")))?;

        self.confirm("depositFor", pending).await
    }

    async fn fund_native_currency(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<String, SettleError> {
        tracing::debug!(%from, %to, %amount, "submitting native top-up");
        let request = TransactionRequest::default().with_to(to).with_value(amount);
        let pending = tokio::time::timeout(
            self.send_timeout,
            self.provider.send_transaction(request),
        )
        .await
        .map_err(|_| SettleError::ChainIndeterminate { tx_hash: None })?
        .map_err(|e| SettleError::Chain(format!("funding send failed: {e}")))?;

        self.confirm("funding", pending).await
    }

    async fn get_spendable_balance(&self, address: Address) -> Result<U256, SettleError> {
        self.provider
            .get_balance(address)
            .await
            .map_err(|e| SettleError::Chain(format!("getBalance failed: {e}")))
    }

    async fn is_router_registered(&self, custodian: Address) -> Result<bool, SettleError> {
        let contract = InboxRouter::new(self.router, &self.provider);
        contract
            .isRegistered(custodian)
            .call()
            .await
            .map_err(|e| SettleError::Chain(format!("isRegistered failed: {e}")))
    }

    async fn register_with_router(&self) -> Result<String, SettleError> {
        let contract = InboxRouter::new(self.router, &self.provider);
        let pending = tokio::time::timeout(self.send_timeout, contract.register().send())
            .await
            .map_err(|_| SettleError::ChainIndeterminate { tx_hash: None })?
            .map_err(|e| SettleError::Chain(format!("register send failed: {e}")))?;

        self.confirm("register", pending).await
    }

    async fn transaction_confirmed(&self, tx_hash: &str) -> Result<Option<bool>, SettleError> {
        let hash: TxHash = tx_hash
            .parse()
            .map_err(|e| SettleError::Validation(format!("invalid tx hash: {e}")))?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| SettleError::Chain(format!("getTransactionReceipt failed: {e}")))?;
        Ok(receipt.map(|r| r.status()))
    }

    async fn latest_block(&self) -> Result<u64, SettleError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| SettleError::Chain(format!("health check failed: {e}")))
    }
}
