//! Build a ready [`AppState`] from typed startup configuration.
//!
//! All environment reading happens in `main`; everything below this point
//! takes explicit values so tests and embedded callers can construct the
//! server without touching process environment.

use std::sync::Arc;

use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;

use tokengate::reconcile::start_reconciler;
use tokengate::{Db, EventGateway, EvmChainClient, SettleConfig, SettlementDispatcher};

use crate::state::AppState;

/// Configuration for bootstrapping the settlement server.
pub struct BootstrapConfig<'a> {
    /// The custodial wallet's private key (hex-encoded).
    pub private_key: &'a str,
    /// RPC URL for the target chain.
    pub rpc_url: &'a str,
    /// Path to the SQLite settlement database.
    pub db_path: &'a str,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: Vec<u8>,
    /// Metrics bearer token (as raw bytes).
    pub metrics_token: Option<Vec<u8>>,
    /// Provision this much sale-token inventory if none is tracked yet.
    pub initial_supply: Option<u64>,
    /// Settlement parameters (network, asset, funding thresholds).
    pub settle: SettleConfig,
}

/// Bootstrap the settlement server state and start the reconciler task.
///
/// # Panics
///
/// Calls `std::process::exit(1)` if the settlement database cannot be
/// opened: losing the idempotency ledger would re-apply settled payments
/// on the next delivery, so there is no in-memory fallback.
pub fn bootstrap_settler(config: BootstrapConfig<'_>) -> AppState {
    let signer: PrivateKeySigner = config
        .private_key
        .parse()
        .expect("invalid SETTLER_PRIVATE_KEY");
    let custodial_address = signer.address();

    let provider = ProviderBuilder::new()
        .wallet(alloy::network::EthereumWallet::from(signer))
        .connect_http(config.rpc_url.parse().expect("invalid RPC_URL"));

    let db = match Db::open(config.db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!("Failed to open settlement database at {}: {e}", config.db_path);
            tracing::error!(
                "Refusing to start — without the idempotency ledger, re-delivered webhooks would settle twice"
            );
            std::process::exit(1);
        }
    };

    let mut settle = config.settle;
    settle.custodial_address = custodial_address;

    if let Some(supply) = config.initial_supply {
        let asset_id = format!("{:#x}", settle.asset);
        if let Err(e) = db.provision_inventory(
            &settle.network,
            &asset_id,
            supply,
            &format!("{custodial_address:#x}"),
        ) {
            tracing::error!("Failed to provision inventory: {e}");
            std::process::exit(1);
        }
        tracing::info!(
            network = %settle.network,
            asset = %asset_id,
            supply,
            "inventory provisioned (existing rows untouched)"
        );
    }

    let reconcile_interval = settle.reconcile_after_secs.max(30);
    let chain = EvmChainClient::new(provider, settle.asset, settle.inbox_router);
    let dispatcher = Arc::new(SettlementDispatcher::new(chain, db, settle));
    start_reconciler(dispatcher.clone(), reconcile_interval);

    tracing::info!("Custodial wallet address: {custodial_address}");

    AppState {
        dispatcher,
        gateway: EventGateway::new(config.webhook_secret),
        metrics_token: config.metrics_token,
    }
}
