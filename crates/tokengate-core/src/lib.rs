//! Payment-to-token settlement pipeline.
//!
//! Converts confirmed fiat payments (delivered as provider webhooks) into
//! on-chain token transfers from a custodial wallet, guaranteeing that
//! inventory is never oversold and that no payment is settled twice.
//!
//! # Pipeline
//!
//! - [`EventGateway`] — verifies the provider signature and parses the payload
//! - [`Db`] — SQLite-backed idempotency, inventory and transaction ledgers
//! - [`SettlementDispatcher`] — reserves inventory and delivers tokens, either
//!   by direct transfer or through the custodial-inbox deposit protocol
//! - reconciler — background sweep for transfers left in an indeterminate state
//!
//! # Quick example (dispatcher)
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokengate::{Db, EvmChainClient, SettleConfig, SettlementDispatcher};
//! use alloy::providers::ProviderBuilder;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let db = Arc::new(Db::open("./tokengate.db").unwrap());
//! let provider = ProviderBuilder::new().connect_http("http://localhost:8545".parse().unwrap());
//! let config = SettleConfig::default();
//! let chain = EvmChainClient::new(provider, config.asset, config.inbox_router);
//! let dispatcher = SettlementDispatcher::new(chain, db, config);
//! # }
//! ```

pub mod cache;
pub mod chain;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod inventory;
pub mod ledger;
pub mod payment;
pub mod reconcile;
pub mod security;

use alloy::sol;

// Sale-token contract interface. `isAuthorizedHolder` reports whether an
// address has completed the holder opt-in and can receive the asset directly.
sol! {
    #[sol(rpc)]
    interface GateToken {
        function balanceOf(address owner) external view returns (uint256);
        function isAuthorizedHolder(address account) external view returns (bool);
        function transfer(address to, uint256 value) external returns (bool);
    }
}

// Deposit-and-claim router. Custodians register once, then deposit assets
// into a per-receiver inbox that the receiver claims after opting in.
sol! {
    #[sol(rpc)]
    interface InboxRouter {
        function isRegistered(address custodian) external view returns (bool);
        function register() external;
        function depositFor(address receiver, address token, uint256 amount) external returns (bool);
    }
}

// Re-exports
pub use cache::{InMemoryTtlCache, TtlCache};
pub use chain::{ChainClient, EvmChainClient};
pub use config::SettleConfig;
pub use db::Db;
pub use dispatcher::{SettlementDispatcher, SettlementOutcome};
pub use error::SettleError;
pub use gateway::{EventGateway, WebhookEvent};
pub use payment::{
    BalanceDirection, PaymentEvent, PaymentStatus, PaymentTransaction, TokenTransfer,
    TransferKind, TransferRowStatus, TransferStatus,
};
