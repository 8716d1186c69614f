use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, RootProvider,
};

use tokengate::{EventGateway, EvmChainClient, SettlementDispatcher};

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// Chain client wired to the custodial signer.
pub type SettlerChain = EvmChainClient<WalletProvider>;

/// Shared application state for the settlement server.
pub struct AppState {
    /// Shared with the background reconciler task.
    pub dispatcher: Arc<SettlementDispatcher<SettlerChain>>,
    /// Verifies the processor's webhook signature. The secret is mandatory —
    /// the server will not start without it.
    pub gateway: EventGateway,
    /// Separate bearer token for the /metrics endpoint.
    pub metrics_token: Option<Vec<u8>>,
}
