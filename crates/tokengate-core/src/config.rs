use alloy::primitives::{address, Address, U256};

/// CAIP-2 network identifier for the default deployment target.
pub const DEFAULT_NETWORK: &str = "eip155:8453";

/// Sale-token contract address on the default network.
pub const DEFAULT_ASSET: Address = address!("a11ce00000000000000000000000000000000001");

/// Deposit-and-claim router contract address on the default network.
pub const DEFAULT_INBOX_ROUTER: Address = address!("a11ce00000000000000000000000000000000002");

/// The sale token has 6 decimal places; all amounts are integer base units.
pub const TOKEN_DECIMALS: u32 = 6;

/// Default RPC endpoint.
pub const RPC_URL: &str = "https://mainnet.base.org";

/// Native balance a fresh account must hold before it can register an asset
/// and submit a claim (smallest native units).
pub const BASE_MIN_BALANCE: u64 = 1_000_000_000_000_000;

/// Additional minimum balance consumed by registering one asset.
pub const ASSET_MIN_BALANCE: u64 = 500_000_000_000_000;

/// Flat per-transaction fee allowance (registration tx + claim tx).
pub const FLAT_TX_FEE: u64 = 200_000_000_000_000;

/// Safety margin on top of the computed funding threshold.
pub const FUNDING_BUFFER: u64 = 100_000_000_000_000;

/// Runtime settlement configuration. Injected into every component at
/// construction; business logic never reads process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleConfig {
    /// CAIP-2 network identifier, used as the inventory partition key.
    pub network: String,
    /// Sale-token contract address.
    pub asset: Address,
    pub token_decimals: u32,
    /// Custodial wallet that holds the sale inventory on-chain.
    pub custodial_address: Address,
    /// Deposit-and-claim router contract.
    pub inbox_router: Address,
    /// Base minimum native balance for a receiver account.
    pub base_min_balance: U256,
    /// Extra minimum balance required to register one asset.
    pub asset_min_balance: U256,
    /// Flat fee allowance per transaction.
    pub flat_tx_fee: U256,
    /// Safety buffer added to the funding threshold.
    pub funding_buffer: U256,
    /// Bound on every chain round-trip before it is treated as indeterminate.
    pub chain_timeout_secs: u64,
    /// Age after which a payment stuck in a non-terminal transfer status is
    /// picked up by the reconciler.
    pub reconcile_after_secs: u64,
}

impl SettleConfig {
    /// Native balance a receiver must hold before an inbox deposit is
    /// attempted: base minimum, one asset-registration minimum, two
    /// transaction fees, plus the safety buffer.
    ///
    /// Computed in smallest indivisible units; no floating point anywhere.
    pub fn funding_threshold(&self) -> U256 {
        self.base_min_balance
            + self.asset_min_balance
            + self.flat_tx_fee * U256::from(2u64)
            + self.funding_buffer
    }

    /// Exact top-up needed to bring `spendable` to the funding threshold.
    /// Zero when the receiver already meets it.
    pub fn funding_gap(&self, spendable: U256) -> U256 {
        self.funding_threshold().saturating_sub(spendable)
    }
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            asset: DEFAULT_ASSET,
            token_decimals: TOKEN_DECIMALS,
            custodial_address: Address::ZERO,
            inbox_router: DEFAULT_INBOX_ROUTER,
            base_min_balance: U256::from(BASE_MIN_BALANCE),
            asset_min_balance: U256::from(ASSET_MIN_BALANCE),
            flat_tx_fee: U256::from(FLAT_TX_FEE),
            funding_buffer: U256::from(FUNDING_BUFFER),
            chain_timeout_secs: 60,
            reconcile_after_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_threshold_sums_components() {
        let config = SettleConfig::default();
        let expected =
            U256::from(BASE_MIN_BALANCE + ASSET_MIN_BALANCE + 2 * FLAT_TX_FEE + FUNDING_BUFFER);
        assert_eq!(config.funding_threshold(), expected);
    }

    #[test]
    fn funding_gap_is_exact() {
        let config = SettleConfig::default();
        let threshold = config.funding_threshold();

        let spendable = threshold - U256::from(123u64);
        assert_eq!(config.funding_gap(spendable), U256::from(123u64));
    }

    #[test]
    fn funding_gap_zero_when_already_funded() {
        let config = SettleConfig::default();
        let threshold = config.funding_threshold();

        assert_eq!(config.funding_gap(threshold), U256::ZERO);
        assert_eq!(config.funding_gap(threshold + U256::from(1u64)), U256::ZERO);
    }
}
