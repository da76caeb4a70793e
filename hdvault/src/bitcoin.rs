pub mod builder;
pub mod fee;
pub mod keys;

pub use ::bitcoin::{Address, Amount, Block, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
pub use builder::{BuildRequest, BuiltTransaction, CoinSelection, LargestFirst, Recipient, TransactionBuilder};
pub use fee::{ConfirmationTarget, FeeChoice, FeePolicy, StaticFeePolicy};
pub use keys::{EncryptedSeed, KdfParams, KeyChain, Seed, SigningKeys};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Renders an amount in BTC with a `.` separator and no trailing zeros,
/// e.g. `0.001` for 100,000 sat.
pub fn btc_string(amount: Amount) -> Result<String> {
    let sats = i64::try_from(amount.to_sat()).context("Amount does not fit into a decimal")?;

    Ok(Decimal::new(sats, 8).normalize().to_string())
}

/// Parses an address and checks it belongs to the network we operate on.
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    let address = Address::from_str(address)
        .with_context(|| format!("Failed to parse bitcoin address {}", address))?
        .require_network(network)
        .with_context(|| format!("Address {} is not valid on {}", address, network))?;

    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_amounts_without_trailing_zeros() {
        assert_eq!(btc_string(Amount::from_sat(100_000)).unwrap(), "0.001");
        assert_eq!(btc_string(Amount::from_sat(150_000_000)).unwrap(), "1.5");
        assert_eq!(btc_string(Amount::from_sat(1)).unwrap(), "0.00000001");
        assert_eq!(btc_string(Amount::ZERO).unwrap(), "0");
    }

    #[test]
    fn rejects_address_of_other_network() {
        let mainnet = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

        assert!(parse_address(mainnet, Network::Bitcoin).is_ok());
        assert!(parse_address(mainnet, Network::Regtest).is_err());
    }
}
