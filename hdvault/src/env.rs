use crate::bitcoin::KdfParams;
use crate::config;
use ::bitcoin::{Amount, Network};
use std::cmp::max;
use std::time::Duration;

/// Constants that only depend on the network we run on.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Config {
    pub bitcoin_network: Network,
    /// BIP44 coin type; `0` on mainnet, `1` on every test network.
    pub coin_type: u32,
    pub min_tx_fee: Amount,
    pub webhook_confirmations: u32,
    pub bitcoin_avg_block_time: Duration,
    pub kdf: KdfParams,
}

impl Config {
    pub fn bitcoin_sync_interval(&self) -> Duration {
        sync_interval(self.bitcoin_avg_block_time)
    }
}

pub trait GetConfig {
    fn get_config() -> Config;
}

#[derive(Clone, Copy)]
pub struct Mainnet;

#[derive(Clone, Copy)]
pub struct Testnet;

#[derive(Clone, Copy)]
pub struct Regtest;

impl GetConfig for Mainnet {
    fn get_config() -> Config {
        Config {
            bitcoin_network: Network::Bitcoin,
            coin_type: 0,
            min_tx_fee: Amount::from_sat(1_000),
            webhook_confirmations: 3,
            bitcoin_avg_block_time: Duration::from_secs(10 * 60),
            kdf: KdfParams::default(),
        }
    }
}

impl GetConfig for Testnet {
    fn get_config() -> Config {
        Config {
            bitcoin_network: Network::Testnet,
            coin_type: 1,
            min_tx_fee: Amount::from_sat(1_000),
            webhook_confirmations: 1,
            bitcoin_avg_block_time: Duration::from_secs(10 * 60),
            kdf: KdfParams::default(),
        }
    }
}

impl GetConfig for Regtest {
    fn get_config() -> Config {
        Config {
            bitcoin_network: Network::Regtest,
            coin_type: 1,
            min_tx_fee: Amount::from_sat(1_000),
            webhook_confirmations: 1,
            bitcoin_avg_block_time: Duration::from_secs(5),
            kdf: KdfParams::light(),
        }
    }
}

fn sync_interval(avg_block_time: Duration) -> Duration {
    max(avg_block_time / 10, Duration::from_secs(1))
}

pub fn new(config: &config::Config) -> Config {
    let env_config = match config.network.chain {
        Network::Bitcoin => Mainnet::get_config(),
        Network::Regtest => Regtest::get_config(),
        chain => Config {
            bitcoin_network: chain,
            ..Testnet::get_config()
        },
    };

    let env_config = if let Some(confirmations) = config.webhook.confirmations {
        Config {
            webhook_confirmations: confirmations,
            ..env_config
        }
    } else {
        env_config
    };

    if let Some(min_tx_fee) = config.fees.min_tx_fee_sat {
        Config {
            min_tx_fee: Amount::from_sat(min_tx_fee),
            ..env_config
        }
    } else {
        env_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_interval_is_one_second_if_avg_blocktime_is_one_second() {
        let interval = sync_interval(Duration::from_secs(1));

        assert_eq!(interval, Duration::from_secs(1))
    }

    #[test]
    fn mainnet_polls_every_minute() {
        assert_eq!(
            Mainnet::get_config().bitcoin_sync_interval(),
            Duration::from_secs(60)
        )
    }

    #[test]
    fn config_file_overrides_network_defaults() {
        let mut config = config::Config::default_for(Network::Testnet).unwrap();
        config.webhook.confirmations = Some(6);
        config.fees.min_tx_fee_sat = Some(2_000);

        let env = new(&config);

        assert_eq!(env.bitcoin_network, Network::Testnet);
        assert_eq!(env.webhook_confirmations, 6);
        assert_eq!(env.min_tx_fee, Amount::from_sat(2_000));
    }

    #[test]
    fn signet_uses_test_network_constants() {
        let env = new(&config::Config::default_for(Network::Signet).unwrap());

        assert_eq!(env.bitcoin_network, Network::Signet);
        assert_eq!(env.coin_type, 1);
    }
}
