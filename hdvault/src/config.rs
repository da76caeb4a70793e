use crate::fs::{ensure_directory_exists, system_data_dir};
use anyhow::{Context, Result};
use ::config::ConfigError;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Input;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use url::Url;

const DEFAULT_ESPLORA_MAINNET_URL: &str = "https://blockstream.info/api/";
const DEFAULT_ESPLORA_TESTNET_URL: &str = "https://blockstream.info/testnet/api/";
const DEFAULT_ESPLORA_REGTEST_URL: &str = "http://127.0.0.1:3002/";
const DEFAULT_MIN_CONFIRMATIONS: u32 = 1;
const DEFAULT_MAX_WEBHOOK_BACKOFF_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub data: Data,
    pub network: Network,
    pub bitcoin: Bitcoin,
    pub esplora: Esplora,
    pub webhook: Webhook,
    pub fees: Fees,
}

impl Config {
    pub fn read<D>(config_file: D) -> Result<Self, ConfigError>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        ::config::Config::builder()
            .add_source(::config::File::from(config_file))
            .build()?
            .try_deserialize()
    }

    pub fn default_for(chain: ::bitcoin::Network) -> Result<Self> {
        let esplora_url = match chain {
            ::bitcoin::Network::Bitcoin => DEFAULT_ESPLORA_MAINNET_URL,
            ::bitcoin::Network::Regtest => DEFAULT_ESPLORA_REGTEST_URL,
            _ => DEFAULT_ESPLORA_TESTNET_URL,
        };

        Ok(Config {
            data: Data {
                dir: Default::default(),
            },
            network: Network { chain },
            bitcoin: Bitcoin {
                min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            },
            esplora: Esplora {
                url: Url::parse(esplora_url)?,
            },
            webhook: Webhook {
                url: None,
                secret: String::new(),
                confirmations: None,
                max_backoff_secs: DEFAULT_MAX_WEBHOOK_BACKOFF_SECS,
            },
            fees: Fees::default(),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data.dir.join("hdvault.sqlite")
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Data {
    pub dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Network {
    pub chain: ::bitcoin::Network,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Bitcoin {
    /// Confirmations an output needs before it is spent or counted.
    pub min_confirmations: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Esplora {
    pub url: Url,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Webhook {
    #[serde(default)]
    pub url: Option<Url>,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub confirmations: Option<u32>,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_max_backoff_secs() -> u64 {
    DEFAULT_MAX_WEBHOOK_BACKOFF_SECS
}

/// Fee rates in sat/vB per confirmation target.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Fees {
    pub fast: u64,
    pub medium: u64,
    pub slow: u64,
    #[serde(default)]
    pub min_tx_fee_sat: Option<u64>,
}

impl Default for Fees {
    fn default() -> Self {
        Self {
            fast: 20,
            medium: 10,
            slow: 2,
            min_tx_fee_sat: None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("config not initialized")]
pub struct ConfigNotInitialized {}

pub fn read_config(config_path: PathBuf) -> Result<Result<Config, ConfigNotInitialized>> {
    if config_path.exists() {
        info!(path = %config_path.display(), "Using config file");
    } else {
        return Ok(Err(ConfigNotInitialized {}));
    }

    let file = Config::read(&config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;

    Ok(Ok(file))
}

pub fn initial_setup<F>(config_path: PathBuf, config_file: F) -> Result<()>
where
    F: Fn() -> Result<Config>,
{
    info!("Config file not found, running initial setup...");
    ensure_directory_exists(config_path.as_path())?;
    let initial_config = config_file()?;

    let toml = toml::to_string(&initial_config)?;
    fs::write(&config_path, toml)?;

    info!(
        path = %config_path.display(),
        "Initial setup complete, config file created",
    );
    Ok(())
}

pub fn query_user_for_initial_config(testnet: bool) -> Result<Config> {
    let chain = if testnet {
        ::bitcoin::Network::Testnet
    } else {
        ::bitcoin::Network::Bitcoin
    };
    let defaults = Config::default_for(chain)?;
    let theme = ColorfulTheme::default();

    println!();
    let data_dir = Input::with_theme(&theme)
        .with_prompt("Enter data directory for hdvault or hit return to use default")
        .default(
            system_data_dir()?
                .join(chain.to_string())
                .to_str()
                .context("Unsupported characters in default path")?
                .to_string(),
        )
        .interact_text()?;
    let data_dir = data_dir.as_str().parse()?;

    let esplora_url: String = Input::with_theme(&theme)
        .with_prompt("Enter Esplora API URL or hit return to use default")
        .default(defaults.esplora.url.to_string())
        .interact_text()?;
    let esplora_url = Url::parse(esplora_url.as_str())?;

    let webhook_url: String = Input::with_theme(&theme)
        .with_prompt("Enter webhook URL for incoming payments or hit return to disable")
        .allow_empty(true)
        .interact_text()?;
    let webhook_url = match webhook_url.trim() {
        "" => None,
        url => Some(Url::parse(url)?),
    };

    let webhook_secret: String = Input::with_theme(&theme)
        .with_prompt("Enter the secret webhooks are signed with")
        .allow_empty(true)
        .interact_text()?;
    println!();

    Ok(Config {
        data: Data { dir: data_dir },
        esplora: Esplora { url: esplora_url },
        webhook: Webhook {
            url: webhook_url,
            secret: webhook_secret,
            ..defaults.webhook
        },
        ..defaults
    })
}
