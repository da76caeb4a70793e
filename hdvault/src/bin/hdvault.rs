#![warn(
    unused_extern_crates,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use dialoguer::Password;
use hdvault::bitcoin::{
    btc_string, parse_address, BuildRequest, KeyChain, Recipient, StaticFeePolicy, TransactionBuilder,
};
use hdvault::broadcast::NodeBroadcaster;
use hdvault::chain::{Esplora, SyncService, Tip};
use hdvault::command::{parse_args, Arguments, Command};
use hdvault::config::{initial_setup, query_user_for_initial_config, read_config, Config, ConfigNotInitialized};
use hdvault::database::open_db;
use hdvault::index::AddressIndex;
use hdvault::ledger::Ledger;
use hdvault::metrics::WalletMetrics;
use hdvault::wallet::{SendRequest, Sent, Wallet};
use hdvault::webhook::{WebhookConfig, WebhookScheduler};
use hdvault::{env, trace, Error};
use std::sync::Arc;
use std::time::Duration;
use structopt::clap;
use structopt::clap::ErrorKind;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let Arguments {
        testnet,
        json,
        debug,
        config_path,
        cmd,
    } = match parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(e) => {
            if let Some(clap_err) = e.downcast_ref::<clap::Error>() {
                if let ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed = clap_err.kind {
                    println!("{}", clap_err.message);
                    std::process::exit(0);
                }
            }
            bail!(e);
        }
    };

    let config = match read_config(config_path.clone())? {
        Ok(config) => config,
        Err(ConfigNotInitialized {}) => {
            initial_setup(config_path.clone(), || query_user_for_initial_config(testnet))?;
            read_config(config_path)?.context("Config file is missing after initial setup")?
        }
    };

    if testnet && config.network.chain == ::bitcoin::Network::Bitcoin {
        bail!("Running with --testnet but the config file is for mainnet")
    }

    let level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    trace::init(level, json, Some(config.data.dir.as_path())).context("Failed to initialize tracing")?;

    let env_config = env::new(&config);
    tracing::debug!(network = %env_config.bitcoin_network, data_dir = %config.data.dir.display(), "Using data directory");

    let db = open_db(config.database_path())
        .await
        .context("Could not open database")?;
    let keys = KeyChain::new(env_config.bitcoin_network, env_config.coin_type);
    let index = Arc::new(AddressIndex::load(db.as_ref(), &keys).await?);
    let last_block_height = db.last_block_height().await?;
    let tip = Tip::new(last_block_height.unwrap_or(0));

    let ledger = Arc::new(Ledger::new(db.clone(), index, keys, tip.clone(), env_config.kdf));

    let esplora = Esplora::new(config.esplora.url.clone())?;
    let fee_policy = StaticFeePolicy::from_sat_per_vb(config.fees.fast, config.fees.medium, config.fees.slow)?;
    let builder = TransactionBuilder::new(ledger.clone(), Arc::new(fee_policy), env_config.min_tx_fee);
    let broadcaster = NodeBroadcaster::new(Arc::new(esplora.clone()));
    let wallet = Wallet::new(ledger.clone(), builder, Arc::new(broadcaster));

    match cmd {
        Command::Start => {
            let cancel = CancellationToken::new();

            let (sync, sync_handle) = SyncService::new(ledger.clone(), db.clone());
            let scheduler = WebhookScheduler::new(db.clone(), tip.clone(), webhook_config(&config, env_config))?;

            let sync = tokio::spawn(sync.run(cancel.clone()));
            let watch = tokio::spawn({
                let cancel = cancel.clone();
                let interval = env_config.bitcoin_sync_interval();
                async move {
                    esplora
                        .watch(sync_handle, last_block_height, interval, cancel)
                        .await
                }
            });
            let webhooks = tokio::spawn({
                let cancel = cancel.clone();
                async move { scheduler.run(cancel).await }
            });

            tracing::info!(tip = tip.height(), "Wallet started");

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutting down");
            cancel.cancel();

            let (sync, watch, webhooks) = tokio::join!(sync, watch, webhooks);
            sync?;
            watch?;
            webhooks?;
        }
        Command::NewAccount => {
            let passphrase = new_passphrase()?;
            let account = wallet.create_account(&passphrase).await?;

            println!("Account:  {}", account.index);
            println!("Mnemonic: {}", account.mnemonic);
        }
        Command::NewAddress { account } => {
            let address = wallet.new_address(account).await?;

            println!("{}", address.address);
        }
        Command::Balance {
            account,
            min_confirmations,
        } => {
            let min_confirmations = min_confirmations.unwrap_or(config.bitcoin.min_confirmations);
            let balance = wallet.balance(account, min_confirmations).await?;

            tracing::debug!(account, min_confirmations, tip = tip.height(), "Computed balance");
            println!("{} BTC", btc_string(balance)?);
        }
        Command::Send {
            account,
            recipients,
            fee,
            min_confirmations,
            reservation_id,
            op_return,
        } => {
            let recipients = recipients
                .iter()
                .map(|recipient| {
                    let address = parse_address(&recipient.address, env_config.bitcoin_network)?;
                    Ok(Recipient::new(&address, recipient.amount))
                })
                .collect::<Result<Vec<_>>>()?;

            let request = SendRequest {
                build: BuildRequest {
                    account,
                    recipients,
                    min_confirmations: min_confirmations.unwrap_or(config.bitcoin.min_confirmations),
                    fee,
                    op_return,
                },
                reservation_id,
            };

            let passphrase = passphrase("Passphrase")?;
            let sent = match wallet.send(&request, &passphrase).await {
                Err(error) if matches!(Error::find(&error), Some(Error::AuthenticationFailure)) => {
                    bail!("Wrong passphrase for account {}", account)
                }
                result => result?,
            };

            let built = sent.built();
            println!("Txid: {}", built.transaction.compute_txid());
            println!("Fee:  {} BTC", btc_string(built.fee)?);
            if let Sent::Reserved { reservation_id, .. } = &sent {
                println!("Reserved under {}", reservation_id);
                println!(
                    "{}",
                    ::bitcoin::consensus::encode::serialize_hex(&built.transaction)
                );
            }
        }
        Command::Broadcast { transaction } => {
            wallet.broadcast(&transaction).await?;

            println!("{}", transaction.compute_txid());
        }
        Command::ChangePassphrase { account } => {
            let current = passphrase("Current passphrase")?;
            let new = new_passphrase()?;

            wallet.change_passphrase(account, &current, &new).await?;
            println!("Passphrase of account {} changed", account);
        }
        Command::Metrics => {
            let metrics = WalletMetrics::new()?;
            metrics
                .refresh(db.as_ref(), ledger.index(), OffsetDateTime::now_utc())
                .await?;

            print!("{}", metrics.render()?);
        }
    }

    Ok(())
}

fn webhook_config(config: &Config, env_config: env::Config) -> WebhookConfig {
    WebhookConfig {
        url: config.webhook.url.clone(),
        secret: config.webhook.secret.clone(),
        confirmations: env_config.webhook_confirmations,
        max_backoff: Duration::from_secs(config.webhook.max_backoff_secs),
    }
}

fn passphrase(prompt: &str) -> Result<String> {
    Ok(Password::new().with_prompt(prompt).interact()?)
}

fn new_passphrase() -> Result<String> {
    Ok(Password::new()
        .with_prompt("New passphrase")
        .with_confirmation("Repeat passphrase", "Passphrases do not match")
        .interact()?)
}
