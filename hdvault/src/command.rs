use crate::bitcoin::{Amount, ConfirmationTarget, FeeChoice, Transaction};
use crate::fs::{default_config_path, system_config_dir};
use ::bitcoin::consensus::deserialize;
use ::bitcoin::FeeRate;
use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;
use uuid::Uuid;

pub fn parse_args<I, T>(raw_args: I) -> Result<Arguments>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = RawArguments::clap().get_matches_from_safe(raw_args)?;
    let args = RawArguments::from_clap(&matches);

    let testnet = args.testnet;
    let cmd = match args.cmd {
        RawCommand::Start => Command::Start,
        RawCommand::NewAccount => Command::NewAccount,
        RawCommand::NewAddress { account } => Command::NewAddress { account },
        RawCommand::Balance {
            account,
            min_confirmations,
        } => Command::Balance {
            account,
            min_confirmations,
        },
        RawCommand::Send {
            account,
            recipients,
            fee_rate,
            fee,
            target,
            min_confirmations,
            reservation_id,
            op_return,
        } => Command::Send {
            account,
            recipients,
            fee: fee_choice(fee_rate, fee, target)?,
            min_confirmations,
            reservation_id,
            op_return: op_return
                .map(|data| hex::decode(data).context("OP_RETURN data must be hex encoded"))
                .transpose()?,
        },
        RawCommand::Broadcast { transaction } => Command::Broadcast {
            transaction: parse_transaction(&transaction)?,
        },
        RawCommand::ChangePassphrase { account } => Command::ChangePassphrase { account },
        RawCommand::Metrics => Command::Metrics,
    };

    Ok(Arguments {
        testnet,
        json: args.json,
        debug: args.debug,
        config_path: config_path(args.config, testnet)?,
        cmd,
    })
}

fn config_path(config: Option<PathBuf>, testnet: bool) -> Result<PathBuf> {
    match config {
        Some(config_path) => Ok(config_path),
        None if testnet => Ok(system_config_dir()?.join("testnet").join("config.toml")),
        None => default_config_path(),
    }
}

fn fee_choice(fee_rate: Option<u64>, fee: Option<u64>, target: Option<ConfirmationTarget>) -> Result<FeeChoice> {
    let choice = match (fee_rate, fee, target) {
        (None, None, None) => FeeChoice::default(),
        (Some(rate), None, None) => FeeChoice::Rate(
            FeeRate::from_sat_per_vb(rate).with_context(|| format!("Fee rate {} sat/vB is too high", rate))?,
        ),
        (None, Some(fee), None) => FeeChoice::Absolute(Amount::from_sat(fee)),
        (None, None, Some(target)) => FeeChoice::Policy(target),
        _ => bail!("Only one of --fee-rate, --fee and --target can be given"),
    };

    Ok(choice)
}

fn parse_transaction(hex: &str) -> Result<Transaction> {
    let bytes = hex::decode(hex.trim()).context("Transaction must be hex encoded")?;

    deserialize(&bytes).context("Failed to decode transaction")
}

/// A payment given on the command line as `<address>=<sats>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientArg {
    pub address: String,
    pub amount: Amount,
}

impl FromStr for RecipientArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, sats) = s
            .split_once('=')
            .with_context(|| format!("Recipient {} is not of the form <address>=<sats>", s))?;
        let sats = sats
            .parse::<u64>()
            .with_context(|| format!("Invalid amount {} for {}", sats, address))?;

        Ok(Self {
            address: address.to_owned(),
            amount: Amount::from_sat(sats),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Arguments {
    pub testnet: bool,
    pub json: bool,
    pub debug: bool,
    pub config_path: PathBuf,
    pub cmd: Command,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    NewAccount,
    NewAddress {
        account: u32,
    },
    Balance {
        account: u32,
        min_confirmations: Option<u32>,
    },
    Send {
        account: u32,
        recipients: Vec<RecipientArg>,
        fee: FeeChoice,
        min_confirmations: Option<u32>,
        reservation_id: Option<Uuid>,
        op_return: Option<Vec<u8>>,
    },
    Broadcast {
        transaction: Transaction,
    },
    ChangePassphrase {
        account: u32,
    },
    Metrics,
}

#[derive(structopt::StructOpt, Debug)]
#[structopt(
    name = "hdvault",
    about = "Custodial HD wallet with deposit notifications",
    author
)]
pub struct RawArguments {
    #[structopt(long, help = "Operate on the bitcoin testnet")]
    pub testnet: bool,

    #[structopt(short, long = "json", help = "Print log messages as json instead of plain text")]
    pub json: bool,

    #[structopt(long, help = "Log at debug level")]
    pub debug: bool,

    #[structopt(
        long = "config",
        help = "Provide a custom path to the configuration file. The configuration file must be a toml file.",
        parse(from_os_str)
    )]
    pub config: Option<PathBuf>,

    #[structopt(subcommand)]
    pub cmd: RawCommand,
}

#[derive(structopt::StructOpt, Debug)]
pub enum RawCommand {
    #[structopt(about = "Follow the chain and deliver webhooks until interrupted")]
    Start,
    #[structopt(about = "Create an account from a fresh mnemonic")]
    NewAccount,
    #[structopt(about = "Allocate the next receive address of an account")]
    NewAddress {
        #[structopt(long)]
        account: u32,
    },
    #[structopt(about = "Print the balance of an account")]
    Balance {
        #[structopt(long)]
        account: u32,
        #[structopt(long = "min-confirmations")]
        min_confirmations: Option<u32>,
    },
    #[structopt(about = "Build and sign a transaction, then reserve or broadcast it")]
    Send {
        #[structopt(long)]
        account: u32,
        #[structopt(
            long = "to",
            required = true,
            help = "Recipient as <address>=<sats>, can be repeated"
        )]
        recipients: Vec<RecipientArg>,
        #[structopt(long = "fee-rate", help = "Fee rate in sat/vB")]
        fee_rate: Option<u64>,
        #[structopt(long = "fee", help = "Absolute fee in sats")]
        fee: Option<u64>,
        #[structopt(long = "target", help = "Confirmation target: fast, medium or slow")]
        target: Option<ConfirmationTarget>,
        #[structopt(long = "min-confirmations")]
        min_confirmations: Option<u32>,
        #[structopt(
            long = "reservation-id",
            help = "Reserve the inputs under this id instead of broadcasting"
        )]
        reservation_id: Option<Uuid>,
        #[structopt(long = "op-return", help = "Hex encoded data to embed in an OP_RETURN output")]
        op_return: Option<String>,
    },
    #[structopt(about = "Broadcast a signed transaction")]
    Broadcast {
        #[structopt(help = "Hex encoded transaction")]
        transaction: String,
    },
    #[structopt(about = "Re-encrypt the seed of an account under a new passphrase")]
    ChangePassphrase {
        #[structopt(long)]
        account: u32,
    },
    #[structopt(about = "Print wallet metrics in the Prometheus text format")]
    Metrics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::bitcoin::blockdata::constants::genesis_block;
    use ::bitcoin::consensus::encode::serialize_hex;
    use ::bitcoin::Network;

    const BINARY_NAME: &str = "hdvault";
    const ADDRESS: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

    fn args(raw: &[&str]) -> Result<Arguments> {
        parse_args(std::iter::once(BINARY_NAME).chain(raw.iter().copied()))
    }

    #[test]
    fn given_custom_config_then_it_is_used() {
        let arguments = args(&["--config", "/tmp/hdvault.toml", "start"]).unwrap();

        assert_eq!(
            arguments,
            Arguments {
                testnet: false,
                json: false,
                debug: false,
                config_path: PathBuf::from("/tmp/hdvault.toml"),
                cmd: Command::Start,
            }
        );
    }

    #[test]
    fn given_testnet_then_testnet_config_path() {
        let arguments = args(&["--testnet", "new-account"]).unwrap();

        assert!(arguments.testnet);
        assert!(arguments.config_path.ends_with("testnet/config.toml"));
        assert_eq!(arguments.cmd, Command::NewAccount);
    }

    #[test]
    fn send_with_defaults() {
        let to = format!("{}=40000", ADDRESS);
        let arguments = args(&["--config", "c.toml", "send", "--account", "0", "--to", &to]).unwrap();

        assert_eq!(
            arguments.cmd,
            Command::Send {
                account: 0,
                recipients: vec![RecipientArg {
                    address: ADDRESS.to_owned(),
                    amount: Amount::from_sat(40_000),
                }],
                fee: FeeChoice::Policy(ConfirmationTarget::Medium),
                min_confirmations: None,
                reservation_id: None,
                op_return: None,
            }
        );
    }

    #[test]
    fn send_with_reservation_and_op_return() {
        let to = format!("{}=1000", ADDRESS);
        let id = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        let arguments = args(&[
            "--config",
            "c.toml",
            "send",
            "--account",
            "2",
            "--to",
            &to,
            "--to",
            &to,
            "--fee",
            "1500",
            "--reservation-id",
            id,
            "--op-return",
            "deadbeef",
        ])
        .unwrap();

        let Command::Send {
            account,
            recipients,
            fee,
            reservation_id,
            op_return,
            ..
        } = arguments.cmd
        else {
            panic!("expected send command");
        };
        assert_eq!(account, 2);
        assert_eq!(recipients.len(), 2);
        assert_eq!(fee, FeeChoice::Absolute(Amount::from_sat(1_500)));
        assert_eq!(reservation_id, Some(Uuid::parse_str(id).unwrap()));
        assert_eq!(op_return, Some(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn conflicting_fee_options_are_refused() {
        let to = format!("{}=1000", ADDRESS);
        let result = args(&[
            "--config", "c.toml", "send", "--account", "0", "--to", &to, "--fee", "1000", "--fee-rate", "5",
        ]);

        assert!(result.is_err());
    }

    #[test]
    fn malformed_recipient_is_refused() {
        let result = args(&["--config", "c.toml", "send", "--account", "0", "--to", ADDRESS]);

        assert!(result.is_err());
    }

    #[test]
    fn broadcast_decodes_transaction() {
        let transaction = genesis_block(Network::Regtest).txdata.remove(0);
        let hex = serialize_hex(&transaction);

        let arguments = args(&["--config", "c.toml", "broadcast", &hex]).unwrap();

        assert_eq!(arguments.cmd, Command::Broadcast { transaction });
    }
}
