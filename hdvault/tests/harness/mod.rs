use anyhow::Result;
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use hdvault::bitcoin::{KdfParams, KeyChain, StaticFeePolicy, TransactionBuilder};
use hdvault::broadcast::{Acceptance, Node, NodeBroadcaster, Peer};
use hdvault::chain::Tip;
use hdvault::database::{open_db, Database};
use hdvault::index::AddressIndex;
use hdvault::ledger::Ledger;
use hdvault::wallet::Wallet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const PASSPHRASE: &str = "correct horse battery staple";
pub const MIN_TX_FEE: Amount = Amount::from_sat(1_000);

/// A node that accepts or rejects everything and remembers what it saw.
pub struct FakeNode {
    verdict: Mutex<Acceptance>,
    submitted: Mutex<Vec<Transaction>>,
}

impl FakeNode {
    pub fn new() -> Self {
        Self {
            verdict: Mutex::new(Acceptance::Accepted),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn reject_with(&self, reason: &str) {
        *self.verdict.lock().unwrap() = Acceptance::Rejected(reason.to_owned());
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Node for FakeNode {
    async fn tip_height(&self) -> Result<u32> {
        Ok(0)
    }

    async fn accept_to_mempool(&self, transaction: &Transaction) -> Result<Acceptance> {
        self.submitted.lock().unwrap().push(transaction.clone());
        Ok(self.verdict.lock().unwrap().clone())
    }

    fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
        Vec::new()
    }
}

pub struct TestWallet {
    pub db: Arc<dyn Database + Send + Sync>,
    pub ledger: Arc<Ledger>,
    pub wallet: Wallet,
    pub node: Arc<FakeNode>,
    pub tip: Tip,
    pub account: u32,
    funding: AtomicU32,
    dir: TempDir,
}

impl TestWallet {
    /// A wallet with one account and no funds, with the chain at `tip`.
    pub async fn new(tip: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path().join("hdvault.sqlite")).await.unwrap();
        let keys = KeyChain::new(Network::Regtest, 1);
        let index = Arc::new(AddressIndex::load(db.as_ref(), &keys).await.unwrap());
        let tip = Tip::new(tip);

        let ledger = Arc::new(Ledger::new(
            db.clone(),
            index,
            keys,
            tip.clone(),
            KdfParams::light(),
        ));

        let node = Arc::new(FakeNode::new());
        let wallet = Wallet::new(
            ledger.clone(),
            builder(&ledger),
            Arc::new(NodeBroadcaster::new(node.clone())),
        );

        let account = wallet.create_account(PASSPHRASE).await.unwrap().index;

        Self {
            db,
            ledger,
            wallet,
            node,
            tip,
            account,
            funding: AtomicU32::new(0),
            dir,
        }
    }

    pub fn builder(&self) -> TransactionBuilder {
        builder(&self.ledger)
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("hdvault.sqlite")
    }

    /// Pays `sats` to a fresh receive address in a transaction mined at
    /// `block`, or seen in the mempool if `block` is `None`.
    pub async fn fund(&self, sats: u64, block: Option<u32>) -> OutPoint {
        let address = self.wallet.new_address(self.account).await.unwrap();
        let transaction = funding_transaction(
            self.funding.fetch_add(1, Ordering::SeqCst),
            address.address.script_pubkey(),
            sats,
        );

        self.ledger
            .apply_transaction(&transaction, block)
            .await
            .unwrap();

        OutPoint::new(transaction.compute_txid(), 0)
    }
}

fn builder(ledger: &Arc<Ledger>) -> TransactionBuilder {
    let fee_policy = StaticFeePolicy::from_sat_per_vb(20, 10, 2).unwrap();

    TransactionBuilder::new(ledger.clone(), Arc::new(fee_policy), MIN_TX_FEE)
}

/// A transaction from outside the wallet paying to `script`. `nonce` keeps
/// the txids distinct.
pub fn funding_transaction(nonce: u32, script: ScriptBuf, sats: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::all_zeros(), nonce),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: script,
        }],
    }
}

/// An unsigned transaction spending `outpoint` to an external address.
pub fn spending_transaction(outpoint: OutPoint) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: external_address().script_pubkey(),
        }],
    }
}

/// An address the wallet does not own.
pub fn external_address() -> Address {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
    let public = CompressedPublicKey(secret.public_key(&secp));

    Address::p2wpkh(&public, Network::Regtest)
}
