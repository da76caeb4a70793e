use crate::bitcoin::keys::{chain_code, generate_mnemonic};
use crate::bitcoin::{EncryptedSeed, KdfParams, KeyChain, Seed};
use crate::chain::Tip;
use crate::database::{
    AccountRecord, AddressRecord, Database, NewAddress, NewOutput, OutputRecord, Reservation,
};
use crate::error::Error;
use crate::index::AddressIndex;
use ::bitcoin::bip32::Xpriv;
use ::bitcoin::{Address, Amount, Block, OutPoint, Transaction};
use anyhow::{bail, Result};
use bip39::Mnemonic;
use moka::sync::Cache;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct NewAccount {
    pub index: u32,
    pub mnemonic: Mnemonic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub record: AddressRecord,
    pub address: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendableOutput {
    pub output: OutputRecord,
    pub address_id: i64,
    pub is_change: bool,
    pub derivation_index: u32,
    pub confirmations: u32,
}

impl SpendableOutput {
    pub fn amount(&self) -> Amount {
        self.output.amount
    }

    pub fn outpoint(&self) -> OutPoint {
        self.output.outpoint
    }
}

/// Blocks mined on top of the block an output arrived in.
pub fn confirmations(arrival_block: Option<u32>, tip: u32) -> u32 {
    arrival_block.map_or(0, |arrival| tip.saturating_sub(arrival))
}

/// The predicate shared by balance and spendable queries.
pub fn has_confirmations(arrival_block: Option<u32>, tip: u32, min_confirmations: u32) -> bool {
    if min_confirmations == 0 {
        return true;
    }

    match (arrival_block, tip.checked_sub(min_confirmations)) {
        (Some(arrival), Some(limit)) => arrival <= limit,
        _ => false,
    }
}

/// Accounts, addresses and the outputs they own.
///
/// Writes go through the store first and are mirrored into the
/// [`AddressIndex`] afterwards, so the index never knows about rows the
/// store does not have.
pub struct Ledger {
    db: Arc<dyn Database + Send + Sync>,
    index: Arc<AddressIndex>,
    keys: KeyChain,
    tip: Tip,
    kdf: KdfParams,
    account_lock: Mutex<()>,
    address_locks: Cache<u32, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new(
        db: Arc<dyn Database + Send + Sync>,
        index: Arc<AddressIndex>,
        keys: KeyChain,
        tip: Tip,
        kdf: KdfParams,
    ) -> Self {
        Self {
            db,
            index,
            keys,
            tip,
            kdf,
            account_lock: Mutex::new(()),
            address_locks: Cache::builder().build(),
        }
    }

    pub fn index(&self) -> &AddressIndex {
        &self.index
    }

    pub fn keys(&self) -> &KeyChain {
        &self.keys
    }

    pub fn tip(&self) -> &Tip {
        &self.tip
    }

    pub async fn create_account(&self, passphrase: &str) -> Result<NewAccount> {
        let mnemonic = generate_mnemonic()?;
        let index = self.import_account(&mnemonic, passphrase).await?;

        Ok(NewAccount { index, mnemonic })
    }

    /// Registers the seed behind `mnemonic`. A seed that is already known
    /// keeps its account index.
    pub async fn import_account(&self, mnemonic: &Mnemonic, passphrase: &str) -> Result<u32> {
        let seed = Seed::from_mnemonic(mnemonic);
        let master = seed.master_key(self.keys.network())?;
        let chain_code = chain_code(&master);

        let _guard = self.account_lock.lock().await;

        if let Some(existing) = self.db.find_account_by_chain_code(&chain_code).await? {
            tracing::warn!(account = existing.index, "Seed is already registered");
            return Ok(existing.index);
        }

        let index = self.db.account_count().await?;
        let account = AccountRecord {
            index,
            encrypted_seed: EncryptedSeed::encrypt(&seed, passphrase, self.kdf)?,
            xpub: self.keys.account_xpub(&master, index)?,
            chain_code,
        };
        self.db.insert_account(&account).await?;

        tracing::info!(account = index, "Created account");

        Ok(index)
    }

    pub async fn account(&self, account: u32) -> Result<AccountRecord> {
        match self.db.get_account(account).await? {
            Some(record) => Ok(record),
            None => bail!(Error::AccountNotFound(account)),
        }
    }

    /// Allocates the next unused index on the receive or change chain.
    pub async fn new_address(&self, account: u32, is_change: bool) -> Result<DerivedAddress> {
        let record = self.account(account).await?;

        let lock = self
            .address_locks
            .get_with(account, || Arc::new(Mutex::new(())));
        let _guard = lock.lock().await;

        let index = self.db.address_count(account, is_change).await?;
        let address = self.keys.address(&record.xpub, is_change, index)?;
        let stored = self
            .db
            .insert_address(&NewAddress {
                account,
                is_change,
                index,
                address: address.to_string(),
            })
            .await?;
        self.index.insert_address(address.script_pubkey(), stored.id);

        tracing::debug!(account, is_change, index, %address, "Allocated address");

        Ok(DerivedAddress {
            record: stored,
            address,
        })
    }

    pub async fn balance(&self, account: u32, min_confirmations: u32) -> Result<Amount> {
        let spendable = self.spendable(account, min_confirmations).await?;

        Ok(spendable.iter().map(SpendableOutput::amount).sum())
    }

    pub async fn spendable(&self, account: u32, min_confirmations: u32) -> Result<Vec<SpendableOutput>> {
        self.account(account).await?;
        let tip = self.tip.height();

        let spendable = self
            .db
            .unspent_outputs(account)
            .await?
            .into_iter()
            .filter(|(output, _)| has_confirmations(output.arrival_block, tip, min_confirmations))
            .map(|(output, address)| SpendableOutput {
                confirmations: confirmations(output.arrival_block, tip),
                output,
                address_id: address.id,
                is_change: address.is_change,
                derivation_index: address.index,
            })
            .collect();

        Ok(spendable)
    }

    /// Holds every wallet output the transaction spends under
    /// `reservation_id`. All outputs are reserved or none.
    pub async fn reserve(&self, transaction: &Transaction, reservation_id: Uuid) -> Result<()> {
        if reservation_id.is_nil() {
            bail!("The nil reservation id is reserved for the wallet itself")
        }

        let output_ids = transaction
            .input
            .iter()
            .filter_map(|input| self.index.output_id(&input.previous_output))
            .collect::<Vec<_>>();

        self.db
            .reserve_outputs(
                &output_ids,
                Reservation {
                    id: reservation_id,
                    reserved_on: OffsetDateTime::now_utc(),
                },
            )
            .await?;

        tracing::info!(
            %reservation_id,
            txid = %transaction.compute_txid(),
            outputs = output_ids.len(),
            "Reserved outputs"
        );

        Ok(())
    }

    pub async fn is_reservation_in_use(&self, reservation_id: Uuid) -> Result<bool> {
        self.db.is_reservation_in_use(reservation_id).await
    }

    /// Records what the transaction does to our outputs. `block` is `None`
    /// for transactions seen before confirmation.
    pub async fn apply_transaction(&self, transaction: &Transaction, block: Option<u32>) -> Result<()> {
        let txid = transaction.compute_txid();

        for (vout, output) in transaction.output.iter().enumerate() {
            let Some(address_id) = self.index.address_id(&output.script_pubkey) else {
                continue;
            };

            let Some(address) = self.db.get_address(address_id).await? else {
                bail!(Error::AddressNotFound(address_id.to_string()))
            };

            // deposits to receive addresses are announced by webhook
            let outpoint = OutPoint::new(txid, u32::try_from(vout)?);
            let (record, created) = self
                .db
                .insert_output(&NewOutput {
                    address_id,
                    outpoint,
                    amount: output.value,
                    arrival_block: block,
                    webhook_at: (!address.is_change).then(OffsetDateTime::now_utc),
                })
                .await?;
            self.db.mark_address_in_use(address_id).await?;

            if record.spending_block.is_none() {
                self.index.insert_output(outpoint, record.id);
            }

            if created {
                tracing::info!(%txid, vout, amount = %output.value, ?block, is_change = address.is_change, "Output arrived");
            }
        }

        for input in &transaction.input {
            let Some(output_id) = self.index.output_id(&input.previous_output) else {
                continue;
            };

            self.db
                .mark_output_spent(output_id, block, Reservation::system(OffsetDateTime::now_utc()))
                .await?;

            if block.is_some() {
                self.index.evict_output(&input.previous_output);
            }

            tracing::debug!(%txid, outpoint = %input.previous_output, ?block, "Output spent");
        }

        Ok(())
    }

    pub async fn apply_block(&self, block: Option<&Block>, height: u32) -> Result<()> {
        let Some(block) = block else {
            return Ok(());
        };

        for transaction in &block.txdata {
            self.apply_transaction(transaction, Some(height)).await?;
        }

        Ok(())
    }

    /// Decrypts the account seed. Fails with
    /// [`Error::AuthenticationFailure`] on a wrong passphrase.
    pub async fn master_key(&self, account: u32, passphrase: &str) -> Result<Xpriv> {
        let record = self.account(account).await?;
        let master = record
            .encrypted_seed
            .decrypt(passphrase)?
            .master_key(self.keys.network())?;

        if chain_code(&master) != record.chain_code {
            bail!("Seed of account {} does not match its chain code", account)
        }

        Ok(master)
    }

    pub async fn change_passphrase(&self, account: u32, current: &str, new: &str) -> Result<()> {
        let record = self.account(account).await?;
        let seed = record.encrypted_seed.decrypt(current)?;

        let encrypted = EncryptedSeed::encrypt(&seed, new, self.kdf)?;
        self.db.update_encrypted_seed(account, &encrypted).await?;

        tracing::info!(account, "Changed passphrase");

        Ok(())
    }
}
