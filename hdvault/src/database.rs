pub use sqlite::SqliteDatabase;

use crate::bitcoin::EncryptedSeed;
use crate::fs::ensure_directory_exists;
use ::bitcoin::bip32::Xpub;
use ::bitcoin::{Amount, OutPoint};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

mod sqlite;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub index: u32,
    pub encrypted_seed: EncryptedSeed,
    pub xpub: Xpub,
    pub chain_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAddress {
    pub account: u32,
    pub is_change: bool,
    pub index: u32,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub id: i64,
    pub account: u32,
    pub is_change: bool,
    pub index: u32,
    pub address: String,
    pub in_use: bool,
}

/// Who holds an output and since when. [`Uuid::nil`] marks outputs the
/// wallet itself saw being spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub reserved_on: OffsetDateTime,
}

impl Reservation {
    pub fn system(now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::nil(),
            reserved_on: now,
        }
    }

    pub fn is_system(&self) -> bool {
        self.id.is_nil()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewOutput {
    pub address_id: i64,
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub arrival_block: Option<u32>,
    /// Registers a webhook created at this time, together with the output.
    pub webhook_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRecord {
    pub id: i64,
    pub address_id: i64,
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub arrival_block: Option<u32>,
    pub spending_block: Option<u32>,
    pub reservation: Option<Reservation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRecord {
    pub id: i64,
    pub created_at: OffsetDateTime,
    pub send_on: Option<OffsetDateTime>,
    pub status: Option<String>,
    pub output: OutputRecord,
    pub address: String,
}

/// Outcome of one delivery attempt. `send_on: None` finalizes the webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookUpdate {
    pub id: i64,
    pub send_on: Option<OffsetDateTime>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputTotals {
    pub unspent_count: u64,
    pub unspent_sum: Amount,
    pub spent_count: u64,
    pub spent_sum: Amount,
    pub newest_arrival_block: Option<u32>,
    pub newest_spending_block: Option<u32>,
}

#[async_trait]
pub trait Database {
    async fn account_count(&self) -> Result<u32>;
    async fn insert_account(&self, account: &AccountRecord) -> Result<()>;
    async fn get_account(&self, index: u32) -> Result<Option<AccountRecord>>;
    async fn find_account_by_chain_code(&self, chain_code: &str) -> Result<Option<AccountRecord>>;
    async fn all_accounts(&self) -> Result<Vec<AccountRecord>>;
    async fn update_encrypted_seed(&self, index: u32, encrypted_seed: &EncryptedSeed) -> Result<()>;

    async fn address_count(&self, account: u32, is_change: bool) -> Result<u32>;
    async fn insert_address(&self, address: &NewAddress) -> Result<AddressRecord>;
    async fn get_address(&self, id: i64) -> Result<Option<AddressRecord>>;
    async fn all_addresses(&self) -> Result<Vec<AddressRecord>>;
    async fn mark_address_in_use(&self, id: i64) -> Result<()>;

    /// Inserts the output unless one with the same outpoint exists, then
    /// fills in a missing arrival block. A newly created output gets its
    /// webhook in the same transaction. Returns the stored row and whether
    /// it was created by this call.
    async fn insert_output(&self, output: &NewOutput) -> Result<(OutputRecord, bool)>;
    async fn get_output(&self, id: i64) -> Result<Option<OutputRecord>>;
    /// Fills in a missing spending block and a missing reservation.
    async fn mark_output_spent(
        &self,
        id: i64,
        spending_block: Option<u32>,
        reservation: Reservation,
    ) -> Result<()>;
    /// Outputs not yet spent in a block.
    async fn open_outputs(&self) -> Result<Vec<OutputRecord>>;
    /// Outputs of an account that are neither spent nor reserved.
    async fn unspent_outputs(&self, account: u32) -> Result<Vec<(OutputRecord, AddressRecord)>>;

    async fn is_reservation_in_use(&self, id: Uuid) -> Result<bool>;
    /// Reserves all outputs or none of them. Fails with
    /// [`Error::ReservationConflict`](crate::Error::ReservationConflict) if
    /// any output is held or the id is already in use.
    async fn reserve_outputs(&self, output_ids: &[i64], reservation: Reservation) -> Result<()>;

    async fn due_webhooks(&self, now: OffsetDateTime, limit: u32) -> Result<Vec<WebhookRecord>>;
    async fn commit_webhooks(&self, updates: &[WebhookUpdate]) -> Result<()>;
    async fn pending_webhook_count(&self) -> Result<u64>;

    async fn last_block_height(&self) -> Result<Option<u32>>;
    async fn set_last_block_height(&self, height: u32) -> Result<()>;

    async fn output_totals(&self) -> Result<OutputTotals>;
    /// When each output held by a caller reservation was reserved.
    async fn reservation_times(&self) -> Result<Vec<OffsetDateTime>>;
}

pub async fn open_db(sqlite_path: impl AsRef<Path>) -> Result<Arc<dyn Database + Send + Sync>> {
    if sqlite_path.as_ref().exists() {
        tracing::debug!("Using existing sqlite database.");
        let sqlite = SqliteDatabase::open(sqlite_path).await?;
        Ok(Arc::new(sqlite))
    } else {
        tracing::debug!("Creating and using new sqlite database.");
        ensure_directory_exists(sqlite_path.as_ref())?;
        tokio::fs::File::create(&sqlite_path).await?;
        let sqlite = SqliteDatabase::open(sqlite_path).await?;
        Ok(Arc::new(sqlite))
    }
}
