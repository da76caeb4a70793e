use crate::bitcoin::EncryptedSeed;
use crate::database::{
    AccountRecord, AddressRecord, Database, NewAddress, NewOutput, OutputRecord, OutputTotals,
    Reservation, WebhookRecord, WebhookUpdate,
};
use crate::error::Error;
use ::bitcoin::bip32::Xpub;
use ::bitcoin::{Amount, OutPoint, Txid};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqliteRow};
use sqlx::{ConnectOptions, Pool, Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

const OUTPUT_COLUMNS: &str = "o.id AS output_id, o.address_id AS output_address_id, o.txid, o.vout, \
     o.amount, o.arrival_block, o.spending_block, o.reserved_by, o.reserved_on";
const ADDRESS_COLUMNS: &str =
    "a.id AS addr_id, a.account_id, a.is_change, a.derivation_index, a.address, a.in_use";

pub struct SqliteDatabase {
    pool: Pool<Sqlite>,
}

impl SqliteDatabase {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self>
    where
        Self: std::marker::Sized,
    {
        let path_str = format!("sqlite:{}", path.as_ref().display());

        let options = SqliteConnectOptions::from_str(&path_str)?.disable_statement_logging();

        let pool = SqlitePool::connect_with(options).await?;
        let mut sqlite = Self { pool };

        sqlite.run_migrations().await?;

        Ok(sqlite)
    }

    async fn run_migrations(&mut self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn account_count(&self) -> Result<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .await?;

        Ok(u32::try_from(count)?)
    }

    async fn insert_account(&self, account: &AccountRecord) -> Result<()> {
        sqlx::query(
            r#"
        INSERT INTO accounts (
            id,
            encrypted_seed,
            xpub,
            chain_code
            ) VALUES (?, ?, ?, ?);
        "#,
        )
        .bind(i64::from(account.index))
        .bind(account.encrypted_seed.to_string())
        .bind(account.xpub.to_string())
        .bind(&account.chain_code)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to store account {}", account.index))?;

        Ok(())
    }

    async fn get_account(&self, index: u32) -> Result<Option<AccountRecord>> {
        let row = sqlx::query(
            r#"
        SELECT id, encrypted_seed, xpub, chain_code
        FROM accounts
        WHERE id = ?
        "#,
        )
        .bind(i64::from(index))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_account_by_chain_code(&self, chain_code: &str) -> Result<Option<AccountRecord>> {
        let row = sqlx::query(
            r#"
        SELECT id, encrypted_seed, xpub, chain_code
        FROM accounts
        WHERE chain_code = ?
        "#,
        )
        .bind(chain_code)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn all_accounts(&self) -> Result<Vec<AccountRecord>> {
        let rows = sqlx::query("SELECT id, encrypted_seed, xpub, chain_code FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn update_encrypted_seed(&self, index: u32, encrypted_seed: &EncryptedSeed) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET encrypted_seed = ? WHERE id = ?")
            .bind(encrypted_seed.to_string())
            .bind(i64::from(index))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            bail!(Error::AccountNotFound(index))
        }

        Ok(())
    }

    async fn address_count(&self, account: u32, is_change: bool) -> Result<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM addresses WHERE account_id = ? AND is_change = ?")
                .bind(i64::from(account))
                .bind(i64::from(is_change))
                .fetch_one(&self.pool)
                .await?;

        Ok(u32::try_from(count)?)
    }

    async fn insert_address(&self, address: &NewAddress) -> Result<AddressRecord> {
        let result = sqlx::query(
            r#"
        INSERT INTO addresses (
            account_id,
            is_change,
            derivation_index,
            address
            ) VALUES (?, ?, ?, ?);
        "#,
        )
        .bind(i64::from(address.account))
        .bind(i64::from(address.is_change))
        .bind(i64::from(address.index))
        .bind(&address.address)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to store address {} of account {}",
                address.index, address.account
            )
        })?;

        Ok(AddressRecord {
            id: result.last_insert_rowid(),
            account: address.account,
            is_change: address.is_change,
            index: address.index,
            address: address.address.clone(),
            in_use: false,
        })
    }

    async fn get_address(&self, id: i64) -> Result<Option<AddressRecord>> {
        let sql = format!("SELECT {ADDRESS_COLUMNS} FROM addresses a WHERE a.id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        row.as_ref().map(address_from_row).transpose()
    }

    async fn all_addresses(&self) -> Result<Vec<AddressRecord>> {
        let sql = format!("SELECT {ADDRESS_COLUMNS} FROM addresses a ORDER BY a.id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter().map(address_from_row).collect()
    }

    async fn mark_address_in_use(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE addresses SET in_use = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_output(&self, output: &NewOutput) -> Result<(OutputRecord, bool)> {
        let txid = output.outpoint.txid.to_string();
        let vout = i64::from(output.outpoint.vout);
        let arrival_block = output.arrival_block.map(i64::from);

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
        INSERT OR IGNORE INTO outputs (
            address_id,
            txid,
            vout,
            amount,
            arrival_block
            ) VALUES (?, ?, ?, ?, ?);
        "#,
        )
        .bind(output.address_id)
        .bind(&txid)
        .bind(vout)
        .bind(i64::try_from(output.amount.to_sat())?)
        .bind(arrival_block)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE outputs SET arrival_block = COALESCE(arrival_block, ?) WHERE txid = ? AND vout = ?",
        )
        .bind(arrival_block)
        .bind(&txid)
        .bind(vout)
        .execute(&mut *tx)
        .await?;

        let sql = format!("SELECT {OUTPUT_COLUMNS} FROM outputs o WHERE o.txid = ? AND o.vout = ?");
        let row = sqlx::query(&sql)
            .bind(&txid)
            .bind(vout)
            .fetch_one(&mut *tx)
            .await?;
        let record = output_from_row(&row)?;

        let created = inserted.rows_affected() == 1;
        if let (true, Some(webhook_at)) = (created, output.webhook_at) {
            let webhook_at = webhook_at.unix_timestamp();
            sqlx::query(
                r#"
            INSERT INTO webhooks (
                output_id,
                created_at,
                send_on
                ) VALUES (?, ?, ?);
            "#,
            )
            .bind(record.id)
            .bind(webhook_at)
            .bind(webhook_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok((record, created))
    }

    async fn get_output(&self, id: i64) -> Result<Option<OutputRecord>> {
        let sql = format!("SELECT {OUTPUT_COLUMNS} FROM outputs o WHERE o.id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        row.as_ref().map(output_from_row).transpose()
    }

    async fn mark_output_spent(
        &self,
        id: i64,
        spending_block: Option<u32>,
        reservation: Reservation,
    ) -> Result<()> {
        sqlx::query(
            r#"
        UPDATE outputs
        SET spending_block = COALESCE(spending_block, ?),
            reserved_by    = COALESCE(reserved_by, ?),
            reserved_on    = COALESCE(reserved_on, ?)
        WHERE id = ?
        "#,
        )
        .bind(spending_block.map(i64::from))
        .bind(reservation.id.to_string())
        .bind(reservation.reserved_on.unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn open_outputs(&self) -> Result<Vec<OutputRecord>> {
        let sql = format!("SELECT {OUTPUT_COLUMNS} FROM outputs o WHERE o.spending_block IS NULL");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter().map(output_from_row).collect()
    }

    async fn unspent_outputs(&self, account: u32) -> Result<Vec<(OutputRecord, AddressRecord)>> {
        let sql = format!(
            r#"
        SELECT {OUTPUT_COLUMNS}, {ADDRESS_COLUMNS}
        FROM outputs o
        JOIN addresses a ON a.id = o.address_id
        WHERE a.account_id = ?
          AND o.spending_block IS NULL
          AND o.reserved_by IS NULL
        ORDER BY o.id
        "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(account))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Ok((output_from_row(row)?, address_from_row(row)?)))
            .collect()
    }

    async fn is_reservation_in_use(&self, id: Uuid) -> Result<bool> {
        let in_use: i64 =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outputs WHERE reserved_by = ?)")
                .bind(id.to_string())
                .fetch_one(&self.pool)
                .await?;

        Ok(in_use != 0)
    }

    async fn reserve_outputs(&self, output_ids: &[i64], reservation: Reservation) -> Result<()> {
        match reserve(&self.pool, output_ids, reservation).await {
            Err(error) if is_busy(&error) => {
                tracing::debug!(reservation_id = %reservation.id, "Store stayed locked, refusing reservation");
                bail!(Error::ReservationConflict(reservation.id))
            }
            result => result,
        }
    }

    async fn due_webhooks(&self, now: OffsetDateTime, limit: u32) -> Result<Vec<WebhookRecord>> {
        let sql = format!(
            r#"
        SELECT w.id AS webhook_id, w.created_at, w.send_on, w.status, {OUTPUT_COLUMNS}, a.address
        FROM webhooks w
        JOIN outputs o ON o.id = w.output_id
        JOIN addresses a ON a.id = o.address_id
        WHERE w.send_on IS NOT NULL
          AND w.send_on <= ?
        ORDER BY w.id
        LIMIT ?
        "#
        );
        let rows = sqlx::query(&sql)
            .bind(now.unix_timestamp())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(WebhookRecord {
                    id: row.try_get("webhook_id")?,
                    created_at: from_unix(row.try_get("created_at")?)?,
                    send_on: row
                        .try_get::<Option<i64>, _>("send_on")?
                        .map(from_unix)
                        .transpose()?,
                    status: row.try_get("status")?,
                    output: output_from_row(row)?,
                    address: row.try_get("address")?,
                })
            })
            .collect()
    }

    async fn commit_webhooks(&self, updates: &[WebhookUpdate]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for update in updates {
            sqlx::query("UPDATE webhooks SET send_on = ?, status = ? WHERE id = ?")
                .bind(update.send_on.map(OffsetDateTime::unix_timestamp))
                .bind(&update.status)
                .bind(update.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn pending_webhook_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhooks WHERE send_on IS NOT NULL")
            .fetch_one(&self.pool)
            .await?;

        Ok(u64::try_from(count)?)
    }

    async fn last_block_height(&self) -> Result<Option<u32>> {
        let height: Option<i64> =
            sqlx::query_scalar("SELECT last_block_height FROM chain_state WHERE id = 0")
                .fetch_optional(&self.pool)
                .await?;

        to_height(height)
    }

    async fn set_last_block_height(&self, height: u32) -> Result<()> {
        sqlx::query(
            r#"
        INSERT INTO chain_state (id, last_block_height) VALUES (0, ?)
        ON CONFLICT (id) DO UPDATE SET last_block_height = excluded.last_block_height
        "#,
        )
        .bind(i64::from(height))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn output_totals(&self) -> Result<OutputTotals> {
        let (unspent_count, unspent_sum): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0) FROM outputs WHERE spending_block IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        let (spent_count, spent_sum): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0) FROM outputs WHERE spending_block IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        let (newest_arrival, newest_spending): (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MAX(arrival_block), MAX(spending_block) FROM outputs")
                .fetch_one(&self.pool)
                .await?;

        Ok(OutputTotals {
            unspent_count: u64::try_from(unspent_count)?,
            unspent_sum: Amount::from_sat(u64::try_from(unspent_sum)?),
            spent_count: u64::try_from(spent_count)?,
            spent_sum: Amount::from_sat(u64::try_from(spent_sum)?),
            newest_arrival_block: to_height(newest_arrival)?,
            newest_spending_block: to_height(newest_spending)?,
        })
    }

    async fn reservation_times(&self) -> Result<Vec<OffsetDateTime>> {
        let times: Vec<i64> = sqlx::query_scalar(
            "SELECT reserved_on FROM outputs WHERE reserved_by IS NOT NULL AND reserved_by != ?",
        )
        .bind(Uuid::nil().to_string())
        .fetch_all(&self.pool)
        .await?;

        times.into_iter().map(from_unix).collect()
    }
}

/// Holds every output under `reservation`, or none if one of them is taken
/// or the id is already in use.
///
/// The update must stay the first statement: it takes the write lock, and a
/// deferred transaction that has already read cannot wait for it.
async fn reserve(pool: &Pool<Sqlite>, output_ids: &[i64], reservation: Reservation) -> Result<()> {
    let reserved_by = reservation.id.to_string();
    let mut tx = pool.begin().await?;

    let placeholders = vec!["?"; output_ids.len()].join(", ");
    let sql = format!(
        r#"
        UPDATE outputs
        SET reserved_by = ?, reserved_on = ?
        WHERE id IN ({placeholders})
          AND reserved_by IS NULL
          AND spending_block IS NULL
        "#
    );
    let mut query = sqlx::query(&sql)
        .bind(&reserved_by)
        .bind(reservation.reserved_on.unix_timestamp());
    for output_id in output_ids {
        query = query.bind(output_id);
    }
    let updated = query.execute(&mut *tx).await?.rows_affected();

    if updated != u64::try_from(output_ids.len())? {
        tracing::debug!(reservation_id = %reservation.id, "Output is already held, rolling back reservation");
        bail!(Error::ReservationConflict(reservation.id))
    }

    let holders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outputs WHERE reserved_by = ?")
        .bind(&reserved_by)
        .fetch_one(&mut *tx)
        .await?;
    if u64::try_from(holders)? != updated {
        tracing::debug!(reservation_id = %reservation.id, "Reservation id is already in use, rolling back");
        bail!(Error::ReservationConflict(reservation.id))
    }

    tx.commit().await?;

    Ok(())
}

/// SQLITE_BUSY and its extended codes.
fn is_busy(error: &anyhow::Error) -> bool {
    const SQLITE_BUSY: i32 = 5;

    match error.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(error)) => error
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| code & 0xff == SQLITE_BUSY),
        _ => false,
    }
}

fn from_unix(timestamp: i64) -> Result<OffsetDateTime> {
    Ok(OffsetDateTime::from_unix_timestamp(timestamp)?)
}

fn to_height(height: Option<i64>) -> Result<Option<u32>> {
    height
        .map(u32::try_from)
        .transpose()
        .context("Block height out of range")
}

fn account_from_row(row: &SqliteRow) -> Result<AccountRecord> {
    let index: i64 = row.try_get("id")?;
    let encrypted_seed: String = row.try_get("encrypted_seed")?;
    let xpub: String = row.try_get("xpub")?;

    Ok(AccountRecord {
        index: u32::try_from(index)?,
        encrypted_seed: EncryptedSeed::from_str(&encrypted_seed)?,
        xpub: Xpub::from_str(&xpub)?,
        chain_code: row.try_get("chain_code")?,
    })
}

fn address_from_row(row: &SqliteRow) -> Result<AddressRecord> {
    let account: i64 = row.try_get("account_id")?;
    let index: i64 = row.try_get("derivation_index")?;
    let is_change: i64 = row.try_get("is_change")?;
    let in_use: i64 = row.try_get("in_use")?;

    Ok(AddressRecord {
        id: row.try_get("addr_id")?,
        account: u32::try_from(account)?,
        is_change: is_change != 0,
        index: u32::try_from(index)?,
        address: row.try_get("address")?,
        in_use: in_use != 0,
    })
}

fn output_from_row(row: &SqliteRow) -> Result<OutputRecord> {
    let id: i64 = row.try_get("output_id")?;
    let txid: String = row.try_get("txid")?;
    let vout: i64 = row.try_get("vout")?;
    let amount: i64 = row.try_get("amount")?;
    let reserved_by: Option<String> = row.try_get("reserved_by")?;
    let reserved_on: Option<i64> = row.try_get("reserved_on")?;

    let reservation = match (reserved_by, reserved_on) {
        (Some(reserved_by), Some(reserved_on)) => Some(Reservation {
            id: Uuid::parse_str(&reserved_by)?,
            reserved_on: from_unix(reserved_on)?,
        }),
        (None, None) => None,
        _ => bail!("Output {} carries a partial reservation", id),
    };

    Ok(OutputRecord {
        id,
        address_id: row.try_get("output_address_id")?,
        outpoint: OutPoint::new(Txid::from_str(&txid)?, u32::try_from(vout)?),
        amount: Amount::from_sat(u64::try_from(amount)?),
        arrival_block: to_height(row.try_get("arrival_block")?)?,
        spending_block: to_height(row.try_get("spending_block")?)?,
        reservation,
    })
}
