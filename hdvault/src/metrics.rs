//! Prometheus gauges describing the state of the wallet.

use crate::database::Database;
use crate::index::AddressIndex;
use ::bitcoin::Amount;
use anyhow::{Context, Result};
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use time::OffsetDateTime;

const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Upper bounds of the reservation age buckets: one minute, growing by a
/// factor of four while under a week.
pub fn reservation_age_buckets() -> Vec<Duration> {
    std::iter::successors(Some(Duration::from_secs(60)), |bucket| Some(*bucket * 4))
        .take_while(|bucket| *bucket < WEEK)
        .collect()
}

pub struct WalletMetrics {
    registry: Registry,
    reserved_outputs: IntGaugeVec,
    unspent_outputs: IntGauge,
    unspent_sats: IntGauge,
    spent_outputs: IntGauge,
    spent_sats: IntGauge,
    newest_arrival_block: IntGauge,
    newest_spending_block: IntGauge,
    index_scripts: IntGauge,
    index_outpoints: IntGauge,
    pending_webhooks: IntGauge,
}

impl WalletMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("hdvault".to_owned()), None)?;

        let reserved_outputs = IntGaugeVec::new(
            Opts::new(
                "reserved_outputs",
                "Outputs held by a caller reservation no older than max_age seconds, cumulative like a histogram",
            ),
            &["max_age"],
        )?;
        registry.register(Box::new(reserved_outputs.clone()))?;

        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let unspent_outputs = gauge("unspent_outputs", "Outputs not spent in a block")?;
        let unspent_sats = gauge("unspent_sats", "Value of outputs not spent in a block")?;
        let spent_outputs = gauge("spent_outputs", "Outputs spent in a block")?;
        let spent_sats = gauge("spent_sats", "Value of outputs spent in a block")?;
        let newest_arrival_block = gauge("newest_arrival_block", "Highest block an output arrived in")?;
        let newest_spending_block = gauge("newest_spending_block", "Highest block an output was spent in")?;
        let index_scripts = gauge("index_scripts", "Scripts held by the address index")?;
        let index_outpoints = gauge("index_outpoints", "Outpoints held by the address index")?;
        let pending_webhooks = gauge("pending_webhooks", "Webhooks that are not finalized")?;

        Ok(Self {
            registry,
            reserved_outputs,
            unspent_outputs,
            unspent_sats,
            spent_outputs,
            spent_sats,
            newest_arrival_block,
            newest_spending_block,
            index_scripts,
            index_outpoints,
            pending_webhooks,
        })
    }

    pub async fn refresh(
        &self,
        db: &(dyn Database + Send + Sync),
        index: &AddressIndex,
        now: OffsetDateTime,
    ) -> Result<()> {
        let ages = db
            .reservation_times()
            .await?
            .into_iter()
            .map(|reserved_on| Duration::try_from(now - reserved_on).unwrap_or(Duration::ZERO))
            .collect::<Vec<_>>();

        for bucket in reservation_age_buckets() {
            let count = ages.iter().filter(|age| **age <= bucket).count();
            let label = bucket.as_secs().to_string();
            self.reserved_outputs
                .with_label_values(&[label.as_str()])
                .set(gauge_value(count as u64));
        }
        // buckets are cumulative, so +Inf holds every reservation
        self.reserved_outputs
            .with_label_values(&["+Inf"])
            .set(gauge_value(ages.len() as u64));

        let totals = db.output_totals().await?;
        self.unspent_outputs.set(gauge_value(totals.unspent_count));
        self.unspent_sats.set(sats(totals.unspent_sum));
        self.spent_outputs.set(gauge_value(totals.spent_count));
        self.spent_sats.set(sats(totals.spent_sum));
        self.newest_arrival_block
            .set(totals.newest_arrival_block.map_or(0, i64::from));
        self.newest_spending_block
            .set(totals.newest_spending_block.map_or(0, i64::from));

        self.index_scripts.set(gauge_value(index.script_count()));
        self.index_outpoints.set(gauge_value(index.output_count()));
        self.pending_webhooks
            .set(gauge_value(db.pending_webhook_count().await?));

        Ok(())
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;

        String::from_utf8(buffer).context("Metrics are not valid UTF-8")
    }
}

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn sats(amount: Amount) -> i64 {
    gauge_value(amount.to_sat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::open_db;
    use tempfile::tempdir;

    #[test]
    fn buckets_grow_by_four_until_a_week() {
        let buckets = reservation_age_buckets()
            .iter()
            .map(Duration::as_secs)
            .collect::<Vec<_>>();

        assert_eq!(buckets, vec![60, 240, 960, 3_840, 15_360, 61_440, 245_760]);
    }

    #[tokio::test]
    async fn renders_empty_wallet() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path().join("hdvault.sqlite")).await.unwrap();
        let index = AddressIndex::new();
        index.insert_address(::bitcoin::ScriptBuf::new(), 1);

        let metrics = WalletMetrics::new().unwrap();
        metrics
            .refresh(db.as_ref(), &index, OffsetDateTime::now_utc())
            .await
            .unwrap();
        let text = metrics.render().unwrap();

        assert!(text.contains("hdvault_unspent_outputs 0"));
        assert!(text.contains("hdvault_index_scripts 1"));
        assert!(text.contains("hdvault_pending_webhooks 0"));
        assert!(text.contains("hdvault_reserved_outputs{max_age=\"+Inf\"} 0"));
        assert!(text.contains("hdvault_reserved_outputs{max_age=\"60\"} 0"));
    }
}
