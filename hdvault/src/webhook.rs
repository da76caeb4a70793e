use crate::bitcoin::btc_string;
use crate::chain::Tip;
use crate::database::{Database, WebhookRecord, WebhookUpdate};
use crate::ledger::confirmations;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const BATCH_SIZE: u32 = 100;
const POLL_INTERVAL: Duration = Duration::from_secs(60);
const DRAIN_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_RESCHEDULE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: Option<Url>,
    pub secret: String,
    pub confirmations: u32,
    pub max_backoff: Duration,
}

/// What a webhook receiver is told about a deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub txid: String,
    pub amount: String,
    pub address: String,
    pub confirmed: bool,
}

impl Notification {
    fn status(&self) -> &'static str {
        if self.confirmed {
            "confirmed"
        } else {
            "unconfirmed"
        }
    }

    /// Lowercase hex SHA-256 over address, amount, txid, status and the
    /// shared secret, in that order.
    pub fn control(&self, secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.address.as_bytes());
        hasher.update(self.amount.as_bytes());
        hasher.update(self.txid.as_bytes());
        hasher.update(self.status().as_bytes());
        hasher.update(secret.as_bytes());

        hex::encode(hasher.finalize())
    }

    pub fn url(&self, base: &Url, secret: &str) -> Url {
        let mut url = base.clone();
        url.query_pairs_mut()
            .append_pair("txid", &self.txid)
            .append_pair("amount", &self.amount)
            .append_pair("address", &self.address)
            .append_pair("status", self.status())
            .append_pair("control", &self.control(secret));

        url
    }
}

/// The next time a delivery is attempted: twice the record's age from now,
/// kept between ten seconds and `max_backoff`.
pub fn next_send(created_at: OffsetDateTime, now: OffsetDateTime, max_backoff: Duration) -> OffsetDateTime {
    let age = Duration::try_from(now - created_at).unwrap_or(Duration::ZERO);
    let delay = age
        .saturating_mul(2)
        .clamp(MIN_RESCHEDULE, max_backoff.max(MIN_RESCHEDULE));

    now + delay
}

enum Delivery {
    Delivered(String),
    Failed(String),
    Cancelled,
}

/// Delivers pending deposit notifications until the deposit has enough
/// confirmations.
pub struct WebhookScheduler {
    db: Arc<dyn Database + Send + Sync>,
    tip: Tip,
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookScheduler {
    pub fn new(db: Arc<dyn Database + Send + Sync>, tip: Tip, config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            db,
            tip,
            config,
            client,
        })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let delay = match self.process_due(OffsetDateTime::now_utc(), &cancel).await {
                Ok(processed) if processed == BATCH_SIZE as usize => DRAIN_INTERVAL,
                Ok(_) => POLL_INTERVAL,
                Err(error) => {
                    tracing::error!("Failed to process webhooks: {:#}", error);
                    POLL_INTERVAL
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("Webhook scheduler stopped");
    }

    /// Attempts every due webhook in one batch and commits the outcomes
    /// together. Returns how many records were due.
    pub async fn process_due(&self, now: OffsetDateTime, cancel: &CancellationToken) -> Result<usize> {
        let due = self.db.due_webhooks(now, BATCH_SIZE).await?;
        let tip = self.tip.height();
        let mut updates = Vec::with_capacity(due.len());

        for record in &due {
            let notification = Notification {
                txid: record.output.outpoint.txid.to_string(),
                amount: btc_string(record.output.amount)?,
                address: record.address.clone(),
                confirmed: self.is_confirmed(record, tip),
            };

            let (delivered, status) = match self.deliver(&notification, cancel).await {
                Delivery::Delivered(status) => (true, status),
                Delivery::Failed(status) => (false, status),
                Delivery::Cancelled => break,
            };

            let send_on = if delivered && notification.confirmed {
                tracing::info!(webhook = record.id, txid = %notification.txid, "Webhook finalized");
                None
            } else {
                Some(next_send(record.created_at, now, self.config.max_backoff))
            };

            updates.push(WebhookUpdate {
                id: record.id,
                send_on,
                status,
            });
        }

        self.db.commit_webhooks(&updates).await?;

        if !due.is_empty() {
            tracing::debug!(due = due.len(), attempted = updates.len(), "Processed webhooks");
        }

        Ok(due.len())
    }

    fn is_confirmed(&self, record: &WebhookRecord, tip: u32) -> bool {
        let arrival = record.output.arrival_block;

        arrival.is_some() && confirmations(arrival, tip) >= self.config.confirmations
    }

    async fn deliver(&self, notification: &Notification, cancel: &CancellationToken) -> Delivery {
        let Some(base) = &self.config.url else {
            return Delivery::Failed("webhook url is not set".to_owned());
        };
        let url = notification.url(base, &self.config.secret);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Delivery::Cancelled,
            response = self.client.get(url.clone()).send() => response,
        };

        match response {
            Ok(response) => {
                let code = response.status();
                let body = response.text().await.unwrap_or_default();
                let status = format!("{:03} | {} | {}", code.as_u16(), base, body);

                if code.is_success() {
                    Delivery::Delivered(status)
                } else {
                    tracing::warn!(txid = %notification.txid, %code, "Webhook receiver refused notification");
                    Delivery::Failed(status)
                }
            }
            Err(error) => {
                tracing::warn!(txid = %notification.txid, "Failed to deliver webhook: {:#}", error);
                Delivery::Failed(format!("000 | {} | {:#}", base, error))
            }
        }
    }
}
