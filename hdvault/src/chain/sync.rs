use crate::database::Database;
use crate::ledger::Ledger;
use ::bitcoin::{Block, Transaction};
use anyhow::{bail, Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RETRY_INTERVAL: Duration = Duration::from_millis(500);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
enum ChainEvent {
    BlockConnected { block: Box<Block>, height: u32 },
    TransactionObserved(Box<Transaction>),
}

/// Feeds chain notifications into the [`SyncService`]. Cheap to clone.
#[derive(Clone, Debug)]
pub struct SyncHandle {
    sender: mpsc::UnboundedSender<ChainEvent>,
}

impl SyncHandle {
    pub fn on_block_connected(&self, block: Block, height: u32) -> Result<()> {
        self.sender
            .send(ChainEvent::BlockConnected {
                block: Box::new(block),
                height,
            })
            .ok()
            .context("Sync service is not running")
    }

    pub fn on_transaction_observed(&self, transaction: Transaction) -> Result<()> {
        self.sender
            .send(ChainEvent::TransactionObserved(Box::new(transaction)))
            .ok()
            .context("Sync service is not running")
    }
}

/// Applies chain notifications to the ledger one at a time, in the order
/// they were received.
///
/// A block that fails to apply is retried until it succeeds or the service
/// is cancelled. Later blocks wait behind it, so the persisted height never
/// passes a block that was not applied.
pub struct SyncService {
    ledger: Arc<Ledger>,
    db: Arc<dyn Database + Send + Sync>,
    receiver: mpsc::UnboundedReceiver<ChainEvent>,
}

impl SyncService {
    pub fn new(ledger: Arc<Ledger>, db: Arc<dyn Database + Send + Sync>) -> (Self, SyncHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();

        (
            Self {
                ledger,
                db,
                receiver,
            },
            SyncHandle { sender },
        )
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let result = match event {
                ChainEvent::BlockConnected { block, height } => {
                    self.connect_block(&block, height, &cancel).await
                }
                ChainEvent::TransactionObserved(transaction) => {
                    self.ledger.apply_transaction(&transaction, None).await
                }
            };

            if let Err(error) = result {
                tracing::error!("Failed to apply chain event: {:#}", error);
            }
        }

        tracing::debug!("Sync service stopped");
    }

    async fn connect_block(&self, block: &Block, height: u32, cancel: &CancellationToken) -> Result<()> {
        let mut backoff = ExponentialBackoff {
            initial_interval: RETRY_INTERVAL,
            current_interval: RETRY_INTERVAL,
            max_interval: MAX_RETRY_INTERVAL,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        loop {
            let error = match self.apply_block(block, height).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            let delay = backoff.next_backoff().unwrap_or(MAX_RETRY_INTERVAL);
            tracing::warn!(
                height,
                "Failed to apply block, retrying in {}ms: {:#}",
                delay.as_millis(),
                error
            );

            tokio::select! {
                _ = cancel.cancelled() => bail!("Stopped before block {} was applied", height),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn apply_block(&self, block: &Block, height: u32) -> Result<()> {
        if self.ledger.index().is_relevant(block) {
            tracing::debug!(height, hash = %block.block_hash(), "Applying relevant block");
            self.ledger.apply_block(Some(block), height).await?;
        } else {
            self.ledger.apply_block(None, height).await?;
        }

        let tip = self.ledger.tip().advance(height);
        self.db.set_last_block_height(tip).await?;

        Ok(())
    }
}
