use crate::error::Error;
use ::bitcoin::{Transaction, Txid};
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastState {
    ToBroadcast,
    Propagated,
    CantBroadcast,
}

impl fmt::Display for BroadcastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastState::ToBroadcast => write!(f, "to broadcast"),
            BroadcastState::Propagated => write!(f, "propagated"),
            BroadcastState::CantBroadcast => write!(f, "can't broadcast"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEntry {
    pub transaction: Transaction,
    pub state: BroadcastState,
    pub error: Option<String>,
}

impl BroadcastEntry {
    pub fn txid(&self) -> Txid {
        self.transaction.compute_txid()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Accepted,
    Rejected(String),
}

/// The node we validate and relay transactions through.
#[async_trait]
pub trait Node: Send + Sync {
    async fn tip_height(&self) -> Result<u32>;
    async fn accept_to_mempool(&self, transaction: &Transaction) -> Result<Acceptance>;
    fn connected_peers(&self) -> Vec<Arc<dyn Peer>>;
}

#[async_trait]
pub trait Peer: Send + Sync {
    fn id(&self) -> String;
    async fn announce(&self, transaction: &Transaction) -> Result<()>;
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Submits the transaction once. Fails with
    /// [`Error::BroadcastRejected`] if the node refuses it.
    async fn broadcast_transaction(&self, transaction: &Transaction) -> Result<()>;
    async fn get_transaction(&self, txid: Txid) -> Option<BroadcastEntry>;
    fn subscribe(&self) -> broadcast::Receiver<BroadcastEntry>;
}

/// Remembers what happened to every transaction we tried to broadcast.
///
/// Subscribers are told about an entry when it is first added and whenever
/// its state changes.
pub struct BroadcastTracker {
    entries: Mutex<HashMap<Txid, BroadcastEntry>>,
    changes: broadcast::Sender<BroadcastEntry>,
}

impl BroadcastTracker {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);

        Self {
            entries: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Returns whether anything changed.
    pub async fn add_or_update(
        &self,
        transaction: &Transaction,
        state: BroadcastState,
        error: Option<String>,
    ) -> bool {
        let txid = transaction.compute_txid();
        let mut entries = self.entries.lock().await;

        let entry = match entries.get_mut(&txid) {
            Some(entry) if entry.state == state => return false,
            Some(entry) => {
                entry.state = state;
                entry.error = error;
                entry.clone()
            }
            None => {
                let entry = BroadcastEntry {
                    transaction: transaction.clone(),
                    state,
                    error,
                };
                entries.insert(txid, entry.clone());
                entry
            }
        };
        drop(entries);

        tracing::debug!(%txid, %state, "Broadcast state changed");
        // no receivers is fine
        let _ = self.changes.send(entry);

        true
    }

    pub async fn get(&self, txid: Txid) -> Option<BroadcastEntry> {
        self.entries.lock().await.get(&txid).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEntry> {
        self.changes.subscribe()
    }
}

impl Default for BroadcastTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcasts through a [`Node`] and fans accepted transactions out to its
/// peers.
pub struct NodeBroadcaster {
    node: Arc<dyn Node>,
    tracker: BroadcastTracker,
}

impl NodeBroadcaster {
    pub fn new(node: Arc<dyn Node>) -> Self {
        Self {
            node,
            tracker: BroadcastTracker::new(),
        }
    }

    async fn propagate_to_peers(&self, transaction: &Transaction) {
        let txid = transaction.compute_txid();
        let peers = self.node.connected_peers();

        let results = join_all(peers.iter().map(|peer| async move {
            (peer.id(), peer.announce(transaction).await)
        }))
        .await;

        for (peer, result) in results {
            if let Err(error) = result {
                tracing::debug!(%txid, %peer, "Failed to announce transaction: {:#}", error);
            }
        }
    }
}

#[async_trait]
impl Broadcaster for NodeBroadcaster {
    async fn broadcast_transaction(&self, transaction: &Transaction) -> Result<()> {
        let txid = transaction.compute_txid();

        if let Some(entry) = self.tracker.get(txid).await {
            if entry.state == BroadcastState::Propagated {
                tracing::debug!(%txid, "Transaction already propagated");
                return Ok(());
            }
        }

        self.tracker
            .add_or_update(transaction, BroadcastState::ToBroadcast, None)
            .await;

        let acceptance = match self.node.accept_to_mempool(transaction).await {
            Ok(acceptance) => acceptance,
            Err(error) => {
                self.tracker
                    .add_or_update(transaction, BroadcastState::CantBroadcast, Some(format!("{:#}", error)))
                    .await;
                return Err(error.context(format!("Failed to submit transaction {}", txid)));
            }
        };

        match acceptance {
            Acceptance::Accepted => {
                self.propagate_to_peers(transaction).await;
                self.tracker
                    .add_or_update(transaction, BroadcastState::Propagated, None)
                    .await;
                tracing::info!(%txid, "Broadcast transaction");

                Ok(())
            }
            Acceptance::Rejected(reason) => {
                self.tracker
                    .add_or_update(transaction, BroadcastState::CantBroadcast, Some(reason.clone()))
                    .await;
                tracing::warn!(%txid, %reason, "Node rejected transaction");

                bail!(Error::BroadcastRejected(reason))
            }
        }
    }

    async fn get_transaction(&self, txid: Txid) -> Option<BroadcastEntry> {
        self.tracker.get(txid).await
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastEntry> {
        self.tracker.subscribe()
    }
}
