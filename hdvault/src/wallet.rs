use crate::bitcoin::{Amount, BuildRequest, BuiltTransaction, Transaction, TransactionBuilder};
use crate::broadcast::Broadcaster;
use crate::error::Error;
use crate::ledger::{DerivedAddress, Ledger, NewAccount};
use anyhow::{bail, Result};
use std::sync::Arc;
use uuid::Uuid;

pub struct SendRequest {
    pub build: BuildRequest,
    /// Hold the inputs under this id instead of broadcasting.
    pub reservation_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Reserved {
        built: BuiltTransaction,
        reservation_id: Uuid,
    },
    Broadcast(BuiltTransaction),
}

impl Sent {
    pub fn built(&self) -> &BuiltTransaction {
        match self {
            Sent::Reserved { built, .. } => built,
            Sent::Broadcast(built) => built,
        }
    }
}

/// The operations exposed to wallet users.
pub struct Wallet {
    ledger: Arc<Ledger>,
    builder: TransactionBuilder,
    broadcaster: Arc<dyn Broadcaster>,
}

impl Wallet {
    pub fn new(ledger: Arc<Ledger>, builder: TransactionBuilder, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            ledger,
            builder,
            broadcaster,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub async fn create_account(&self, passphrase: &str) -> Result<NewAccount> {
        self.ledger.create_account(passphrase).await
    }

    pub async fn new_address(&self, account: u32) -> Result<DerivedAddress> {
        self.ledger.new_address(account, false).await
    }

    pub async fn balance(&self, account: u32, min_confirmations: u32) -> Result<Amount> {
        self.ledger.balance(account, min_confirmations).await
    }

    pub async fn send(&self, request: &SendRequest, passphrase: &str) -> Result<Sent> {
        if let Some(reservation_id) = request.reservation_id {
            if self.ledger.is_reservation_in_use(reservation_id).await? {
                bail!(Error::ReservationConflict(reservation_id))
            }
        }

        let built = self.builder.build(&request.build, passphrase).await?;

        match request.reservation_id {
            Some(reservation_id) => {
                self.ledger.reserve(&built.transaction, reservation_id).await?;

                Ok(Sent::Reserved {
                    built,
                    reservation_id,
                })
            }
            None => {
                self.broadcast(&built.transaction).await?;

                Ok(Sent::Broadcast(built))
            }
        }
    }

    /// Broadcasts and records the spend so the inputs are not selected
    /// again while the transaction is unconfirmed.
    pub async fn broadcast(&self, transaction: &Transaction) -> Result<()> {
        self.broadcaster.broadcast_transaction(transaction).await?;
        self.ledger.apply_transaction(transaction, None).await?;

        Ok(())
    }

    pub async fn change_passphrase(&self, account: u32, current: &str, new: &str) -> Result<()> {
        self.ledger.change_passphrase(account, current, new).await
    }
}
