use bitcoin::Amount;
use uuid::Uuid;

/// Errors callers are expected to tell apart.
///
/// Every operation returns [`anyhow::Result`]; these variants are raised with
/// `bail!` and can be recovered with `err.downcast_ref::<Error>()`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("Not enough fees. The minimum fee is {minimum}, got {actual}")]
    FeeTooLow { minimum: Amount, actual: Amount },
    #[error("Reservation id is in use: {0}")]
    ReservationConflict(Uuid),
    #[error("No address found for {0}")]
    AddressNotFound(String),
    #[error("No account found for {0}")]
    AccountNotFound(u32),
    #[error("Wallet passphrase is incorrect")]
    AuthenticationFailure,
    #[error("Transaction was rejected by the node: {0}")]
    BroadcastRejected(String),
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("Not supported: {0}")]
    Unsupported(&'static str),
    #[error("Could not build the transaction. Details: {0}")]
    Verification(String),
}

impl Error {
    /// Walks the chain of an [`anyhow::Error`] looking for a domain error.
    pub fn find(err: &anyhow::Error) -> Option<&Error> {
        err.chain().find_map(|cause| cause.downcast_ref::<Error>())
    }
}
