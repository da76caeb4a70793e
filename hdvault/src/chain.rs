mod esplora;
mod sync;

pub use esplora::Esplora;
pub use sync::{SyncHandle, SyncService};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Height of the best block we have processed. Shared between the sync
/// service, the ledger and the webhook scheduler; it never moves backwards.
#[derive(Clone, Debug, Default)]
pub struct Tip(Arc<AtomicU32>);

impl Tip {
    pub fn new(height: u32) -> Self {
        Self(Arc::new(AtomicU32::new(height)))
    }

    pub fn height(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the height after the update.
    pub fn advance(&self, height: u32) -> u32 {
        self.0.fetch_max(height, Ordering::AcqRel).max(height)
    }
}
