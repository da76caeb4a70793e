use crate::bitcoin::KeyChain;
use crate::database::Database;
use ::bitcoin::{Block, OutPoint, Script, ScriptBuf};
use anyhow::{Context, Result};
use moka::sync::Cache;
use std::collections::HashMap;

/// In-memory lookup from output scripts to wallet addresses and from
/// outpoints to wallet outputs that have not been spent in a block.
///
/// Scripts are never removed. Outpoints are evicted once the spend is
/// confirmed.
pub struct AddressIndex {
    scripts: Cache<ScriptBuf, i64>,
    outputs: Cache<OutPoint, i64>,
}

impl AddressIndex {
    pub fn new() -> Self {
        Self {
            scripts: Cache::builder().build(),
            outputs: Cache::builder().build(),
        }
    }

    /// Rebuilds the index from the store. Scripts are re-derived from the
    /// account xpubs rather than parsed from the stored address strings.
    pub async fn load(db: &(dyn Database + Send + Sync), keys: &KeyChain) -> Result<Self> {
        let index = Self::new();

        let xpubs = db
            .all_accounts()
            .await?
            .into_iter()
            .map(|account| (account.index, account.xpub))
            .collect::<HashMap<_, _>>();

        for address in db.all_addresses().await? {
            let xpub = xpubs
                .get(&address.account)
                .with_context(|| format!("Address {} belongs to unknown account {}", address.id, address.account))?;
            let derived = keys.address(xpub, address.is_change, address.index)?;

            index.insert_address(derived.script_pubkey(), address.id);
        }

        for output in db.open_outputs().await? {
            index.insert_output(output.outpoint, output.id);
        }

        tracing::debug!(
            scripts = index.script_count(),
            outputs = index.output_count(),
            "Loaded address index"
        );

        Ok(index)
    }

    pub fn address_id(&self, script: &Script) -> Option<i64> {
        self.scripts.get(script)
    }

    pub fn insert_address(&self, script: ScriptBuf, address_id: i64) {
        self.scripts.insert(script, address_id);
    }

    pub fn output_id(&self, outpoint: &OutPoint) -> Option<i64> {
        self.outputs.get(outpoint)
    }

    pub fn insert_output(&self, outpoint: OutPoint, output_id: i64) {
        self.outputs.insert(outpoint, output_id);
    }

    pub fn evict_output(&self, outpoint: &OutPoint) {
        self.outputs.invalidate(outpoint);
    }

    /// Whether any transaction in the block pays to one of our scripts or
    /// spends one of our outputs.
    pub fn is_relevant(&self, block: &Block) -> bool {
        block.txdata.iter().any(|tx| {
            tx.output
                .iter()
                .any(|output| self.scripts.contains_key(output.script_pubkey.as_script()))
                || tx
                    .input
                    .iter()
                    .any(|input| self.outputs.contains_key(&input.previous_output))
        })
    }

    pub fn script_count(&self) -> u64 {
        self.scripts.run_pending_tasks();
        self.scripts.entry_count()
    }

    pub fn output_count(&self) -> u64 {
        self.outputs.run_pending_tasks();
        self.outputs.entry_count()
    }
}

impl Default for AddressIndex {
    fn default() -> Self {
        Self::new()
    }
}
