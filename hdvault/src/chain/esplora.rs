use super::SyncHandle;
use crate::broadcast::{Acceptance, Node, Peer};
use ::bitcoin::consensus::{deserialize, encode::serialize_hex};
use ::bitcoin::{Block, BlockHash, Transaction};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::StatusCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An Esplora HTTP API, used as the source of blocks and as the node we
/// submit transactions to.
#[derive(Clone, Debug)]
pub struct Esplora {
    client: reqwest::Client,
    base: Url,
}

impl Esplora {
    pub fn new(mut base: Url) -> Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid esplora path {}", path))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.endpoint(path)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if !response.status().is_success() {
            bail!("GET {} returned {}", url, response.status())
        }

        Ok(response)
    }

    pub async fn block_hash(&self, height: u32) -> Result<BlockHash> {
        let body = self.get(&format!("block-height/{}", height)).await?.text().await?;

        BlockHash::from_str(body.trim()).with_context(|| format!("Invalid block hash {}", body))
    }

    pub async fn block(&self, hash: BlockHash) -> Result<Block> {
        let bytes = self.get(&format!("block/{}/raw", hash)).await?.bytes().await?;

        deserialize(&bytes).with_context(|| format!("Failed to decode block {}", hash))
    }

    /// Feeds every block connected after `last_processed` to the sync
    /// service, polling every `interval`. Without a previous height the
    /// current tip is the first block processed.
    pub async fn watch(
        &self,
        sync: SyncHandle,
        last_processed: Option<u32>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut next = last_processed.map(|height| height + 1);
        let mut backoff = ExponentialBackoff {
            initial_interval: interval,
            current_interval: interval,
            max_interval: interval * 12,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        loop {
            let delay = match self.catch_up(&sync, &mut next).await {
                Ok(()) => {
                    backoff.reset();
                    interval
                }
                Err(error) => {
                    let delay = backoff.next_backoff().unwrap_or(interval);
                    tracing::warn!(
                        "Failed to fetch blocks from esplora, retrying in {}s: {:#}",
                        delay.as_secs(),
                        error
                    );
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("Stopped watching esplora");
    }

    async fn catch_up(&self, sync: &SyncHandle, next: &mut Option<u32>) -> Result<()> {
        let tip = self.tip_height().await?;
        let mut height = next.unwrap_or(tip);

        while height <= tip {
            let hash = self.block_hash(height).await?;
            let block = self.block(hash).await?;

            tracing::trace!(height, %hash, "Fetched block");
            sync.on_block_connected(block, height)?;

            height += 1;
            *next = Some(height);
        }

        Ok(())
    }
}

#[async_trait]
impl Node for Esplora {
    async fn tip_height(&self) -> Result<u32> {
        let body = self.get("blocks/tip/height").await?.text().await?;

        body.trim()
            .parse()
            .with_context(|| format!("Invalid tip height {}", body))
    }

    async fn accept_to_mempool(&self, transaction: &Transaction) -> Result<Acceptance> {
        let url = self.endpoint("tx")?;
        let response = self
            .client
            .post(url.clone())
            .body(serialize_hex(transaction))
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        match status {
            status if status.is_success() => Ok(Acceptance::Accepted),
            StatusCode::BAD_REQUEST => Ok(Acceptance::Rejected(body)),
            status => bail!("POST {} returned {}: {}", url, status, body),
        }
    }

    fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::bitcoin::consensus::serialize;
    use ::bitcoin::blockdata::constants::genesis_block;
    use ::bitcoin::Network;

    async fn esplora(server: &mockito::Server) -> Esplora {
        let url = Url::parse(&format!("{}/api", server.url())).unwrap();
        Esplora::new(url).unwrap()
    }

    #[tokio::test]
    async fn reads_tip_height() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/blocks/tip/height")
            .with_body("812345\n")
            .create_async()
            .await;

        let height = esplora(&server).await.tip_height().await.unwrap();

        assert_eq!(height, 812_345);
    }

    #[tokio::test]
    async fn fetches_block_by_height() {
        let genesis = genesis_block(Network::Regtest);
        let hash = genesis.block_hash();

        let mut server = mockito::Server::new_async().await;
        let _height = server
            .mock("GET", "/api/block-height/0")
            .with_body(hash.to_string())
            .create_async()
            .await;
        let _raw = server
            .mock("GET", format!("/api/block/{}/raw", hash).as_str())
            .with_body(serialize(&genesis))
            .create_async()
            .await;

        let esplora = esplora(&server).await;
        let block = esplora.block(esplora.block_hash(0).await.unwrap()).await.unwrap();

        assert_eq!(block, genesis);
    }

    #[tokio::test]
    async fn bad_request_is_a_rejection() {
        let transaction = genesis_block(Network::Regtest).txdata.remove(0);

        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/tx")
            .match_body(serialize_hex(&transaction).as_str())
            .with_status(400)
            .with_body("sendrawtransaction RPC error: bad-txns-inputs-missingorspent")
            .create_async()
            .await;

        let acceptance = esplora(&server)
            .await
            .accept_to_mempool(&transaction)
            .await
            .unwrap();

        assert_eq!(
            acceptance,
            Acceptance::Rejected("sendrawtransaction RPC error: bad-txns-inputs-missingorspent".to_owned())
        );
    }

    #[tokio::test]
    async fn server_error_is_not_a_rejection() {
        let transaction = genesis_block(Network::Regtest).txdata.remove(0);

        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/tx")
            .with_status(503)
            .create_async()
            .await;

        let result = esplora(&server).await.accept_to_mempool(&transaction).await;

        assert!(result.is_err());
    }
}
