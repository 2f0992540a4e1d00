//! Block source following the finalized chain of a node over JSON-RPC.

use super::{Block, BlockSource, RawLog};
use anyhow::{Context, Result};
use ethrpc::{
    eth,
    types::{ArrayVec, BlockTag, Hydrated, LogBlocks, LogFilter, LogFilterValue},
};
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use solabi::ethprim::U256;
use std::time::Duration;
use tokio::time;

pub struct Node {
    eth: ethrpc::http::Client,
    /// How long to wait before checking for a new finalized block once caught
    /// up.
    poll_interval: Duration,
}

impl Node {
    pub fn new(eth: ethrpc::http::Client, poll_interval: Duration) -> Self {
        Self { eth, poll_interval }
    }

    async fn finalized(&self) -> Result<u64> {
        let block = self
            .eth
            .execute(
                eth::GetBlockByNumber,
                (BlockTag::Finalized.into(), Hydrated::No),
            )
            .await?
            .context("missing finalized block")?;
        Ok(block.number.as_u64())
    }

    async fn block(&self, height: u64) -> Result<Block> {
        let block = self
            .eth
            .execute(
                eth::GetBlockByNumber,
                (U256::from(height).into(), Hydrated::No),
            )
            .await?
            .with_context(|| format!("missing block {height}"))?;

        // Logs are fetched by hash so they are guaranteed to belong to the
        // block that was just read.
        let logs = self
            .eth
            .execute(
                eth::GetLogs,
                (LogFilter {
                    address: LogFilterValue::Any,
                    topics: ArrayVec::new(),
                    blocks: LogBlocks::Hash(block.hash),
                },),
            )
            .await?;
        let mut logs = logs
            .into_iter()
            .map(|log| RawLog {
                address: log.address,
                topics: log.topics.to_vec(),
                data: log.data,
                transaction_index: log.transaction_index.as_u64(),
                log_index: log.log_index.as_u64(),
            })
            .collect::<Vec<_>>();
        logs.sort_by_key(|log| (log.transaction_index, log.log_index));

        tracing::debug!(block = %height, hash = %block.hash, logs = logs.len(), "fetched block");
        Ok(Block {
            height,
            timestamp: block.timestamp.as_u64(),
            logs,
        })
    }
}

impl BlockSource for Node {
    fn blocks(&mut self, from: u64) -> BoxStream<'_, Result<Block>> {
        let node = &*self;
        stream::try_unfold((from, None), move |(next, mut finalized)| async move {
            while finalized.map_or(true, |finalized| next > finalized) {
                let latest = node.finalized().await?;
                if next > latest {
                    tracing::trace!(%next, finalized = %latest, "waiting for finalized block");
                    time::sleep(node.poll_interval).await;
                }
                finalized = Some(latest);
            }

            let block = node.block(next).await?;
            Ok::<_, anyhow::Error>(Some((block, (next + 1, finalized))))
        })
        .boxed()
    }
}
