//! Committed block delivery.

pub mod node;

use anyhow::Result;
use futures::stream::BoxStream;
use solabi::ethprim::{Address, Digest};

/// A committed block.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub height: u64,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    pub logs: Vec<RawLog>,
}

/// An undecoded event log attached to a block.
#[derive(Clone, Debug, Default)]
pub struct RawLog {
    pub address: Address,
    /// The first topic is the event signature, the rest are indexed fields.
    pub topics: Vec<Digest>,
    pub data: Vec<u8>,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl RawLog {
    pub fn signature(&self) -> Option<&Digest> {
        self.topics.first()
    }
}

/// An ordered, restartable sequence of committed blocks.
pub trait BlockSource: Send {
    /// Streams blocks in ascending height order starting at `from`. The
    /// stream ends only for bounded sources; errors are fatal to the consumer.
    fn blocks(&mut self, from: u64) -> BoxStream<'_, Result<Block>>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    /// A bounded source replaying a fixed list of blocks, optionally failing
    /// once it runs out.
    #[derive(Default)]
    pub struct Replay {
        pub blocks: Vec<Block>,
        pub fail_at_end: bool,
        /// Heights requested by each call to `blocks`.
        pub requests: Vec<u64>,
    }

    impl Replay {
        pub fn new(blocks: Vec<Block>) -> Self {
            Self {
                blocks,
                ..Default::default()
            }
        }
    }

    impl BlockSource for Replay {
        fn blocks(&mut self, from: u64) -> BoxStream<'_, Result<Block>> {
            self.requests.push(from);
            let blocks = self
                .blocks
                .iter()
                .filter(|block| block.height >= from)
                .cloned()
                .map(Ok)
                .collect::<Vec<_>>();
            let end = self
                .fail_at_end
                .then(|| Err(anyhow::anyhow!("node went away")));
            stream::iter(blocks).chain(stream::iter(end)).boxed()
        }
    }

    #[test]
    fn log_signature_is_first_topic() {
        let log = RawLog {
            topics: vec![Digest([1; 32]), Digest([2; 32])],
            ..Default::default()
        };
        assert_eq!(log.signature(), Some(&Digest([1; 32])));
        assert_eq!(RawLog::default().signature(), None);
    }
}
