//! The streaming loop projecting committed blocks into the database.

pub mod router;

use crate::{
    abi::Abi,
    database::{Database, Projection},
    source::BlockSource,
    spec::Spec,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a consumer run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Constructed, not yet pulling blocks.
    Idle,
    Streaming,
    /// Shutdown was requested; the block in flight is being finished.
    Draining,
    Stopped,
}

/// Fatal consumer errors. The run can be restarted from the last checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read checkpoint")]
    Checkpoint(#[source] anyhow::Error),
    #[error("block source failed")]
    Source(#[source] anyhow::Error),
    #[error("block {height} delivered out of order, expected {expected} or later")]
    OutOfOrder { height: u64, expected: u64 },
    #[error("failed to commit block {height}")]
    Commit {
        height: u64,
        #[source]
        source: anyhow::Error,
    },
}

pub struct Consumer<D> {
    spec: Arc<Spec>,
    abi: Arc<Abi>,
    database: D,
    notifications: Option<broadcast::Sender<Arc<Projection>>>,
    state: watch::Sender<State>,
}

impl<D> Consumer<D>
where
    D: Database,
{
    pub fn new(spec: Arc<Spec>, abi: Arc<Abi>, database: D) -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            spec,
            abi,
            database,
            notifications: None,
            state,
        }
    }

    /// Publishes every committed projection on the channel. Sending never
    /// waits on receivers; slow receivers miss old projections.
    pub fn with_notifications(mut self, sender: broadcast::Sender<Arc<Projection>>) -> Self {
        self.notifications = Some(sender);
        self
    }

    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    #[cfg(test)]
    pub fn database(&mut self) -> &mut D {
        &mut self.database
    }

    #[cfg(test)]
    pub fn into_database(self) -> D {
        self.database
    }

    /// Projects blocks from the source until it ends, fails, or `shutdown` is
    /// cancelled.
    ///
    /// Streaming starts at the block after the checkpoint, or at `start` if
    /// that is later. A block whose commit has started is always finished
    /// before the run stops.
    pub async fn run(
        &mut self,
        source: &mut dyn BlockSource,
        start: u64,
        shutdown: &CancellationToken,
    ) -> Result<(), Error> {
        let result = self.stream(source, start, shutdown).await;
        match &result {
            Ok(()) => tracing::info!("consumer stopped"),
            Err(err) => tracing::error!(?err, "consumer failed"),
        }
        self.state.send_replace(State::Stopped);
        result
    }

    async fn stream(
        &mut self,
        source: &mut dyn BlockSource,
        start: u64,
        shutdown: &CancellationToken,
    ) -> Result<(), Error> {
        let checkpoint = self
            .database
            .checkpoint()
            .await
            .map_err(Error::Checkpoint)?;
        let mut next = match checkpoint {
            Some(checkpoint) => start.max(checkpoint.saturating_add(1)),
            None => start,
        };

        tracing::info!(?checkpoint, %next, "streaming blocks");
        self.state.send_replace(State::Streaming);
        let mut blocks = source.blocks(next);
        loop {
            let block = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.state.send_replace(State::Draining);
                    break;
                }
                block = blocks.next() => block,
            };
            let Some(block) = block else {
                tracing::info!("block source finished");
                break;
            };
            let block = block.map_err(Error::Source)?;
            if block.height < next {
                return Err(Error::OutOfOrder {
                    height: block.height,
                    expected: next,
                });
            }

            let height = block.height;
            let projection = router::project(&self.spec, &self.abi, &block);
            {
                // Shutdown requests are noted, but never interrupt a commit.
                let mut commit = self.database.commit(&projection);
                let result = tokio::select! {
                    biased;
                    result = &mut commit => result,
                    _ = shutdown.cancelled() => {
                        self.state.send_replace(State::Draining);
                        commit.await
                    }
                };
                result.map_err(|source| Error::Commit { height, source })?;
            }
            next = height + 1;
            tracing::debug!(
                block = %height,
                rows = projection.tables.iter().map(|table| table.rows.len()).sum::<usize>(),
                "committed block"
            );

            if let Some(notifications) = &self.notifications {
                // No receivers is not an error.
                let _ = notifications.send(Arc::new(projection));
            }
            if shutdown.is_cancelled() {
                self.state.send_replace(State::Draining);
                break;
            }
        }
        Ok(())
    }
}

impl<D> Consumer<D>
where
    D: Database + 'static,
{
    /// Runs the consumer on its own task.
    pub fn spawn<S>(mut self, mut source: S, start: u64) -> Handle<D>
    where
        S: BlockSource + 'static,
    {
        let shutdown = CancellationToken::new();
        let state = self.state();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let result = self.run(&mut source, start, &shutdown).await;
                (self.database, result)
            }
        });
        Handle {
            shutdown,
            state,
            task,
        }
    }
}

/// A consumer running on its own task.
pub struct Handle<D> {
    shutdown: CancellationToken,
    state: watch::Receiver<State>,
    task: JoinHandle<(D, Result<(), Error>)>,
}

impl<D> Handle<D> {
    /// Requests a graceful stop. Returns immediately; use [`Handle::join`] to
    /// wait for the consumer to finish draining.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    /// Waits for the consumer to stop and returns its database with the
    /// outcome of the run.
    pub async fn join(self) -> (D, Result<(), Error>) {
        match self.task.await {
            Ok(result) => result,
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::tests::EVENTS_TEST_ABI,
        database::{BlockRows, Cell, Sqlite},
        decoder::tests::update_test_events,
        source::{tests::Replay, Block},
        spec::tests::EVENTS_TEST_SPEC,
    };
    use anyhow::Result;
    use chrono::{DateTime, Utc};
    use futures::{
        future::{self, BoxFuture},
        stream::{self, BoxStream},
        FutureExt,
    };
    use std::{sync::Mutex, time::Duration};
    use tokio::sync::{mpsc, Notify};

    fn consumer<D: Database>(database: D) -> Consumer<D> {
        let abi = Abi::from_json(EVENTS_TEST_ABI).unwrap();
        let spec = Spec::from_toml(EVENTS_TEST_SPEC, &abi, false).unwrap();
        Consumer::new(Arc::new(spec), Arc::new(abi), database)
    }

    fn block(height: u64) -> Block {
        let name = format!("TestEvent{}", height - 1);
        Block {
            height,
            timestamp: 1_600_000_000 + height,
            logs: vec![update_test_events(
                &name,
                format!("Description of {name}").as_bytes(),
                height as _,
            )],
        }
    }

    fn blocks(heights: impl IntoIterator<Item = u64>) -> Vec<Block> {
        heights.into_iter().map(block).collect()
    }

    /// Yields the blocks and then waits forever.
    struct Endless(Vec<Block>);

    impl BlockSource for Endless {
        fn blocks(&mut self, from: u64) -> BoxStream<'_, Result<Block>> {
            let blocks = self
                .0
                .iter()
                .filter(|block| block.height >= from)
                .cloned()
                .map(Ok)
                .collect::<Vec<_>>();
            stream::iter(blocks).chain(stream::pending()).boxed()
        }
    }

    /// Records committed heights. Commits can be made to wait for a signal.
    #[derive(Default)]
    struct Memory {
        committed: Arc<Mutex<Vec<u64>>>,
        started: Option<mpsc::UnboundedSender<u64>>,
        release: Option<Arc<Notify>>,
        fail_at: Option<u64>,
    }

    impl Database for Memory {
        fn checkpoint(&mut self) -> BoxFuture<'_, Result<Option<u64>>> {
            let checkpoint = self.committed.lock().unwrap().iter().copied().max();
            future::ready(Ok(checkpoint)).boxed()
        }

        fn commit<'a>(&'a mut self, projection: &'a Projection) -> BoxFuture<'a, Result<()>> {
            async move {
                if let Some(started) = &self.started {
                    started.send(projection.height).unwrap();
                }
                if let Some(release) = &self.release {
                    release.notified().await;
                }
                anyhow::ensure!(self.fail_at != Some(projection.height), "disk full");
                self.committed.lock().unwrap().push(projection.height);
                Ok(())
            }
            .boxed()
        }

        fn block(&mut self, _: u64) -> BoxFuture<'_, Result<Option<BlockRows>>> {
            future::ready(Ok(None)).boxed()
        }

        fn restore<'a>(&'a mut self, _: DateTime<Utc>, _: &'a str) -> BoxFuture<'a, Result<()>> {
            future::ready(Ok(())).boxed()
        }
    }

    fn text(value: &str) -> Cell {
        Cell::Text(value.to_owned())
    }

    #[tokio::test]
    async fn events_test_scenario() {
        let handle = consumer(Sqlite::new_for_test()).spawn(Replay::new(blocks(2..=5)), 0);
        let (mut sqlite, result) = handle.join().await;
        result.unwrap();
        assert_eq!(sqlite.checkpoint().await.unwrap(), Some(5));

        let block = sqlite.block(2).await.unwrap().unwrap();
        assert_eq!(block.height, 2);
        assert_eq!(block.tables.len(), 1);
        let rows = &block.tables["eventtest"];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_eventtype"], text("LogEvent"));
        assert_eq!(rows[0]["_eventname"], text("UpdateTestEvents"));
        assert_eq!(rows[0]["testname"], text("TestEvent1"));
        assert_eq!(rows[0]["description"], text("Description of TestEvent1"));
        assert_eq!(rows[0]["count"], text("2"));

        let block = sqlite.block(5).await.unwrap().unwrap();
        let rows = &block.tables["eventtest"];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_height"], Cell::Int(5));
        assert_eq!(rows[0]["_eventtype"], text("LogEvent"));
        assert_eq!(rows[0]["_eventname"], text("UpdateTestEvents"));
        assert_eq!(rows[0]["testname"], text("TestEvent4"));

        let later = Utc::now() + chrono::Duration::days(3650);
        sqlite.restore(later, "RESTORED").await.unwrap();
        assert_eq!(sqlite.row_count("restored__eventtest"), 4);
        assert_eq!(sqlite.row_count("eventtest"), 4);
    }

    #[tokio::test]
    async fn malformed_string_is_committed_as_hex() {
        let mut block = block(2);
        block.logs = vec![update_test_events("TestEvent1", b"identificaci\xf3n", 1)];
        let mut consumer = consumer(Sqlite::new_for_test());
        consumer
            .run(&mut Replay::new(vec![block]), 0, &CancellationToken::new())
            .await
            .unwrap();

        let block = consumer.database().block(2).await.unwrap().unwrap();
        assert_eq!(
            block.tables["eventtest"][0]["description"],
            text("0x6964656e7469666963616369f36e")
        );
    }

    #[tokio::test]
    async fn resumes_after_checkpoint() {
        let mut consumer = consumer(Sqlite::new_for_test());
        let shutdown = CancellationToken::new();
        consumer
            .run(&mut Replay::new(blocks(2..=3)), 0, &shutdown)
            .await
            .unwrap();

        let mut source = Replay::new(blocks(2..=5));
        consumer.run(&mut source, 0, &shutdown).await.unwrap();
        assert_eq!(source.requests, [4]);
        assert_eq!(consumer.database().checkpoint().await.unwrap(), Some(5));
        assert_eq!(consumer.into_database().row_count("eventtest"), 4);
    }

    #[tokio::test]
    async fn start_after_checkpoint() {
        let mut consumer = consumer(Memory::default());
        let mut source = Replay::new(blocks(2..=9));
        consumer
            .run(&mut source, 7, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(source.requests, [7]);
        assert_eq!(*consumer.database().committed.lock().unwrap(), [7, 8, 9]);
    }

    #[tokio::test]
    async fn rejects_out_of_order_blocks() {
        let mut consumer = consumer(Sqlite::new_for_test());
        let result = consumer
            .run(
                &mut Replay::new(blocks([3, 2])),
                0,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::OutOfOrder {
                height: 2,
                expected: 4
            })
        ));
        assert_eq!(consumer.database().checkpoint().await.unwrap(), Some(3));
        assert_eq!(consumer.database().block(2).await.unwrap(), None);
        assert_eq!(*consumer.state().borrow(), State::Stopped);
    }

    #[tokio::test]
    async fn source_errors_are_fatal() {
        let mut source = Replay::new(blocks(2..=3));
        source.fail_at_end = true;
        let (mut sqlite, result) = consumer(Sqlite::new_for_test())
            .spawn(source, 0)
            .join()
            .await;
        assert!(matches!(result, Err(Error::Source(_))));
        assert_eq!(sqlite.checkpoint().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn commit_errors_are_fatal() {
        let database = Memory {
            fail_at: Some(3),
            ..Default::default()
        };
        let (database, result) = consumer(database)
            .spawn(Replay::new(blocks(2..=5)), 0)
            .join()
            .await;
        assert!(matches!(result, Err(Error::Commit { height: 3, .. })));
        assert_eq!(*database.committed.lock().unwrap(), [2]);
    }

    #[tokio::test]
    async fn notifies_committed_blocks() {
        let (sender, mut receiver) = broadcast::channel(16);
        let (_, result) = consumer(Sqlite::new_for_test())
            .with_notifications(sender)
            .spawn(Replay::new(blocks(2..=4)), 0)
            .join()
            .await;
        result.unwrap();

        for height in 2..=4 {
            let projection = receiver.recv().await.unwrap();
            assert_eq!(projection.height, height);
            assert_eq!(projection.tables[0].rows.len(), 1);
        }
    }

    #[tokio::test]
    async fn notifications_without_receivers() {
        let (sender, receiver) = broadcast::channel(1);
        drop(receiver);
        let (mut sqlite, result) = consumer(Sqlite::new_for_test())
            .with_notifications(sender)
            .spawn(Replay::new(blocks(2..=4)), 0)
            .join()
            .await;
        result.unwrap();
        assert_eq!(sqlite.checkpoint().await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn shutdown_while_waiting_for_blocks() {
        let (sender, mut receiver) = broadcast::channel(16);
        let handle = consumer(Sqlite::new_for_test())
            .with_notifications(sender)
            .spawn(Endless(blocks(2..=3)), 0);
        let mut state = handle.state();

        assert_eq!(receiver.recv().await.unwrap().height, 2);
        assert_eq!(receiver.recv().await.unwrap().height, 3);
        handle.shutdown();
        let (mut sqlite, result) = handle.join().await;
        result.unwrap();

        assert_eq!(*state.borrow_and_update(), State::Stopped);
        assert_eq!(sqlite.checkpoint().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn shutdown_drains_block_in_flight() {
        let (started, mut commits) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let database = Memory {
            started: Some(started),
            release: Some(release.clone()),
            ..Default::default()
        };
        let committed = database.committed.clone();
        let handle = consumer(database).spawn(Endless(blocks(2..=5)), 0);
        let mut state = handle.state();

        assert_eq!(commits.recv().await, Some(2));
        handle.shutdown();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == State::Draining),
        )
        .await
        .unwrap()
        .unwrap();
        release.notify_one();

        let (_, result) = handle.join().await;
        result.unwrap();
        assert_eq!(*committed.lock().unwrap(), [2]);
        assert!(commits.try_recv().is_err());
    }

    #[tokio::test]
    async fn state_transitions() {
        let consumer = consumer(Memory::default());
        let mut state = consumer.state();
        assert_eq!(*state.borrow_and_update(), State::Idle);

        let handle = consumer.spawn(Endless(blocks(2..=2)), 0);
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == State::Streaming),
        )
        .await
        .unwrap()
        .unwrap();

        handle.shutdown();
        handle.join().await.1.unwrap();
        assert_eq!(*state.borrow_and_update(), State::Stopped);
    }
}
