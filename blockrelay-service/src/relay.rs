//! The pull-driven block relay.
//!
//! A [`Relay`] belongs to one worker. [`Relay::stream`] turns a [`RangePlan`] into a
//! [`PayloadStream`] that fetches one block per poll, trims it and hands it to the consumer before
//! fetching the next. At most one fetch is outstanding per stream and blocks are always emitted in
//! offset order.
//!
//! The worker's load is held from the moment the stream is created until it is dropped, whether
//! it ran to completion, failed on an upstream error or was abandoned by the consumer. Failed
//! fetches are never retried.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;

use crate::error::{Error, Result};
use crate::id::WorkerId;
use crate::load::LoadTracker;
use crate::locator::Locator;
use crate::range::{DEFAULT_BLOCK_SIZE, RangePlan};
use crate::session::SessionCache;
use crate::source::BoxedSource;
use crate::stream::PayloadStream;

/// Tunables shared by all relays of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayOptions {
    /// Size of upstream blocks. Must be a valid block size, see
    /// [`is_valid_block_size`](crate::range::is_valid_block_size).
    pub block_size: u32,
    /// Upper bound for a single block fetch. `None` waits indefinitely.
    pub fetch_timeout: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            fetch_timeout: None,
        }
    }
}

/// Streams byte ranges through one worker.
#[derive(Clone, Debug)]
pub struct Relay {
    worker: WorkerId,
    sessions: Arc<SessionCache>,
    loads: LoadTracker,
    fetch_timeout: Option<Duration>,
}

impl Relay {
    /// Creates a relay for `worker`, charging its streams to `loads`.
    pub fn new(
        worker: WorkerId,
        sessions: Arc<SessionCache>,
        loads: LoadTracker,
        options: RelayOptions,
    ) -> Self {
        Self {
            worker,
            sessions,
            loads,
            fetch_timeout: options.fetch_timeout,
        }
    }

    /// The worker this relay fetches through.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// The worker's shard sessions.
    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    /// Returns a stream yielding exactly the bytes covered by `plan`.
    ///
    /// Nothing is fetched until the stream is polled. The stream ends early without an error when
    /// the upstream returns an empty block or a block shorter than the plan's block size.
    pub fn stream(&self, locator: Locator, plan: RangePlan) -> PayloadStream {
        let guard = self.loads.acquire(self.worker);
        let sessions = Arc::clone(&self.sessions);
        let fetch_timeout = self.fetch_timeout;

        let stream = async_stream::try_stream! {
            let _guard = guard;

            if !plan.is_empty() {
                let source = sessions.get(locator.shard).await?;

                for index in 0..plan.block_count {
                    let offset = plan.block_offset(index);
                    let mut block = fetch(&source, &locator, offset, plan.block_size, fetch_timeout).await?;

                    if block.is_empty() {
                        tracing::debug!(offset, index, "upstream returned an empty block");
                        break;
                    }

                    // Anything past the requested limit belongs to the next block.
                    block.truncate(plan.block_size as usize);
                    let short = block.len() < plan.block_size as usize;
                    let segment = plan.trim(index, block);

                    merni::counter!("relay.blocks": 1, "source" => source.name());
                    merni::counter!("relay.bytes": segment.len() as u64, "source" => source.name());

                    yield segment;

                    if short {
                        tracing::debug!(offset, index, "upstream returned a short block");
                        break;
                    }
                }
            }
        };

        stream.boxed()
    }
}

async fn fetch(
    source: &BoxedSource,
    locator: &Locator,
    offset: u64,
    limit: u32,
    timeout: Option<Duration>,
) -> Result<Bytes> {
    let fetch = source.fetch_block(locator, offset, limit);
    let result = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fetch)
            .await
            .map_err(|_| Error::Timeout { offset })?,
        None => fetch.await,
    };

    result.map_err(|cause| Error::Fetch { offset, cause })
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;

    use super::*;
    use crate::id::ShardId;
    use crate::range::{ByteRange, MIN_BLOCK_SIZE};
    use crate::source::Connector;
    use crate::source::in_memory::InMemoryNetwork;
    use crate::stream::read_to_vec;

    const BLOCK: u32 = MIN_BLOCK_SIZE;

    fn contents(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn relay(network: &InMemoryNetwork, options: RelayOptions) -> (Relay, LoadTracker) {
        let primary = network
            .connector(ShardId(1))
            .connect("worker-token")
            .await
            .unwrap();

        let loads = LoadTracker::new();
        loads.register(WorkerId(0));
        let sessions = Arc::new(SessionCache::new(WorkerId(0), primary));
        let relay = Relay::new(WorkerId(0), sessions, loads.clone(), options);
        (relay, loads)
    }

    fn options() -> RelayOptions {
        RelayOptions {
            block_size: BLOCK,
            fetch_timeout: None,
        }
    }

    fn plan(first: u64, last: u64) -> RangePlan {
        RangePlan::new(ByteRange { first, last }, BLOCK)
    }

    #[tokio::test]
    async fn trims_single_block() {
        let network = InMemoryNetwork::new();
        let data = contents(3 * BLOCK as usize);
        let locator = network.insert(ShardId(1), 1, data.clone());
        let (relay, loads) = relay(&network, options()).await;

        let payload = read_to_vec(relay.stream(locator, plan(100, 199)))
            .await
            .unwrap();
        assert_eq!(payload, &data[100..200]);
        assert_eq!(network.fetches(), vec![(ShardId(1), 0)]);
        assert_eq!(loads.load(WorkerId(0)), Some(0));
    }

    #[tokio::test]
    async fn trims_first_and_last_of_many_blocks() {
        let network = InMemoryNetwork::new();
        let data = contents(4 * BLOCK as usize);
        let locator = network.insert(ShardId(1), 1, data.clone());
        let (relay, _loads) = relay(&network, options()).await;

        let (first, last) = (BLOCK as u64 - 10, 3 * BLOCK as u64 + 5);
        let segments: Vec<Bytes> = relay
            .stream(locator, plan(first, last))
            .try_collect()
            .await
            .unwrap();

        let lens: Vec<usize> = segments.iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![10, BLOCK as usize, BLOCK as usize, 6]);
        assert_eq!(segments.concat(), &data[first as usize..=last as usize]);
    }

    #[tokio::test]
    async fn stops_after_short_block() {
        let network = InMemoryNetwork::new();
        // The object is shorter than its declared size.
        let data = contents(BLOCK as usize + 100);
        let locator = network.insert(ShardId(1), 1, data.clone());
        let (relay, loads) = relay(&network, options()).await;

        let payload = read_to_vec(relay.stream(locator, plan(0, 3 * BLOCK as u64 - 1)))
            .await
            .unwrap();
        assert_eq!(payload, data);
        assert_eq!(network.fetches().len(), 2);
        assert_eq!(loads.load(WorkerId(0)), Some(0));
    }

    #[tokio::test]
    async fn oversized_blocks_are_cut_to_block_size() {
        let network = InMemoryNetwork::new();
        network.ignore_limits();
        let data = contents(4 * BLOCK as usize);
        let locator = network.insert(ShardId(1), 1, data.clone());
        let (relay, _loads) = relay(&network, options()).await;

        let (first, last) = (10, 3 * BLOCK as u64 + 5);
        let segments: Vec<Bytes> = relay
            .stream(locator, plan(first, last))
            .try_collect()
            .await
            .unwrap();

        let lens: Vec<usize> = segments.iter().map(Bytes::len).collect();
        assert_eq!(
            lens,
            vec![BLOCK as usize - 10, BLOCK as usize, BLOCK as usize, 6]
        );
        assert_eq!(segments.concat(), &data[first as usize..=last as usize]);
    }

    #[tokio::test]
    async fn empty_first_block_ends_stream() {
        let network = InMemoryNetwork::new();
        let locator = network.insert(ShardId(1), 1, Bytes::new());
        let (relay, loads) = relay(&network, options()).await;

        let payload = read_to_vec(relay.stream(locator, plan(0, 999)))
            .await
            .unwrap();
        assert!(payload.is_empty());
        assert_eq!(network.fetches().len(), 1);
        assert_eq!(loads.load(WorkerId(0)), Some(0));
    }

    #[tokio::test]
    async fn empty_plan_fetches_nothing() {
        let network = InMemoryNetwork::new();
        let locator = network.insert(ShardId(2), 1, Bytes::new());
        let (relay, loads) = relay(&network, options()).await;

        let payload = read_to_vec(relay.stream(locator, RangePlan::empty(BLOCK)))
            .await
            .unwrap();
        assert!(payload.is_empty());
        assert!(network.fetches().is_empty());
        assert_eq!(network.sessions_opened(), 0);
        assert_eq!(loads.load(WorkerId(0)), Some(0));
    }

    #[tokio::test]
    async fn fetch_error_ends_stream_and_releases_load() {
        let network = InMemoryNetwork::new();
        let data = contents(3 * BLOCK as usize);
        let locator = network.insert(ShardId(1), 1, data.clone());
        network.fail_fetch_at(BLOCK as u64);
        let (relay, loads) = relay(&network, options()).await;

        let mut stream = relay.stream(locator, plan(0, 3 * BLOCK as u64 - 1));
        assert_eq!(loads.load(WorkerId(0)), Some(1));

        let first = stream.try_next().await.unwrap().unwrap();
        assert_eq!(first.as_ref(), &data[..BLOCK as usize]);

        let error = stream.try_next().await.unwrap_err();
        assert!(matches!(error, Error::Fetch { offset, .. } if offset == BLOCK as u64));
        assert!(stream.try_next().await.unwrap().is_none());

        drop(stream);
        assert_eq!(loads.load(WorkerId(0)), Some(0));
    }

    #[tokio::test]
    async fn authorization_failure_ends_stream() {
        let network = InMemoryNetwork::new();
        let locator = network.insert(ShardId(2), 1, contents(100));
        network.fail_imports(ShardId(2));
        let (relay, loads) = relay(&network, options()).await;

        let result = read_to_vec(relay.stream(locator, plan(0, 99))).await;
        assert!(matches!(result, Err(Error::Authorization { .. })));
        assert!(relay.sessions().is_empty());
        assert_eq!(loads.load(WorkerId(0)), Some(0));
    }

    #[tokio::test]
    async fn reads_foreign_shard_through_session() {
        let network = InMemoryNetwork::new();
        let data = contents(2 * BLOCK as usize);
        let locator = network.insert(ShardId(5), 1, data.clone());
        let (relay, _loads) = relay(&network, options()).await;

        let payload = read_to_vec(relay.stream(locator.clone(), plan(0, 2 * BLOCK as u64 - 1)))
            .await
            .unwrap();
        assert_eq!(payload, data);

        read_to_vec(relay.stream(locator, plan(0, 9))).await.unwrap();
        assert_eq!(network.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn dropping_stream_midway_releases_load() {
        let network = InMemoryNetwork::new();
        let locator = network.insert(ShardId(1), 1, contents(4 * BLOCK as usize));
        let (relay, loads) = relay(&network, options()).await;

        let mut stream = relay.stream(locator, plan(0, 4 * BLOCK as u64 - 1));
        stream.try_next().await.unwrap().unwrap();
        assert_eq!(loads.load(WorkerId(0)), Some(1));

        drop(stream);
        assert_eq!(loads.load(WorkerId(0)), Some(0));
        assert_eq!(network.fetches().len(), 1);
    }

    #[tokio::test]
    async fn fetches_one_block_per_poll() {
        let network = InMemoryNetwork::new();
        let locator = network.insert(ShardId(1), 1, contents(4 * BLOCK as usize));
        let (relay, _loads) = relay(&network, options()).await;

        let mut stream = relay.stream(locator, plan(0, 4 * BLOCK as u64 - 1));
        assert!(network.fetches().is_empty());

        stream.try_next().await.unwrap();
        stream.try_next().await.unwrap();
        let offsets: Vec<u64> = network.fetches().into_iter().map(|(_, o)| o).collect();
        assert_eq!(offsets, vec![0, BLOCK as u64]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_fetch_times_out() {
        let network = InMemoryNetwork::new();
        let locator = network.insert(ShardId(1), 1, contents(2 * BLOCK as usize));
        network.stall_fetch_at(BLOCK as u64);
        let options = RelayOptions {
            block_size: BLOCK,
            fetch_timeout: Some(Duration::from_secs(5)),
        };
        let (relay, loads) = relay(&network, options).await;

        let result = read_to_vec(relay.stream(locator, plan(0, 2 * BLOCK as u64 - 1))).await;
        assert!(matches!(result, Err(Error::Timeout { offset }) if offset == BLOCK as u64));
        assert_eq!(loads.load(WorkerId(0)), Some(0));
    }

    #[tokio::test]
    async fn stalled_fetch_without_timeout_keeps_load() {
        let network = InMemoryNetwork::new();
        let locator = network.insert(ShardId(1), 1, contents(BLOCK as usize));
        network.stall_fetch_at(0);
        let (relay, loads) = relay(&network, options()).await;

        let mut stream = relay.stream(locator, plan(0, 99));
        assert!(futures::poll!(stream.next()).is_pending());
        assert_eq!(loads.load(WorkerId(0)), Some(1));

        drop(stream);
        assert_eq!(loads.load(WorkerId(0)), Some(0));
    }
}
