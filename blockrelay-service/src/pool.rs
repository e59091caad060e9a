//! The pool of upstream workers.
//!
//! Every worker is one provisioned credential with its own primary connection, shard sessions and
//! [`Relay`]. Requests are dispatched to the worker with the fewest active streams, as reported by
//! the pool's [`LoadTracker`].

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::join_all;

use crate::id::WorkerId;
use crate::load::LoadTracker;
use crate::relay::{Relay, RelayOptions};
use crate::session::SessionCache;
use crate::source::{BoxedSource, Connector};

/// One provisioned upstream identity.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    relay: Relay,
}

impl Worker {
    /// The worker's id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The relay streaming through this worker.
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// The worker's shard sessions.
    pub fn sessions(&self) -> &Arc<SessionCache> {
        self.relay.sessions()
    }
}

/// The set of workers and the least-loaded dispatcher.
#[derive(Debug)]
pub struct WorkerPool {
    workers: RwLock<BTreeMap<WorkerId, Arc<Worker>>>,
    loads: LoadTracker,
    options: RelayOptions,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new(options: RelayOptions) -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
            loads: LoadTracker::new(),
            options,
        }
    }

    /// Connects one worker per credential and returns the pool of all that succeeded.
    ///
    /// Credentials are authenticated concurrently. Worker ids follow the position of the
    /// credential, so they stay stable when some credentials fail. Failures are logged and the
    /// worker is left out.
    pub async fn provision<S>(
        connector: &dyn Connector,
        credentials: &[S],
        options: RelayOptions,
    ) -> Self
    where
        S: AsRef<str>,
    {
        let pool = Self::new(options);

        let connections = credentials.iter().enumerate().map(|(index, credential)| async move {
            let id = WorkerId(index as u32);
            (id, connector.connect(credential.as_ref()).await)
        });

        for (id, result) in join_all(connections).await {
            match result {
                Ok(primary) => pool.register(id, primary),
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        worker = %id,
                        "failed to provision worker"
                    );
                    merni::counter!("pool.provision_failed": 1);
                }
            }
        }

        tracing::info!(workers = pool.len(), "provisioned worker pool");
        pool
    }

    /// Adds a worker with an established primary connection.
    ///
    /// Registering an id again replaces the worker's connection and sessions but keeps its load.
    pub fn register(&self, id: WorkerId, primary: BoxedSource) {
        let sessions = Arc::new(SessionCache::new(id, primary));
        let relay = Relay::new(id, sessions, self.loads.clone(), self.options);

        // The worker must be reachable before the tracker can select it.
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(Worker { id, relay }));
        self.loads.register(id);
    }

    /// Returns the worker with the smallest load, or `None` if the pool is empty.
    pub fn select(&self) -> Option<Arc<Worker>> {
        let id = self.loads.select()?;
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Returns the number of workers.
    pub fn len(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no worker is available.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The load tracker shared by all workers.
    pub fn loads(&self) -> &LoadTracker {
        &self.loads
    }

    /// The options applied to every relay.
    pub fn options(&self) -> RelayOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ShardId;
    use crate::range::{ByteRange, MIN_BLOCK_SIZE, RangePlan};
    use crate::source::in_memory::InMemoryNetwork;
    use crate::stream::read_to_vec;

    fn options() -> RelayOptions {
        RelayOptions {
            block_size: MIN_BLOCK_SIZE,
            fetch_timeout: None,
        }
    }

    #[tokio::test]
    async fn provisioning_skips_rejected_credentials() {
        let network = InMemoryNetwork::new();
        network.reject_credential("revoked");
        let connector = network.connector(ShardId(1));

        let pool =
            WorkerPool::provision(&connector, &["first", "revoked", "third"], options()).await;

        assert_eq!(pool.len(), 2);
        let ids: Vec<WorkerId> = pool.loads().loads().into_keys().collect();
        assert_eq!(ids, vec![WorkerId(0), WorkerId(2)]);
    }

    #[tokio::test]
    async fn empty_pool_selects_nothing() {
        let network = InMemoryNetwork::new();
        let connector = network.connector(ShardId(1));

        let pool = WorkerPool::provision::<&str>(&connector, &[], options()).await;
        assert!(pool.is_empty());
        assert!(pool.select().is_none());
    }

    #[tokio::test]
    async fn selection_follows_load() {
        let network = InMemoryNetwork::new();
        let locator = network.insert(ShardId(1), 1, vec![7; 100]);
        let connector = network.connector(ShardId(1));
        let pool = WorkerPool::provision(&connector, &["a", "b"], options()).await;

        let first = pool.select().unwrap();
        assert_eq!(first.id(), WorkerId(0));

        let plan = RangePlan::new(ByteRange { first: 0, last: 99 }, MIN_BLOCK_SIZE);
        let stream = first.relay().stream(locator.clone(), plan);

        let second = pool.select().unwrap();
        assert_eq!(second.id(), WorkerId(1));

        assert_eq!(read_to_vec(stream).await.unwrap(), vec![7; 100]);
        assert_eq!(pool.select().unwrap().id(), WorkerId(0));
    }

    #[tokio::test]
    async fn registered_workers_are_selectable_immediately() {
        let network = InMemoryNetwork::new();
        let connector = network.connector(ShardId(1));
        let mut primaries = Vec::new();
        for _ in 0..200 {
            primaries.push(connector.connect("worker").await.unwrap());
        }

        let pool = WorkerPool::new(options());
        pool.register(WorkerId(0), primaries.pop().unwrap());
        // Keep the first worker busy so that every new worker wins the selection.
        let _busy = pool.loads().acquire(WorkerId(0));

        let registered = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for (id, primary) in (1..).zip(primaries) {
                    pool.register(WorkerId(id), primary);
                }
                registered.store(true, std::sync::atomic::Ordering::Release);
            });

            while !registered.load(std::sync::atomic::Ordering::Acquire) {
                assert!(pool.select().is_some());
            }
        });

        assert_eq!(pool.len(), 200);
    }

    #[tokio::test]
    async fn concurrent_requests_on_one_worker_share_sessions() {
        let network = InMemoryNetwork::new();
        let on_two = network.insert(ShardId(2), 1, vec![2; 10]);
        let on_three = network.insert(ShardId(3), 1, vec![3; 10]);
        let connector = network.connector(ShardId(1));
        let pool = WorkerPool::provision(&connector, &["only"], options()).await;

        let worker = pool.select().unwrap();
        let plan = RangePlan::new(ByteRange { first: 0, last: 9 }, MIN_BLOCK_SIZE);
        let (a, b) = tokio::join!(
            read_to_vec(worker.relay().stream(on_two.clone(), plan)),
            read_to_vec(worker.relay().stream(on_three, plan)),
        );
        assert_eq!(a.unwrap(), vec![2; 10]);
        assert_eq!(b.unwrap(), vec![3; 10]);
        assert_eq!(worker.sessions().len(), 2);

        read_to_vec(worker.relay().stream(on_two, plan))
            .await
            .unwrap();
        assert_eq!(worker.sessions().len(), 2);
        assert_eq!(network.sessions_opened(), 2);
        assert_eq!(pool.loads().load(worker.id()), Some(0));
    }
}
