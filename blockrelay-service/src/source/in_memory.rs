//! A programmable upstream network for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use super::{AuthToken, BlockSource, BoxedSource, Connector, SourceError, SourceResult};
use crate::id::ShardId;
use crate::locator::Locator;

#[derive(Debug, Default)]
struct NetworkState {
    objects: HashMap<(ShardId, u64), Bytes>,
    rejected_credentials: HashSet<String>,
    failing_imports: HashSet<ShardId>,
    failing_offsets: HashSet<u64>,
    stalled_offsets: HashSet<u64>,
    ignore_limits: bool,
    next_identity: u64,
    sessions_opened: usize,
    fetches: Vec<(ShardId, u64)>,
}

/// Shared state of all in-memory shards.
///
/// Clones share the same state, so a test keeps one handle to program failures and inspect
/// counters while connectors and sources use others.
#[derive(Clone, Debug, Default)]
pub(crate) struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap()
    }

    /// Stores an object and returns its locator.
    pub fn insert(&self, shard: ShardId, object_id: u64, contents: impl Into<Bytes>) -> Locator {
        self.lock()
            .objects
            .insert((shard, object_id), contents.into());

        Locator {
            shard,
            object_id,
            access_hash: object_id.wrapping_mul(31),
            reference: Bytes::new(),
        }
    }

    pub fn reject_credential(&self, credential: &str) {
        self.lock()
            .rejected_credentials
            .insert(credential.to_owned());
    }

    pub fn fail_imports(&self, shard: ShardId) {
        self.lock().failing_imports.insert(shard);
    }

    pub fn allow_imports(&self, shard: ShardId) {
        self.lock().failing_imports.remove(&shard);
    }

    pub fn fail_fetch_at(&self, offset: u64) {
        self.lock().failing_offsets.insert(offset);
    }

    pub fn stall_fetch_at(&self, offset: u64) {
        self.lock().stalled_offsets.insert(offset);
    }

    /// Makes fetches return everything from the offset to the end of the object.
    pub fn ignore_limits(&self) {
        self.lock().ignore_limits = true;
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Returns `(shard, offset)` of every fetch so far.
    pub fn fetches(&self) -> Vec<(ShardId, u64)> {
        self.lock().fetches.clone()
    }

    pub fn connector(&self, home_shard: ShardId) -> InMemoryConnector {
        InMemoryConnector {
            network: self.clone(),
            home_shard,
        }
    }
}

#[derive(Debug)]
pub(crate) struct InMemoryConnector {
    network: InMemoryNetwork,
    home_shard: ShardId,
}

#[async_trait::async_trait]
impl Connector for InMemoryConnector {
    fn home_shard(&self) -> ShardId {
        self.home_shard
    }

    async fn connect(&self, credential: &str) -> SourceResult<BoxedSource> {
        let mut state = self.network.lock();
        if state.rejected_credentials.contains(credential) {
            return Err(SourceError::CredentialRejected(self.home_shard));
        }

        state.next_identity += 1;
        Ok(Arc::new(InMemorySource {
            network: self.network.clone(),
            shard: self.home_shard,
            identity: state.next_identity,
            authorized: AtomicBool::new(true),
        }))
    }
}

#[derive(Debug)]
pub(crate) struct InMemorySource {
    network: InMemoryNetwork,
    shard: ShardId,
    identity: u64,
    authorized: AtomicBool,
}

#[async_trait::async_trait]
impl BlockSource for InMemorySource {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn shard(&self) -> ShardId {
        self.shard
    }

    async fn fetch_block(&self, locator: &Locator, offset: u64, limit: u32) -> SourceResult<Bytes> {
        if !self.authorized.load(Ordering::Acquire) {
            return Err(SourceError::Unauthorized(self.shard));
        }
        if locator.shard != self.shard {
            return Err(SourceError::Misrouted {
                object: locator.shard,
                connection: self.shard,
            });
        }

        let (contents, stalled, ignore_limit) = {
            let mut state = self.network.lock();
            state.fetches.push((self.shard, offset));

            if state.failing_offsets.contains(&offset) {
                return Err(SourceError::Io(std::io::Error::other("connection reset")));
            }

            let contents = state
                .objects
                .get(&(self.shard, locator.object_id))
                .cloned()
                .ok_or_else(|| SourceError::Io(std::io::ErrorKind::NotFound.into()))?;
            (
                contents,
                state.stalled_offsets.contains(&offset),
                state.ignore_limits,
            )
        };

        if stalled {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;

        let len = contents.len() as u64;
        let start = offset.min(len);
        let end = match ignore_limit {
            true => len,
            false => offset.saturating_add(u64::from(limit)).min(len),
        };
        Ok(contents.slice(start as usize..end as usize))
    }

    async fn export_authorization(&self, shard: ShardId) -> SourceResult<AuthToken> {
        Ok(AuthToken {
            id: self.identity,
            bytes: Bytes::copy_from_slice(&shard.0.to_le_bytes()),
        })
    }

    async fn import_authorization(&self, token: AuthToken) -> SourceResult<()> {
        tokio::task::yield_now().await;

        let failing = self.network.lock().failing_imports.contains(&self.shard);
        let target = token.bytes[..] == self.shard.0.to_le_bytes()[..];
        if failing || token.id != self.identity || !target {
            return Err(SourceError::InvalidToken(self.shard));
        }

        self.authorized.store(true, Ordering::Release);
        Ok(())
    }

    async fn open_session(&self, shard: ShardId) -> SourceResult<BoxedSource> {
        self.network.lock().sessions_opened += 1;
        tokio::task::yield_now().await;

        Ok(Arc::new(InMemorySource {
            network: self.network.clone(),
            shard,
            identity: self.identity,
            authorized: AtomicBool::new(false),
        }))
    }
}
