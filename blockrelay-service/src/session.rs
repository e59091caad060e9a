//! Per-worker connections to foreign shards.
//!
//! A worker credential is native to exactly one shard. To read objects stored elsewhere, the
//! worker opens a session to the foreign shard and authorizes it with a token exported from its
//! primary connection. [`SessionCache`] performs this exchange once per shard and hands out the
//! authorized session afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::id::{ShardId, WorkerId};
use crate::source::{BoxedSource, SourceResult};

type SessionCell = Arc<OnceCell<BoxedSource>>;

/// Shard connections of a single worker.
///
/// Each worker owns its own cache, so a failing shard exchange on one worker never affects the
/// sessions of another.
#[derive(Debug)]
pub struct SessionCache {
    worker: WorkerId,
    primary: BoxedSource,
    sessions: Mutex<HashMap<ShardId, SessionCell>>,
}

impl SessionCache {
    /// Creates a cache around the worker's primary connection.
    pub fn new(worker: WorkerId, primary: BoxedSource) -> Self {
        Self {
            worker,
            primary,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The shard the worker's credential is native to.
    pub fn home_shard(&self) -> ShardId {
        self.primary.shard()
    }

    /// The worker's primary connection.
    pub fn primary(&self) -> &BoxedSource {
        &self.primary
    }

    /// Returns an authorized connection to `shard`.
    ///
    /// The home shard is served by the primary connection. Other shards get a session that is
    /// created on first use and shared by all later callers. Concurrent callers for the same shard
    /// wait for a single exchange. A failed exchange is not cached, the next call tries again.
    pub async fn get(&self, shard: ShardId) -> Result<BoxedSource> {
        if shard == self.home_shard() {
            return Ok(Arc::clone(&self.primary));
        }

        let cell = self.cell(shard);
        let session = cell
            .get_or_try_init(|| self.establish(shard))
            .await
            .map_err(|cause| Error::Authorization { shard, cause })?;

        Ok(Arc::clone(session))
    }

    /// Returns the number of established sessions, not counting the primary connection.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Returns `true` if no session has been established yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, shard: ShardId) -> SessionCell {
        Arc::clone(self.lock().entry(shard).or_default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ShardId, SessionCell>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(worker = %self.worker))]
    async fn establish(&self, shard: ShardId) -> SourceResult<BoxedSource> {
        let session = self.primary.open_session(shard).await?;
        let token = self.primary.export_authorization(shard).await?;
        session.import_authorization(token).await?;

        tracing::debug!("established session");
        merni::counter!("session.established": 1);

        Ok(session)
    }
}
