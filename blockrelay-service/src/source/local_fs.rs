use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{AuthToken, BlockSource, BoxedSource, Connector, SourceError, SourceResult};
use crate::id::ShardId;
use crate::locator::Locator;

/// Creates [`LocalFs`] connections rooted at a directory.
///
/// Every non-empty credential is accepted as long as the root directory exists.
#[derive(Debug)]
pub struct LocalFsConnector {
    root: PathBuf,
    home_shard: ShardId,
}

impl LocalFsConnector {
    /// Creates a connector serving shards below `root`.
    pub fn new(root: &Path, home_shard: ShardId) -> Self {
        Self {
            root: root.to_path_buf(),
            home_shard,
        }
    }
}

#[async_trait::async_trait]
impl Connector for LocalFsConnector {
    fn home_shard(&self) -> ShardId {
        self.home_shard
    }

    async fn connect(&self, credential: &str) -> SourceResult<BoxedSource> {
        if credential.trim().is_empty() {
            return Err(SourceError::CredentialRejected(self.home_shard));
        }
        if !tokio::fs::metadata(&self.root).await?.is_dir() {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("{} is not a directory", self.root.display()),
            )));
        }

        let mut hasher = DefaultHasher::new();
        credential.hash(&mut hasher);

        Ok(Arc::new(LocalFs {
            root: self.root.clone(),
            shard: self.home_shard,
            identity: hasher.finish(),
            authorized: AtomicBool::new(true),
        }))
    }
}

/// A shard connection that reads objects from `<root>/shard-<id>/<object id>.bin`.
///
/// Sessions opened for other shards reject fetches until they import an authorization exported
/// by a connection of the same identity. Access hashes are not verified.
pub struct LocalFs {
    root: PathBuf,
    shard: ShardId,
    identity: u64,
    authorized: AtomicBool,
}

impl LocalFs {
    /// Returns the path at which `object_id` of `shard` is stored below `root`.
    pub fn object_path(root: &Path, shard: ShardId, object_id: u64) -> PathBuf {
        root.join(format!("shard-{shard}"))
            .join(format!("{object_id}.bin"))
    }

    fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LocalFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFs")
            .field("root", &self.root)
            .field("shard", &self.shard)
            .field("authorized", &self.is_authorized())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl BlockSource for LocalFs {
    fn name(&self) -> &'static str {
        "local-fs"
    }

    fn shard(&self) -> ShardId {
        self.shard
    }

    #[tracing::instrument(level = "trace", skip_all, fields(offset = offset))]
    async fn fetch_block(&self, locator: &Locator, offset: u64, limit: u32) -> SourceResult<Bytes> {
        if !self.is_authorized() {
            return Err(SourceError::Unauthorized(self.shard));
        }
        if locator.shard != self.shard {
            return Err(SourceError::Misrouted {
                object: locator.shard,
                connection: self.shard,
            });
        }

        let path = Self::object_path(&self.root, self.shard, locator.object_id);
        let mut file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        if offset >= len {
            return Ok(Bytes::new());
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::with_capacity(u64::from(limit).min(len - offset) as usize);
        let mut reader = file.take(u64::from(limit));
        reader.read_to_end(&mut buffer).await?;

        Ok(buffer.into())
    }

    async fn export_authorization(&self, shard: ShardId) -> SourceResult<AuthToken> {
        if !self.is_authorized() {
            return Err(SourceError::Unauthorized(self.shard));
        }

        let mut bytes = shard.0.to_le_bytes().to_vec();
        bytes.extend_from_slice(&rand::random::<[u8; 16]>());

        Ok(AuthToken {
            id: self.identity,
            bytes: bytes.into(),
        })
    }

    async fn import_authorization(&self, token: AuthToken) -> SourceResult<()> {
        let target = token
            .bytes
            .first_chunk::<4>()
            .map(|bytes| ShardId(u32::from_le_bytes(*bytes)));

        if token.id != self.identity || target != Some(self.shard) {
            return Err(SourceError::InvalidToken(self.shard));
        }

        self.authorized.store(true, Ordering::Release);
        Ok(())
    }

    async fn open_session(&self, shard: ShardId) -> SourceResult<BoxedSource> {
        Ok(Arc::new(LocalFs {
            root: self.root.clone(),
            shard,
            identity: self.identity,
            authorized: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(contents: &[u8]) -> (tempfile::TempDir, BoxedSource, Locator) {
        let tempdir = tempfile::tempdir().unwrap();
        let locator = Locator {
            shard: ShardId(2),
            object_id: 7,
            access_hash: 0,
            reference: Bytes::new(),
        };

        let path = LocalFs::object_path(tempdir.path(), locator.shard, locator.object_id);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, contents).await.unwrap();

        let connector = LocalFsConnector::new(tempdir.path(), ShardId(1));
        let primary = connector.connect("worker-token").await.unwrap();
        (tempdir, primary, locator)
    }

    #[tokio::test]
    async fn rejects_empty_credential() {
        let tempdir = tempfile::tempdir().unwrap();
        let connector = LocalFsConnector::new(tempdir.path(), ShardId(1));

        let result = connector.connect("  ").await;
        assert!(matches!(result, Err(SourceError::CredentialRejected(_))));
    }

    #[tokio::test]
    async fn rejects_missing_root() {
        let connector = LocalFsConnector::new(Path::new("/nonexistent/blockrelay"), ShardId(1));
        let result = connector.connect("worker-token").await;
        assert!(matches!(result, Err(SourceError::Io(_))));
    }

    #[tokio::test]
    async fn session_requires_authorization() {
        let (_tempdir, primary, locator) = setup(b"oh hai!").await;

        let session = primary.open_session(ShardId(2)).await.unwrap();
        let result = session.fetch_block(&locator, 0, 4096).await;
        assert!(matches!(result, Err(SourceError::Unauthorized(ShardId(2)))));

        let token = primary.export_authorization(ShardId(2)).await.unwrap();
        session.import_authorization(token).await.unwrap();

        let block = session.fetch_block(&locator, 0, 4096).await.unwrap();
        assert_eq!(block.as_ref(), b"oh hai!");
    }

    #[tokio::test]
    async fn rejects_token_for_other_shard() {
        let (_tempdir, primary, _locator) = setup(b"").await;

        let session = primary.open_session(ShardId(2)).await.unwrap();
        let token = primary.export_authorization(ShardId(3)).await.unwrap();

        let result = session.import_authorization(token).await;
        assert!(matches!(result, Err(SourceError::InvalidToken(ShardId(2)))));
    }

    #[tokio::test]
    async fn reads_limited_blocks() {
        let (_tempdir, primary, locator) = setup(b"0123456789").await;

        let session = primary.open_session(ShardId(2)).await.unwrap();
        let token = primary.export_authorization(ShardId(2)).await.unwrap();
        session.import_authorization(token).await.unwrap();

        let block = session.fetch_block(&locator, 4, 4).await.unwrap();
        assert_eq!(block.as_ref(), b"4567");

        let short = session.fetch_block(&locator, 8, 4).await.unwrap();
        assert_eq!(short.as_ref(), b"89");

        let past_end = session.fetch_block(&locator, 12, 4).await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn rejects_misrouted_fetch() {
        let (_tempdir, primary, locator) = setup(b"data").await;

        let result = primary.fetch_block(&locator, 0, 4).await;
        assert!(matches!(result, Err(SourceError::Misrouted { .. })));
    }
}
