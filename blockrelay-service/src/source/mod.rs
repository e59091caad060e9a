//! Connections to upstream shards.
//!
//! A [`BlockSource`] is one authenticated connection to one shard. Workers own a primary source
//! for their home shard and open further sources through [`BlockSource::open_session`] when an
//! object lives elsewhere. Those sessions start out unauthorized; the
//! [`SessionCache`](crate::session::SessionCache) authorizes them by exporting a token from the
//! primary connection and importing it on the new one.
//!
//! Primary sources are created by a [`Connector`] from a worker credential. Use [`connector`] to
//! create the connector matching an [`UpstreamConfig`].

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::id::ShardId;
use crate::locator::Locator;

mod http;
#[cfg(test)]
pub(crate) mod in_memory;
mod local_fs;

pub use http::{HttpConnector, HttpSource};
pub use local_fs::{LocalFs, LocalFsConnector};

/// User agent string used for outgoing requests.
pub const USER_AGENT: &str = concat!("blockrelay/", env!("CARGO_PKG_VERSION"));

/// A shared, type-erased [`BlockSource`] instance.
pub type BoxedSource = Arc<dyn BlockSource>;

/// A type-erased [`Connector`] instance.
pub type BoxedConnector = Box<dyn Connector>;

/// An authorization exported by one shard connection for use on another shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthToken {
    /// The exporting identity.
    pub id: u64,
    /// Opaque authorization payload.
    pub bytes: Bytes,
}

/// One authenticated connection to an upstream shard.
///
/// Fetches are never retried by callers; implementations may retry internally if the upstream
/// protocol calls for it.
#[async_trait::async_trait]
pub trait BlockSource: Debug + Send + Sync + 'static {
    /// The connector name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// The shard this connection talks to.
    fn shard(&self) -> ShardId;

    /// Fetches up to `limit` bytes of the object at `offset`.
    ///
    /// Returns fewer bytes than requested at the end of the object and an empty buffer if
    /// `offset` lies beyond it.
    async fn fetch_block(&self, locator: &Locator, offset: u64, limit: u32) -> SourceResult<Bytes>;

    /// Exports this connection's authorization for use on `shard`.
    async fn export_authorization(&self, shard: ShardId) -> SourceResult<AuthToken>;

    /// Authorizes this connection with a token exported by another shard connection.
    async fn import_authorization(&self, token: AuthToken) -> SourceResult<()>;

    /// Opens a new, not yet authorized connection to `shard` with this connection's identity.
    async fn open_session(&self, shard: ShardId) -> SourceResult<BoxedSource>;
}

/// Creates primary shard connections from worker credentials.
#[async_trait::async_trait]
pub trait Connector: Debug + Send + Sync + 'static {
    /// The home shard of connections created by this connector.
    fn home_shard(&self) -> ShardId;

    /// Authenticates `credential` against the home shard.
    async fn connect(&self, credential: &str) -> SourceResult<BoxedSource>;
}

/// Configuration to initialize a [`Connector`].
#[derive(Debug, Clone)]
pub enum UpstreamConfig<'a> {
    /// Serve blocks from shard directories on the local filesystem.
    FileSystem {
        /// The directory containing one `shard-<id>` directory per shard.
        path: &'a Path,
        /// The shard worker credentials are native to.
        home_shard: ShardId,
    },
    /// Fetch blocks from an HTTP block gateway.
    Http {
        /// Base URL of the gateway.
        endpoint: &'a str,
        /// The shard worker credentials are native to.
        home_shard: ShardId,
    },
}

/// Creates the connector for the given upstream configuration.
pub fn connector(config: UpstreamConfig<'_>) -> SourceResult<BoxedConnector> {
    Ok(match config {
        UpstreamConfig::FileSystem { path, home_shard } => {
            Box::new(LocalFsConnector::new(path, home_shard))
        }
        UpstreamConfig::Http {
            endpoint,
            home_shard,
        } => Box::new(HttpConnector::new(endpoint, home_shard)?),
    })
}

/// Errors raised by upstream connections.
#[derive(Debug, Error)]
pub enum SourceError {
    /// IO errors related to reading blocks from local storage.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the reqwest client, either sending the request or returned by the gateway.
    #[error("reqwest error: {context}")]
    Reqwest {
        /// What the connection was doing.
        context: String,
        /// The underlying client error.
        #[source]
        cause: reqwest::Error,
    },

    /// Errors related to de/serialization of gateway payloads.
    #[error("serde error: {context}")]
    Serde {
        /// What the connection was doing.
        context: String,
        /// The underlying serde error.
        #[source]
        cause: serde_json::Error,
    },

    /// The credential was rejected by its home shard.
    #[error("credential rejected by shard {0}")]
    CredentialRejected(ShardId),

    /// The connection has not been authorized for its shard yet.
    #[error("connection to shard {0} is not authorized")]
    Unauthorized(ShardId),

    /// An authorization token was rejected during import.
    #[error("authorization rejected by shard {0}")]
    InvalidToken(ShardId),

    /// The object lives on a different shard than the connection.
    #[error("object on shard {object} requested from shard {connection}")]
    Misrouted {
        /// The shard holding the object.
        object: ShardId,
        /// The shard of the connection.
        connection: ShardId,
    },
}

/// Result type for upstream operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Creates a reqwest client with required defaults.
pub fn reqwest_client() -> SourceResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|cause| SourceError::Reqwest {
            context: "failed to build client".to_owned(),
            cause,
        })
}
