//! Errors raised while relaying a byte range.

use thiserror::Error;

use crate::id::ShardId;
use crate::source::SourceError;

/// Errors that end a relay stream.
///
/// These surface after the response status has been sent, so the HTTP layer can only react by
/// terminating the body early.
#[derive(Debug, Error)]
pub enum Error {
    /// An upstream block fetch failed.
    #[error("failed to fetch block at offset {offset}")]
    Fetch {
        /// Upstream offset of the failed block.
        offset: u64,
        /// The underlying upstream error.
        #[source]
        cause: SourceError,
    },

    /// A session to a foreign shard could not be established.
    #[error("failed to establish session to shard {shard}")]
    Authorization {
        /// The shard the session was meant for.
        shard: ShardId,
        /// The underlying upstream error.
        #[source]
        cause: SourceError,
    },

    /// An upstream block fetch exceeded the configured timeout.
    #[error("block fetch at offset {offset} timed out")]
    Timeout {
        /// Upstream offset of the stalled block.
        offset: u64,
    },
}

/// Result type for relay operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
