//! The relay layer translates HTTP byte ranges into block fetches against a sharded,
//! session-authenticated upstream store.
//!
//! It is designed as a library crate to be used by the `server`. The main pieces are:
//!
//!  - [`range`]: maps a requested byte interval onto aligned upstream blocks.
//!  - [`pool`]: the set of upstream workers and the least-loaded dispatcher.
//!  - [`session`]: per-worker connections to shards the worker does not originate on.
//!  - [`relay`]: the pull-driven stream that fetches, trims and yields blocks.
//!  - [`registry`]: resolves public object references into [`Locator`]s.
//!
//! Upstream connections are abstracted by the [`BlockSource`](source::BlockSource) trait. The
//! crate ships a filesystem connector for development and an HTTP gateway connector.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod error;
pub mod id;
pub mod load;
pub mod locator;
pub mod pool;
pub mod range;
pub mod registry;
pub mod relay;
pub mod session;
pub mod source;
pub mod stream;

pub use error::{Error, Result};
pub use id::{ShardId, WorkerId};
pub use locator::Locator;
pub use stream::PayloadStream;
