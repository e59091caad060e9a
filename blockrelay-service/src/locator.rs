//! Decodable references to objects in the upstream store.
//!
//! The registry stores objects by an opaque identifier string. That string is the URL-safe base64
//! encoding of a packed little-endian record:
//!
//! ```text
//! magic (2) | version (u16) | shard (u32) | object id (u64) | access hash (u64) | ref len (u16) | ref
//! ```
//!
//! A [`Locator`] is reconstructed from that identifier on every request and never outlives it.

use std::fmt;
use std::mem;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use pack1::{U16LE, U32LE, U64LE};
use thiserror::Error;
use watto::Pod;

use crate::id::ShardId;

const LOCATOR_MAGIC: [u8; 2] = *b"\xf5L";
const LOCATOR_VERSION: u16 = 1;

#[derive(Debug)]
#[repr(C)]
struct LocatorHeader {
    magic: [u8; 2],
    version: U16LE,
    shard: U32LE,
    object_id: U64LE,
    access_hash: U64LE,
    reference_len: U16LE,
}
unsafe impl Pod for LocatorHeader {}

/// Errors returned when decoding a stored object identifier.
#[derive(Debug, Error)]
pub enum LocatorError {
    /// The identifier is not valid URL-safe base64.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded record is shorter than its header or declared reference.
    #[error("truncated locator")]
    Truncated,

    /// The decoded record has bytes beyond its declared reference.
    #[error("trailing data after locator")]
    TrailingData,

    /// The record does not start with the locator magic.
    #[error("invalid locator magic")]
    Magic,

    /// The record uses an unsupported layout version.
    #[error("unsupported locator version {0}")]
    Version(u16),

    /// The reference blob does not fit into the length field.
    #[error("reference of {0} bytes is too large")]
    ReferenceTooLarge(usize),
}

/// A decoded reference to an object stored on an upstream shard.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    /// The shard holding the object.
    pub shard: ShardId,
    /// The shard-local object id.
    pub object_id: u64,
    /// Access credential bound to the object.
    pub access_hash: u64,
    /// Optional reference blob required by some shards to authorize retrieval.
    pub reference: Bytes,
}

impl Locator {
    /// Decodes a locator from its stored identifier.
    pub fn decode(encoded: &str) -> Result<Self, LocatorError> {
        let raw = URL_SAFE_NO_PAD.decode(encoded.trim())?;

        let (header, rest) = raw
            .split_at_checked(mem::size_of::<LocatorHeader>())
            .ok_or(LocatorError::Truncated)?;
        let header = LocatorHeader::ref_from_bytes(header).ok_or(LocatorError::Truncated)?;

        if header.magic != LOCATOR_MAGIC {
            return Err(LocatorError::Magic);
        }
        if header.version.get() != LOCATOR_VERSION {
            return Err(LocatorError::Version(header.version.get()));
        }

        let reference_len = header.reference_len.get() as usize;
        if rest.len() < reference_len {
            return Err(LocatorError::Truncated);
        }
        if rest.len() > reference_len {
            return Err(LocatorError::TrailingData);
        }

        Ok(Self {
            shard: ShardId(header.shard.get()),
            object_id: header.object_id.get(),
            access_hash: header.access_hash.get(),
            reference: Bytes::copy_from_slice(rest),
        })
    }

    /// Encodes this locator into its stored identifier.
    pub fn encode(&self) -> Result<String, LocatorError> {
        let reference_len = u16::try_from(self.reference.len())
            .map_err(|_| LocatorError::ReferenceTooLarge(self.reference.len()))?;

        let header = LocatorHeader {
            magic: LOCATOR_MAGIC,
            version: LOCATOR_VERSION.into(),
            shard: self.shard.0.into(),
            object_id: self.object_id.into(),
            access_hash: self.access_hash.into(),
            reference_len: reference_len.into(),
        };

        let mut buffer = header.as_bytes().to_owned();
        buffer.extend_from_slice(&self.reference);
        Ok(URL_SAFE_NO_PAD.encode(buffer))
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

// The access hash and reference are credentials and stay out of logs.
impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locator")
            .field("shard", &self.shard)
            .field("object_id", &self.object_id)
            .finish_non_exhaustive()
    }
}
