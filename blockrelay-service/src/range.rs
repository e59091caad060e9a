//! Translation of HTTP byte ranges into aligned upstream block fetches.
//!
//! The upstream store only serves fixed-size blocks at offsets aligned to the block size. A
//! requested interval `[first, last]` is therefore widened to whole blocks and the surplus is
//! trimmed from the first and last block again while streaming:
//!
//! ```text
//!            aligned_start
//!            |<- leading ->|<------------ requested ------------>|
//! block:     [=============|===========][=========================|=====]
//!            0                          block_size                 ^ trailing_trim
//! ```
//!
//! Use [`RangeSpec::parse`] to read a `Range` header, [`RangeSpec::resolve`] to bind it to an
//! object size and [`RangePlan::new`] to derive the block plan.

use bytes::Bytes;
use thiserror::Error;

/// The default upstream block size (512 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 512 * 1024;

/// The smallest block size accepted by upstream shards.
pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;

/// Returns whether `block_size` can be used to plan block fetches.
pub fn is_valid_block_size(block_size: u32) -> bool {
    block_size >= MIN_BLOCK_SIZE && block_size.is_power_of_two()
}

/// A single byte range as sent by the client, not yet bound to an object size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=<first>-<last>`
    Bounded {
        /// First requested byte.
        first: u64,
        /// Last requested byte, inclusive.
        last: u64,
    },
    /// `bytes=<first>-`, reading to the end of the object.
    From(u64),
    /// `bytes=-<len>`, reading the final `len` bytes of the object.
    Suffix(u64),
}

/// The requested range does not overlap the object.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("range not satisfiable for object of {size} bytes")]
pub struct Unsatisfiable {
    /// The total object size.
    pub size: u64,
}

impl RangeSpec {
    /// Parses the value of a `Range` header.
    ///
    /// Returns `None` for anything that is not a single `bytes` range, including multiple ranges,
    /// other units and inverted bounds. Callers treat such requests as if no range was sent.
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }

        let (first, last) = spec.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());

        match (first.is_empty(), last.is_empty()) {
            (true, true) => None,
            (true, false) => last.parse().ok().map(RangeSpec::Suffix),
            (false, true) => first.parse().ok().map(RangeSpec::From),
            (false, false) => {
                let first = first.parse().ok()?;
                let last = last.parse().ok()?;
                (first <= last).then_some(RangeSpec::Bounded { first, last })
            }
        }
    }

    /// Binds the range to an object of `size` bytes.
    ///
    /// The last byte is clamped to the end of the object. Ranges starting at or beyond the end of
    /// the object, and empty suffixes, are not satisfiable.
    pub fn resolve(self, size: u64) -> Result<ByteRange, Unsatisfiable> {
        let end = size.checked_sub(1).ok_or(Unsatisfiable { size })?;

        let (first, last) = match self {
            RangeSpec::Bounded { first, last } => (first, last.min(end)),
            RangeSpec::From(first) => (first, end),
            RangeSpec::Suffix(0) => return Err(Unsatisfiable { size }),
            RangeSpec::Suffix(len) => (size.saturating_sub(len), end),
        };

        if first > end {
            return Err(Unsatisfiable { size });
        }

        Ok(ByteRange { first, last })
    }
}

/// An inclusive byte interval within an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte of the range.
    pub first: u64,
    /// Last byte of the range, inclusive.
    pub last: u64,
}

impl ByteRange {
    /// Returns the range spanning an entire object, or `None` for an empty object.
    pub fn full(size: u64) -> Option<Self> {
        let last = size.checked_sub(1)?;
        Some(Self { first: 0, last })
    }

    /// Returns the number of bytes in this range.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Formats the `Content-Range` header value for an object of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.first, self.last, size)
    }
}

/// The sequence of block fetches needed to serve one [`ByteRange`].
///
/// Fetching `block_count` consecutive blocks from `aligned_start`, dropping `leading_trim` bytes
/// from the first block and keeping `trailing_trim` bytes of the last block yields exactly the
/// requested range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangePlan {
    /// Size of each upstream block.
    pub block_size: u32,
    /// Offset of the first block, a multiple of `block_size`.
    pub aligned_start: u64,
    /// Bytes to drop from the front of the first block.
    pub leading_trim: usize,
    /// Bytes to keep from the front of the last block.
    pub trailing_trim: usize,
    /// Number of blocks to fetch.
    pub block_count: u64,
}

impl RangePlan {
    /// Computes the block plan for `range`.
    ///
    /// `block_size` must be non-zero, see [`is_valid_block_size`].
    pub fn new(range: ByteRange, block_size: u32) -> Self {
        let size = u64::from(block_size);
        let first_block = range.first / size;
        let last_block = range.last / size;
        let aligned_start = first_block * size;

        Self {
            block_size,
            aligned_start,
            leading_trim: (range.first - aligned_start) as usize,
            trailing_trim: (range.last % size) as usize + 1,
            block_count: last_block - first_block + 1,
        }
    }

    /// A plan that fetches nothing, used for empty objects.
    pub fn empty(block_size: u32) -> Self {
        Self {
            block_size,
            aligned_start: 0,
            leading_trim: 0,
            trailing_trim: 0,
            block_count: 0,
        }
    }

    /// Returns `true` if the plan fetches no blocks.
    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    /// Returns the upstream offset of the block at `index`.
    pub fn block_offset(&self, index: u64) -> u64 {
        self.aligned_start + index * u64::from(self.block_size)
    }

    /// Trims the block at `index` down to the bytes belonging to the requested range.
    ///
    /// Short blocks are trimmed as far as their length allows.
    pub fn trim(&self, index: u64, block: Bytes) -> Bytes {
        let len = block.len();
        let start = if index == 0 {
            self.leading_trim.min(len)
        } else {
            0
        };
        let end = if index + 1 == self.block_count {
            self.trailing_trim.min(len)
        } else {
            len
        };

        block.slice(start..end.max(start))
    }
}
