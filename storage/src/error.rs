// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The error taxonomy surfaced by the blob reader core.

use crate::region::Region;

/// Errors the blob reader core can return.
///
/// `CacheMiss`/`CacheCorrupt` are deliberately absent here: they are purely
/// internal to `Blob::read_at`'s per-chunk cache probe and are always
/// recovered locally by falling through to a fetch, never surfaced to a
/// caller.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// Operation attempted after `Blob::close()`.
    #[error("blob is closed")]
    BlobClosed,

    /// `Blob::refresh` re-resolved a fetcher reporting a different size.
    #[error("size mismatch on refresh: expected {expected}, got {got}")]
    SizeMismatch { expected: u64, got: u64 },

    /// `walk_chunks` was called on a region not aligned to the chunk grid.
    #[error("region [{0}, {1}] is not chunk-aligned", .0.b, .0.e)]
    MisalignedRegion(Region),

    /// The fetcher's HTTP call failed, including non-2xx statuses.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response could not be parsed: bad `Content-Range`, broken
    /// multipart framing, missing boundary, etc.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A part's body ended before delivering its declared range.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: u64, got: u64 },

    /// A fetch completed without covering every requested chunk.
    #[error("fetch completed without covering region [{0}, {1}]", .0.b, .0.e)]
    MissingRegion(Region),

    /// The underlying cache backend failed in a way that isn't a plain miss
    /// (disk full, permission denied, ...).
    #[error("cache backend error: {0}")]
    Cache(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
