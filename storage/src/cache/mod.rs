// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The byte-addressable cache contract consumed (not defined) by the blob
//! reader, plus two reference implementations used to run and test it:
//! [`file_cache`] (disk-backed) and [`mem_cache`] (in-memory, for tests and
//! the demo binary).
//!
//! The blob reader never assumes persistence beyond what a `Cache` impl
//! promises: any `Get` error, including a short read, is treated as a plain
//! cache miss and recovered by re-fetching.

pub mod file_cache;
pub mod mem_cache;

use std::io::Result;

/// A positioned byte-reader over previously committed cache content.
pub trait CacheReader: Send {
    /// Deliver exactly `dst.len()` bytes starting at `off`, or fail
    /// (including with `UnexpectedEof`) — there is no short-read success
    /// case here, by contract of `std::io::Read::read_exact`-like callers.
    fn read_at(&mut self, dst: &mut [u8], off: u64) -> Result<()>;
}

/// A sequential writer for a new cache entry.
///
/// Every `write` call must succeed or fail atomically for the bytes it was
/// given; `commit` publishes everything written so far, `abort` discards it.
/// `close` without a prior `commit` is equivalent to `abort` and must be
/// idempotent.
pub trait CacheWriter: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn commit(&mut self) -> Result<()>;
    fn abort(&mut self) -> Result<()>;
}

/// A byte-addressable, named-entry cache backend.
pub trait Cache: Send + Sync {
    /// Look up a previously committed entry. Callers treat `Err` uniformly
    /// as "not cached" — including a genuine not-found and any other I/O
    /// failure — and fall through to fetching.
    fn get(&self, id: &str) -> Result<Box<dyn CacheReader>>;

    /// Begin a new entry. If `id` is already committed, implementations may
    /// return a writer whose `commit` is a harmless no-op republish — the
    /// blob reader tolerates either outcome when two fetches race to cache
    /// the same chunk (see DESIGN.md's resolution of the corresponding open
    /// question).
    fn add(&self, id: &str) -> Result<Box<dyn CacheWriter>>;

    /// Release any resources held by the backend. Idempotent.
    fn close(&self) -> Result<()>;
}
