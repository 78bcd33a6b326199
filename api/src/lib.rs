// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Configuration types for the blob reader core and the `nydus-blobd` binary.

#[macro_use]
extern crate serde_derive;

use std::time::Duration;

fn default_chunk_size() -> u64 {
    1024 * 1024
}

fn default_prefetch_chunk_size() -> u64 {
    4 * 1024 * 1024
}

fn default_check_interval_secs() -> u64 {
    5 * 60
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_prefetch_concurrency() -> usize {
    4
}

/// Configuration for a single `storage::blob::Blob`.
///
/// Mirrors the knobs named in the blob reader's configuration section:
/// `chunkSize`, `prefetchChunkSize`, `checkInterval`, `fetchTimeout`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BlobReaderConfig {
    /// Chunk size in bytes; must be > 0. Every region a `Blob` fetches is
    /// aligned to this grid except for the final, possibly-short chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Prefetch fan-out window size in bytes. 0 (or a value <= `chunk_size`)
    /// disables parallel prefetch windows; `Blob::cache` then issues a
    /// single `cache_at` call for the whole requested range.
    #[serde(default = "default_prefetch_chunk_size")]
    pub prefetch_chunk_size: u64,

    /// How often `Blob::check` is allowed to actually probe the fetcher.
    #[serde(default = "default_check_interval_secs", rename = "check_interval_secs")]
    pub check_interval_secs: u64,

    /// Upper bound on a single `fetcher.fetch` call, absent a caller-supplied
    /// deadline.
    #[serde(default = "default_fetch_timeout_secs", rename = "fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Maximum number of concurrent prefetch windows spawned by
    /// `Blob::cache` when `prefetch_chunk_size > chunk_size`.
    #[serde(default = "default_prefetch_concurrency")]
    pub prefetch_concurrency: usize,
}

impl Default for BlobReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            prefetch_chunk_size: default_prefetch_chunk_size(),
            check_interval_secs: default_check_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            prefetch_concurrency: default_prefetch_concurrency(),
        }
    }
}

impl BlobReaderConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn from_json_file(path: &str) -> std::io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
            .map_err(|e| nydus_utils::einval!(format!("invalid blob reader config: {}", e)))
    }
}
