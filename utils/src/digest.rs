// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A thin wrapper around a content digest, used to derive stable cache keys.

use sha2::{Digest, Sha256};

/// Digest of an immutable byte blob, printed lower-case hex with no prefix.
///
/// `storage::fetcher::Fetcher::gen_id` concatenates this with a region's
/// coordinates to derive a cache entry id that stays stable across process
/// restarts, so a persistent cache backend can hit on it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the digest of `buf`.
    pub fn from_buf(buf: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(buf);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already-known digest string, e.g. one taken verbatim from an
    /// OCI descriptor (`sha256:...`). The `sha256:` prefix, if present, is
    /// stripped so `genID` stays stable regardless of how the caller spelled
    /// it.
    pub fn from_str_digest(s: &str) -> Self {
        match s.split_once(':') {
            Some((_, rest)) => Self(rest.to_string()),
            None => Self(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
