// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The `Resolver` surface: an external collaborator the blob reader
//! consumes but does not implement. Registry authentication, host
//! candidate selection, and credential refresh all live on the other side
//! of this trait.

use crate::error::Result;
use crate::fetcher::Fetcher;

/// A minimal stand-in for an OCI blob descriptor: just enough to identify
/// what is being resolved.
#[derive(Clone, Debug)]
pub struct BlobDescriptor {
    pub digest: String,
    pub refspec: String,
}

/// Resolves an authenticated, range-fetching `Fetcher` for a blob.
///
/// `Blob::new`/`Blob::refresh` call through this; the core never performs
/// registry authentication itself.
pub trait Resolver: Send + Sync {
    fn resolve_fetcher(
        &self,
        hosts: &[String],
        descriptor: &BlobDescriptor,
    ) -> Result<(Fetcher, u64)>;
}
