// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The lazy remote-blob data plane: a chunk-grid-aligned, cache-backed,
//! single-flight-coalesced reader over an HTTP range-request source.
//!
//! [`blob::Blob`] is the public surface. Everything else in this crate is a
//! supporting collaborator it owns or consumes: [`region`] for chunk-grid
//! arithmetic, [`cache`] for the byte-addressable storage contract (plus two
//! reference backends), [`fetcher`] for the HTTP range-request handle,
//! [`multipart`] for parsing the wire response, [`singleflight`] for
//! request coalescing, and [`resolver`] for the external registry/auth
//! collaborator the core never implements itself.

#[macro_use]
extern crate log;

pub mod blob;
pub mod cache;
pub mod error;
pub mod fetcher;
pub mod multipart;
pub mod region;
pub mod resolver;
pub mod singleflight;

pub use blob::{Blob, Options};
pub use error::{Result, StorageError};
pub use fetcher::Fetcher;
pub use resolver::{BlobDescriptor, Resolver};
