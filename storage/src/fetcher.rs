// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A stateless handle over a remote byte-range source: issues multi-range
//! HTTP requests, parses single-part/multipart responses, and derives
//! stable per-chunk cache identifiers.

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;

use nydus_utils::digest::ContentDigest;

use crate::error::{Result, StorageError};
use crate::multipart::{parse_content_range, parse_multipart_boundary, MultipartReader};
use crate::region::Region;

/// A fetcher is cheap to snapshot: cloning it does not repeat any I/O, it
/// just bumps an `Arc` refcount on the underlying client and URL.
#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<FetcherInner>,
}

struct FetcherInner {
    url: String,
    digest: ContentDigest,
    client: Client,
}

impl Fetcher {
    /// `digest` is taken as given by the caller (e.g. an OCI descriptor's
    /// `sha256:...` digest string) and normalized through `ContentDigest`,
    /// which strips the algorithm prefix so `gen_id` stays stable regardless
    /// of how the caller spelled it.
    pub fn new(client: Client, url: String, digest: &str) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                url,
                digest: ContentDigest::from_str_digest(digest),
                client,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// `"<digest>-<b>-<e>"`, stable across process restarts so a persistent
    /// cache backend hits on it.
    pub fn gen_id(&self, region: &Region) -> String {
        format!("{}-{}-{}", self.inner.digest, region.b, region.e)
    }

    /// Issue a single HTTP GET covering `regions`, with a deadline of
    /// `timeout`. Returns a lazy cursor over the response body.
    pub fn fetch(
        &self,
        regions: &[Region],
        allow_multi_range: bool,
        timeout: Duration,
    ) -> Result<MultipartReader<Response>> {
        if !allow_multi_range {
            // The caller is responsible for splitting into one call per
            // region when multi-range is disallowed; `fetch` always issues
            // exactly one HTTP call for what it's given.
            debug_assert!(regions.len() <= 1);
        }

        let range_header = format!(
            "bytes={}",
            regions
                .iter()
                .map(|r| format!("{}-{}", r.b, r.e))
                .collect::<Vec<_>>()
                .join(",")
        );

        trace!("fetching {} from {}", range_header, self.inner.url);

        let resp = self
            .inner
            .client
            .get(&self.inner.url)
            .header(RANGE, range_header)
            .timeout(timeout)
            .send()
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {
                let size = resp
                    .content_length()
                    .ok_or_else(|| StorageError::MalformedResponse("missing Content-Length".into()))?;
                Ok(MultipartReader::whole(resp, size))
            }
            StatusCode::PARTIAL_CONTENT => {
                let content_type = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                if let Some(boundary) =
                    content_type.as_deref().and_then(parse_multipart_boundary)
                {
                    return Ok(MultipartReader::multi(resp, boundary));
                }

                let content_range = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| StorageError::MalformedResponse("missing Content-Range".into()))?
                    .to_string();
                let (b, e) = parse_content_range(&content_range)?;
                Ok(MultipartReader::single(resp, Region::new(b, e)))
            }
            status => Err(StorageError::Transport(format!(
                "unexpected status {}",
                status
            ))),
        }
    }

    /// A cheap liveness probe: a zero-length range request against the
    /// fetcher's URL. Any non-2xx status (other than the 416 an empty blob
    /// may legitimately return for a zero-length range) is a failure.
    pub fn check(&self, timeout: Duration) -> Result<()> {
        let resp = self
            .inner
            .client
            .get(&self.inner.url)
            .header(RANGE, "bytes=0-0")
            .timeout(timeout)
            .send()
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        if resp.status().is_success() || resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            Ok(())
        } else {
            Err(StorageError::Transport(format!(
                "liveness check failed: {}",
                resp.status()
            )))
        }
    }
}
