// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! `nydus-blobd`: a small ops/demo binary that wires an HTTP `Resolver` +
//! `Fetcher` + `FileCache`/`MemCache` + `Blob` together, exercising
//! `ReadAt`/`Cache`/`Check` against a real HTTP range server from the
//! command line. Scoped-down stand-in for the teacher's `nydusd` daemon:
//! no FUSE mount, no gRPC manager, just the blob-reader core.

#[macro_use]
extern crate log;

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{App, Arg, SubCommand};
use reqwest::blocking::Client;

use nydus_api::BlobReaderConfig;
use nydus_storage::cache::file_cache::FileCache;
use nydus_storage::cache::mem_cache::MemCache;
use nydus_storage::cache::Cache;
use nydus_storage::{Blob, BlobDescriptor, Fetcher, Options, Resolver, StorageError};

/// Resolves an already-authenticated URL list directly into a `Fetcher`, via
/// a plain `HEAD` request for the blob's size. Registry authentication is
/// out of scope: callers are expected to hand this a URL that's already
/// reachable.
struct HttpResolver {
    client: Client,
}

impl HttpResolver {
    fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Resolver for HttpResolver {
    fn resolve_fetcher(
        &self,
        hosts: &[String],
        descriptor: &BlobDescriptor,
    ) -> nydus_storage::Result<(Fetcher, u64)> {
        let url = hosts
            .first()
            .ok_or_else(|| StorageError::Transport("no candidate hosts given".into()))?;

        let resp = self
            .client
            .head(url)
            .send()
            .map_err(|e| StorageError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StorageError::Transport(format!(
                "HEAD {} returned {}",
                url,
                resp.status()
            )));
        }
        let size = resp
            .content_length()
            .ok_or_else(|| StorageError::MalformedResponse("missing Content-Length".into()))?;

        let fetcher = Fetcher::new(self.client.clone(), url.clone(), &descriptor.digest);
        Ok((fetcher, size))
    }
}

fn build_blob(url: &str, digest: &str, cache_dir: Option<&str>, config: &BlobReaderConfig) -> Result<Blob> {
    let resolver = HttpResolver::new();
    let descriptor = BlobDescriptor {
        digest: digest.to_string(),
        refspec: url.to_string(),
    };
    let (fetcher, size) = resolver
        .resolve_fetcher(&[url.to_string()], &descriptor)
        .context("resolving fetcher")?;

    let cache: Arc<dyn Cache> = match cache_dir {
        Some(dir) => Arc::new(FileCache::new(dir).context("opening file cache")?),
        None => Arc::new(MemCache::new()),
    };

    Ok(Blob::new(cache, fetcher, size, config))
}

fn parse_config(matches: &clap::ArgMatches) -> Result<BlobReaderConfig> {
    match matches.value_of("config") {
        Some(path) => BlobReaderConfig::from_json_file(path).context("loading config file"),
        None => Ok(BlobReaderConfig::default()),
    }
}

fn run() -> Result<()> {
    let matches = App::new("nydus-blobd")
        .version("1.0.0")
        .about("Lazy remote-blob reader with chunk-level caching")
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .default_value("info"),
        )
        .arg(
            Arg::with_name("url")
                .long("url")
                .takes_value(true)
                .required(true)
                .global(true)
                .help("HTTP range-request URL of the blob"),
        )
        .arg(
            Arg::with_name("digest")
                .long("digest")
                .takes_value(true)
                .required(true)
                .global(true)
                .help("content digest used to derive cache keys"),
        )
        .arg(
            Arg::with_name("cache-dir")
                .long("cache-dir")
                .takes_value(true)
                .global(true)
                .help("disk cache directory; defaults to an in-memory cache"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .global(true)
                .help("JSON file with BlobReaderConfig overrides"),
        )
        .subcommand(
            SubCommand::with_name("read")
                .about("read a byte range and write it to stdout")
                .arg(Arg::with_name("offset").long("offset").takes_value(true).required(true))
                .arg(Arg::with_name("length").long("length").takes_value(true).required(true)),
        )
        .subcommand(
            SubCommand::with_name("cache")
                .about("prefetch a byte range into the cache")
                .arg(Arg::with_name("offset").long("offset").takes_value(true).required(true))
                .arg(Arg::with_name("length").long("length").takes_value(true).required(true)),
        )
        .subcommand(SubCommand::with_name("check").about("probe fetcher liveness"))
        .get_matches();

    nydus_utils::logger::setup_logging(None, matches.value_of("log-level").unwrap())
        .map_err(anyhow::Error::msg)
        .context("initializing logger")?;

    let url = matches.value_of("url").unwrap();
    let digest = matches.value_of("digest").unwrap();
    let cache_dir = matches.value_of("cache-dir");
    let config = parse_config(&matches)?;

    let blob = build_blob(url, digest, cache_dir, &config)?;

    match matches.subcommand() {
        ("read", Some(sub)) => {
            let offset: u64 = sub.value_of("offset").unwrap().parse().context("parsing offset")?;
            let length: usize = sub.value_of("length").unwrap().parse().context("parsing length")?;
            let mut buf = nydus_utils::alloc_buf(length);
            let n = blob
                .read_at(&mut buf, offset, &Options::default())
                .context("read_at failed")?;
            std::io::stdout().write_all(&buf[..n]).context("writing stdout")?;
            info!("read {} bytes at offset {}", n, offset);
        }
        ("cache", Some(sub)) => {
            let offset: u64 = sub.value_of("offset").unwrap().parse().context("parsing offset")?;
            let length: u64 = sub.value_of("length").unwrap().parse().context("parsing length")?;
            blob.cache(offset, length, &Options::default()).context("cache failed")?;
            info!(
                "cached [{}, {}), fetched_size now {}",
                offset,
                offset + length,
                blob.fetched_size()
            );
        }
        ("check", Some(_)) => {
            blob.check().context("check failed")?;
            info!("fetcher is live");
        }
        _ => bail!("a subcommand is required: read, cache, or check"),
    }

    blob.close().context("closing blob")?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
