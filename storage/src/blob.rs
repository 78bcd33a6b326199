// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The public blob reader surface: `size`, `fetched_size`, `read_at`,
//! `cache`, `check`, `refresh`, `close`. This is the component that owns
//! the chunk grid, the current fetcher snapshot, the cache handle, and the
//! single-flight group that coalesces concurrent misses into one HTTP
//! fetch.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use nydus_api::BlobReaderConfig;

use crate::cache::{Cache, CacheReader, CacheWriter};
use crate::error::{Result, StorageError};
use crate::fetcher::Fetcher;
use crate::region::{ceil, floor, positive, walk_chunks, Region, RegionSet};
use crate::resolver::{BlobDescriptor, Resolver};
use crate::singleflight::SingleFlightGroup;

/// Per-call options: a deadline (replaces `fetchTimeout` when present) and
/// an opaque passthrough for the cache backend. Neither reference `Cache`
/// implementation in this crate needs the passthrough, so it's `()`
/// rather than a speculative extension point.
#[derive(Clone, Default)]
pub struct Options {
    pub deadline: Option<Instant>,
    pub cache_opts: (),
}

impl Options {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cache_opts: (),
        }
    }
}

/// A destination-offset writer: accepts a chunk-sized byte stream but only
/// copies the sub-window `[lower_unread, lower_unread + dst.len())` into
/// the caller's buffer. Every `write` call advances the internal cursor by
/// the full length given, regardless of how much fell inside the window —
/// this is what lets `fetch_regions` stream a whole chunk through
/// uniformly while `read_at` only wants the slice a partial read touches.
struct DestOffsetWriter<'a> {
    dst: &'a mut [u8],
    lower_unread: u64,
    cursor: u64,
}

impl<'a> Write for DestOffsetWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let start = self.cursor;
        let end = start + buf.len() as u64;
        self.cursor = end;

        let window_start = self.lower_unread;
        let window_end = self.lower_unread + self.dst.len() as u64;

        let overlap_start = start.max(window_start);
        let overlap_end = end.min(window_end);
        if overlap_start < overlap_end {
            let src_off = (overlap_start - start) as usize;
            let len = (overlap_end - overlap_start) as usize;
            let dst_off = (overlap_start - window_start) as usize;
            self.dst[dst_off..dst_off + len].copy_from_slice(&buf[src_off..src_off + len]);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Writes simultaneously into a new cache entry and (if present) a
/// caller-owned destination.
struct TeeWriter<'a> {
    cache: &'a mut Box<dyn crate::cache::CacheWriter>,
    dest: Option<&'a mut dyn Write>,
}

impl<'a> Write for TeeWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.cache.write(buf)?;
        if let Some(dest) = self.dest.as_mut() {
            dest.write_all(&buf[..n])?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Construct a `&'a mut [u8]` window of `len` bytes starting at `base`
/// within the buffer `ptr` points `total_len` bytes into.
///
/// # Safety
/// Callers must ensure windows constructed this way, across one `read_at`
/// call, never overlap — true by construction because each window covers
/// a distinct, disjoint sub-range of the chunk-aligned request region.
unsafe fn window_mut<'a>(ptr: *mut u8, total_len: usize, base: usize, len: usize) -> &'a mut [u8] {
    debug_assert!(base + len <= total_len);
    std::slice::from_raw_parts_mut(ptr.add(base), len)
}

/// One per remote image layer.
pub struct Blob {
    size: u64,
    chunk_size: u64,
    prefetch_chunk_size: u64,
    check_interval: Duration,
    fetch_timeout: Duration,
    prefetch_concurrency: usize,

    fetcher: RwLock<Fetcher>,
    last_check: Mutex<Instant>,
    closed: AtomicBool,
    cache: Arc<dyn Cache>,
    fetched: Mutex<RegionSet>,
    single_flight: SingleFlightGroup,
    // Serializes the shared-result cache-to-destination copy-out so two
    // concurrent `read_at` calls sharing one fetch result don't interleave
    // writes into overlapping destination slices.
    fetched_region_copy_mu: Mutex<()>,
}

impl Blob {
    pub fn new(cache: Arc<dyn Cache>, fetcher: Fetcher, size: u64, config: &BlobReaderConfig) -> Self {
        let check_interval = config.check_interval();
        let never_checked = Instant::now()
            .checked_sub(check_interval)
            .unwrap_or_else(Instant::now);
        Self {
            size,
            chunk_size: config.chunk_size,
            prefetch_chunk_size: config.prefetch_chunk_size,
            check_interval,
            fetch_timeout: config.fetch_timeout(),
            prefetch_concurrency: config.prefetch_concurrency.max(1),
            fetcher: RwLock::new(fetcher),
            last_check: Mutex::new(never_checked),
            closed: AtomicBool::new(false),
            cache,
            fetched: Mutex::new(RegionSet::new()),
            single_flight: SingleFlightGroup::new(),
            fetched_region_copy_mu: Mutex::new(()),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn fetched_size(&self) -> u64 {
        self.fetched.lock().unwrap().total_size()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::BlobClosed)
        } else {
            Ok(())
        }
    }

    fn snapshot_fetcher(&self) -> Fetcher {
        self.fetcher.read().unwrap().clone()
    }

    /// Throttled liveness probe: at most one real probe per `check_interval`.
    pub fn check(&self) -> Result<()> {
        self.ensure_open()?;

        let now = Instant::now();
        {
            let last_check = self.last_check.lock().unwrap();
            if now.duration_since(*last_check) < self.check_interval {
                return Ok(());
            }
        }

        let fetcher = self.snapshot_fetcher();
        fetcher.check(self.fetch_timeout)?;
        *self.last_check.lock().unwrap() = now;
        Ok(())
    }

    /// Re-resolve a fetcher and hot-swap it in. In-flight reads that already
    /// snapshotted the old fetcher run to completion against it.
    pub fn refresh(
        &self,
        resolver: &dyn Resolver,
        hosts: &[String],
        descriptor: &BlobDescriptor,
    ) -> Result<()> {
        self.ensure_open()?;

        let (new_fetcher, new_size) = resolver.resolve_fetcher(hosts, descriptor)?;
        if new_size != self.size {
            return Err(StorageError::SizeMismatch {
                expected: self.size,
                got: new_size,
            });
        }

        *self.fetcher.write().unwrap() = new_fetcher;
        *self.last_check.lock().unwrap() = Instant::now();
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cache.close().map_err(StorageError::Cache)
    }

    /// Chunk-aligned request region covering `[offset, offset+len)`.
    fn aligned_region(&self, offset: u64, len: u64) -> Region {
        Region::new(
            floor(offset, self.chunk_size),
            ceil(offset + len - 1, self.chunk_size) - 1,
        )
    }

    pub fn read_at<'d>(&self, dst: &'d mut [u8], offset: u64, opts: &Options) -> Result<usize> {
        self.ensure_open()?;

        if dst.is_empty() || offset > self.size {
            return Ok(0);
        }

        let len = dst.len() as u64;
        let region = self.aligned_region(offset, len);
        let fetcher = self.snapshot_fetcher();

        let dst_ptr = dst.as_mut_ptr();
        let dst_len = dst.len();
        let mut missing: HashMap<Region, Box<dyn Write + 'd>> = HashMap::new();

        walk_chunks(region, self.chunk_size, self.size, |chunk| {
            let base = positive(chunk.b as i64 - offset as i64) as usize;
            let lower_unread = positive(offset as i64 - chunk.b as i64);
            let upper_unread = positive((chunk.e + 1) as i64 - (offset + len) as i64);
            let expected = (chunk.size() - lower_unread - upper_unread) as usize;

            let hit = match self.cache.get(&fetcher.gen_id(&chunk)) {
                Ok(mut reader) => {
                    // Safety: `base..base+expected` is disjoint from every
                    // other chunk's window within this call.
                    let window = unsafe { window_mut(dst_ptr, dst_len, base, expected) };
                    reader.read_at(window, lower_unread).is_ok()
                }
                Err(_) => false,
            };

            if hit {
                trace!("chunk {} cache hit", chunk);
            } else {
                trace!("chunk {} cache miss", chunk);
                let window = unsafe { window_mut(dst_ptr, dst_len, base, expected) };
                missing.insert(
                    chunk,
                    Box::new(DestOffsetWriter {
                        dst: window,
                        lower_unread,
                        cursor: 0,
                    }),
                );
            }
            Ok(())
        })?;

        self.fetch_range(missing, opts)?;

        Ok(std::cmp::min(len, self.size.saturating_sub(offset)) as usize)
    }

    /// Prefetch `[offset, offset+size)` without a destination buffer.
    pub fn cache(&self, offset: u64, size: u64, opts: &Options) -> Result<()> {
        self.ensure_open()?;

        if size == 0 || offset >= self.size {
            return Ok(());
        }

        if self.prefetch_chunk_size <= self.chunk_size {
            return self.cache_at(offset, size, opts);
        }

        let fetch_size = self.chunk_size * (self.prefetch_chunk_size / self.chunk_size);
        let end = std::cmp::min(offset + size, self.size);
        let mut windows = Vec::new();
        let mut b = offset;
        while b < end {
            let e = std::cmp::min(b + fetch_size, end);
            windows.push((b, e - b));
            b = e;
        }

        let concurrency = self.prefetch_concurrency;
        let mut first_err = None;
        for batch in windows.chunks(concurrency.max(1)) {
            std::thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|&(o, s)| scope.spawn(move || self.cache_at(o, s, opts)))
                    .collect();
                for h in handles {
                    if let Err(e) = h.join().expect("prefetch worker panicked") {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            });
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn cache_at(&self, offset: u64, size: u64, opts: &Options) -> Result<()> {
        let fetcher = self.snapshot_fetcher();
        let region = self.aligned_region(offset, size);

        let mut missing: HashMap<Region, Box<dyn Write>> = HashMap::new();
        walk_chunks(region, self.chunk_size, self.size, |chunk| {
            if self.cache.get(&fetcher.gen_id(&chunk)).is_err() {
                missing.insert(chunk, Box::new(std::io::sink()));
            }
            Ok(())
        })?;

        self.fetch_range(missing, opts)
    }

    /// The coalescing entry point: deduplicates concurrent identical
    /// `fetch_range` calls via `single_flight`, sharing the result. Shared
    /// (non-primary) callers re-read the fetched chunks from cache into
    /// their own destination, retried at most once if that re-read fails.
    fn fetch_range<'w>(&self, all_data: HashMap<Region, Box<dyn Write + 'w>>, opts: &Options) -> Result<()> {
        if all_data.is_empty() {
            return Ok(());
        }
        self.fetch_range_with_retry(all_data, opts, true)
    }

    fn fetch_range_with_retry<'w>(
        &self,
        all_data: HashMap<Region, Box<dyn Write + 'w>>,
        opts: &Options,
        allow_retry: bool,
    ) -> Result<()> {
        let mut regions: Vec<Region> = all_data.keys().cloned().collect();
        regions.sort();
        let key = regions
            .iter()
            .map(|r| format!("[{},{}]", r.b, r.e))
            .collect::<Vec<_>>()
            .join(",");

        let key_for_log = key.clone();
        let cell = std::cell::RefCell::new(Some(all_data));
        let (result, is_primary) = self.single_flight.run(key, || {
            let mut guard = cell.borrow_mut();
            let data = guard.as_mut().expect("single-flight primary runs once");
            self.fetch_regions(data, opts)
        });
        let mut all_data = cell.into_inner().expect("data restored after single_flight::run");

        result?;

        if !is_primary {
            let _serialize = self.fetched_region_copy_mu.lock().unwrap();
            let fetcher = self.snapshot_fetcher();
            let reread: Result<()> = (|| {
                for (region, writer) in all_data.iter_mut() {
                    let mut reader = self
                        .cache
                        .get(&fetcher.gen_id(region))
                        .map_err(|_| StorageError::MissingRegion(*region))?;
                    let mut buf = vec![0u8; region.size() as usize];
                    reader
                        .read_at(&mut buf, 0)
                        .map_err(|_| StorageError::MissingRegion(*region))?;
                    writer
                        .write_all(&buf)
                        .map_err(|e| StorageError::Transport(e.to_string()))?;
                }
                Ok(())
            })();

            if let Err(e) = reread {
                drop(_serialize);
                warn!(
                    "shared-result re-read failed for key {}, retry={}: {}",
                    key_for_log, allow_retry, e
                );
                return if allow_retry {
                    self.fetch_range_with_retry(all_data, opts, false)
                } else {
                    Err(e)
                };
            }
        }

        Ok(())
    }

    /// The primary fetch path: invoked exactly once per single-flight key.
    fn fetch_regions<'w>(&self, all_data: &mut HashMap<Region, Box<dyn Write + 'w>>, opts: &Options) -> Result<()> {
        let fetcher = self.snapshot_fetcher();

        let mut regions: Vec<Region> = all_data.keys().cloned().collect();
        regions.sort();
        let mut fetched: HashMap<Region, bool> = regions.iter().map(|r| (*r, false)).collect();

        let timeout = match opts.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.fetch_timeout),
            None => self.fetch_timeout,
        };

        debug!(
            "fetching {} region(s) from {}, timeout={:?}",
            regions.len(),
            fetcher.url(),
            timeout
        );
        let mut mr = fetcher.fetch(&regions, true, timeout).map_err(|e| {
            error!("fetch of {} region(s) from {} failed: {}", regions.len(), fetcher.url(), e);
            e
        })?;

        *self.last_check.lock().unwrap() = Instant::now();

        while let Some(resp_region) = mr.next_part()? {
            walk_chunks(resp_region, self.chunk_size, self.size, |chunk| {
                let id = fetcher.gen_id(&chunk);
                let mut cw = self.cache.add(&id).map_err(StorageError::Cache)?;

                let copy_result: std::io::Result<u64> = {
                    let mut limited = mr.part_reader().take(chunk.size());
                    let mut tee = TeeWriter {
                        cache: &mut cw,
                        dest: all_data.get_mut(&chunk).map(|w| w.as_mut()),
                    };
                    std::io::copy(&mut limited, &mut tee)
                };

                match copy_result {
                    Ok(n) if n == chunk.size() => {
                        cw.commit().map_err(StorageError::Cache)?;
                        self.fetched.lock().unwrap().add(chunk);
                        if let Some(flag) = fetched.get_mut(&chunk) {
                            *flag = true;
                        }
                        Ok(())
                    }
                    Ok(n) => {
                        let _ = cw.abort();
                        error!("chunk {} short read: expected {}, got {}", chunk, chunk.size(), n);
                        Err(StorageError::ShortRead {
                            expected: chunk.size(),
                            got: n,
                        })
                    }
                    Err(e) => {
                        let _ = cw.abort();
                        error!("chunk {} commit failed: {}", chunk, e);
                        Err(StorageError::Transport(e.to_string()))
                    }
                }
            })?;
        }

        for region in &regions {
            if !fetched[region] {
                return Err(StorageError::MissingRegion(*region));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::mem_cache::MemCache;
    use crate::resolver::test_doubles::StaticResolver;
    use crate::resolver::BlobDescriptor;

    use reqwest::blocking::Client;
    use std::io::{BufRead, BufReader as StdBufReader};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    /// An in-memory HTTP range server: serves a fixed byte slice, honoring
    /// `Range: bytes=b-e[,b-e...]` with single-part or `multipart/byteranges`
    /// responses, mirroring the shapes `Fetcher::fetch` knows how to parse.
    /// `fail_remaining` connections are dropped before any response is
    /// written, simulating a transport failure.
    struct RangeServer {
        addr: std::net::SocketAddr,
        requests: Arc<AtomicUsize>,
    }

    impl RangeServer {
        fn start(data: Vec<u8>, fail_remaining: usize) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let requests = Arc::new(AtomicUsize::new(0));
            let fail_remaining = Arc::new(AtomicUsize::new(fail_remaining));

            let req_counter = requests.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(s) => s,
                        Err(_) => break,
                    };
                    let data = data.clone();
                    let req_counter = req_counter.clone();
                    let fail_remaining = fail_remaining.clone();
                    thread::spawn(move || handle_conn(stream, &data, &req_counter, &fail_remaining));
                }
            });

            Self { addr, requests }
        }

        fn url(&self) -> String {
            format!("http://{}/blob", self.addr)
        }

        fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    fn parse_ranges(header: &str, total: u64) -> Vec<(u64, u64)> {
        header
            .trim_start_matches("bytes=")
            .split(',')
            .map(|r| {
                let (b, e) = r.trim().split_once('-').unwrap();
                let b: u64 = b.parse().unwrap();
                let e: u64 = if e.is_empty() { total - 1 } else { e.parse().unwrap() };
                (b, e)
            })
            .collect()
    }

    fn handle_conn(mut stream: TcpStream, data: &[u8], req_counter: &AtomicUsize, fail_remaining: &AtomicUsize) {
        let mut reader = StdBufReader::new(match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        });
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
            return;
        }
        let method = request_line.split_whitespace().next().unwrap_or("").to_string();

        let mut range_header: Option<String> = None;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            if let Some(v) = line
                .strip_prefix("Range: ")
                .or_else(|| line.strip_prefix("range: "))
            {
                range_header = Some(v.to_string());
            }
        }

        req_counter.fetch_add(1, Ordering::SeqCst);

        if fail_remaining.load(Ordering::SeqCst) > 0 {
            fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        if method == "HEAD" {
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                data.len()
            );
            let _ = stream.write_all(resp.as_bytes());
            return;
        }

        let range_header = match range_header {
            None => {
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    data.len()
                );
                let _ = stream.write_all(resp.as_bytes());
                let _ = stream.write_all(data);
                return;
            }
            Some(h) => h,
        };

        let ranges = parse_ranges(&range_header, data.len() as u64);

        if ranges.len() == 1 {
            let (b, e) = ranges[0];
            let body = &data[b as usize..=e as usize];
            let resp = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                b,
                e,
                data.len(),
                body.len()
            );
            let _ = stream.write_all(resp.as_bytes());
            let _ = stream.write_all(body);
            return;
        }

        let boundary = "TESTBOUNDARY";
        let mut body = Vec::new();
        for (b, e) in &ranges {
            body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            body.extend_from_slice(format!("Content-Range: bytes {}-{}/{}\r\n\r\n", b, e, data.len()).as_bytes());
            body.extend_from_slice(&data[*b as usize..=*e as usize]);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        let resp_header = format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Type: multipart/byteranges; boundary={}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            boundary,
            body.len()
        );
        let _ = stream.write_all(resp_header.as_bytes());
        let _ = stream.write_all(&body);
    }

    fn test_config() -> BlobReaderConfig {
        BlobReaderConfig {
            chunk_size: 3,
            prefetch_chunk_size: 0,
            check_interval_secs: 300,
            fetch_timeout_secs: 5,
            prefetch_concurrency: 4,
        }
    }

    fn new_blob(server: &RangeServer, digest: &str) -> Blob {
        let fetcher = Fetcher::new(Client::new(), server.url(), digest);
        let cache: Arc<dyn Cache> = Arc::new(MemCache::new());
        Blob::new(cache, fetcher, 10, &test_config())
    }

    /// Like `new_blob`, but also hands back the concrete `MemCache` so tests
    /// can assert on cache contents directly (`Blob` only keeps a `dyn Cache`).
    fn new_blob_with_config(server: &RangeServer, digest: &str, config: &BlobReaderConfig, size: u64) -> (Blob, Arc<MemCache>) {
        let fetcher = Fetcher::new(Client::new(), server.url(), digest);
        let cache = Arc::new(MemCache::new());
        let blob = Blob::new(cache.clone() as Arc<dyn Cache>, fetcher, size, config);
        (blob, cache)
    }

    #[test]
    fn test_cold_cache_read_fetches_from_server() {
        let server = RangeServer::start(b"0123456789".to_vec(), 0);
        let blob = new_blob(&server, "d1");

        let mut buf = [0u8; 4];
        let n = blob.read_at(&mut buf, 2, &Options::default()).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"2345");
        assert!(server.request_count() >= 1);
    }

    #[test]
    fn test_repeat_read_hits_cache_without_refetch() {
        let server = RangeServer::start(b"0123456789".to_vec(), 0);
        let blob = new_blob(&server, "d2");

        let mut buf = [0u8; 3];
        blob.read_at(&mut buf, 0, &Options::default()).unwrap();
        let after_first = server.request_count();

        let mut buf2 = [0u8; 3];
        blob.read_at(&mut buf2, 0, &Options::default()).unwrap();
        assert_eq!(server.request_count(), after_first);
        assert_eq!(&buf2, b"012");
    }

    #[test]
    fn test_full_blob_read() {
        let server = RangeServer::start(b"0123456789".to_vec(), 0);
        let blob = new_blob(&server, "d3");

        let mut buf = vec![0u8; 10];
        let n = blob.read_at(&mut buf, 0, &Options::default()).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf, b"0123456789");
        assert_eq!(blob.fetched_size(), 10);
    }

    #[test]
    fn test_concurrent_reads_of_same_chunk_dedup_into_one_fetch() {
        let server = RangeServer::start(b"0123456789".to_vec(), 0);
        let blob = Arc::new(new_blob(&server, "d4"));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let blob = blob.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut buf = [0u8; 3];
                    blob.read_at(&mut buf, 6, &Options::default()).unwrap();
                    buf
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), *b"678");
        }
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn test_transport_failure_leaves_no_partial_commit() {
        let server = RangeServer::start(b"0123456789".to_vec(), 1);
        let blob = new_blob(&server, "d5");

        let mut buf = [0u8; 3];
        let res = blob.read_at(&mut buf, 0, &Options::default());
        assert!(res.is_err());
        assert_eq!(blob.fetched_size(), 0);

        // The dropped connection was the only scripted failure; a retry
        // against the same (now healthy) server succeeds.
        let mut buf2 = [0u8; 3];
        let n = blob.read_at(&mut buf2, 0, &Options::default()).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf2, b"012");
    }

    #[test]
    fn test_refresh_rejects_size_mismatch_then_rotates_to_new_fetcher() {
        let server1 = RangeServer::start(b"0123456789".to_vec(), 0);
        let blob = new_blob(&server1, "d6");
        let descriptor = BlobDescriptor {
            digest: "d6".into(),
            refspec: "ref".into(),
        };

        let wrong_size_server = RangeServer::start(b"01234".to_vec(), 0);
        let wrong_fetcher = Fetcher::new(Client::new(), wrong_size_server.url(), "d6");
        let wrong_resolver = StaticResolver::new(wrong_fetcher, 5);
        let res = blob.refresh(&wrong_resolver, &[wrong_size_server.url()], &descriptor);
        assert!(matches!(res, Err(StorageError::SizeMismatch { .. })));

        let server2 = RangeServer::start(b"0123456789".to_vec(), 0);
        let fetcher2 = Fetcher::new(Client::new(), server2.url(), "d6");
        let ok_resolver = StaticResolver::new(fetcher2, 10);
        blob.refresh(&ok_resolver, &[server2.url()], &descriptor).unwrap();

        let mut buf = [0u8; 3];
        blob.read_at(&mut buf, 0, &Options::default()).unwrap();
        assert_eq!(&buf, b"012");
        assert_eq!(server1.request_count(), 0);
        assert!(server2.request_count() >= 1);
    }

    #[test]
    fn test_closed_blob_rejects_operations() {
        let server = RangeServer::start(b"0123456789".to_vec(), 0);
        let blob = new_blob(&server, "d7");
        blob.close().unwrap();

        let mut buf = [0u8; 3];
        let res = blob.read_at(&mut buf, 0, &Options::default());
        assert!(matches!(res, Err(StorageError::BlobClosed)));
    }

    #[test]
    fn test_check_succeeds_against_live_server() {
        let server = RangeServer::start(b"0123456789".to_vec(), 0);
        let blob = new_blob(&server, "d8");
        blob.check().unwrap();
    }

    #[test]
    fn test_cold_cache_cache_fetches_from_server() {
        let server = RangeServer::start(b"0123456789".to_vec(), 0);
        let (blob, cache) = new_blob_with_config(&server, "c1", &test_config(), 10);
        let fetcher = Fetcher::new(Client::new(), server.url(), "c1");

        blob.cache(2, 4, &Options::default()).unwrap();

        assert!(server.request_count() >= 1);
        assert_eq!(blob.fetched_size(), 6);
        assert!(cache.contains(&fetcher.gen_id(&Region::new(0, 2))));
        assert!(cache.contains(&fetcher.gen_id(&Region::new(3, 5))));
    }

    #[test]
    fn test_repeat_cache_hits_cache_without_refetch() {
        let server = RangeServer::start(b"0123456789".to_vec(), 0);
        let (blob, _cache) = new_blob_with_config(&server, "c2", &test_config(), 10);

        blob.cache(0, 3, &Options::default()).unwrap();
        let after_first = server.request_count();
        assert!(after_first >= 1);

        blob.cache(0, 3, &Options::default()).unwrap();
        assert_eq!(server.request_count(), after_first);
    }

    #[test]
    fn test_cache_produces_same_cache_state_as_read_at() {
        let server = RangeServer::start(b"0123456789".to_vec(), 0);
        let fetcher = Fetcher::new(Client::new(), server.url(), "c3");

        let (cached_blob, cached) = new_blob_with_config(&server, "c3", &test_config(), 10);
        cached_blob.cache(1, 5, &Options::default()).unwrap();

        let (read_blob, read) = new_blob_with_config(&server, "c3", &test_config(), 10);
        let mut buf = [0u8; 5];
        read_blob.read_at(&mut buf, 1, &Options::default()).unwrap();

        for region in [Region::new(0, 2), Region::new(3, 5)] {
            let id = fetcher.gen_id(&region);
            assert_eq!(cached.contains(&id), read.contains(&id));
            assert!(cached.contains(&id));
        }
        assert_eq!(cached_blob.fetched_size(), read_blob.fetched_size());
    }

    fn prefetch_config(prefetch_chunk_size: u64, prefetch_concurrency: usize) -> BlobReaderConfig {
        BlobReaderConfig {
            chunk_size: 3,
            prefetch_chunk_size,
            check_interval_secs: 300,
            fetch_timeout_secs: 5,
            prefetch_concurrency,
        }
    }

    #[test]
    fn test_cache_with_prefetch_windows_fans_out_then_is_idempotent() {
        let data: Vec<u8> = (0..30u8).collect();
        let server = RangeServer::start(data, 0);
        let config = prefetch_config(9, 2);
        let (blob, cache) = new_blob_with_config(&server, "c4", &config, 30);
        let fetcher = Fetcher::new(Client::new(), server.url(), "c4");

        blob.cache(0, 30, &Options::default()).unwrap();

        assert_eq!(blob.fetched_size(), 30);
        assert!(cache.contains(&fetcher.gen_id(&Region::new(0, 2))));
        assert!(cache.contains(&fetcher.gen_id(&Region::new(27, 29))));

        let after_first = server.request_count();
        assert!(
            after_first > 1,
            "prefetch windows wider than chunk_size should fan out into more than one request"
        );

        blob.cache(0, 30, &Options::default()).unwrap();
        assert_eq!(server.request_count(), after_first);
    }
}
