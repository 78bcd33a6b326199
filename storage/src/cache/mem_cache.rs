// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! An in-memory `Cache` implementation, the "test harness" cache backend
//! the specification calls for — grounded on the `dummycache` idea in this
//! codebase (a minimal, allocation-only cache standing in for a real
//! backend) but actually storing bytes rather than just reporting
//! presence, since the blob reader's tests need real read-back.

use std::collections::HashMap;
use std::io::{ErrorKind, Result};
use std::sync::{Arc, Mutex};

use nydus_utils::einval;

use super::{Cache, CacheReader, CacheWriter};

type EntryMap = Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>>;

#[derive(Default)]
pub struct MemCache {
    entries: EntryMap,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }
}

impl Cache for MemCache {
    fn get(&self, id: &str) -> Result<Box<dyn CacheReader>> {
        let data = self
            .entries
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| std::io::Error::from(ErrorKind::NotFound))?;
        Ok(Box::new(MemCacheReader { data }))
    }

    fn add(&self, id: &str) -> Result<Box<dyn CacheWriter>> {
        Ok(Box::new(MemCacheWriter {
            id: id.to_string(),
            buf: Vec::new(),
            entries: self.entries.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}

struct MemCacheReader {
    data: Arc<Vec<u8>>,
}

impl CacheReader for MemCacheReader {
    fn read_at(&mut self, dst: &mut [u8], off: u64) -> Result<()> {
        let off = off as usize;
        if off
            .checked_add(dst.len())
            .map(|end| end > self.data.len())
            .unwrap_or(true)
        {
            return Err(einval!("read past end of cache entry").into());
        }
        dst.copy_from_slice(&self.data[off..off + dst.len()]);
        Ok(())
    }
}

struct MemCacheWriter {
    id: String,
    buf: Vec<u8>,
    entries: EntryMap,
}

impl CacheWriter for MemCacheWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn commit(&mut self) -> Result<()> {
        // An already-cached id is tolerated as an idempotent overwrite.
        self.entries
            .lock()
            .unwrap()
            .insert(self.id.clone(), Arc::new(std::mem::take(&mut self.buf)));
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.buf.clear();
        Ok(())
    }
}
