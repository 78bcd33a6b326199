// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Keyed deduplication of concurrent identical calls, the synchronous
//! `Mutex` + `Condvar` rendezvous shape used by blocking HTTP range readers
//! in this ecosystem: the first caller for a key runs the work and wakes
//! every waiter with the shared result; nobody else issues the request.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Result, StorageError};

enum Outcome {
    Pending,
    Done(std::result::Result<(), Arc<StorageError>>),
}

/// Reconstruct an owned `StorageError` carrying the same variant and data as
/// `e`, for handing the primary's error to each waiter. `StorageError::Cache`
/// wraps a non-`Clone` `std::io::Error`, so that one case rebuilds an
/// equivalent `io::Error` from its kind and message rather than cloning.
fn clone_storage_error(e: &StorageError) -> StorageError {
    match e {
        StorageError::BlobClosed => StorageError::BlobClosed,
        StorageError::SizeMismatch { expected, got } => StorageError::SizeMismatch {
            expected: *expected,
            got: *got,
        },
        StorageError::MisalignedRegion(r) => StorageError::MisalignedRegion(*r),
        StorageError::Transport(s) => StorageError::Transport(s.clone()),
        StorageError::MalformedResponse(s) => StorageError::MalformedResponse(s.clone()),
        StorageError::ShortRead { expected, got } => StorageError::ShortRead {
            expected: *expected,
            got: *got,
        },
        StorageError::MissingRegion(r) => StorageError::MissingRegion(*r),
        StorageError::Cache(io_err) => StorageError::Cache(std::io::Error::new(io_err.kind(), io_err.to_string())),
    }
}

struct Flight {
    outcome: Mutex<Outcome>,
    done: Condvar,
}

/// A group of in-flight calls keyed by an arbitrary string.
pub struct SingleFlightGroup {
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl Default for SingleFlightGroup {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl SingleFlightGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` under `key`, deduplicating concurrent callers.
    ///
    /// Returns `(result, is_primary)`: `is_primary` is `true` for exactly
    /// the one caller that actually ran `work`; every other concurrent
    /// caller for the same key gets `is_primary = false` and must recover
    /// its own side effects (e.g. populate its destination buffer) by some
    /// other means, since `work`'s side effects were only performed once.
    pub fn run<F>(&self, key: String, work: F) -> (Result<()>, bool)
    where
        F: FnOnce() -> Result<()>,
    {
        let (flight, is_primary) = {
            let mut flights = self.flights.lock().unwrap();
            if let Some(existing) = flights.get(&key) {
                (existing.clone(), false)
            } else {
                let flight = Arc::new(Flight {
                    outcome: Mutex::new(Outcome::Pending),
                    done: Condvar::new(),
                });
                flights.insert(key.clone(), flight.clone());
                (flight, true)
            }
        };

        if is_primary {
            let result = work();
            let stored = result.as_ref().map(|_| ()).map_err(|e| Arc::new(clone_storage_error(e)));
            {
                let mut outcome = flight.outcome.lock().unwrap();
                *outcome = Outcome::Done(stored);
            }
            flight.done.notify_all();
            self.flights.lock().unwrap().remove(&key);
            (result, true)
        } else {
            let mut outcome = flight.outcome.lock().unwrap();
            while matches!(*outcome, Outcome::Pending) {
                outcome = flight.done.wait(outcome).unwrap();
            }
            let result = match &*outcome {
                Outcome::Done(Ok(())) => Ok(()),
                Outcome::Done(Err(e)) => Err(clone_storage_error(e)),
                Outcome::Pending => unreachable!(),
            };
            (result, false)
        }
    }
}
