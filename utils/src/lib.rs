// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the nydus-blobd workspace: logging setup, the content
//! digest type, and the `io::Error` construction macros used throughout
//! `storage`.

#[macro_use]
extern crate log;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub mod digest;
pub mod logger;

/// Build an `io::Error` of kind `InvalidInput`.
#[macro_export]
macro_rules! einval {
    () => {
        std::io::Error::from(std::io::ErrorKind::InvalidInput)
    };
    ($msg:expr) => {{
        let msg = format!("{}", $msg);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
    }};
}

/// Build an `io::Error` of kind `NotFound`.
#[macro_export]
macro_rules! enoent {
    () => {
        std::io::Error::from(std::io::ErrorKind::NotFound)
    };
    ($msg:expr) => {{
        let msg = format!("{}", $msg);
        std::io::Error::new(std::io::ErrorKind::NotFound, msg)
    }};
}

/// Build an `io::Error` of kind `Other`, for "operation not supported here".
#[macro_export]
macro_rules! enosys {
    () => {
        std::io::Error::from_raw_os_error(libc::ENOSYS)
    };
    ($msg:expr) => {{
        let msg = format!("{}", $msg);
        std::io::Error::new(std::io::ErrorKind::Other, msg)
    }};
}

/// Wrap `std::io::Error::last_os_error()`, optionally tagging it with context.
#[macro_export]
macro_rules! last_error {
    () => {
        std::io::Error::last_os_error()
    };
    ($msg:expr) => {{
        let err = std::io::Error::last_os_error();
        warn!("{}: {}", $msg, err);
        err
    }};
}

/// A customized buffer allocator that avoids zeroing, mirroring the
/// `storage` crate's hot read path where every byte is about to be
/// overwritten by a `pread`/HTTP copy anyway.
pub fn alloc_buf(size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(size);
    unsafe { buf.set_len(size) };
    buf
}
