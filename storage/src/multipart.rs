// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A lazy cursor over an HTTP range-request response body: either a whole
//! `200 OK` body, a single `206` part, or a `206 multipart/byteranges`
//! body. State machine: `Idle -> PartHeader -> PartBody -> (PartHeader |
//! End)`.
//!
//! Every yielded part is read through `PartReader`, which borrows the
//! cursor for exactly as long as the caller needs to drain it — calling
//! `next_part` again before fully draining the current part is a
//! `ShortRead`, matching the "reader is valid only until `Next()` is
//! called again" contract.

use std::io::{BufReader, Read};

use crate::error::{Result, StorageError};
use crate::region::Region;

enum Body<R> {
    /// A `200 OK` response: the whole blob, one synthetic part.
    Whole { body: BufReader<R>, blob_size: u64 },
    /// A `206` response with a single `Content-Range`: one part, already
    /// known before any body bytes are read.
    Single {
        body: BufReader<R>,
        region: Region,
    },
    /// A `206 multipart/byteranges` response: parts are framed by `boundary`
    /// and each carries its own `Content-Range` header.
    Multi {
        body: BufReader<R>,
        boundary: Vec<u8>,
    },
}

enum State {
    /// No part has been yielded yet (Whole/Single) or we're between parts
    /// (Multi), about to look for the next boundary/part header.
    Idle,
    /// A part's region is known and `remaining` bytes of it are still
    /// unread.
    InPart { remaining: u64 },
    Done,
}

pub struct MultipartReader<R> {
    body: Body<R>,
    state: State,
    emitted_single: bool,
}

impl<R: Read> MultipartReader<R> {
    pub fn whole(body: R, blob_size: u64) -> Self {
        Self {
            body: Body::Whole {
                body: BufReader::new(body),
                blob_size,
            },
            state: State::Idle,
            emitted_single: false,
        }
    }

    pub fn single(body: R, region: Region) -> Self {
        Self {
            body: Body::Single {
                body: BufReader::new(body),
                region,
            },
            state: State::Idle,
            emitted_single: false,
        }
    }

    pub fn multi(body: R, boundary: Vec<u8>) -> Self {
        Self {
            body: Body::Multi {
                body: BufReader::new(body),
                boundary,
            },
            state: State::Idle,
            emitted_single: false,
        }
    }

    /// Advance to the next part, returning its region. `Ok(None)` is the
    /// terminal EOF sentinel, not an error.
    pub fn next_part(&mut self) -> Result<Option<Region>> {
        if let State::InPart { remaining } = self.state {
            if remaining != 0 {
                return Err(StorageError::ShortRead {
                    expected: remaining,
                    got: 0,
                });
            }
        }
        if matches!(self.state, State::Done) {
            return Ok(None);
        }

        match &mut self.body {
            Body::Whole { blob_size, .. } => {
                if self.emitted_single {
                    self.state = State::Done;
                    return Ok(None);
                }
                self.emitted_single = true;
                let region = Region::new(0, blob_size.saturating_sub(1));
                self.state = State::InPart {
                    remaining: region.size(),
                };
                Ok(Some(region))
            }
            Body::Single { region, .. } => {
                if self.emitted_single {
                    self.state = State::Done;
                    return Ok(None);
                }
                self.emitted_single = true;
                let region = *region;
                self.state = State::InPart {
                    remaining: region.size(),
                };
                Ok(Some(region))
            }
            Body::Multi { body, boundary } => {
                let region = next_multipart_region(body, boundary)?;
                match region {
                    Some(region) => {
                        self.state = State::InPart {
                            remaining: region.size(),
                        };
                        Ok(Some(region))
                    }
                    None => {
                        self.state = State::Done;
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Read up to `buf.len()` bytes of the current part's body.
    fn read_part_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = match &mut self.state {
            State::InPart { remaining } => remaining,
            _ => return Ok(0),
        };
        if *remaining == 0 {
            return Ok(0);
        }
        let want = std::cmp::min(buf.len() as u64, *remaining) as usize;
        let inner: &mut dyn Read = match &mut self.body {
            Body::Whole { body, .. } => body,
            Body::Single { body, .. } => body,
            Body::Multi { body, .. } => body,
        };
        let n = inner
            .read(&mut buf[..want])
            .map_err(|e| StorageError::Transport(e.to_string()))?;
        *remaining -= n as u64;
        Ok(n)
    }

    /// Borrow a `Read` over the current part, valid until the next call to
    /// `next_part`.
    pub fn part_reader(&mut self) -> PartReader<'_, R> {
        PartReader { parent: self }
    }
}

pub struct PartReader<'a, R> {
    parent: &'a mut MultipartReader<R>,
}

impl<'a, R: Read> Read for PartReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.parent
            .read_part_bytes(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

/// Parse a `Content-Range: bytes b-e/total` (or `.../*`) header value into
/// `(b, e)`.
pub fn parse_content_range(value: &str) -> Result<(u64, u64)> {
    let rest = value
        .trim()
        .strip_prefix("bytes ")
        .ok_or_else(|| StorageError::MalformedResponse(format!("bad Content-Range: {}", value)))?;
    let (range, _total) = rest
        .split_once('/')
        .ok_or_else(|| StorageError::MalformedResponse(format!("bad Content-Range: {}", value)))?;
    let (b, e) = range
        .split_once('-')
        .ok_or_else(|| StorageError::MalformedResponse(format!("bad Content-Range: {}", value)))?;
    let b: u64 = b
        .trim()
        .parse()
        .map_err(|_| StorageError::MalformedResponse(format!("bad Content-Range: {}", value)))?;
    let e: u64 = e
        .trim()
        .parse()
        .map_err(|_| StorageError::MalformedResponse(format!("bad Content-Range: {}", value)))?;
    Ok((b, e))
}

/// Extract the `boundary` parameter from a `Content-Type: multipart/byteranges;
/// boundary=...` header value.
pub fn parse_multipart_boundary(content_type: &str) -> Option<Vec<u8>> {
    let lower = content_type.to_ascii_lowercase();
    if !lower.trim_start().starts_with("multipart/byteranges") {
        return None;
    }
    for part in content_type.split(';').skip(1) {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("boundary=") {
            let b = rest.trim_matches('"');
            return Some(format!("--{}", b).into_bytes());
        }
    }
    None
}

fn read_line<R: Read>(r: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte) {
            Ok(0) => {
                return if line.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(line))
                }
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }
                line.push(byte[0]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Consume the next boundary + header block of a `multipart/byteranges`
/// body and return the region it declares, or `None` at the terminal
/// boundary (`--boundary--`).
fn next_multipart_region<R: Read>(body: &mut R, boundary: &[u8]) -> Result<Option<Region>> {
    // Skip blank preamble lines until we hit the boundary line.
    loop {
        let line = read_line(body).map_err(|e| StorageError::Transport(e.to_string()))?;
        let line = match line {
            Some(l) => l,
            None => {
                return Err(StorageError::MalformedResponse(
                    "multipart body truncated before boundary".into(),
                ))
            }
        };
        if line.is_empty() {
            continue;
        }
        let terminal = {
            let mut t = boundary.to_vec();
            t.extend_from_slice(b"--");
            t
        };
        if line == terminal {
            return Ok(None);
        }
        if line == boundary {
            break;
        }
        return Err(StorageError::MalformedResponse(format!(
            "expected multipart boundary, got {:?}",
            String::from_utf8_lossy(&line)
        )));
    }

    // Read header lines until the blank line that ends the part header.
    let mut header_lines = Vec::new();
    loop {
        let line = read_line(body).map_err(|e| StorageError::Transport(e.to_string()))?;
        match line {
            Some(l) if l.is_empty() => break,
            Some(l) => header_lines.push(l),
            None => {
                return Err(StorageError::MalformedResponse(
                    "multipart part headers truncated".into(),
                ))
            }
        }
    }

    let mut header_block = Vec::new();
    for line in &header_lines {
        header_block.extend_from_slice(line);
        header_block.extend_from_slice(b"\r\n");
    }
    header_block.extend_from_slice(b"\r\n");

    let mut header_storage = [httparse::EMPTY_HEADER; 16];
    let parsed = httparse::parse_headers(&header_block, &mut header_storage)
        .map_err(|e| StorageError::MalformedResponse(format!("bad part headers: {}", e)))?;
    let headers = match parsed {
        httparse::Status::Complete((_, headers)) => headers,
        httparse::Status::Partial => {
            return Err(StorageError::MalformedResponse(
                "incomplete part headers".into(),
            ))
        }
    };

    let content_range = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-range"))
        .ok_or_else(|| StorageError::MalformedResponse("part missing Content-Range".into()))?;
    let value = std::str::from_utf8(content_range.value)
        .map_err(|_| StorageError::MalformedResponse("non-UTF8 Content-Range".into()))?;
    let (b, e) = parse_content_range(value)?;
    Ok(Some(Region::new(b, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_whole_yields_single_region() {
        let mut mr = MultipartReader::whole(Cursor::new(b"0123456789".to_vec()), 10);
        let region = mr.next_part().unwrap().unwrap();
        assert_eq!(region, Region::new(0, 9));
        let mut buf = vec![0u8; 10];
        std::io::Read::read_exact(&mut mr.part_reader(), &mut buf).unwrap();
        assert_eq!(&buf, b"0123456789");
        assert!(mr.next_part().unwrap().is_none());
    }

    #[test]
    fn test_single_part() {
        let mut mr = MultipartReader::single(Cursor::new(b"345".to_vec()), Region::new(3, 5));
        let region = mr.next_part().unwrap().unwrap();
        assert_eq!(region, Region::new(3, 5));
        let mut buf = vec![0u8; 3];
        std::io::Read::read_exact(&mut mr.part_reader(), &mut buf).unwrap();
        assert_eq!(&buf, b"345");
        assert!(mr.next_part().unwrap().is_none());
    }

    #[test]
    fn test_multipart_two_parts() {
        let body = concat!(
            "--B\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-Range: bytes 0-2/10\r\n",
            "\r\n",
            "012",
            "\r\n--B\r\n",
            "Content-Range: bytes 6-9/10\r\n",
            "\r\n",
            "6789",
            "\r\n--B--\r\n",
        );
        let mut mr = MultipartReader::multi(Cursor::new(body.as_bytes().to_vec()), b"--B".to_vec());

        let r1 = mr.next_part().unwrap().unwrap();
        assert_eq!(r1, Region::new(0, 2));
        let mut buf = vec![0u8; 3];
        std::io::Read::read_exact(&mut mr.part_reader(), &mut buf).unwrap();
        assert_eq!(&buf, b"012");

        let r2 = mr.next_part().unwrap().unwrap();
        assert_eq!(r2, Region::new(6, 9));
        let mut buf2 = vec![0u8; 4];
        std::io::Read::read_exact(&mut mr.part_reader(), &mut buf2).unwrap();
        assert_eq!(&buf2, b"6789");

        assert!(mr.next_part().unwrap().is_none());
    }

    #[test]
    fn test_advancing_without_draining_is_short_read() {
        let body = concat!(
            "--B\r\n",
            "Content-Range: bytes 0-5/10\r\n",
            "\r\n",
            "012345",
            "\r\n--B--\r\n",
        );
        let mut mr = MultipartReader::multi(Cursor::new(body.as_bytes().to_vec()), b"--B".to_vec());
        mr.next_part().unwrap().unwrap();
        // Drain only part of the declared range.
        let mut buf = vec![0u8; 2];
        std::io::Read::read(&mut mr.part_reader(), &mut buf).unwrap();
        let res = mr.next_part();
        assert!(matches!(res, Err(StorageError::ShortRead { .. })));
    }

    #[test]
    fn test_parse_boundary() {
        let ct = "multipart/byteranges; boundary=3d6b6a416f9b5";
        let boundary = parse_multipart_boundary(ct).unwrap();
        assert_eq!(boundary, b"--3d6b6a416f9b5".to_vec());
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-499/1234").unwrap(), (0, 499));
        assert!(parse_content_range("garbage").is_err());
    }
}
