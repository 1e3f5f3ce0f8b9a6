//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! The versioned binary envelope every persisted reader group record uses:
//! `{write_version: u8, revision: u8, payload}`, with `u32`-length-prefixed
//! maps and `u16`-length-prefixed strings inside the payload. A coordinator
//! built against `write_version = W` accepts any stored `revision <= W` and
//! rejects anything newer as [`WireError::UnsupportedRevision`].

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ordered_float::OrderedFloat;
use pravega_rust_client_shared::{Reader, ReaderGroupConfig, RetentionType, ScopedSegment, ScopedStream, Segment, SegmentWithRange, StreamCut};
use snafu::Snafu;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};

#[derive(Debug, Snafu)]
pub enum WireError {
    #[snafu(display("unsupported revision {} for writeVersion {}", found, write_version))]
    UnsupportedRevision { write_version: u8, found: u8 },

    #[snafu(display("io error while {}: {}", operation, source))]
    Io { operation: String, source: io::Error },

    #[snafu(display("malformed payload while {}: {}", operation, reason))]
    Malformed { operation: String, reason: String },
}

pub type WireResult<T> = std::result::Result<T, WireError>;

/// Implemented by every type that is persisted through the state
/// synchronizer. `WRITE_VERSION` is the highest revision this build knows
/// how to produce; `write_fields`/`read_fields` encode/decode the payload
/// only, the envelope is handled by [`to_bytes`]/[`from_bytes`].
pub trait RevisionedSerializer: Sized {
    const WRITE_VERSION: u8;

    fn write_fields<W: Write>(&self, w: &mut W) -> WireResult<()>;
    fn read_fields<R: Read>(r: &mut R, revision: u8) -> WireResult<Self>;

    fn to_bytes(&self) -> WireResult<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u8(Self::WRITE_VERSION).context_io("writing write_version")?;
        out.write_u8(Self::WRITE_VERSION).context_io("writing revision")?;
        self.write_fields(&mut out)?;
        Ok(out)
    }

    fn from_bytes(bytes: &[u8]) -> WireResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let write_version = cursor.read_u8().context_io("reading write_version")?;
        let revision = cursor.read_u8().context_io("reading revision")?;
        if revision > Self::WRITE_VERSION {
            return Err(WireError::UnsupportedRevision {
                write_version,
                found: revision,
            });
        }
        Self::read_fields(&mut cursor, revision)
    }
}

pub trait IoResultExt<T> {
    fn context_io(self, operation: &str) -> WireResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context_io(self, operation: &str) -> WireResult<T> {
        self.map_err(|source| WireError::Io {
            operation: operation.to_owned(),
            source,
        })
    }
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> WireResult<()> {
    let bytes = s.as_bytes();
    w.write_u16::<BigEndian>(bytes.len() as u16).context_io("writing string length")?;
    w.write_all(bytes).context_io("writing string bytes")
}

pub fn read_string<R: Read>(r: &mut R) -> WireResult<String> {
    let len = r.read_u16::<BigEndian>().context_io("reading string length")?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).context_io("reading string bytes")?;
    String::from_utf8(buf).map_err(|e| WireError::Malformed {
        operation: "reading string bytes".to_owned(),
        reason: e.to_string(),
    })
}

pub fn write_i64<W: Write>(w: &mut W, v: i64) -> WireResult<()> {
    w.write_i64::<BigEndian>(v).context_io("writing i64")
}

pub fn read_i64<R: Read>(r: &mut R) -> WireResult<i64> {
    r.read_i64::<BigEndian>().context_io("reading i64")
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> WireResult<()> {
    w.write_u64::<BigEndian>(v).context_io("writing u64")
}

pub fn read_u64<R: Read>(r: &mut R) -> WireResult<u64> {
    r.read_u64::<BigEndian>().context_io("reading u64")
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> WireResult<()> {
    w.write_u32::<BigEndian>(v).context_io("writing u32")
}

pub fn read_u32<R: Read>(r: &mut R) -> WireResult<u32> {
    r.read_u32::<BigEndian>().context_io("reading u32")
}

pub fn write_f64<W: Write>(w: &mut W, v: f64) -> WireResult<()> {
    w.write_f64::<BigEndian>(v).context_io("writing f64")
}

pub fn read_f64<R: Read>(r: &mut R) -> WireResult<f64> {
    r.read_f64::<BigEndian>().context_io("reading f64")
}

pub fn write_bool<W: Write>(w: &mut W, v: bool) -> WireResult<()> {
    w.write_u8(v as u8).context_io("writing bool")
}

pub fn read_bool<R: Read>(r: &mut R) -> WireResult<bool> {
    Ok(r.read_u8().context_io("reading bool")? != 0)
}

/// `u32`-length-prefixed `(key, value)*` map.
pub fn write_map<W, K, V>(w: &mut W, map: &HashMap<K, V>, write_key: impl Fn(&mut W, &K) -> WireResult<()>, write_val: impl Fn(&mut W, &V) -> WireResult<()>) -> WireResult<()>
where
    W: Write,
{
    w.write_u32::<BigEndian>(map.len() as u32).context_io("writing map length")?;
    for (k, v) in map {
        write_key(w, k)?;
        write_val(w, v)?;
    }
    Ok(())
}

pub fn read_map<R, K, V>(r: &mut R, read_key: impl Fn(&mut R) -> WireResult<K>, read_val: impl Fn(&mut R) -> WireResult<V>) -> WireResult<HashMap<K, V>>
where
    R: Read,
    K: std::hash::Hash + Eq,
{
    let len = r.read_u32::<BigEndian>().context_io("reading map length")?;
    let mut map = HashMap::with_capacity(len as usize);
    for _ in 0..len {
        let k = read_key(r)?;
        let v = read_val(r)?;
        map.insert(k, v);
    }
    Ok(map)
}

/// One presence byte followed by the value, or nothing.
pub fn write_option<W, T>(w: &mut W, opt: &Option<T>, write_val: impl Fn(&mut W, &T) -> WireResult<()>) -> WireResult<()>
where
    W: Write,
{
    match opt {
        Some(v) => {
            write_bool(w, true)?;
            write_val(w, v)
        }
        None => write_bool(w, false),
    }
}

pub fn read_option<R, T>(r: &mut R, read_val: impl Fn(&mut R) -> WireResult<T>) -> WireResult<Option<T>>
where
    R: Read,
{
    if read_bool(r)? {
        Ok(Some(read_val(r)?))
    } else {
        Ok(None)
    }
}

/// `scope/stream`, round-tripped through `Display`/`From<&str>` the same
/// way the controller client addresses a stream over the wire.
pub fn write_scoped_stream<W: Write>(w: &mut W, stream: &ScopedStream) -> WireResult<()> {
    write_string(w, &stream.to_string())
}

pub fn read_scoped_stream<R: Read>(r: &mut R) -> WireResult<ScopedStream> {
    Ok(ScopedStream::from(read_string(r)?.as_str()))
}

pub fn write_scoped_segment<W: Write>(w: &mut W, segment: &ScopedSegment) -> WireResult<()> {
    write_string(w, &segment.to_string())
}

pub fn read_scoped_segment<R: Read>(r: &mut R) -> WireResult<ScopedSegment> {
    Ok(ScopedSegment::from(read_string(r)?.as_str()))
}

pub fn write_segment_with_range<W: Write>(w: &mut W, segment: &SegmentWithRange) -> WireResult<()> {
    write_scoped_segment(w, &segment.scoped_segment)?;
    write_option(w, &segment.key_range, |w, (lo, hi)| {
        write_f64(w, lo.into_inner())?;
        write_f64(w, hi.into_inner())
    })
}

pub fn read_segment_with_range<R: Read>(r: &mut R) -> WireResult<SegmentWithRange> {
    let scoped_segment = read_scoped_segment(r)?;
    let key_range = read_option(r, |r| Ok((OrderedFloat(read_f64(r)?), OrderedFloat(read_f64(r)?))))?;
    Ok(SegmentWithRange::new(scoped_segment, key_range))
}

pub fn write_reader<W: Write>(w: &mut W, reader: &Reader) -> WireResult<()> {
    write_string(w, &reader.0)
}

pub fn read_reader<R: Read>(r: &mut R) -> WireResult<Reader> {
    Ok(Reader(read_string(r)?))
}

fn retention_type_tag(retention_type: RetentionType) -> u8 {
    match retention_type {
        RetentionType::None => 0,
        RetentionType::ManualReleaseAtUserStreamCut => 1,
        RetentionType::AutomaticReleaseAtLastCheckpoint => 2,
    }
}

fn retention_type_from_tag(tag: u8) -> WireResult<RetentionType> {
    match tag {
        0 => Ok(RetentionType::None),
        1 => Ok(RetentionType::ManualReleaseAtUserStreamCut),
        2 => Ok(RetentionType::AutomaticReleaseAtLastCheckpoint),
        other => Err(WireError::Malformed {
            operation: "reading retentionType".to_owned(),
            reason: format!("unknown retentionType tag {}", other),
        }),
    }
}

impl RevisionedSerializer for StreamCut {
    const WRITE_VERSION: u8 = 1;

    fn write_fields<W: Write>(&self, w: &mut W) -> WireResult<()> {
        write_map(w, &self.0, |w, k| write_u64(w, k.number), |w, v| write_i64(w, *v))
    }

    fn read_fields<R: Read>(r: &mut R, _revision: u8) -> WireResult<Self> {
        let positions = read_map(r, |r| Ok(Segment::new(read_u64(r)?)), read_i64)?;
        Ok(StreamCut::new(positions))
    }
}

impl RevisionedSerializer for ReaderGroupConfig {
    const WRITE_VERSION: u8 = 1;

    fn write_fields<W: Write>(&self, w: &mut W) -> WireResult<()> {
        write_map(w, &self.starting_stream_cuts, |w, k| write_scoped_stream(w, k), |w, v| v.write_fields(w))?;
        write_map(w, &self.ending_stream_cuts, |w, k| write_scoped_stream(w, k), |w, v| v.write_fields(w))?;
        w.write_u8(retention_type_tag(self.retention_type)).context_io("writing retentionType")?;
        write_u32(w, self.max_outstanding_checkpoint_request)?;
        write_bool(w, self.automatic_checkpoints_disabled)?;
        write_u64(w, self.group_refresh_time_millis)
    }

    fn read_fields<R: Read>(r: &mut R, revision: u8) -> WireResult<Self> {
        let starting_stream_cuts = read_map(r, |r| read_scoped_stream(r), |r| StreamCut::read_fields(r, revision))?;
        let ending_stream_cuts = read_map(r, |r| read_scoped_stream(r), |r| StreamCut::read_fields(r, revision))?;
        let retention_tag = r.read_u8().context_io("reading retentionType")?;
        let retention_type = retention_type_from_tag(retention_tag)?;
        let max_outstanding_checkpoint_request = read_u32(r)?;
        let automatic_checkpoints_disabled = read_bool(r)?;
        let group_refresh_time_millis = read_u64(r)?;
        Ok(ReaderGroupConfig {
            starting_stream_cuts,
            ending_stream_cuts,
            retention_type,
            max_outstanding_checkpoint_request,
            automatic_checkpoints_disabled,
            group_refresh_time_millis,
        })
    }
}
