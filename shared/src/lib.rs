//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Data model shared between the reader group coordinator and the
//! controller client trait it talks to: streams, segments, stream-cuts and
//! reader group configuration. Deliberately free of any synchronizer or
//! controller RPC concerns so it can be depended on from either side without
//! a cycle.

use derive_new::new;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Sentinel offset meaning "latest segment position at the moment the group
/// observing it was created" when used in a starting stream-cut, or "read
/// until the segment ends" when used in an ending stream-cut. Ending-cut
/// consumers must promote it to [`i64::MAX`] before comparing offsets.
pub const UNBOUNDED_OFFSET: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
pub struct Scope {
    pub name: String,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
pub struct Stream {
    pub name: String,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Identity of a stream: `(scope, name)`. Opaque to the coordinator beyond
/// equality, hashing and display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
pub struct ScopedStream {
    pub scope: Scope,
    pub stream: Stream,
}

impl fmt::Display for ScopedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.stream)
    }
}

impl From<&str> for ScopedStream {
    fn from(s: &str) -> Self {
        let mut it = s.splitn(2, '/');
        let scope = it.next().expect("scope component");
        let stream = it.next().expect("stream component, expected scope/stream");
        ScopedStream {
            scope: Scope::new(scope.to_owned()),
            stream: Stream::new(stream.to_owned()),
        }
    }
}

/// A unit of parallelism within a stream. Segment numbers are unique within
/// a stream for the lifetime of that stream, so ordering by `number` is a
/// stable tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, new)]
pub struct Segment {
    pub number: u64,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number)
    }
}

/// Identity `(stream, segment)`, the key most of the coordinator's maps are
/// keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
pub struct ScopedSegment {
    pub stream: ScopedStream,
    pub segment: Segment,
}

impl fmt::Display for ScopedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.segment)
    }
}

impl From<&str> for ScopedSegment {
    fn from(s: &str) -> Self {
        let idx = s.rfind('/').expect("scoped segment must contain a segment suffix");
        let (stream_part, segment_part) = s.split_at(idx);
        let segment_part = &segment_part[1..];
        ScopedSegment {
            stream: ScopedStream::from(stream_part),
            segment: Segment::new(segment_part.parse().expect("segment number")),
        }
    }
}

/// A segment together with the key-space range it owns. The range is
/// present while a reassignment from a split/merge is still being handed
/// out; absent once the segment has settled into steady-state reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, new)]
pub struct SegmentWithRange {
    pub scoped_segment: ScopedSegment,
    pub key_range: Option<(OrderedFloat<f64>, OrderedFloat<f64>)>,
}

impl Eq for SegmentWithRange {}

impl std::hash::Hash for SegmentWithRange {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.scoped_segment.hash(state);
    }
}

impl fmt::Display for SegmentWithRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_range {
            Some((lo, hi)) => write!(f, "{}:{}-{}", self.scoped_segment, lo, hi),
            None => write!(f, "{}", self.scoped_segment),
        }
    }
}

/// A reader process's identity within its group. Readers choose their own
/// id on join; the coordinator only ever treats it as an opaque key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reader(pub String);

impl From<String> for Reader {
    fn from(s: String) -> Self {
        Reader(s)
    }
}

impl fmt::Display for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consistent cross-segment position on a stream: a per-segment offset
/// map. [`UNBOUNDED_OFFSET`] is the sentinel described above.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCut(pub HashMap<Segment, i64>);

impl StreamCut {
    pub fn new(positions: HashMap<Segment, i64>) -> Self {
        StreamCut(positions)
    }

    pub fn unbounded() -> Self {
        StreamCut(HashMap::new())
    }

    pub fn is_unbounded(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, segment: &Segment) -> Option<i64> {
        self.0.get(segment).copied()
    }

    /// The offset an ending cut implies for `segment`, promoting
    /// [`UNBOUNDED_OFFSET`] to [`i64::MAX`] per the wire contract.
    pub fn ending_offset(&self, segment: &Segment) -> i64 {
        match self.0.get(segment) {
            Some(&UNBOUNDED_OFFSET) | None => i64::MAX,
            Some(&offset) => offset,
        }
    }
}

/// A reader's owned `{segment -> offset}` snapshot at a moment in time.
pub type Position = HashMap<SegmentWithRange, i64>;

/// How upstream retention is driven by this group's stream-cuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionType {
    None,
    ManualReleaseAtUserStreamCut,
    AutomaticReleaseAtLastCheckpoint,
}

impl RetentionType {
    pub fn is_enabled(self) -> bool {
        !matches!(self, RetentionType::None)
    }
}

/// Immutable configuration bundle for a reader group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderGroupConfig {
    pub starting_stream_cuts: HashMap<ScopedStream, StreamCut>,
    pub ending_stream_cuts: HashMap<ScopedStream, StreamCut>,
    pub retention_type: RetentionType,
    pub max_outstanding_checkpoint_request: u32,
    pub automatic_checkpoints_disabled: bool,
    pub group_refresh_time_millis: u64,
}

impl ReaderGroupConfig {
    pub fn builder() -> ReaderGroupConfigBuilder {
        ReaderGroupConfigBuilder::default()
    }

    pub fn streams(&self) -> impl Iterator<Item = &ScopedStream> {
        self.starting_stream_cuts.keys()
    }
}

#[derive(Debug, Default)]
pub struct ReaderGroupConfigBuilder {
    starting_stream_cuts: HashMap<ScopedStream, StreamCut>,
    ending_stream_cuts: HashMap<ScopedStream, StreamCut>,
    retention_type: Option<RetentionType>,
    max_outstanding_checkpoint_request: Option<u32>,
    automatic_checkpoints_disabled: bool,
    group_refresh_time_millis: Option<u64>,
}

impl ReaderGroupConfigBuilder {
    pub fn stream(mut self, stream: ScopedStream) -> Self {
        self.starting_stream_cuts.insert(stream, StreamCut::unbounded());
        self
    }

    pub fn starting_stream_cut(mut self, stream: ScopedStream, cut: StreamCut) -> Self {
        self.starting_stream_cuts.insert(stream, cut);
        self
    }

    pub fn ending_stream_cut(mut self, stream: ScopedStream, cut: StreamCut) -> Self {
        self.ending_stream_cuts.insert(stream, cut);
        self
    }

    pub fn retention_type(mut self, retention_type: RetentionType) -> Self {
        self.retention_type = Some(retention_type);
        self
    }

    pub fn max_outstanding_checkpoint_request(mut self, n: u32) -> Self {
        self.max_outstanding_checkpoint_request = Some(n);
        self
    }

    pub fn automatic_checkpoints_disabled(mut self, disabled: bool) -> Self {
        self.automatic_checkpoints_disabled = disabled;
        self
    }

    pub fn group_refresh_time_millis(mut self, millis: u64) -> Self {
        self.group_refresh_time_millis = Some(millis);
        self
    }

    pub fn build(self) -> ReaderGroupConfig {
        ReaderGroupConfig {
            starting_stream_cuts: self.starting_stream_cuts,
            ending_stream_cuts: self.ending_stream_cuts,
            retention_type: self.retention_type.unwrap_or(RetentionType::None),
            max_outstanding_checkpoint_request: self.max_outstanding_checkpoint_request.unwrap_or(1),
            automatic_checkpoints_disabled: self.automatic_checkpoints_disabled,
            group_refresh_time_millis: self.group_refresh_time_millis.unwrap_or(3_000),
        }
    }
}

/// A config paired with the generation it was installed under, the unit the
/// synchronizer actually stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderGroupConfigVersioned {
    pub config: ReaderGroupConfig,
    pub generation: u64,
}
