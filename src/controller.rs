//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! The slice of the controller RPC surface the coordinator invokes.
//! Everything else a real controller client exposes — connection pooling,
//! TLS, the wire protocol — is out of scope; this module only names
//! the trait boundary and the error taxonomy of failures the coordinator
//! must classify as retryable or not.

use async_trait::async_trait;
use pravega_rust_client_shared::{Segment, ScopedSegment, ScopedStream, StreamCut};
use snafu::Snafu;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Snafu)]
pub enum ControllerError {
    #[snafu(display("connection reset talking to controller during {}: {}", operation, reason))]
    ConnectionReset { operation: String, reason: String },

    #[snafu(display("controller leader election in progress during {}", operation))]
    LeaderElection { operation: String },

    #[snafu(display("stream {} does not exist", stream))]
    InvalidStream { stream: String },
}

impl ControllerError {
    /// Classifies this failure as retryable per `RetryableUpstream`
    /// kind: connection resets and leader elections are transient; a
    /// missing stream is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControllerError::ConnectionReset { .. } | ControllerError::LeaderElection { .. })
    }
}

/// The set of segments between two stream-cuts together with, for each
/// segment, the predecessor segments that must be fully read before it is
/// eligible (mirrors `getSuccessors`'s `{segments, predecessors}` result).
#[derive(Debug, Clone, Default)]
pub struct Successors {
    pub segments: HashSet<Segment>,
    pub predecessors: HashMap<Segment, Vec<Segment>>,
}

#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn get_segments_at_time(&self, stream: &ScopedStream, timestamp: u64) -> Result<HashMap<Segment, i64>, ControllerError>;

    async fn get_successors(&self, stream: &ScopedStream, from: &StreamCut) -> Result<Successors, ControllerError>;

    async fn get_segments(&self, stream: &ScopedStream, from: &StreamCut, to: &StreamCut) -> Result<HashSet<Segment>, ControllerError>;

    /// Current write-head length of a segment still open for writes, used
    /// by `unreadBytes` when an ending cut does not bound it.
    async fn get_segment_length(&self, segment: &ScopedSegment) -> Result<i64, ControllerError>;

    /// NOP if `generation <= stored` — idempotent under replay.
    async fn add_subscriber(&self, stream: &ScopedStream, subscriber_id: &str, generation: u64) -> Result<(), ControllerError>;

    /// NOP if `generation < stored`.
    async fn update_subscriber_stream_cut(&self, stream: &ScopedStream, subscriber_id: &str, cut: &StreamCut, generation: u64) -> Result<(), ControllerError>;

    /// NOP if already deleted.
    async fn delete_subscriber(&self, stream: &ScopedStream, subscriber_id: &str, generation: u64) -> Result<(), ControllerError>;
}
