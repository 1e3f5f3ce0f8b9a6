//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Component C: the checkpoint sub-engine. Tracks outstanding checkpoints,
//! per-reader reported positions, the completion predicate, the
//! silent-vs-observable flag and FIFO clearing. Every method here is a pure
//! function over `&CheckpointState` producing a new `CheckpointState`; the
//! synchronizer retry loop in [`crate::synchronizer::apply_update`] is what
//! actually commits the result.

use base64::URL_SAFE_NO_PAD;
use pravega_rust_client_shared::{Reader, ScopedSegment, ScopedStream, Segment, StreamCut};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const SILENT_SUFFIX: &str = "_SILENT_";

pub type CheckpointId = String;

/// Generates a checkpoint id for an internal, silent checkpoint: 32 random
/// bytes, base64url-encoded, with the `_SILENT_` suffix appended. At
/// 2^-128 collision probability a collision is treated as undefined
/// behavior.
pub fn generate_silent_checkpoint_id() -> CheckpointId {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", base64::encode_config(bytes, URL_SAFE_NO_PAD), SILENT_SUFFIX)
}

pub fn is_silent(id: &str) -> bool {
    id.ends_with(SILENT_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedCheckpoint {
    pub id: CheckpointId,
    pub positions: HashMap<ScopedStream, StreamCut>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// FIFO order of checkpoints that have been created but not yet cleared.
    outstanding: Vec<CheckpointId>,
    /// The online readers snapshotted at creation time for each checkpoint.
    pending_readers: HashMap<CheckpointId, HashSet<Reader>>,
    /// Reported positions, keyed by reader, for each checkpoint.
    reported: HashMap<CheckpointId, HashMap<Reader, HashMap<ScopedSegment, i64>>>,
    pub last_completed: Option<CompletedCheckpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointAdmissionError {
    MaxOutstandingExceeded { outstanding: u32 },
}

impl CheckpointState {
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn outstanding(&self) -> &[CheckpointId] {
        &self.outstanding
    }

    pub fn contains(&self, id: &str) -> bool {
        self.outstanding.iter().any(|o| o == id)
    }

    pub fn is_silent_checkpoint(&self, id: &str) -> bool {
        is_silent(id)
    }

    /// Admits a new checkpoint iff `|outstanding| < max_outstanding`. The
    /// admission decision and the FIFO append happen in the same pure step
    /// so two racing `CreateCheckpoint` updates can never both slip past
    /// the cap — the synchronizer's CAS serializes them.
    pub fn create(&self, id: CheckpointId, online_readers: &HashSet<Reader>, max_outstanding: u32) -> Result<CheckpointState, CheckpointAdmissionError> {
        if self.outstanding.len() >= max_outstanding as usize {
            return Err(CheckpointAdmissionError::MaxOutstandingExceeded {
                outstanding: self.outstanding.len() as u32,
            });
        }
        let mut next = self.clone();
        next.outstanding.push(id.clone());
        next.pending_readers.insert(id.clone(), online_readers.clone());
        next.reported.insert(id, HashMap::new());
        Ok(next)
    }

    /// Records `reader`'s reported positions for `id`. A no-op (returns
    /// `None`) if `id` is no longer outstanding — it was already cleared by
    /// a racing coordinator.
    pub fn report(&self, id: &str, reader: &Reader, positions: HashMap<ScopedSegment, i64>) -> Option<CheckpointState> {
        if !self.contains(id) {
            return None;
        }
        let mut next = self.clone();
        next.reported.get_mut(id).expect("outstanding checkpoint has a reported entry").insert(reader.clone(), positions);
        Some(next)
    }

    /// Treats `reader` as having implicitly reported `last_position` for
    /// every outstanding checkpoint that still expects a report from it —
    /// called when a reader goes offline before checkpointing.
    pub fn reader_went_offline(&self, reader: &Reader, last_position: &HashMap<ScopedSegment, i64>) -> CheckpointState {
        let mut next = self.clone();
        for id in &next.outstanding.clone() {
            let pending = next.pending_readers.get(id).map_or(false, |set| set.contains(reader));
            if !pending {
                continue;
            }
            let reported = next.reported.get_mut(id).expect("outstanding checkpoint has a reported entry");
            reported.entry(reader.clone()).or_insert_with(|| last_position.clone());
        }
        next
    }

    /// A checkpoint is complete once every reader pending at creation time
    /// has a reported entry (offline readers substitute their last known
    /// position via [`Self::reader_went_offline`]).
    pub fn is_complete(&self, id: &str) -> bool {
        match (self.pending_readers.get(id), self.reported.get(id)) {
            (Some(pending), Some(reported)) => pending.iter().all(|r| reported.contains_key(r)),
            _ => false,
        }
    }

    /// The union of all reporters' positions for a complete checkpoint,
    /// projected into a `map<Stream, StreamCut>`.
    pub fn completed_positions(&self, id: &str) -> HashMap<ScopedStream, StreamCut> {
        let mut by_stream: HashMap<ScopedStream, HashMap<Segment, i64>> = HashMap::new();
        if let Some(reported) = self.reported.get(id) {
            for positions in reported.values() {
                for (segment, offset) in positions {
                    by_stream.entry(segment.stream.clone()).or_default().insert(segment.segment, *offset);
                }
            }
        }
        by_stream.into_iter().map(|(stream, positions)| (stream, StreamCut::new(positions))).collect()
    }

    /// Pops the FIFO up to and including `id`, recording `positions` as the
    /// new `last_completed` entry. A no-op if `id` is not (or no longer)
    /// outstanding — a racing coordinator already cleared it.
    pub fn clear_before(&self, id: &str, positions: HashMap<ScopedStream, StreamCut>) -> Option<CheckpointState> {
        let idx = self.outstanding.iter().position(|o| o == id)?;
        let mut next = self.clone();
        for cleared in next.outstanding.drain(..=idx).collect::<Vec<_>>() {
            next.pending_readers.remove(&cleared);
            next.reported.remove(&cleared);
        }
        next.last_completed = Some(CompletedCheckpoint {
            id: id.to_owned(),
            positions,
        });
        Some(next)
    }
}
