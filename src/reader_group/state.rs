//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Components A and B: the replicated snapshot and the closed set of
//! updates applied to it. Every [`StateUpdate`] variant is a pure
//! `(state, params) -> newState` function, in the style of
//! `reader_group_state.rs::*_internal`, generalized to carry the checkpoint
//! and lifecycle state machines. [`ReaderGroupState::init`] is handled
//! outside the enum, the same way `TableSynchronizer::insert` special-cases
//! an empty table: it is only ever valid against an absent snapshot.

use crate::reader_group::checkpoint::CheckpointState;
use crate::reader_group::config::ConfigState;
use crate::synchronizer::SynchronizerError;
use pravega_rust_client_shared::{Reader, ReaderGroupConfig, ScopedSegment, ScopedStream, Segment, SegmentWithRange};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderGroupState {
    pub config: ReaderGroupConfig,
    pub new_config: Option<ReaderGroupConfig>,
    pub config_state: ConfigState,
    pub generation: u64,
    pub assigned_segments: HashMap<Reader, HashMap<SegmentWithRange, i64>>,
    pub unassigned_segments: HashMap<SegmentWithRange, i64>,
    pub end_segments: HashMap<ScopedSegment, i64>,
    pub last_read_positions: HashMap<ScopedStream, HashMap<SegmentWithRange, i64>>,
    pub checkpoint_state: CheckpointState,
    pub distance_to_tail: HashMap<Reader, i64>,
}

impl ReaderGroupState {
    /// Establishes the very first snapshot of a reader group. Only valid
    /// against an absent backing value — see [`crate::reader_group::coordinator::ReaderGroupImpl::create_state`].
    pub fn init(config: ReaderGroupConfig, initial_segments: HashMap<SegmentWithRange, i64>, end_segments: HashMap<ScopedSegment, i64>) -> ReaderGroupState {
        ReaderGroupState {
            config,
            new_config: None,
            config_state: ConfigState::Initializing,
            generation: 0,
            assigned_segments: HashMap::new(),
            unassigned_segments: initial_segments,
            end_segments,
            last_read_positions: HashMap::new(),
            checkpoint_state: CheckpointState::default(),
            distance_to_tail: HashMap::new(),
        }
    }

    pub fn online_readers(&self) -> HashSet<Reader> {
        self.assigned_segments.keys().cloned().collect()
    }

    pub fn all_segments(&self) -> HashSet<SegmentWithRange> {
        let mut all: HashSet<SegmentWithRange> = self.unassigned_segments.keys().cloned().collect();
        for owned in self.assigned_segments.values() {
            all.extend(owned.keys().cloned());
        }
        all
    }

    /// Checks this snapshot's structural invariants.
    /// Generation strictly increasing is a property of a
    /// *sequence* of snapshots, asserted in coordinator-level tests instead.
    #[cfg(test)]
    pub fn check_invariants(&self) -> Result<(), String> {
        let assigned_keys: HashSet<&SegmentWithRange> = self.assigned_segments.values().flat_map(|m| m.keys()).collect();
        let unassigned_keys: HashSet<&SegmentWithRange> = self.unassigned_segments.keys().collect();
        if !assigned_keys.is_disjoint(&unassigned_keys) {
            return Err("assigned and unassigned segments overlap".to_owned());
        }
        if self.online_readers() != self.assigned_segments.keys().cloned().collect() {
            return Err("online readers must equal keys(assignedSegments)".to_owned());
        }
        match self.config_state {
            ConfigState::Reinitializing => {
                if self.new_config.is_none() {
                    return Err("REINITIALIZING requires newConfig".to_owned());
                }
            }
            _ => {
                if self.new_config.is_some() {
                    return Err("newConfig must be absent outside REINITIALIZING".to_owned());
                }
            }
        }
        Ok(())
    }
}

/// Component B: the closed set of mutation operations. Each variant's
/// [`StateUpdate::apply`] arm is a pure function; side effects (subscriber
/// RPCs, polling sleeps) live entirely in `coordinator.rs`, after a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    ChangeConfigState {
        target: ConfigState,
        expected_generation: u64,
    },
    ResetStart {
        new_config: ReaderGroupConfig,
    },
    ResetComplete {
        segments: HashMap<SegmentWithRange, i64>,
        end_segments: HashMap<ScopedSegment, i64>,
    },
    AddReader {
        reader: Reader,
    },
    AcquireSegment {
        reader: Reader,
    },
    ReleaseSegment {
        reader: Reader,
        segment: ScopedSegment,
        offset: i64,
    },
    ReaderOffline {
        reader: Reader,
        last_position: Option<HashMap<SegmentWithRange, i64>>,
    },
    CreateCheckpoint {
        id: String,
        max_outstanding: u32,
    },
    CheckpointPositions {
        id: String,
        reader: Reader,
        segment_offsets: HashMap<ScopedSegment, i64>,
    },
    ClearCheckpointsBefore {
        id: String,
        positions: HashMap<ScopedStream, pravega_rust_client_shared::StreamCut>,
    },
}

impl StateUpdate {
    /// Applies this update to `state`. `Ok(None)` means the update is a
    /// no-op against this snapshot — either because it is stale
    /// (generation fencing, idempotent replay, a race already won by
    /// another coordinator) or because there was nothing to do (no
    /// unassigned segment to acquire). `Err` means the update is invalid
    /// against this snapshot regardless of races — a real invariant
    /// violation.
    pub fn apply(&self, state: &ReaderGroupState) -> Result<Option<ReaderGroupState>, SynchronizerError> {
        match self {
            StateUpdate::ChangeConfigState { target, expected_generation } => Self::apply_change_config_state(state, *target, *expected_generation),
            StateUpdate::ResetStart { new_config } => Self::apply_reset_start(state, new_config),
            StateUpdate::ResetComplete { segments, end_segments } => Self::apply_reset_complete(state, segments, end_segments),
            StateUpdate::AddReader { reader } => Self::apply_add_reader(state, reader),
            StateUpdate::AcquireSegment { reader } => Self::apply_acquire_segment(state, reader),
            StateUpdate::ReleaseSegment { reader, segment, offset } => Self::apply_release_segment(state, reader, segment, *offset),
            StateUpdate::ReaderOffline { reader, last_position } => Ok(Some(Self::apply_reader_offline(state, reader, last_position.as_ref()))),
            StateUpdate::CreateCheckpoint { id, max_outstanding } => Self::apply_create_checkpoint(state, id, *max_outstanding),
            StateUpdate::CheckpointPositions { id, reader, segment_offsets } => Ok(Self::apply_checkpoint_positions(state, id, reader, segment_offsets)),
            StateUpdate::ClearCheckpointsBefore { id, positions } => Ok(Self::apply_clear_checkpoints_before(state, id, positions)),
        }
    }

    fn apply_change_config_state(state: &ReaderGroupState, target: ConfigState, expected_generation: u64) -> Result<Option<ReaderGroupState>, SynchronizerError> {
        if state.generation != expected_generation {
            return Ok(None);
        }
        let allowed = matches!(
            (state.config_state, target),
            (_, ConfigState::Deleting) | (ConfigState::Initializing, ConfigState::Ready)
        );
        if !allowed {
            return Err(SynchronizerError::SyncUpdateError {
                error_msg: format!("illegal config state transition {:?} -> {:?}", state.config_state, target),
            });
        }
        if state.config_state == target {
            return Ok(None);
        }
        let mut next = state.clone();
        next.config_state = target;
        if target != ConfigState::Reinitializing {
            next.new_config = None;
        }
        next.generation = state.generation + 1;
        Ok(Some(next))
    }

    fn apply_reset_start(state: &ReaderGroupState, new_config: &ReaderGroupConfig) -> Result<Option<ReaderGroupState>, SynchronizerError> {
        if state.config_state != ConfigState::Ready {
            // A racing coordinator already moved this group into
            // REINITIALIZING (or it is being deleted); the caller should
            // refetch and join rather than retry this update.
            return Ok(None);
        }
        let mut next = state.clone();
        next.config_state = ConfigState::Reinitializing;
        next.new_config = Some(new_config.clone());
        next.generation = state.generation + 1;
        Ok(Some(next))
    }

    fn apply_reset_complete(state: &ReaderGroupState, segments: &HashMap<SegmentWithRange, i64>, end_segments: &HashMap<ScopedSegment, i64>) -> Result<Option<ReaderGroupState>, SynchronizerError> {
        if state.config_state != ConfigState::Reinitializing {
            return Ok(None);
        }
        let new_config = state.new_config.clone().expect("REINITIALIZING implies newConfig is set");
        let mut next = state.clone();
        next.config = new_config;
        next.new_config = None;
        next.config_state = ConfigState::Ready;
        next.unassigned_segments = segments.clone();
        next.end_segments = end_segments.clone();
        next.last_read_positions = HashMap::new();
        next.checkpoint_state = CheckpointState::default();
        for owned in next.assigned_segments.values_mut() {
            owned.clear();
        }
        for distance in next.distance_to_tail.values_mut() {
            *distance = i64::MAX;
        }
        Ok(Some(next))
    }

    fn apply_add_reader(state: &ReaderGroupState, reader: &Reader) -> Result<Option<ReaderGroupState>, SynchronizerError> {
        if state.assigned_segments.contains_key(reader) {
            return Err(SynchronizerError::SyncUpdateError {
                error_msg: format!("reader {} is already online", reader),
            });
        }
        let mut next = state.clone();
        next.assigned_segments.insert(reader.clone(), HashMap::new());
        next.distance_to_tail.insert(reader.clone(), i64::MAX);
        Ok(Some(next))
    }

    /// Hands out the lowest-numbered unassigned segment to `reader`. Pure
    /// and retry-safe: each retry re-reads `unassignedSegments` from the
    /// latest snapshot, so concurrent acquirers never observe the same
    /// winner.
    fn apply_acquire_segment(state: &ReaderGroupState, reader: &Reader) -> Result<Option<ReaderGroupState>, SynchronizerError> {
        if !state.assigned_segments.contains_key(reader) {
            return Err(SynchronizerError::SyncUpdateError {
                error_msg: format!("reader {} is not online", reader),
            });
        }
        let chosen = state
            .unassigned_segments
            .keys()
            .min_by_key(|s| s.scoped_segment.segment.number)
            .cloned();
        let chosen = match chosen {
            Some(s) => s,
            None => return Ok(None),
        };
        let offset = *state.unassigned_segments.get(&chosen).expect("chosen key came from this map");
        let mut next = state.clone();
        next.unassigned_segments.remove(&chosen);
        next.assigned_segments.get_mut(reader).expect("checked above").insert(chosen, offset);
        Ok(Some(next))
    }

    fn apply_release_segment(state: &ReaderGroupState, reader: &Reader, segment: &ScopedSegment, offset: i64) -> Result<Option<ReaderGroupState>, SynchronizerError> {
        let owned = state.assigned_segments.get(reader).ok_or_else(|| SynchronizerError::SyncUpdateError {
            error_msg: format!("reader {} is not online", reader),
        })?;
        let matching: Vec<SegmentWithRange> = owned.keys().filter(|s| &s.scoped_segment == segment).cloned().collect();
        if matching.len() != 1 {
            return Err(SynchronizerError::SyncUpdateError {
                error_msg: format!("expected exactly one owned range for segment {:?} but found {}", segment, matching.len()),
            });
        }
        let released = matching.into_iter().next().expect("checked len == 1");
        let mut next = state.clone();
        next.assigned_segments.get_mut(reader).expect("checked above").remove(&released);
        next.unassigned_segments.insert(released.clone(), offset);
        Self::record_last_read_position(&mut next, &released.scoped_segment, offset);
        Ok(Some(next))
    }

    fn apply_reader_offline(state: &ReaderGroupState, reader: &Reader, last_position: Option<&HashMap<SegmentWithRange, i64>>) -> ReaderGroupState {
        let mut next = state.clone();
        let owned = next.assigned_segments.remove(reader).unwrap_or_default();
        next.distance_to_tail.remove(reader);

        let mut positions_by_segment: HashMap<ScopedSegment, i64> = HashMap::new();
        for (segment, reported_offset) in &owned {
            let offset = last_position
                .and_then(|p| p.get(segment))
                .copied()
                .or_else(|| Self::last_read_position(&next, &segment.scoped_segment))
                .unwrap_or(*reported_offset);
            next.unassigned_segments.insert(segment.clone(), offset);
            positions_by_segment.insert(segment.scoped_segment.clone(), offset);
            Self::record_last_read_position(&mut next, &segment.scoped_segment, offset);
        }

        next.checkpoint_state = next.checkpoint_state.reader_went_offline(reader, &positions_by_segment);
        next
    }

    /// Records `offset` as the last reported read position for `segment`,
    /// keyed by the stream it belongs to. Stored with an empty key range
    /// since `SegmentWithRange`'s `Hash`/`Eq` only look at `scoped_segment`
    /// anyway, so lookups and overwrites are unaffected by whatever range
    /// was attached to the segment at assignment time.
    fn record_last_read_position(state: &mut ReaderGroupState, segment: &ScopedSegment, offset: i64) {
        state
            .last_read_positions
            .entry(segment.stream.clone())
            .or_default()
            .insert(SegmentWithRange::new(segment.clone(), None), offset);
    }

    fn last_read_position(state: &ReaderGroupState, segment: &ScopedSegment) -> Option<i64> {
        state
            .last_read_positions
            .get(&segment.stream)?
            .get(&SegmentWithRange::new(segment.clone(), None))
            .copied()
    }

    fn apply_create_checkpoint(state: &ReaderGroupState, id: &str, max_outstanding: u32) -> Result<Option<ReaderGroupState>, SynchronizerError> {
        if state.checkpoint_state.contains(id) {
            return Ok(None);
        }
        let online = state.online_readers();
        match state.checkpoint_state.create(id.to_owned(), &online, max_outstanding) {
            Ok(checkpoint_state) => {
                let mut next = state.clone();
                next.checkpoint_state = checkpoint_state;
                Ok(Some(next))
            }
            Err(_) => Err(SynchronizerError::SyncUpdateError {
                error_msg: "MaxNumberOfCheckpointsExceeded".to_owned(),
            }),
        }
    }

    fn apply_checkpoint_positions(state: &ReaderGroupState, id: &str, reader: &Reader, segment_offsets: &HashMap<ScopedSegment, i64>) -> Option<ReaderGroupState> {
        let checkpoint_state = state.checkpoint_state.report(id, reader, segment_offsets.clone())?;
        let mut next = state.clone();
        next.checkpoint_state = checkpoint_state;
        for (segment, offset) in segment_offsets {
            Self::record_last_read_position(&mut next, segment, *offset);
        }
        Some(next)
    }

    fn apply_clear_checkpoints_before(state: &ReaderGroupState, id: &str, positions: &HashMap<ScopedStream, pravega_rust_client_shared::StreamCut>) -> Option<ReaderGroupState> {
        let checkpoint_state = state.checkpoint_state.clear_before(id, positions.clone())?;
        let mut next = state.clone();
        next.checkpoint_state = checkpoint_state;
        Some(next)
    }
}

const CHANGE_CONFIG_STATE_TAG: u8 = 0;
const RESET_START_TAG: u8 = 1;
const RESET_COMPLETE_TAG: u8 = 2;
const ADD_READER_TAG: u8 = 3;
const ACQUIRE_SEGMENT_TAG: u8 = 4;
const RELEASE_SEGMENT_TAG: u8 = 5;
const READER_OFFLINE_TAG: u8 = 6;
const CREATE_CHECKPOINT_TAG: u8 = 7;
const CHECKPOINT_POSITIONS_TAG: u8 = 8;
const CLEAR_CHECKPOINTS_BEFORE_TAG: u8 = 9;

fn config_state_tag(config_state: ConfigState) -> u8 {
    match config_state {
        ConfigState::Initializing => 0,
        ConfigState::Ready => 1,
        ConfigState::Reinitializing => 2,
        ConfigState::Deleting => 3,
    }
}

fn config_state_from_tag(tag: u8) -> crate::wire::WireResult<ConfigState> {
    match tag {
        0 => Ok(ConfigState::Initializing),
        1 => Ok(ConfigState::Ready),
        2 => Ok(ConfigState::Reinitializing),
        3 => Ok(ConfigState::Deleting),
        other => Err(crate::wire::WireError::Malformed {
            operation: "reading configState".to_owned(),
            reason: format!("unknown configState tag {}", other),
        }),
    }
}

/// The wire form of every update committed through the synchronizer: a
/// variant tag byte followed by that variant's fields, built on the same
/// primitives [`ReaderGroupConfig`] and [`pravega_rust_client_shared::StreamCut`]
/// encode through.
impl crate::wire::RevisionedSerializer for StateUpdate {
    const WRITE_VERSION: u8 = 1;

    fn write_fields<W: std::io::Write>(&self, w: &mut W) -> crate::wire::WireResult<()> {
        use byteorder::WriteBytesExt;
        use crate::wire::*;
        match self {
            StateUpdate::ChangeConfigState { target, expected_generation } => {
                w.write_u8(CHANGE_CONFIG_STATE_TAG).context_io("writing StateUpdate tag")?;
                w.write_u8(config_state_tag(*target)).context_io("writing target configState")?;
                write_u64(w, *expected_generation)
            }
            StateUpdate::ResetStart { new_config } => {
                w.write_u8(RESET_START_TAG).context_io("writing StateUpdate tag")?;
                new_config.write_fields(w)
            }
            StateUpdate::ResetComplete { segments, end_segments } => {
                w.write_u8(RESET_COMPLETE_TAG).context_io("writing StateUpdate tag")?;
                write_map(w, segments, |w, k| write_segment_with_range(w, k), |w, v| write_i64(w, *v))?;
                write_map(w, end_segments, |w, k| write_scoped_segment(w, k), |w, v| write_i64(w, *v))
            }
            StateUpdate::AddReader { reader } => {
                w.write_u8(ADD_READER_TAG).context_io("writing StateUpdate tag")?;
                write_reader(w, reader)
            }
            StateUpdate::AcquireSegment { reader } => {
                w.write_u8(ACQUIRE_SEGMENT_TAG).context_io("writing StateUpdate tag")?;
                write_reader(w, reader)
            }
            StateUpdate::ReleaseSegment { reader, segment, offset } => {
                w.write_u8(RELEASE_SEGMENT_TAG).context_io("writing StateUpdate tag")?;
                write_reader(w, reader)?;
                write_scoped_segment(w, segment)?;
                write_i64(w, *offset)
            }
            StateUpdate::ReaderOffline { reader, last_position } => {
                w.write_u8(READER_OFFLINE_TAG).context_io("writing StateUpdate tag")?;
                write_reader(w, reader)?;
                write_option(w, last_position, |w, positions| write_map(w, positions, |w, k| write_segment_with_range(w, k), |w, v| write_i64(w, *v)))
            }
            StateUpdate::CreateCheckpoint { id, max_outstanding } => {
                w.write_u8(CREATE_CHECKPOINT_TAG).context_io("writing StateUpdate tag")?;
                write_string(w, id)?;
                write_u32(w, *max_outstanding)
            }
            StateUpdate::CheckpointPositions { id, reader, segment_offsets } => {
                w.write_u8(CHECKPOINT_POSITIONS_TAG).context_io("writing StateUpdate tag")?;
                write_string(w, id)?;
                write_reader(w, reader)?;
                write_map(w, segment_offsets, |w, k| write_scoped_segment(w, k), |w, v| write_i64(w, *v))
            }
            StateUpdate::ClearCheckpointsBefore { id, positions } => {
                w.write_u8(CLEAR_CHECKPOINTS_BEFORE_TAG).context_io("writing StateUpdate tag")?;
                write_string(w, id)?;
                write_map(w, positions, |w, k| write_scoped_stream(w, k), |w, v| v.write_fields(w))
            }
        }
    }

    fn read_fields<R: std::io::Read>(r: &mut R, revision: u8) -> crate::wire::WireResult<Self> {
        use byteorder::ReadBytesExt;
        use crate::wire::*;
        let tag = r.read_u8().context_io("reading StateUpdate tag")?;
        match tag {
            CHANGE_CONFIG_STATE_TAG => {
                let target = config_state_from_tag(r.read_u8().context_io("reading target configState")?)?;
                let expected_generation = read_u64(r)?;
                Ok(StateUpdate::ChangeConfigState { target, expected_generation })
            }
            RESET_START_TAG => {
                let new_config = ReaderGroupConfig::read_fields(r, revision)?;
                Ok(StateUpdate::ResetStart { new_config })
            }
            RESET_COMPLETE_TAG => {
                let segments = read_map(r, |r| read_segment_with_range(r), read_i64)?;
                let end_segments = read_map(r, |r| read_scoped_segment(r), read_i64)?;
                Ok(StateUpdate::ResetComplete { segments, end_segments })
            }
            ADD_READER_TAG => Ok(StateUpdate::AddReader { reader: read_reader(r)? }),
            ACQUIRE_SEGMENT_TAG => Ok(StateUpdate::AcquireSegment { reader: read_reader(r)? }),
            RELEASE_SEGMENT_TAG => {
                let reader = read_reader(r)?;
                let segment = read_scoped_segment(r)?;
                let offset = read_i64(r)?;
                Ok(StateUpdate::ReleaseSegment { reader, segment, offset })
            }
            READER_OFFLINE_TAG => {
                let reader = read_reader(r)?;
                let last_position = read_option(r, |r| read_map(r, |r| read_segment_with_range(r), read_i64))?;
                Ok(StateUpdate::ReaderOffline { reader, last_position })
            }
            CREATE_CHECKPOINT_TAG => {
                let id = read_string(r)?;
                let max_outstanding = read_u32(r)?;
                Ok(StateUpdate::CreateCheckpoint { id, max_outstanding })
            }
            CHECKPOINT_POSITIONS_TAG => {
                let id = read_string(r)?;
                let reader = read_reader(r)?;
                let segment_offsets = read_map(r, |r| read_scoped_segment(r), read_i64)?;
                Ok(StateUpdate::CheckpointPositions { id, reader, segment_offsets })
            }
            CLEAR_CHECKPOINTS_BEFORE_TAG => {
                let id = read_string(r)?;
                let positions = read_map(r, |r| read_scoped_stream(r), |r| pravega_rust_client_shared::StreamCut::read_fields(r, revision))?;
                Ok(StateUpdate::ClearCheckpointsBefore { id, positions })
            }
            other => Err(WireError::Malformed {
                operation: "reading StateUpdate".to_owned(),
                reason: format!("unknown StateUpdate tag {}", other),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pravega_rust_client_shared::{ReaderGroupConfig, Scope, Stream};

    fn config() -> ReaderGroupConfig {
        ReaderGroupConfig::builder().stream(ScopedStream::new(Scope::new("scope".into()), Stream::new("stream".into()))).build()
    }

    fn segment(number: u64) -> SegmentWithRange {
        let scoped_segment = ScopedSegment::new(ScopedStream::new(Scope::new("scope".into()), Stream::new("stream".into())), Segment::new(number));
        SegmentWithRange::new(scoped_segment, None)
    }

    fn fresh_state(segments: &[u64]) -> ReaderGroupState {
        let initial = segments.iter().map(|&n| (segment(n), 0i64)).collect();
        ReaderGroupState::init(config(), initial, HashMap::new())
    }

    #[test]
    fn add_reader_then_acquire_segment_picks_lowest_number() {
        let state = fresh_state(&[3, 1, 2]);
        let state = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        assert!(state.check_invariants().is_ok());

        let state = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let owned = &state.assigned_segments[&Reader::from("r1".to_owned())];
        assert_eq!(owned.len(), 1);
        assert!(owned.contains_key(&segment(1)));
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn acquire_segment_is_a_no_op_once_exhausted() {
        let state = fresh_state(&[1]);
        let state = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let state = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let result = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn add_reader_twice_is_rejected() {
        let state = fresh_state(&[1]);
        let state = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let err = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&state).unwrap_err();
        assert!(matches!(err, SynchronizerError::SyncUpdateError { .. }));
    }

    #[test]
    fn reader_offline_returns_segments_to_unassigned_at_last_position() {
        let state = fresh_state(&[1, 2]);
        let state = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let state = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let state = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();

        let mut last_position = HashMap::new();
        last_position.insert(segment(1), 42);
        let result = StateUpdate::ReaderOffline {
            reader: Reader::from("r1".into()),
            last_position: Some(last_position),
        }
        .apply(&state)
        .unwrap()
        .unwrap();

        assert!(!result.assigned_segments.contains_key(&Reader::from("r1".to_owned())));
        assert_eq!(result.unassigned_segments.len(), 2);
        assert_eq!(result.unassigned_segments.get(&segment(1)), Some(&42));
        assert!(result.check_invariants().is_ok());
    }

    #[test]
    fn reset_start_is_a_no_op_when_not_ready() {
        let state = fresh_state(&[1]);
        let result = StateUpdate::ResetStart { new_config: config() }.apply(&state).unwrap();
        // fresh_state is INITIALIZING, not READY.
        assert!(result.is_none());
    }

    #[test]
    fn reset_start_then_complete_clears_assignments_and_bumps_generation() {
        let state = fresh_state(&[1]);
        let mut ready = state.clone();
        ready.config_state = ConfigState::Ready;
        let state = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&ready).unwrap().unwrap();
        let state = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();

        let new_config = ReaderGroupConfig::builder()
            .stream(ScopedStream::new(Scope::new("scope".into()), Stream::new("stream2".into())))
            .build();
        let state = StateUpdate::ResetStart { new_config: new_config.clone() }.apply(&state).unwrap().unwrap();
        assert_eq!(state.config_state, ConfigState::Reinitializing);
        assert_eq!(state.generation, 1);
        assert_eq!(state.new_config, Some(new_config.clone()));

        let mut new_segments = HashMap::new();
        new_segments.insert(segment(9), 0i64);
        let state = StateUpdate::ResetComplete {
            segments: new_segments.clone(),
            end_segments: HashMap::new(),
        }
        .apply(&state)
        .unwrap()
        .unwrap();

        assert_eq!(state.config_state, ConfigState::Ready);
        assert!(state.new_config.is_none());
        assert_eq!(state.config, new_config);
        assert_eq!(state.unassigned_segments, new_segments);
        // reader stayed online but its old assignment is gone.
        assert!(state.assigned_segments[&Reader::from("r1".to_owned())].is_empty());
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn checkpoint_cap_is_enforced_atomically_inside_apply() {
        let state = fresh_state(&[1]);
        let state = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let state = StateUpdate::CreateCheckpoint { id: "c1".into(), max_outstanding: 1 }.apply(&state).unwrap().unwrap();
        let err = StateUpdate::CreateCheckpoint { id: "c2".into(), max_outstanding: 1 }.apply(&state).unwrap_err();
        assert!(matches!(err, SynchronizerError::SyncUpdateError { .. }));
    }

    #[test]
    fn change_config_state_bumps_generation_on_every_transition() {
        let state = fresh_state(&[1]);
        assert_eq!(state.generation, 0);

        let state = StateUpdate::ChangeConfigState {
            target: ConfigState::Ready,
            expected_generation: 0,
        }
        .apply(&state)
        .unwrap()
        .unwrap();
        assert_eq!(state.config_state, ConfigState::Ready);
        assert_eq!(state.generation, 1);

        let state = StateUpdate::ChangeConfigState {
            target: ConfigState::Deleting,
            expected_generation: 1,
        }
        .apply(&state)
        .unwrap()
        .unwrap();
        assert_eq!(state.config_state, ConfigState::Deleting);
        assert_eq!(state.generation, 2);
    }

    #[test]
    fn change_config_state_to_deleting_clears_new_config_when_reinitializing() {
        let state = fresh_state(&[1]);
        let mut ready = state.clone();
        ready.config_state = ConfigState::Ready;
        let reinitializing = StateUpdate::ResetStart { new_config: config() }.apply(&ready).unwrap().unwrap();
        assert!(reinitializing.new_config.is_some());

        let deleting = StateUpdate::ChangeConfigState {
            target: ConfigState::Deleting,
            expected_generation: reinitializing.generation,
        }
        .apply(&reinitializing)
        .unwrap()
        .unwrap();

        assert_eq!(deleting.config_state, ConfigState::Deleting);
        assert!(deleting.new_config.is_none());
        assert!(deleting.check_invariants().is_ok());
    }

    #[test]
    fn release_segment_records_last_read_position() {
        let state = fresh_state(&[1]);
        let state = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let state = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();

        let state = StateUpdate::ReleaseSegment {
            reader: Reader::from("r1".into()),
            segment: segment(1).scoped_segment,
            offset: 77,
        }
        .apply(&state)
        .unwrap()
        .unwrap();

        let stream = segment(1).scoped_segment.stream;
        let recorded = state.last_read_positions.get(&stream).expect("stream recorded");
        assert_eq!(recorded.get(&segment(1)), Some(&77));
    }

    #[test]
    fn reader_offline_falls_back_to_last_read_position_before_reported_offset() {
        let state = fresh_state(&[1]);
        let state = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let state = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();

        // r1 releases with an explicit offset, recording it in last_read_positions...
        let state = StateUpdate::ReleaseSegment {
            reader: Reader::from("r1".into()),
            segment: segment(1).scoped_segment,
            offset: 55,
        }
        .apply(&state)
        .unwrap()
        .unwrap();
        let state = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();

        // ...then goes offline with no explicit last_position. The stale
        // acquire-time reported offset (55) is not what should win; it already
        // matches last_read_positions here, so we also check it propagates when
        // the reported offset diverges by overwriting unassigned_segments directly.
        let mut stale = state.clone();
        stale.assigned_segments.get_mut(&Reader::from("r1".to_owned())).unwrap().insert(segment(1), 999);

        let result = StateUpdate::ReaderOffline {
            reader: Reader::from("r1".into()),
            last_position: None,
        }
        .apply(&stale)
        .unwrap()
        .unwrap();

        assert_eq!(result.unassigned_segments.get(&segment(1)), Some(&55));
    }

    #[test]
    fn checkpoint_positions_records_last_read_position() {
        let state = fresh_state(&[1]);
        let state = StateUpdate::AddReader { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let state = StateUpdate::AcquireSegment { reader: Reader::from("r1".into()) }.apply(&state).unwrap().unwrap();
        let state = StateUpdate::CreateCheckpoint { id: "c1".into(), max_outstanding: 1 }.apply(&state).unwrap().unwrap();

        let mut segment_offsets = HashMap::new();
        segment_offsets.insert(segment(1).scoped_segment, 123i64);
        let state = StateUpdate::CheckpointPositions {
            id: "c1".into(),
            reader: Reader::from("r1".into()),
            segment_offsets,
        }
        .apply(&state)
        .unwrap();

        let stream = segment(1).scoped_segment.stream;
        let recorded = state.last_read_positions.get(&stream).expect("stream recorded");
        assert_eq!(recorded.get(&segment(1)), Some(&123));
    }

    #[test]
    fn state_update_round_trips_through_the_wire_format() {
        use crate::wire::RevisionedSerializer;

        let update = StateUpdate::ReleaseSegment {
            reader: Reader::from("r1".into()),
            segment: segment(1).scoped_segment,
            offset: 42,
        };
        let bytes = update.to_bytes().expect("serialize");
        let back = StateUpdate::from_bytes(&bytes).expect("deserialize");
        assert_eq!(update, back);

        let checkpoint = StateUpdate::CreateCheckpoint { id: "c1".into(), max_outstanding: 3 };
        let bytes = checkpoint.to_bytes().expect("serialize");
        let back = StateUpdate::from_bytes(&bytes).expect("deserialize");
        assert_eq!(checkpoint, back);

        let mut last_position = HashMap::new();
        last_position.insert(segment(1), 9i64);
        let offline = StateUpdate::ReaderOffline {
            reader: Reader::from("r1".into()),
            last_position: Some(last_position),
        };
        let bytes = offline.to_bytes().expect("serialize");
        let back = StateUpdate::from_bytes(&bytes).expect("deserialize");
        assert_eq!(offline, back);

        let reset_start = StateUpdate::ResetStart { new_config: config() };
        let bytes = reset_start.to_bytes().expect("serialize");
        let back = StateUpdate::from_bytes(&bytes).expect("deserialize");
        assert_eq!(reset_start, back);
    }
}
