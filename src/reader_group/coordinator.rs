//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Component D. `ReaderGroupImpl` is the public entry point: it drives the
//! lifecycle state machine, owns the checkpoint polling loop,
//! computes stream-cuts and unread bytes, and reconciles
//! subscribers through component E on every lifecycle transition.
//!
//! Every mutating method goes through [`commit`], which wraps
//! [`apply_update`] so callers only ever write a pure
//! `Fn(&ReaderGroupState) -> Result<Option<ReaderGroupState>, SynchronizerError>`
//! closure, the same shape `StateUpdate::apply` already has.

use crate::controller::{ControllerClient, ControllerError};
use crate::error::{self, ReaderGroupError, Result};
use crate::reader_group::checkpoint::generate_silent_checkpoint_id;
use crate::reader_group::config::ConfigState;
use crate::reader_group::notifier::{EndOfDataNotification, NotifierHub, SegmentNotification};
use crate::reader_group::state::{ReaderGroupState, StateUpdate};
use crate::reader_group::subscriber;
use crate::scheduler::{Scheduler, CHECKPOINT_POLL_INTERVAL};
use crate::synchronizer::{apply_update, StateSynchronizer};
use pravega_rust_client_retry::RetryWithBackoff;
use pravega_rust_client_shared::{Reader, ReaderGroupConfig, ScopedSegment, ScopedStream, Segment, StreamCut};
use snafu::ResultExt;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Coordinates one reader group. `S` is the replicated value backing this
/// group's synchronizer; it is `Option<ReaderGroupState>` because the
/// group may not have been created yet, the same way a `TableSynchronizer`
/// is built over an optionally-empty table.
pub struct ReaderGroupImpl<S, C> {
    scope: String,
    group_name: String,
    synchronizer_segment_id: String,
    synchronizer: S,
    controller: C,
    retry: RetryWithBackoff,
    notifiers: NotifierHub,
}

impl<S, C> ReaderGroupImpl<S, C>
where
    S: StateSynchronizer<Option<ReaderGroupState>>,
    C: ControllerClient,
{
    pub fn new(scope: String, group_name: String, synchronizer_segment_id: String, synchronizer: S, controller: C, retry: RetryWithBackoff) -> Self {
        ReaderGroupImpl {
            scope,
            group_name,
            synchronizer_segment_id,
            synchronizer,
            controller,
            retry,
            notifiers: NotifierHub::default(),
        }
    }

    /// `groupName || synchronizer.segmentId`: stable for the
    /// lifetime of this state object, distinguishing this incarnation from
    /// any prior group of the same name.
    fn subscriber_id(&self) -> String {
        format!("{}{}", self.group_name, self.synchronizer_segment_id)
    }

    async fn snapshot(&mut self) -> Result<ReaderGroupState> {
        self.synchronizer.fetch_updates().await.context(error::Synchronizer { operation: "fetch" })?;
        self.synchronizer
            .current()
            .clone()
            .ok_or_else(|| ReaderGroupError::Fatal {
                message: "reader group state has not been created".to_owned(),
            })
    }

    /// Runs the optimistic retry loop for one state update, unwrapping the
    /// `Option<ReaderGroupState>` envelope so callers write plain
    /// `Fn(&ReaderGroupState) -> ...` closures. Fires notifications for
    /// whatever this call actually commits.
    async fn commit<F>(&mut self, operation: &str, transformer: F) -> Result<Option<ReaderGroupState>>
    where
        F: FnMut(&ReaderGroupState) -> std::result::Result<Option<ReaderGroupState>, crate::synchronizer::SynchronizerError>,
    {
        let mut transformer = transformer;
        self.synchronizer.fetch_updates().await.context(error::Synchronizer { operation: operation.to_owned() })?;
        let before = self.synchronizer.current().clone();
        let result = apply_update(&mut self.synchronizer, move |current: &Option<ReaderGroupState>| {
            let state = current.as_ref().ok_or_else(|| crate::synchronizer::SynchronizerError::SyncUpdateError {
                error_msg: "reader group state has not been created".to_owned(),
            })?;
            match transformer(state)? {
                Some(next) => Ok(Some(Some(next))),
                None => Ok(None),
            }
        })
        .await
        .context(error::Synchronizer { operation: operation.to_owned() })?;

        if let (Some(before), Some(Some(after))) = (before, result.clone()) {
            self.notifiers.notify_transition(&before, &after);
        }
        Ok(result.flatten())
    }

    // ---- lifecycle ------------------------------------------------------

    /// Creates the group if it does not already exist, then drives it to
    /// `READY`. A no-op if the group was already created by a racing
    /// coordinator — `createState` is idempotent.
    pub async fn create_state(&mut self, config: ReaderGroupConfig) -> Result<()> {
        self.synchronizer.fetch_updates().await.context(error::Synchronizer { operation: "fetch" })?;
        if self.synchronizer.current().is_none() {
            let initial_segments = self.initial_segments(&config).await?;
            let end_segments = self.end_segments(&config).await?;
            let state = ReaderGroupState::init(config, initial_segments, end_segments);
            self.synchronizer
                .write_unconditionally(Some(state))
                .await
                .context(error::Synchronizer { operation: "createState" })?;
        }
        self.advance_lifecycle().await
    }

    /// Starting segments for every stream in `config`: the segments live
    /// at each stream's starting cut, offset by that cut (or at time 0 for
    /// the unbounded sentinel).
    async fn initial_segments(&self, config: &ReaderGroupConfig) -> Result<HashMap<pravega_rust_client_shared::SegmentWithRange, i64>> {
        let mut segments = HashMap::new();
        for stream in config.streams() {
            let at_time = self
                .controller
                .get_segments_at_time(stream, 0)
                .await
                .context(error::Controller { operation: "getSegmentsAtTime" })?;
            for (segment, offset) in at_time {
                let scoped_segment = ScopedSegment::new(stream.clone(), segment);
                segments.insert(pravega_rust_client_shared::SegmentWithRange::new(scoped_segment, None), offset);
            }
        }
        Ok(segments)
    }

    async fn end_segments(&self, config: &ReaderGroupConfig) -> Result<HashMap<ScopedSegment, i64>> {
        let mut segments = HashMap::new();
        for (stream, cut) in &config.ending_stream_cuts {
            for (segment, _offset) in &cut.0 {
                let scoped_segment = ScopedSegment::new(stream.clone(), *segment);
                segments.insert(scoped_segment.clone(), cut.ending_offset(segment));
            }
        }
        Ok(segments)
    }

    /// Reads the current snapshot and dispatches on `configState` until the
    /// group reaches a stable state (`READY`) or a terminal one
    /// (`DELETING`, after `doDelete` has run).
    async fn advance_lifecycle(&mut self) -> Result<()> {
        loop {
            let state = self.snapshot().await?;
            match state.config_state {
                ConfigState::Initializing => self.do_init(&state).await?,
                ConfigState::Reinitializing => self.do_reinit(&state).await?,
                ConfigState::Ready => return Ok(()),
                ConfigState::Deleting => {
                    self.do_delete(&state).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn do_init(&mut self, state: &ReaderGroupState) -> Result<()> {
        let diff = subscriber::diff_for_init(&state.config);
        self.apply_subscriber_diff(&diff, state.generation).await?;
        let generation = state.generation;
        self.commit("doInit", move |s| {
            StateUpdate::ChangeConfigState {
                target: ConfigState::Ready,
                expected_generation: generation,
            }
            .apply(s)
        })
        .await?;
        info!(group = %self.group_name, "reader group initialized");
        Ok(())
    }

    async fn do_reinit(&mut self, state: &ReaderGroupState) -> Result<()> {
        let new_config = state.new_config.clone().expect("REINITIALIZING implies newConfig");
        let diff = subscriber::diff_for_reinit(&state.config, &new_config);
        self.apply_subscriber_diff(&diff, state.generation).await?;

        let segments = self.initial_segments(&new_config).await?;
        let end_segments = self.end_segments(&new_config).await?;
        self.commit("doReinit", move |s| StateUpdate::ResetComplete { segments: segments.clone(), end_segments: end_segments.clone() }.apply(s)).await?;
        info!(group = %self.group_name, generation = state.generation, "reader group reconfigured");
        Ok(())
    }

    async fn do_delete(&mut self, state: &ReaderGroupState) -> Result<()> {
        let diff = subscriber::diff_for_delete(&state.config);
        self.apply_subscriber_diff(&diff, state.generation).await?;
        info!(group = %self.group_name, "reader group deleted");
        Ok(())
    }

    async fn apply_subscriber_diff(&self, diff: &subscriber::SubscriberDiff, generation: u64) -> Result<()> {
        let subscriber_id = self.subscriber_id();
        for stream in &diff.to_subscribe {
            self.retry_controller("addSubscriber", || self.controller.add_subscriber(stream, &subscriber_id, generation)).await?;
        }
        for stream in &diff.to_unsubscribe {
            self.retry_controller("deleteSubscriber", || self.controller.delete_subscriber(stream, &subscriber_id, generation)).await?;
        }
        Ok(())
    }

    async fn retry_controller<F, Fut, T>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ControllerError>>,
    {
        self.retry
            .retry(op, ControllerError::is_retryable)
            .await
            .map_err(|e| {
                warn!(operation, error = %e, "controller call exhausted retries");
                e
            })
            .context(error::Controller { operation: operation.to_owned() })
    }

    /// Requests a reset to `new_config`. If another coordinator is already
    /// reinitializing the group, joins that transition rather than racing
    /// it (S4): both calls return without error once the (single) new
    /// generation is installed.
    pub async fn reset_reader_group(&mut self, new_config: ReaderGroupConfig) -> Result<()> {
        loop {
            let state = self.snapshot().await?;
            match state.config_state {
                ConfigState::Deleting => return Err(ReaderGroupError::ReinitializationRequired),
                ConfigState::Reinitializing => return self.advance_lifecycle().await,
                ConfigState::Initializing => {
                    return Err(ReaderGroupError::IllegalState {
                        operation: "resetReaderGroup".to_owned(),
                        found: state.config_state,
                    })
                }
                ConfigState::Ready => {
                    let proposed = new_config.clone();
                    let committed = self.commit("resetStart", move |s| StateUpdate::ResetStart { new_config: proposed.clone() }.apply(s)).await?;
                    if committed.is_some() {
                        return self.advance_lifecycle().await;
                    }
                    // lost the race; loop and re-read to join the winner's transition.
                }
            }
        }
    }

    pub async fn delete_state(&mut self) -> Result<()> {
        loop {
            let state = self.snapshot().await?;
            if state.config_state == ConfigState::Deleting {
                return self.advance_lifecycle().await;
            }
            let generation = state.generation;
            let committed = self
                .commit("deleteState", move |s| {
                    StateUpdate::ChangeConfigState {
                        target: ConfigState::Deleting,
                        expected_generation: generation,
                    }
                    .apply(s)
                })
                .await?;
            if committed.is_some() {
                return self.advance_lifecycle().await;
            }
        }
    }

    // ---- reader / segment bookkeeping ------------------------------------

    pub async fn add_reader(&mut self, reader: Reader) -> Result<()> {
        self.commit("addReader", move |s| StateUpdate::AddReader { reader: reader.clone() }.apply(s)).await?;
        Ok(())
    }

    /// Hands out the next unassigned segment, if any, to `reader`.
    pub async fn acquire_segment(&mut self, reader: Reader) -> Result<Option<ScopedSegment>> {
        let before = self.snapshot().await?;
        let after = self.commit("acquireSegment", move |s| StateUpdate::AcquireSegment { reader: reader.clone() }.apply(s)).await?;
        Ok(after.and_then(|after| {
            after
                .all_segments()
                .into_iter()
                .find(|seg| !before.all_segments().contains(seg))
                .map(|seg| seg.scoped_segment)
        }))
    }

    pub async fn release_segment(&mut self, reader: Reader, segment: ScopedSegment, offset: i64) -> Result<()> {
        self.commit("releaseSegment", move |s| {
            StateUpdate::ReleaseSegment {
                reader: reader.clone(),
                segment: segment.clone(),
                offset,
            }
            .apply(s)
        })
        .await?;
        Ok(())
    }

    pub async fn reader_offline(&mut self, reader: Reader, last_position: Option<HashMap<pravega_rust_client_shared::SegmentWithRange, i64>>) -> Result<()> {
        self.commit("readerOffline", move |s| {
            StateUpdate::ReaderOffline {
                reader: reader.clone(),
                last_position: last_position.clone(),
            }
            .apply(s)
        })
        .await?;
        Ok(())
    }

    /// A reader's side of the checkpoint protocol: records `reader`'s
    /// positions for an outstanding checkpoint. Not one of the client-facing
    /// client-facing operations — invoked by the reader process itself once it
    /// observes the checkpoint request, the way `readerOffline` is invoked
    /// by the reader's shutdown path rather than an external caller.
    pub async fn report_checkpoint_position(&mut self, id: &str, reader: Reader, segment_offsets: HashMap<ScopedSegment, i64>) -> Result<()> {
        let id = id.to_owned();
        self.commit("checkpointPositions", move |s| {
            StateUpdate::CheckpointPositions {
                id: id.clone(),
                reader: reader.clone(),
                segment_offsets: segment_offsets.clone(),
            }
            .apply(s)
        })
        .await?;
        Ok(())
    }

    pub async fn get_online_readers(&mut self) -> Result<HashSet<Reader>> {
        Ok(self.snapshot().await?.online_readers())
    }

    /// The FIFO of checkpoint ids a reader should currently expect to
    /// report against — what a reader bootstrapping against the group
    /// consults before calling [`Self::report_checkpoint_position`].
    pub async fn outstanding_checkpoints(&mut self) -> Result<Vec<String>> {
        Ok(self.snapshot().await?.checkpoint_state.outstanding().to_vec())
    }

    pub async fn get_stream_names(&mut self) -> Result<Vec<String>> {
        Ok(self.snapshot().await?.config.streams().map(ToString::to_string).collect())
    }

    pub async fn get_reader_segment_distribution(&mut self) -> Result<HashMap<Reader, usize>> {
        let state = self.snapshot().await?;
        Ok(state.assigned_segments.iter().map(|(reader, segments)| (reader.clone(), segments.len())).collect())
    }

    // ---- checkpoints ------------------------------------------------------

    /// Creates checkpoint `name` (if not already outstanding), polls the
    /// synchronizer at [`CHECKPOINT_POLL_INTERVAL`] until every pending
    /// reader has reported, then consumes it by clearing the FIFO up to and
    /// including it. Returns the completed positions.
    pub async fn initiate_checkpoint(&mut self, name: &str, scheduler: &dyn Scheduler) -> Result<HashMap<ScopedStream, StreamCut>> {
        let id = name.to_owned();
        let admitted = self
            .commit("createCheckpoint", {
                let id = id.clone();
                move |s| {
                    StateUpdate::CreateCheckpoint {
                        id: id.clone(),
                        max_outstanding: s.config.max_outstanding_checkpoint_request,
                    }
                    .apply(s)
                }
            })
            .await;
        match admitted {
            Err(ReaderGroupError::Synchronizer { source: crate::synchronizer::SynchronizerError::SyncUpdateError { .. }, .. }) => {
                let state = self.snapshot().await?;
                return Err(ReaderGroupError::MaxNumberOfCheckpointsExceeded {
                    outstanding: state.checkpoint_state.outstanding_count() as u32,
                });
            }
            other => {
                other?;
            }
        }

        loop {
            let state = self.snapshot().await?;
            if state.config_state == ConfigState::Deleting && !state.checkpoint_state.is_complete(&id) {
                return Err(ReaderGroupError::ReinitializationRequired);
            }
            if !state.checkpoint_state.is_complete(&id) && !state.checkpoint_state.contains(&id) {
                // A concurrent resetReaderGroup committed while this checkpoint was
                // outstanding; apply_reset_complete wipes checkpoint_state entirely,
                // so it will never report complete.
                return Err(ReaderGroupError::ReinitializationRequired);
            }
            if state.checkpoint_state.is_complete(&id) {
                let positions = state.checkpoint_state.completed_positions(&id);
                return self.consume_checkpoint(&id, positions).await;
            }
            debug!(checkpoint = %id, "polling for checkpoint completion");
            scheduler.sleep(CHECKPOINT_POLL_INTERVAL).await;
        }
    }

    async fn consume_checkpoint(&mut self, id: &str, positions: HashMap<ScopedStream, StreamCut>) -> Result<HashMap<ScopedStream, StreamCut>> {
        let cleared = self
            .commit("clearCheckpointsBefore", {
                let id = id.to_owned();
                let positions = positions.clone();
                move |s| StateUpdate::ClearCheckpointsBefore { id: id.clone(), positions: positions.clone() }.apply(s)
            })
            .await?;
        if cleared.is_some() {
            return Ok(positions);
        }
        // lost the clearing race; check whether the winner captured this id.
        let state = self.snapshot().await?;
        match state.checkpoint_state.last_completed {
            Some(completed) if completed.id == id => Ok(completed.positions),
            _ => Err(ReaderGroupError::CheckpointFailed { checkpoint_id: id.to_owned() }),
        }
    }

    /// Issues a silent checkpoint and projects its positions into a
    /// `map<Stream, StreamCut>` covering every stream in `config`, falling
    /// back to `lastReadPositions` for any stream the checkpoint omitted.
    pub async fn generate_stream_cuts(&mut self, scheduler: &dyn Scheduler) -> Result<HashMap<ScopedStream, StreamCut>> {
        let id = generate_silent_checkpoint_id();
        let mut positions = self.initiate_checkpoint(&id, scheduler).await?;
        let state = self.snapshot().await?;
        for stream in state.config.streams() {
            if !positions.contains_key(stream) {
                if let Some(last_read) = state.last_read_positions.get(stream) {
                    let map: HashMap<Segment, i64> = last_read.iter().map(|(s, o)| (s.scoped_segment.segment, *o)).collect();
                    positions.insert(stream.clone(), StreamCut::new(map));
                }
            }
        }
        Ok(positions)
    }

    /// Pins upstream truncation at `cuts`. Requires `READY`.
    pub async fn update_retention_stream_cut(&mut self, cuts: HashMap<ScopedStream, StreamCut>) -> Result<()> {
        let state = self.snapshot().await?;
        if state.config_state != ConfigState::Ready {
            return Err(ReaderGroupError::IllegalState {
                operation: "updateRetentionStreamCut".to_owned(),
                found: state.config_state,
            });
        }
        let subscriber_id = self.subscriber_id();
        for (stream, cut) in &cuts {
            self.retry_controller("updateSubscriberStreamCut", || self.controller.update_subscriber_stream_cut(stream, &subscriber_id, cut, state.generation))
                .await?;
        }
        Ok(())
    }

    pub async fn get_stream_cuts(&mut self) -> Result<HashMap<ScopedStream, StreamCut>> {
        let state = self.snapshot().await?;
        Ok(current_positions(&state))
    }

    /// Total bytes between each stream's current position and its
    /// configured ending cut (or current tail when unbounded), summed
    /// across every stream.
    pub async fn unread_bytes(&mut self) -> Result<i64> {
        let state = self.snapshot().await?;
        let positions = match &state.checkpoint_state.last_completed {
            Some(completed) => completed.positions.clone(),
            None => current_positions(&state),
        };

        let mut total = 0i64;
        for stream in state.config.streams() {
            let from = positions.get(stream).cloned().unwrap_or_else(StreamCut::unbounded);
            let to = state.config.ending_stream_cuts.get(stream).cloned().unwrap_or_else(StreamCut::unbounded);
            if to.is_unbounded() {
                let successors = self.controller.get_successors(stream, &from).await.context(error::Controller { operation: "getSuccessors" })?;
                for segment in successors.segments {
                    let scoped_segment = ScopedSegment::new(stream.clone(), segment);
                    let length = self.controller.get_segment_length(&scoped_segment).await.context(error::Controller { operation: "getSegmentLength" })?;
                    total += length - from.get(&segment).unwrap_or(0);
                }
            } else {
                let segments = self
                    .controller
                    .get_segments(stream, &from, &to)
                    .await
                    .context(error::Controller { operation: "getSegments" })?;
                for segment in segments {
                    total += to.ending_offset(&segment) - from.get(&segment).unwrap_or(0);
                }
            }
        }
        Ok(total)
    }

    pub fn get_segment_notifier(&self) -> broadcast::Receiver<SegmentNotification> {
        self.notifiers.segment_notifier()
    }

    pub fn get_end_of_data_notifier(&self) -> broadcast::Receiver<EndOfDataNotification> {
        self.notifiers.end_of_data_notifier()
    }
}

/// Range-erased `{stream -> StreamCut}` built from whichever positions are
/// currently live: assigned and unassigned segments, keyed by stream.
fn current_positions(state: &ReaderGroupState) -> HashMap<ScopedStream, StreamCut> {
    let mut by_stream: HashMap<ScopedStream, HashMap<Segment, i64>> = HashMap::new();
    for (segment, offset) in &state.unassigned_segments {
        by_stream.entry(segment.scoped_segment.stream.clone()).or_default().insert(segment.scoped_segment.segment, *offset);
    }
    for owned in state.assigned_segments.values() {
        for (segment, offset) in owned {
            by_stream.entry(segment.scoped_segment.stream.clone()).or_default().insert(segment.scoped_segment.segment, *offset);
        }
    }
    by_stream.into_iter().map(|(stream, positions)| (stream, StreamCut::new(positions))).collect()
}
