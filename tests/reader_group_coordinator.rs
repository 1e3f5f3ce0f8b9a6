//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Coordinator-level scenarios against an in-memory synchronizer and a
//! mock controller, standing in for the real segment store / controller
//! the way `MockType` stands in for a real connection in the `reactors.rs`
//! test module.

use async_trait::async_trait;
use pravega_client_rust::controller::{ControllerClient, ControllerError, Successors};
use pravega_client_rust::error::ReaderGroupError;
use pravega_client_rust::reader_group::ReaderGroupImpl;
use pravega_client_rust::scheduler::test_support::VirtualScheduler;
use pravega_client_rust::scheduler::{Scheduler, TokioScheduler};
use pravega_client_rust::synchronizer::{InMemoryStateSynchronizer, InMemoryStore};
use pravega_rust_client_shared::{Reader, ReaderGroupConfig, ScopedSegment, ScopedStream, Segment, SegmentWithRange, StreamCut};
use pravega_rust_client_retry::RetryWithBackoff;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Clone, Default)]
struct MockControllerClient;

#[async_trait]
impl ControllerClient for MockControllerClient {
    async fn get_segments_at_time(&self, _stream: &ScopedStream, _timestamp: u64) -> Result<HashMap<Segment, i64>, ControllerError> {
        let mut map = HashMap::new();
        map.insert(Segment::new(0), 0);
        Ok(map)
    }

    async fn get_successors(&self, _stream: &ScopedStream, _from: &StreamCut) -> Result<Successors, ControllerError> {
        Ok(Successors::default())
    }

    async fn get_segments(&self, _stream: &ScopedStream, _from: &StreamCut, _to: &StreamCut) -> Result<HashSet<Segment>, ControllerError> {
        Ok(HashSet::new())
    }

    async fn get_segment_length(&self, _segment: &ScopedSegment) -> Result<i64, ControllerError> {
        Ok(0)
    }

    async fn add_subscriber(&self, _stream: &ScopedStream, _subscriber_id: &str, _generation: u64) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn update_subscriber_stream_cut(&self, _stream: &ScopedStream, _subscriber_id: &str, _cut: &StreamCut, _generation: u64) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn delete_subscriber(&self, _stream: &ScopedStream, _subscriber_id: &str, _generation: u64) -> Result<(), ControllerError> {
        Ok(())
    }
}

type Coordinator = ReaderGroupImpl<InMemoryStateSynchronizer<Option<pravega_client_rust::reader_group::ReaderGroupState>>, MockControllerClient>;

fn config(max_outstanding: u32) -> ReaderGroupConfig {
    ReaderGroupConfig::builder()
        .stream(ScopedStream::from("scope/stream"))
        .max_outstanding_checkpoint_request(max_outstanding)
        .build()
}

fn coordinator(store: &InMemoryStore<Option<pravega_client_rust::reader_group::ReaderGroupState>>, group_name: &str) -> Coordinator {
    ReaderGroupImpl::new(
        "scope".to_owned(),
        group_name.to_owned(),
        "segment-0".to_owned(),
        InMemoryStateSynchronizer::new(store.clone()),
        MockControllerClient::default(),
        RetryWithBackoff::default(),
    )
}

/// S2: the third checkpoint beyond the configured cap is rejected.
#[tokio::test]
async fn checkpoint_admission_is_capped() {
    let store = InMemoryStore::new(None);
    let mut leader = coordinator(&store, "group");
    leader.create_state(config(2)).await.expect("create state");
    leader.add_reader(Reader::from("r1".to_owned())).await.expect("add reader");

    // c1 and c2 are admitted and then left outstanding forever (no reader
    // ever reports), each polling in the background.
    for id in ["c1", "c2"] {
        let mut bg = coordinator(&store, "group");
        let id = id.to_owned();
        tokio::spawn(async move {
            let _ = bg.initiate_checkpoint(&id, &TokioScheduler).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut third = coordinator(&store, "group");
    let err = third.initiate_checkpoint("c3", &TokioScheduler).await.unwrap_err();
    assert!(matches!(err, ReaderGroupError::MaxNumberOfCheckpointsExceeded { outstanding: 2 }));
}

/// S4: two coordinators racing `resetReaderGroup` both return without
/// error, and the generation advances exactly once.
#[tokio::test]
async fn reset_race_converges_to_one_generation() {
    let store = InMemoryStore::new(None);
    let mut setup = coordinator(&store, "group");
    setup.create_state(config(1)).await.expect("create state");

    let new_config = ReaderGroupConfig::builder().stream(ScopedStream::from("scope/stream2")).build();

    let mut a = coordinator(&store, "group");
    let mut b = coordinator(&store, "group");
    let config_a = new_config.clone();
    let config_b = new_config.clone();

    let (result_a, result_b) = tokio::join!(async move { a.reset_reader_group(config_a).await }, async move { b.reset_reader_group(config_b).await });
    assert!(result_a.is_ok());
    assert!(result_b.is_ok());

    let mut verifier = coordinator(&store, "group");
    assert_eq!(verifier.get_stream_names().await.unwrap(), vec!["scope/stream2".to_owned()]);
}

/// S5: a reader going offline before reporting still lets its checkpoint
/// complete, using its last reported position.
#[tokio::test]
async fn checkpoint_completes_using_offline_readers_last_position() {
    let store = InMemoryStore::new(None);
    let mut leader = coordinator(&store, "group");
    leader.create_state(config(1)).await.expect("create state");
    leader.add_reader(Reader::from("r1".to_owned())).await.expect("add r1");
    leader.add_reader(Reader::from("r2".to_owned())).await.expect("add r2");
    // the stream has a single segment; r2 grabs it, so its last reported
    // offset is what the completed checkpoint must carry.
    let owned_segment = leader.acquire_segment(Reader::from("r2".to_owned())).await.expect("acquire segment").expect("one segment to acquire");

    let checkpoint_id = "c-s5".to_owned();
    let mut checkpointer = coordinator(&store, "group");
    let handle = tokio::spawn(async move { checkpointer.initiate_checkpoint(&checkpoint_id, &TokioScheduler).await });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut r1 = coordinator(&store, "group");
    r1.report_checkpoint_position("c-s5", Reader::from("r1".to_owned()), HashMap::new()).await.expect("r1 reports");

    let mut r2 = coordinator(&store, "group");
    let mut last_position = HashMap::new();
    last_position.insert(SegmentWithRange { scoped_segment: owned_segment.clone(), key_range: None }, 42i64);
    r2.reader_offline(Reader::from("r2".to_owned()), Some(last_position)).await.expect("r2 goes offline");

    let positions = handle.await.expect("task").expect("checkpoint completes");
    let stream = ScopedStream::from("scope/stream");
    assert_eq!(positions.get(&stream).expect("stream cut present").get(&Segment::new(0)), Some(42));

    let mut verifier = coordinator(&store, "group");
    let online = verifier.get_online_readers().await.unwrap();
    assert!(!online.contains(&Reader::from("r2".to_owned())));
}

/// S6: deleting the group while a checkpoint is outstanding surfaces
/// `ReinitializationRequired` rather than hanging.
#[tokio::test]
async fn delete_during_checkpoint_surfaces_reinitialization_required() {
    let store = InMemoryStore::new(None);
    let mut leader = coordinator(&store, "group");
    leader.create_state(config(1)).await.expect("create state");
    leader.add_reader(Reader::from("r1".to_owned())).await.expect("add reader");

    let mut checkpointer = coordinator(&store, "group");
    let handle = tokio::spawn(async move { checkpointer.initiate_checkpoint("c-s6", &TokioScheduler).await });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut deleter = coordinator(&store, "group");
    deleter.delete_state().await.expect("delete state");

    let result = handle.await.expect("task");
    assert!(matches!(result, Err(ReaderGroupError::ReinitializationRequired)));
}

/// S6 again, but with `tokio::time::pause()` driving the poll loop: the
/// reset commits on a task that never sleeps, so the checkpointer's poll
/// wakes on the very next virtual tick rather than a real 500ms wait.
#[tokio::test(start_paused = true)]
async fn reset_during_checkpoint_surfaces_reinitialization_required_with_virtual_clock() {
    let store = InMemoryStore::new(None);
    let mut leader = coordinator(&store, "group");
    leader.create_state(config(1)).await.expect("create state");
    leader.add_reader(Reader::from("r1".to_owned())).await.expect("add reader");

    let mut checkpointer = coordinator(&store, "group");
    let handle = tokio::spawn(async move { checkpointer.initiate_checkpoint("c-virtual", &VirtualScheduler).await });

    // Give the spawned task a chance to register its first poll wait
    // before the reset commits, without advancing the virtual clock.
    tokio::task::yield_now().await;

    let mut resetter = coordinator(&store, "group");
    let new_config = ReaderGroupConfig::builder().stream(ScopedStream::from("scope/stream2")).build();
    resetter.reset_reader_group(new_config).await.expect("reset reader group");

    // The poller is now the only task left waiting on a timer, so the
    // paused clock auto-advances to its next wakeup instead of requiring
    // a real sleep here.
    let result = handle.await.expect("task");
    assert!(matches!(result, Err(ReaderGroupError::ReinitializationRequired)));
}

/// S3 (partial): `generateStreamCuts` issues a silent checkpoint and
/// completes without requiring any reader to see `isCheckpoint=true` — its
/// id always carries the silent suffix, verified directly in
/// `reader_group::checkpoint`'s unit tests. Here we confirm it produces
/// stream-cuts without leaving anything outstanding.
#[tokio::test]
async fn generate_stream_cuts_completes_and_clears_its_silent_checkpoint() {
    let store = InMemoryStore::new(None);
    let mut leader = coordinator(&store, "group");
    leader.create_state(config(1)).await.expect("create state");
    leader.add_reader(Reader::from("r1".to_owned())).await.expect("add reader");
    leader.acquire_segment(Reader::from("r1".to_owned())).await.expect("acquire segment");

    let mut reporter = coordinator(&store, "group");
    let handle = tokio::spawn(async move { reporter.generate_stream_cuts(&TokioScheduler).await });

    tokio::time::sleep(Duration::from_millis(20)).await;

    // r1 reports against every checkpoint currently outstanding — there is
    // exactly one, the silent one `generate_stream_cuts` just created.
    let mut outstanding = HashMap::new();
    outstanding.insert(ScopedSegment::from("scope/stream/0"), 30i64);
    let mut r1 = coordinator(&store, "group");
    let id = {
        let mut probe = coordinator(&store, "group");
        probe.outstanding_checkpoints().await.expect("read outstanding checkpoints").pop().expect("one outstanding checkpoint")
    };
    r1.report_checkpoint_position(&id, Reader::from("r1".to_owned()), outstanding).await.expect("r1 reports");

    let cuts = handle.await.expect("task").expect("generate stream cuts");
    assert!(cuts.contains_key(&ScopedStream::from("scope/stream")));

    let stream_cuts = leader.get_stream_cuts().await.expect("get stream cuts");
    assert!(stream_cuts.contains_key(&ScopedStream::from("scope/stream")));
}
