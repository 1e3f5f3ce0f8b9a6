//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Component F. The observable surface the coordinator exposes besides its
//! direct return values: segment-change and end-of-data events, derived
//! from a diff of two consecutive committed snapshots. A broadcast queue
//! per notifier kind, rather than a shared mutable listener list.

use pravega_rust_client_shared::SegmentWithRange;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentNotification {
    /// A reader's owned segment set changed shape: a new segment was
    /// acquired, or the reader needs to release one (e.g. during a reset).
    AssignmentChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndOfDataNotification {
    pub segments: Vec<SegmentWithRange>,
}

/// Owns the broadcast senders; cloned cheaply (the senders are `Arc`-backed
/// internally), so every coordinator handle sharing one `ReaderGroupImpl`
/// observes the same notifications.
#[derive(Clone)]
pub struct NotifierHub {
    segment_tx: broadcast::Sender<SegmentNotification>,
    end_of_data_tx: broadcast::Sender<EndOfDataNotification>,
}

impl Default for NotifierHub {
    fn default() -> Self {
        let (segment_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (end_of_data_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        NotifierHub { segment_tx, end_of_data_tx }
    }
}

impl NotifierHub {
    pub fn segment_notifier(&self) -> broadcast::Receiver<SegmentNotification> {
        self.segment_tx.subscribe()
    }

    pub fn end_of_data_notifier(&self) -> broadcast::Receiver<EndOfDataNotification> {
        self.end_of_data_tx.subscribe()
    }

    /// Publishes notifications for the transition from `before` to `after`.
    /// Lagging/closed receivers (no subscribers yet) are not errors — a
    /// notifier nobody is listening to is simply a no-op broadcast.
    pub fn notify_transition(&self, before: &crate::reader_group::state::ReaderGroupState, after: &crate::reader_group::state::ReaderGroupState) {
        if before.assigned_segments != after.assigned_segments {
            let _ = self.segment_tx.send(SegmentNotification::AssignmentChanged);
        }

        let before_offsets = offsets_by_segment(before);
        let after_offsets = offsets_by_segment(after);
        let newly_ended: Vec<SegmentWithRange> = after
            .all_segments()
            .into_iter()
            .filter(|s| {
                let end = match after.end_segments.get(&s.scoped_segment) {
                    Some(&end) => end,
                    None => return false,
                };
                let before_offset = before_offsets.get(&s.scoped_segment).copied().unwrap_or(i64::MIN);
                let after_offset = after_offsets.get(&s.scoped_segment).copied().unwrap_or(i64::MIN);
                before_offset < end && after_offset >= end
            })
            .collect();
        if !newly_ended.is_empty() {
            let _ = self.end_of_data_tx.send(EndOfDataNotification { segments: newly_ended });
        }
    }
}

fn offsets_by_segment(state: &crate::reader_group::state::ReaderGroupState) -> std::collections::HashMap<pravega_rust_client_shared::ScopedSegment, i64> {
    let mut offsets = std::collections::HashMap::new();
    for (segment, offset) in &state.unassigned_segments {
        offsets.insert(segment.scoped_segment.clone(), *offset);
    }
    for owned in state.assigned_segments.values() {
        for (segment, offset) in owned {
            offsets.insert(segment.scoped_segment.clone(), *offset);
        }
    }
    offsets
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reader_group::state::ReaderGroupState;
    use pravega_rust_client_shared::{Reader, ReaderGroupConfig, Scope, ScopedSegment, ScopedStream, Segment, Stream};
    use std::collections::HashMap;

    fn segment(number: u64) -> SegmentWithRange {
        let scoped_segment = ScopedSegment::new(ScopedStream::new(Scope::new("scope".into()), Stream::new("stream".into())), Segment::new(number));
        SegmentWithRange::new(scoped_segment, None)
    }

    fn config() -> ReaderGroupConfig {
        ReaderGroupConfig::builder().stream(ScopedStream::new(Scope::new("scope".into()), Stream::new("stream".into()))).build()
    }

    #[test]
    fn assignment_change_publishes_to_segment_notifier() {
        let hub = NotifierHub::default();
        let mut rx = hub.segment_notifier();

        let before = ReaderGroupState::init(config(), HashMap::new(), HashMap::new());
        let mut after = before.clone();
        after.assigned_segments.insert(Reader::from("r1".into()), HashMap::new());

        hub.notify_transition(&before, &after);
        assert_eq!(rx.try_recv().unwrap(), SegmentNotification::AssignmentChanged);
    }

    #[test]
    fn unchanged_snapshots_publish_nothing() {
        let hub = NotifierHub::default();
        let mut rx = hub.segment_notifier();
        let state = ReaderGroupState::init(config(), HashMap::new(), HashMap::new());
        hub.notify_transition(&state, &state);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn segment_reaching_its_recorded_end_publishes_end_of_data() {
        let hub = NotifierHub::default();
        let mut rx = hub.end_of_data_notifier();

        let seg = segment(0);
        let mut initial = HashMap::new();
        initial.insert(seg.clone(), 0i64);
        let before = ReaderGroupState::init(config(), initial.clone(), HashMap::new());

        let mut end_segments = HashMap::new();
        end_segments.insert(seg.scoped_segment.clone(), 100i64);
        let mut after = before.clone();
        after.end_segments = end_segments;
        after.unassigned_segments.insert(seg.clone(), 100i64);

        hub.notify_transition(&before, &after);
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.segments, vec![seg]);
    }
}
