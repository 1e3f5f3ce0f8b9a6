//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! The state synchronizer abstraction the coordinator is built against. The
//! real, log-backed, linearizable implementation is an external
//! collaborator out of scope for this crate; what lives here is the trait
//! boundary plus the generic optimistic-retry helper, and an in-memory test
//! double standing in for the real synchronizer the way `MockType` stands
//! in for a real connection elsewhere in this codebase.

use async_trait::async_trait;
use snafu::Snafu;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum SynchronizerError {
    #[snafu(display("synchronizer update rejected: {}", error_msg))]
    SyncUpdateError { error_msg: String },

    #[snafu(display("synchronizer connection error: {}", error_msg))]
    ConnectionError { error_msg: String },
}

/// A linearizable compare-and-set register over a replicated value `T`,
/// plus read-your-writes fetch. Implementations may suspend on
/// `fetch_updates`/`conditionally_write`/`write_unconditionally`; callers
/// must never hold a lock across those calls.
#[async_trait]
pub trait StateSynchronizer<T>: Send
where
    T: Clone + Send + Sync,
{
    async fn fetch_updates(&mut self) -> Result<(), SynchronizerError>;

    fn current(&self) -> &T;

    fn revision(&self) -> u64;

    /// Commits `new_value` iff the store's revision still equals
    /// `expected_revision`. Returns `false` on a lost race rather than an
    /// error — the caller is expected to refetch and retry.
    async fn conditionally_write(&mut self, expected_revision: u64, new_value: T) -> Result<bool, SynchronizerError>;

    /// Publishes `new_value` regardless of the current revision. Reserved
    /// for updates the caller asserts are commutative or terminal.
    async fn write_unconditionally(&mut self, new_value: T) -> Result<(), SynchronizerError>;
}

/// The optimistic transaction loop every mutating coordinator operation
/// goes through: fetch the latest snapshot, run a pure `transformer` over
/// it, and attempt to commit. Retries on a lost CAS race; `transformer`
/// returning `Ok(None)` means "nothing to do" and is not retried. On
/// success the new, committed state is returned — callers that need a
/// derived result (the segment just acquired, the positions a checkpoint
/// completed with) diff it against the snapshot they read, rather than the
/// transformer threading a side value through — each update variant
/// applies as a single `apply(&state) -> Option<State>` function.
///
/// `transformer` must be free of side effects — side-effecting upstream
/// calls belong after this function returns.
pub async fn apply_update<S, T, F>(sync: &mut S, mut transformer: F) -> Result<Option<T>, SynchronizerError>
where
    S: StateSynchronizer<T>,
    T: Clone + Send + Sync,
    F: FnMut(&T) -> Result<Option<T>, SynchronizerError>,
{
    loop {
        sync.fetch_updates().await?;
        let revision = sync.revision();
        let current = sync.current().clone();
        match transformer(&current)? {
            None => return Ok(None),
            Some(new_value) => {
                if sync.conditionally_write(revision, new_value.clone()).await? {
                    return Ok(Some(new_value));
                }
                debug!("lost CAS race at revision {}, retrying", revision);
            }
        }
    }
}

/// Shared backing store for [`InMemoryStateSynchronizer`]. Cloning this (not
/// the synchronizer) is how tests simulate multiple coordinator processes
/// racing against the same logical state.
#[derive(Clone)]
pub struct InMemoryStore<T>(Arc<Mutex<(T, u64)>>);

impl<T: Clone> InMemoryStore<T> {
    pub fn new(initial: T) -> Self {
        InMemoryStore(Arc::new(Mutex::new((initial, 0))))
    }
}

pub struct InMemoryStateSynchronizer<T> {
    store: InMemoryStore<T>,
    cached: T,
    cached_revision: u64,
}

impl<T: Clone + Send + Sync> InMemoryStateSynchronizer<T> {
    pub fn new(store: InMemoryStore<T>) -> Self {
        let (cached, cached_revision) = {
            let guard = store.0.lock().expect("lock in-memory store");
            (guard.0.clone(), guard.1)
        };
        InMemoryStateSynchronizer {
            store,
            cached,
            cached_revision,
        }
    }

    pub fn handle(&self) -> InMemoryStore<T> {
        self.store.clone()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> StateSynchronizer<T> for InMemoryStateSynchronizer<T> {
    async fn fetch_updates(&mut self) -> Result<(), SynchronizerError> {
        let guard = self.store.0.lock().expect("lock in-memory store");
        self.cached = guard.0.clone();
        self.cached_revision = guard.1;
        Ok(())
    }

    fn current(&self) -> &T {
        &self.cached
    }

    fn revision(&self) -> u64 {
        self.cached_revision
    }

    async fn conditionally_write(&mut self, expected_revision: u64, new_value: T) -> Result<bool, SynchronizerError> {
        let mut guard = self.store.0.lock().expect("lock in-memory store");
        if guard.1 != expected_revision {
            return Ok(false);
        }
        guard.0 = new_value.clone();
        guard.1 += 1;
        self.cached = new_value;
        self.cached_revision = guard.1;
        Ok(true)
    }

    async fn write_unconditionally(&mut self, new_value: T) -> Result<(), SynchronizerError> {
        let mut guard = self.store.0.lock().expect("lock in-memory store");
        guard.0 = new_value.clone();
        guard.1 += 1;
        self.cached = new_value;
        self.cached_revision = guard.1;
        Ok(())
    }
}
