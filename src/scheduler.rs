//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Scheduler injection for the checkpoint poll loop.
//! `initiate_checkpoint`/`generate_stream_cuts` take a `&dyn Scheduler`
//! rather than reaching for `tokio::time::sleep` directly, so tests can
//! drive the 500ms poll deterministically with a virtual clock instead of
//! actually sleeping.

use async_trait::async_trait;
use std::time::Duration;

pub const CHECKPOINT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    use super::*;

    /// Sleeps via `tokio::time::sleep` against a `tokio::time::pause()`d
    /// virtual clock, so tests using `#[tokio::test(start_paused = true)]`
    /// can advance through many poll intervals instantly.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct VirtualScheduler;

    #[async_trait]
    impl Scheduler for VirtualScheduler {
        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }
    }
}
