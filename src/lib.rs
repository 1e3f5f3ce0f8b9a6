//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Reader group coordination for the Pravega Rust client: the replicated
//! state object, its tagged-union updates, the checkpoint state machine,
//! the lifecycle state machine and the stream-cut / unread-bytes / notifier
//! surface built on top of them. The state synchronizer's replicated
//! register, the segment I/O client and the controller's wire protocol are
//! external collaborators, represented here only by the trait boundaries
//! this crate calls through (`StateSynchronizer`, `ControllerClient`).

pub mod controller;
pub mod error;
pub mod reader_group;
pub mod scheduler;
pub mod synchronizer;
pub mod wire;

pub use error::{ReaderGroupError, Result};
