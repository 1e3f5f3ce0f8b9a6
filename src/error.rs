//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

use crate::controller::ControllerError;
use crate::synchronizer::SynchronizerError;
use snafu::Snafu;

/// The error taxonomy surfaced to reader group clients. `TransientSynchronizerConflict`
/// is deliberately absent here: it is retried transparently inside the optimistic
/// loop in [`crate::synchronizer::apply_update`] and never escapes that function.
#[derive(Debug, Snafu)]
pub enum ReaderGroupError {
    #[snafu(display("checkpoint request rejected: {} outstanding checkpoints already at the configured maximum", outstanding))]
    MaxNumberOfCheckpointsExceeded { outstanding: u32 },

    #[snafu(display("checkpoint {} was cleared before its positions could be consumed", checkpoint_id))]
    CheckpointFailed { checkpoint_id: String },

    #[snafu(display("reader group state was deleted or reconfigured; local readers must recreate their state"))]
    ReinitializationRequired,

    #[snafu(display("illegal state for {}: expected READY, found {:?}", operation, found))]
    IllegalState {
        operation: String,
        found: crate::reader_group::config::ConfigState,
    },

    #[snafu(display("upstream reports stream {} no longer exists", stream))]
    InvalidStream { stream: String },

    #[snafu(display("synchronizer error while performing {}: {}", operation, source))]
    Synchronizer {
        operation: String,
        source: SynchronizerError,
    },

    #[snafu(display("controller error while performing {}: {}", operation, source))]
    Controller {
        operation: String,
        source: ControllerError,
    },

    #[snafu(display("fatal error, coordinator cannot continue: {}", message))]
    Fatal { message: String },
}

pub type Result<T> = std::result::Result<T, ReaderGroupError>;
