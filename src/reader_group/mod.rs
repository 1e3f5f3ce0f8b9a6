//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! The reader group coordination protocol: the replicated snapshot and its
//! updates (components A/B), the checkpoint sub-engine (C), the coordinator
//! entry point (D), subscriber reconciliation (E) and the notifier hub (F).

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod notifier;
pub mod state;
pub mod subscriber;

pub use coordinator::ReaderGroupImpl;
pub use state::{ReaderGroupState, StateUpdate};
