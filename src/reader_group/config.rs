//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! The lifecycle label. Kept as a plain enum on [`crate::reader_group::state::ReaderGroupState`]
//! rather than folded into a sum type over the whole snapshot
//! (`Initializing { config } | Ready { .. } | ...`) because the
//! snapshot also carries assignment and checkpoint state that exists in
//! every lifecycle phase; that discipline is instead enforced by [`crate::reader_group::state::ReaderGroupState::check_invariants`]:
//! `newConfig.is_some() <=> configState == Reinitializing`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigState {
    Initializing,
    Ready,
    Reinitializing,
    Deleting,
}
