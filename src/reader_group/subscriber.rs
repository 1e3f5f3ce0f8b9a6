//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Component E. Reconciles the set of upstream streams registered as
//! retention-pinning subscribers against a config transition. Pure
//! set-diff logic; the actual `addSubscriber`/`deleteSubscriber` RPCs are
//! fired by the coordinator after computing the diff, exactly like
//! `doReinit`'s `streamsToSub`/`streamsToUnsub`.

use pravega_rust_client_shared::{ReaderGroupConfig, ScopedStream};
use std::collections::HashSet;

/// The streams to subscribe to and unsubscribe from when moving between
/// two configs (or from no config, on initial creation).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriberDiff {
    pub to_subscribe: HashSet<ScopedStream>,
    pub to_unsubscribe: HashSet<ScopedStream>,
}

/// Streams of `config` whose retention policy actually pins upstream
/// truncation. A config with `RetentionType::None` never needs a
/// subscriber registration for that stream.
fn retention_streams(config: &ReaderGroupConfig) -> HashSet<ScopedStream> {
    if config.retention_type.is_enabled() {
        config.streams().cloned().collect()
    } else {
        HashSet::new()
    }
}

/// `doInit`'s subscriber set: every retention-pinning stream of `config`,
/// all newly subscribed (there is no prior config).
pub fn diff_for_init(config: &ReaderGroupConfig) -> SubscriberDiff {
    SubscriberDiff {
        to_subscribe: retention_streams(config),
        to_unsubscribe: HashSet::new(),
    }
}

/// `doReinit`'s subscriber set: `newStreams \ oldStreams` to subscribe,
/// `oldStreams \ newStreams` to unsubscribe, both under the retention
/// predicate.
pub fn diff_for_reinit(old_config: &ReaderGroupConfig, new_config: &ReaderGroupConfig) -> SubscriberDiff {
    let old = retention_streams(old_config);
    let new = retention_streams(new_config);
    SubscriberDiff {
        to_subscribe: new.difference(&old).cloned().collect(),
        to_unsubscribe: old.difference(&new).cloned().collect(),
    }
}

/// `doDelete`'s subscriber set: every retention-pinning stream of `config`,
/// all to be unsubscribed.
pub fn diff_for_delete(config: &ReaderGroupConfig) -> SubscriberDiff {
    SubscriberDiff {
        to_subscribe: HashSet::new(),
        to_unsubscribe: retention_streams(config),
    }
}
