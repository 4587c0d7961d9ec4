// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;

use hashing::Value;

use crate::RuleNodeId;

pub(crate) type CallKey = (String, Vec<Value>);

///
/// A persistent sorted associative map from call keys to rule nodes, used to implement the
/// defer-to-parent dispatch: `with_put` returns a new map without mutating the callers' view.
///
/// Maps stay small (one entry per frame of a deferral chain), so a copied sorted vector is
/// cheaper than a tree.
///
#[derive(Clone)]
pub(crate) struct NodeMap {
    entries: Arc<Vec<(CallKey, RuleNodeId)>>,
}

impl NodeMap {
    pub fn empty() -> NodeMap {
        NodeMap {
            entries: Arc::new(Vec::new()),
        }
    }

    pub fn get(&self, key: &CallKey) -> Option<RuleNodeId> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn with_put(&self, key: CallKey, value: RuleNodeId) -> NodeMap {
        let mut entries = (*self.entries).clone();
        match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(i) => entries[i].1 = value,
            Err(i) => entries.insert(i, (key, value)),
        }
        NodeMap {
            entries: Arc::new(entries),
        }
    }
}
