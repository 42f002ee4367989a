//! Shared-ancestor cache.
//!
//! Maps a class plus its key values to the node already built for that
//! real-world entity, so later rows attach to the same instance. Keys are
//! taken from the incoming assignments, never from the graph, so a node whose
//! key was uniquified is still found by the value the input carries.

use std::collections::HashMap;

use crate::{graph::NodeId, mapping::Branch, model::ClassDef};

type CacheKey = (String, Vec<String>);

#[derive(Debug, Clone, Default)]
pub struct AncestorCache {
    entries: HashMap<CacheKey, NodeId>,
    /// Entries replaced since `begin`, with what they held before.
    journal: Option<Vec<(CacheKey, Option<NodeId>)>>,
}

impl AncestorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class: &str, key: &[String]) -> Option<NodeId> {
        self.entries.get(&(class.to_string(), key.to_vec())).copied()
    }

    pub fn insert(&mut self, class: &str, key: Vec<String>, node: NodeId) {
        let key = (class.to_string(), key);
        let prior = self.entries.insert(key.clone(), node);
        if let Some(journal) = self.journal.as_mut() {
            journal.push((key, prior));
        }
    }

    pub fn begin(&mut self) {
        self.journal = Some(Vec::new());
    }

    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Undoes every insert since `begin`, newest first.
    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (key, prior) in journal.into_iter().rev() {
            match prior {
                Some(node) => {
                    self.entries.insert(key, node);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Every cached node.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.values().copied()
    }
}

/// The key of `class` as carried by `branch`, when every key path has a value.
pub fn branch_key(class: &ClassDef, branch: &Branch) -> Option<Vec<String>> {
    if class.key.is_empty() {
        return None;
    }
    class
        .key
        .iter()
        .map(|path| branch.value_at(path).map(|v| v.as_display()))
        .collect()
}
