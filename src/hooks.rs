//! Per-class migration hooks.
//!
//! Classes of the target model are never modified to take part in a
//! migration. Instead, a [`MigrationHook`] is registered for a class name and
//! the graph builder and validator call it explicitly for every node of that
//! class a row touches.

use std::{collections::BTreeMap, fmt};

use crate::{
    error::ValidationError,
    graph::{Graph, NodeId},
    rows::RowContext,
};

pub trait MigrationHook: Send + Sync {
    /// Called after the row's assignments were merged onto `node`.
    fn migrate(
        &self,
        _graph: &mut Graph,
        _node: NodeId,
        _row: &RowContext<'_>,
    ) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Called during validation; an error message rejects the row.
    fn validate(&self, _graph: &Graph, _node: NodeId) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Vec<Box<dyn MigrationHook>>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .hooks
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, class: impl Into<String>, hook: H)
    where
        H: MigrationHook + 'static,
    {
        self.hooks.entry(class.into()).or_default().push(Box::new(hook));
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn for_class(&self, class: &str) -> &[Box<dyn MigrationHook>] {
        self.hooks.get(class).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn migrate(
        &self,
        graph: &mut Graph,
        nodes: &[NodeId],
        row: &RowContext<'_>,
    ) -> Result<(), ValidationError> {
        if self.hooks.is_empty() {
            return Ok(());
        }
        for &id in nodes {
            let Some(class) = graph.get(id).map(|n| n.class.clone()) else {
                continue;
            };
            for hook in self.for_class(&class) {
                hook.migrate(graph, id, row)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self, graph: &Graph, nodes: &[NodeId]) -> Result<(), ValidationError> {
        for &id in nodes {
            let Some(node) = graph.get(id) else {
                continue;
            };
            for hook in self.for_class(&node.class) {
                hook.validate(graph, id).map_err(|message| ValidationError::Hook {
                    class: node.class.clone(),
                    message,
                })?;
            }
        }
        Ok(())
    }
}
