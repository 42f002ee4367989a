//! Arena-backed object graph.
//!
//! Nodes live in a flat table keyed by [`NodeId`]; references between nodes are
//! plain ids, so shared and self-referential structures need no reference
//! counting. Containment cycles are caught by [`Graph::find_cycle`] when a row's
//! graph is finalized.
//!
//! Scalar fields remember their [`Origin`]. Two input values that disagree are a
//! conflict; an input value replaces a derived one; forced (cascade) values
//! always win.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    ops::{Index, IndexMut},
};

use crate::{
    data::Value,
    error::ValidationError,
    model::{AttributeDef, Role, TypeRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Instantiated while building the current row.
    Created,
    /// Carried over from an earlier row through the shared-ancestor cache.
    Reused,
    /// Adopted from an existing object found by the persistence gateway.
    Fetched,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
    Input,
    Derived,
    /// Rewritten for uniqueness; holds the value the input supplied.
    Uniquified(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub value: Value,
    pub origin: Origin,
}

impl Field {
    /// True when the field carries `value`, directly or as its pre-uniquified original.
    pub fn holds(&self, value: &Value) -> bool {
        self.value == *value
            || matches!(&self.origin, Origin::Uniquified(original) if original == value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Scalar(Field),
    One(NodeId),
    Many(Vec<NodeId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistState {
    Unpersisted,
    Submitted,
    Persisted,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub class: String,
    pub slots: BTreeMap<String, Slot>,
    pub owner: Option<NodeId>,
    pub provenance: Provenance,
    pub state: PersistState,
    pub identifier: Option<u64>,
    /// A persisted node whose values changed since it was written.
    pub dirty: bool,
    pub uniquified: bool,
}

impl Node {
    fn new(id: NodeId, class: String) -> Self {
        Self {
            id,
            class,
            slots: BTreeMap::new(),
            owner: None,
            provenance: Provenance::Created,
            state: PersistState::Unpersisted,
            identifier: None,
            dirty: false,
            uniquified: false,
        }
    }

    pub fn describe(&self) -> String {
        format!("{}{}", self.class, self.id)
    }

    pub fn field(&self, attribute: &str) -> Option<&Field> {
        match self.slots.get(attribute) {
            Some(Slot::Scalar(field)) => Some(field),
            _ => None,
        }
    }

    pub fn value(&self, attribute: &str) -> Option<&Value> {
        self.field(attribute).map(|f| &f.value)
    }

    pub fn one(&self, attribute: &str) -> Option<NodeId> {
        match self.slots.get(attribute) {
            Some(Slot::One(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn many(&self, attribute: &str) -> &[NodeId] {
        match self.slots.get(attribute) {
            Some(Slot::Many(ids)) => ids,
            _ => &[],
        }
    }

    /// Every referenced node, in attribute order.
    pub fn references(&self) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.slots.iter().flat_map(|(name, slot)| {
            let ids: Vec<NodeId> = match slot {
                Slot::One(id) => vec![*id],
                Slot::Many(ids) => ids.clone(),
                Slot::Scalar(_) => Vec::new(),
            };
            ids.into_iter().map(move |id| (name.as_str(), id))
        })
    }

    pub fn is_set(&self, attribute: &str) -> bool {
        match self.slots.get(attribute) {
            Some(Slot::Many(ids)) => !ids.is_empty(),
            Some(_) => true,
            None => false,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.state == PersistState::Persisted
    }

    fn touch(&mut self) {
        if self.is_persisted() {
            self.dirty = true;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    next_id: usize,
    journal: Option<Journal>,
}

/// Prior state of every node changed since [`Graph::begin`]; `None` marks a
/// node inserted since then.
#[derive(Debug, Clone, Default)]
struct Journal {
    saved: BTreeMap<NodeId, Option<Node>>,
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        self.nodes
            .get(&id)
            .unwrap_or_else(|| panic!("node {id} is not in the graph"))
    }
}

impl IndexMut<NodeId> for Graph {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        if let Some(journal) = self.journal.as_mut() {
            journal
                .saved
                .entry(id)
                .or_insert_with(|| self.nodes.get(&id).cloned());
        }
        self.nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("node {id} is not in the graph"))
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, class: impl Into<String>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        if let Some(journal) = self.journal.as_mut() {
            journal.saved.entry(id).or_insert(None);
        }
        self.nodes.insert(id, Node::new(id, class.into()));
        id
    }

    /// Starts recording changes so they can be undone with [`Graph::rollback`].
    pub fn begin(&mut self) {
        self.journal = Some(Journal::default());
    }

    /// Keeps every change made since [`Graph::begin`].
    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Restores the graph as it was at [`Graph::begin`]. Ids handed out in
    /// between are not reissued.
    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (id, prior) in journal.saved {
            match prior {
                Some(node) => {
                    self.nodes.insert(id, node);
                }
                None => {
                    self.nodes.remove(&id);
                }
            }
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drops every node. Ids are never reissued.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Drops every node not in `keep`.
    pub fn retain(&mut self, keep: &BTreeSet<NodeId>) {
        self.nodes.retain(|id, _| keep.contains(id));
    }

    pub fn describe(&self, id: NodeId) -> String {
        self.get(id).map(Node::describe).unwrap_or_else(|| id.to_string())
    }

    pub fn value(&self, id: NodeId, attribute: &str) -> Option<&Value> {
        self.get(id).and_then(|n| n.value(attribute))
    }

    /// Follows a dotted path of single-valued references. The segment `owner`
    /// steps to the node's owner.
    pub fn value_at(&self, id: NodeId, path: &str) -> Option<&Value> {
        self.field_at(id, path).map(|f| &f.value)
    }

    pub fn field_at(&self, id: NodeId, path: &str) -> Option<&Field> {
        let mut current = id;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let node = self.get(current)?;
            if segments.peek().is_none() {
                return node.field(segment);
            }
            current = match segment {
                "owner" => node.owner?,
                name => node.one(name)?,
            };
        }
        None
    }

    /// Sets a scalar from input data. Returns whether the value changed.
    pub fn assign(
        &mut self,
        id: NodeId,
        attribute: &str,
        value: Value,
    ) -> Result<bool, ValidationError> {
        let node = &mut self[id];
        let conflict = |node: &Node, existing: &Value, incoming: &Value| ValidationError::Conflict {
            class: node.class.clone(),
            attribute: attribute.to_string(),
            existing: existing.as_display(),
            incoming: incoming.as_display(),
        };
        match node.slots.get(attribute) {
            None | Some(Slot::Scalar(Field { origin: Origin::Derived, .. })) => {}
            Some(Slot::Scalar(Field { value: existing, origin: Origin::Input })) => {
                return if *existing == value {
                    Ok(false)
                } else {
                    Err(conflict(node, existing, &value))
                };
            }
            Some(Slot::Scalar(Field { origin: Origin::Uniquified(original), .. })) => {
                return if *original == value {
                    Ok(false)
                } else {
                    Err(conflict(node, original, &value))
                };
            }
            Some(_) => {
                return Err(ValidationError::Conflict {
                    class: node.class.clone(),
                    attribute: attribute.to_string(),
                    existing: "(reference)".to_string(),
                    incoming: value.as_display(),
                });
            }
        }
        let changed = node.value(attribute) != Some(&value);
        node.slots.insert(
            attribute.to_string(),
            Slot::Scalar(Field {
                value,
                origin: Origin::Input,
            }),
        );
        if changed {
            node.touch();
        }
        Ok(changed)
    }

    /// Sets a derived value on an unset attribute.
    pub fn derive(&mut self, id: NodeId, attribute: &str, value: Value) -> bool {
        let node = &mut self[id];
        if node.slots.contains_key(attribute) {
            return false;
        }
        node.slots.insert(
            attribute.to_string(),
            Slot::Scalar(Field {
                value,
                origin: Origin::Derived,
            }),
        );
        node.touch();
        true
    }

    /// Overwrites a scalar unconditionally, as a status cascade does.
    pub fn force(&mut self, id: NodeId, attribute: &str, value: Value) -> bool {
        let node = &mut self[id];
        if node.value(attribute) == Some(&value) {
            return false;
        }
        node.slots.insert(
            attribute.to_string(),
            Slot::Scalar(Field {
                value,
                origin: Origin::Derived,
            }),
        );
        node.touch();
        true
    }

    /// Replaces a set scalar with a uniquified value, keeping the original.
    pub fn uniquify(&mut self, id: NodeId, attribute: &str, value: Value) -> bool {
        let node = &mut self[id];
        let Some(Slot::Scalar(field)) = node.slots.get_mut(attribute) else {
            return false;
        };
        if matches!(field.origin, Origin::Uniquified(_)) {
            return false;
        }
        let original = std::mem::replace(&mut field.value, value);
        field.origin = Origin::Uniquified(original);
        node.touch();
        true
    }

    /// Links `from.attribute` to `to`, maintaining the owner back-reference and
    /// the declared inverse.
    pub fn link(
        &mut self,
        registry: &dyn TypeRegistry,
        from: NodeId,
        attribute: &str,
        def: &AttributeDef,
        to: NodeId,
    ) -> Result<(), ValidationError> {
        self.set_reference(from, attribute, def.collection, to, def.role != Role::Dependent)?;
        match def.role {
            Role::Dependent => self.adopt(from, to)?,
            Role::Owner => self.adopt(to, from)?,
            Role::Independent => {}
        }
        if let Some(inverse) = &def.inverse {
            let back = registry.attribute(&self[to].class, inverse);
            let collection = back.is_some_and(|b| b.collection);
            let touch = back.is_some_and(|b| b.role != Role::Dependent);
            self.set_reference(to, inverse, collection, from, touch)?;
        }
        Ok(())
    }

    fn set_reference(
        &mut self,
        from: NodeId,
        attribute: &str,
        collection: bool,
        to: NodeId,
        touch: bool,
    ) -> Result<(), ValidationError> {
        let existing = self[from].slots.get(attribute).cloned();
        let node_changed = match existing {
            None => {
                let slot = if collection {
                    Slot::Many(vec![to])
                } else {
                    Slot::One(to)
                };
                self[from].slots.insert(attribute.to_string(), slot);
                true
            }
            Some(Slot::One(current)) if current == to => false,
            Some(Slot::One(current)) => {
                return Err(ValidationError::OwnerConflict {
                    owner: self.describe(from),
                    child: self.describe(to),
                    existing: self.describe(current),
                });
            }
            Some(Slot::Many(ids)) if ids.contains(&to) => false,
            Some(Slot::Many(_)) => {
                if let Some(Slot::Many(ids)) = self[from].slots.get_mut(attribute) {
                    ids.push(to);
                }
                true
            }
            Some(Slot::Scalar(field)) => {
                return Err(ValidationError::Conflict {
                    class: self[from].class.clone(),
                    attribute: attribute.to_string(),
                    existing: field.value.as_display(),
                    incoming: self.describe(to),
                });
            }
        };
        if node_changed && touch {
            self[from].touch();
        }
        Ok(())
    }

    fn adopt(&mut self, owner: NodeId, child: NodeId) -> Result<(), ValidationError> {
        match self[child].owner {
            Some(current) if current != owner => Err(ValidationError::AlreadyOwned {
                owner: self.describe(owner),
                child: self.describe(child),
                existing: self.describe(current),
            }),
            _ => {
                self[child].owner = Some(owner);
                Ok(())
            }
        }
    }

    /// Nodes owned by `owner`, optionally restricted to one class.
    pub fn owned_by<'a>(
        &'a self,
        owner: NodeId,
        class: Option<&'a str>,
    ) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes
            .values()
            .filter(move |n| n.owner == Some(owner) && class.is_none_or(|c| n.class == c))
            .map(|n| n.id)
    }

    /// Nodes `id` points at, through any reference or its owner.
    pub fn neighbours(&self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.get(id) else {
            return Vec::new();
        };
        node.references()
            .map(|(_, target)| target)
            .chain(node.owner)
            .collect()
    }

    /// Everything connected to `roots` in either direction, breadth first.
    pub fn reachable(&self, roots: &[NodeId]) -> Vec<NodeId> {
        self.breadth_first(roots, Graph::neighbours)
    }

    /// Breadth-first walk from `roots`, each node visited once.
    pub fn breadth_first<F>(&self, roots: &[NodeId], mut next: F) -> Vec<NodeId>
    where
        F: FnMut(&Graph, NodeId) -> Vec<NodeId>,
    {
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = roots.iter().copied().collect();
        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !self.contains(id) || !visited.insert(id) {
                continue;
            }
            order.push(id);
            queue.extend(next(self, id));
        }
        order
    }

    /// Owner -> dependent pairs implied by containment attributes.
    pub fn edges(&self, registry: &dyn TypeRegistry) -> BTreeSet<(NodeId, NodeId)> {
        let mut edges = BTreeSet::new();
        for node in self.nodes.values() {
            for (name, target) in node.references() {
                match registry.attribute(&node.class, name).map(|d| d.role) {
                    Some(Role::Dependent) => {
                        edges.insert((node.id, target));
                    }
                    Some(Role::Owner) => {
                        edges.insert((target, node.id));
                    }
                    _ => {}
                }
            }
        }
        edges
    }

    /// Returns the nodes of one containment cycle, if any.
    pub fn find_cycle(&self, registry: &dyn TypeRegistry) -> Option<Vec<NodeId>> {
        let mut adjacency: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for (from, to) in self.edges(registry) {
            adjacency.entry(from).or_default().push(to);
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            id: NodeId,
            adjacency: &BTreeMap<NodeId, Vec<NodeId>>,
            marks: &mut BTreeMap<NodeId, Mark>,
            stack: &mut Vec<NodeId>,
        ) -> Option<Vec<NodeId>> {
            match marks.get(&id) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == id).unwrap_or_default();
                    return Some(stack[start..].to_vec());
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            stack.push(id);
            for next in adjacency.get(&id).into_iter().flatten() {
                if let Some(cycle) = visit(*next, adjacency, marks, stack) {
                    return Some(cycle);
                }
            }
            stack.pop();
            marks.insert(id, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut stack = Vec::new();
        self.nodes
            .keys()
            .find_map(|id| visit(*id, &adjacency, &mut marks, &mut stack))
    }
}
