//! Object graph builder.
//!
//! [`GraphBuilder::apply`] merges one row's [`AssignmentTree`] into the running
//! graph:
//!
//! 1. Single-valued branches that could hang under several owners in the row
//!    are moved to the owner ranked first by the dependent class's
//!    `owner_precedence`.
//! 2. Each row entry is resolved to a node: keyed classes through the
//!    shared-ancestor cache, keyless ones by reusing a minimally matching child
//!    of their chosen owner, otherwise a fresh node.
//! 3. Assignments are merged depth-first. Scalars may only fill unset fields
//!    or repeat the existing value; collection members are matched before a
//!    new one is appended.
//! 4. Entries are linked to their owners and to the independent references
//!    the row implies, then the registered migration hooks run.
//!
//! [`cascade`] applies declared status cascades after defaults are filled.

use std::collections::{BTreeMap, BTreeSet, VecDeque, btree_map::Entry};

use itertools::Itertools;
use log::debug;

use crate::{
    cache::{AncestorCache, branch_key},
    data::Value,
    error::ValidationError,
    graph::{Graph, NodeId, Provenance},
    hooks::HookRegistry,
    mapping::{Assignment, AssignmentTree, Branch},
    model::{AttributeDef, ClassDef, Role, TypeRegistry},
    rows::RowContext,
};

/// Nodes produced or visited while applying one row.
#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    pub entries: BTreeMap<String, NodeId>,
    /// Every node the row's assignments reached, in first-visit order.
    pub touched: Vec<NodeId>,
}

pub struct GraphBuilder<'a> {
    registry: &'a dyn TypeRegistry,
    hooks: &'a HookRegistry,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a dyn TypeRegistry, hooks: &'a HookRegistry) -> Self {
        Self { registry, hooks }
    }

    pub fn apply(
        &self,
        tree: &AssignmentTree,
        graph: &mut Graph,
        cache: &mut AncestorCache,
        row: &RowContext<'_>,
    ) -> Result<BuildOutcome, ValidationError> {
        let mut tree = tree.clone();
        relocate_by_precedence(self.registry, &mut tree)?;

        let (entries, touched) = {
            let mut session = Session {
                registry: self.registry,
                graph: &mut *graph,
                cache,
                created: BTreeSet::new(),
                claimed: BTreeSet::new(),
                seen: BTreeSet::new(),
                touched: Vec::new(),
            };
            let entries = session.resolve_entries(&tree)?;
            (entries, session.touched)
        };
        self.hooks.migrate(graph, &touched, row)?;
        debug!("Row {} touched {} node(s)", row.row.number, touched.len());
        Ok(BuildOutcome { entries, touched })
    }
}

/// How a row entry hangs under another entry.
#[derive(Debug, Clone, PartialEq)]
enum OwnerLink {
    /// The owner's dependent attribute holds the entry.
    Down { owner: String, attribute: String },
    /// The entry's owner attribute points at the owner.
    Up { owner: String, attribute: String },
}

impl OwnerLink {
    fn owner(&self) -> &str {
        match self {
            OwnerLink::Down { owner, .. } | OwnerLink::Up { owner, .. } => owner,
        }
    }
}

struct Session<'a, 'g> {
    registry: &'a dyn TypeRegistry,
    graph: &'g mut Graph,
    cache: &'g mut AncestorCache,
    created: BTreeSet<NodeId>,
    claimed: BTreeSet<NodeId>,
    seen: BTreeSet<NodeId>,
    touched: Vec<NodeId>,
}

impl<'a> Session<'a, '_> {
    fn class_def(&self, class: &str) -> Result<&'a ClassDef, ValidationError> {
        self.registry
            .class(class)
            .ok_or_else(|| ValidationError::UnknownClass(class.to_string()))
    }

    fn attribute(&self, class: &str, attribute: &str) -> Result<&'a AttributeDef, ValidationError> {
        self.registry
            .attribute(class, attribute)
            .ok_or_else(|| ValidationError::UnknownAttribute {
                class: class.to_string(),
                attribute: attribute.to_string(),
            })
    }

    fn create(&mut self, class: &str) -> NodeId {
        let id = self.graph.insert(class);
        self.created.insert(id);
        id
    }

    fn visit(&mut self, id: NodeId) {
        if !self.seen.insert(id) {
            return;
        }
        self.touched.push(id);
        let node = &mut self.graph[id];
        if !self.created.contains(&id) && node.provenance == Provenance::Created {
            node.provenance = Provenance::Reused;
        }
    }

    /// Resolves a keyed branch through the shared-ancestor cache.
    fn cached(&mut self, branch: &Branch) -> Result<Option<NodeId>, ValidationError> {
        let def = self.class_def(&branch.class)?;
        let Some(key) = branch_key(def, branch) else {
            return Ok(None);
        };
        if let Some(id) = self.cache.get(&branch.class, &key)
            && self.graph.contains(id)
        {
            return Ok(Some(id));
        }
        let id = self.create(&branch.class);
        self.cache.insert(&branch.class, key, id);
        Ok(Some(id))
    }

    fn matches(&self, node: NodeId, branch: &Branch) -> bool {
        let Some(def) = self.registry.class(&branch.class) else {
            return false;
        };
        def.match_attributes()
            .iter()
            .all(|path| match branch.value_at(path) {
                None => true,
                Some(incoming) => self
                    .graph
                    .field_at(node, path)
                    .is_some_and(|field| field.holds(incoming)),
            })
    }

    fn resolve_entries(
        &mut self,
        tree: &AssignmentTree,
    ) -> Result<BTreeMap<String, NodeId>, ValidationError> {
        let mut ids: BTreeMap<String, NodeId> = BTreeMap::new();
        for (alias, branch) in &tree.entries {
            if let Some(id) = self.cached(branch)? {
                ids.insert(alias.clone(), id);
            }
        }

        let mut owners = BTreeMap::new();
        for alias in tree.entries.keys() {
            if let Some(link) = self.choose_owner(tree, alias)? {
                owners.insert(alias.clone(), link);
            }
        }

        let mut pending: Vec<&String> = tree
            .entries
            .keys()
            .filter(|a| !ids.contains_key(*a))
            .collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for alias in pending {
                let branch = &tree.entries[alias];
                let resolved = match owners.get(alias) {
                    None => Some(self.create(&branch.class)),
                    Some(link) => match ids.get(link.owner()) {
                        Some(&owner) => Some(self.reuse_or_create(owner, link, branch)),
                        None => None,
                    },
                };
                match resolved {
                    Some(id) => {
                        ids.insert(alias.clone(), id);
                    }
                    None => waiting.push(alias),
                }
            }
            if waiting.len() == before {
                // keyless entries waiting on each other
                let alias = waiting.remove(0);
                let id = self.create(&tree.entries[alias].class);
                ids.insert(alias.clone(), id);
            }
            pending = waiting;
        }

        for (alias, branch) in &tree.entries {
            self.merge_branch(ids[alias], branch)?;
        }
        for (alias, link) in &owners {
            self.link_entry(&ids, alias, link)?;
        }
        self.link_independent(tree, &ids)?;
        Ok(ids)
    }

    /// Picks the entry that owns `alias`, ranked by the class's owner precedence.
    fn choose_owner(
        &self,
        tree: &AssignmentTree,
        alias: &str,
    ) -> Result<Option<OwnerLink>, ValidationError> {
        let child = &tree.entries[alias];
        let child_def = self.class_def(&child.class)?;
        let mut best: Vec<(usize, OwnerLink)> = Vec::new();
        for (other, branch) in &tree.entries {
            if other == alias {
                continue;
            }
            let owner_def = self.class_def(&branch.class)?;
            let link = containment_attribute(owner_def, Role::Dependent, &child.class)
                .map(|attribute| OwnerLink::Down {
                    owner: other.clone(),
                    attribute,
                })
                .or_else(|| {
                    containment_attribute(child_def, Role::Owner, &branch.class).map(|attribute| {
                        OwnerLink::Up {
                            owner: other.clone(),
                            attribute,
                        }
                    })
                });
            let Some(link) = link else {
                continue;
            };
            let rank = child_def.owner_rank(&branch.class);
            match best.first().map(|(r, _)| *r) {
                Some(r) if rank > r => continue,
                Some(r) if rank < r => best.clear(),
                _ => {}
            }
            best.push((rank, link));
        }
        match best.len() {
            0 | 1 => Ok(best.pop().map(|(_, link)| link)),
            _ => Err(ValidationError::AmbiguousOwner {
                class: child.class.clone(),
                candidates: best.iter().map(|(_, link)| link.owner()).join(", "),
            }),
        }
    }

    fn reuse_or_create(&mut self, owner: NodeId, link: &OwnerLink, branch: &Branch) -> NodeId {
        let candidates: Vec<NodeId> = match link {
            OwnerLink::Down { attribute, .. } => match self.graph[owner].one(attribute) {
                Some(occupant) => vec![occupant],
                None => self.graph[owner].many(attribute).to_vec(),
            },
            OwnerLink::Up { .. } => self
                .graph
                .owned_by(owner, Some(branch.class.as_str()))
                .collect(),
        };
        let found = candidates.into_iter().find(|c| {
            !self.claimed.contains(c)
                && self.graph[*c].class == branch.class
                && self.matches(*c, branch)
        });
        let id = found.unwrap_or_else(|| self.create(&branch.class));
        self.claimed.insert(id);
        id
    }

    fn merge_branch(&mut self, id: NodeId, branch: &Branch) -> Result<(), ValidationError> {
        self.visit(id);
        for (name, assignment) in &branch.fields {
            let class = self.graph[id].class.clone();
            let def = self.attribute(&class, name)?;
            match assignment {
                Assignment::Value { value, .. } => {
                    self.graph.assign(id, name, value.clone())?;
                }
                Assignment::One(child) => {
                    let child_id = match self.graph[id].one(name) {
                        Some(existing) => existing,
                        None => {
                            let child_id = match self.cached(child)? {
                                Some(cached) => cached,
                                None => self.create(&child.class),
                            };
                            self.graph.link(self.registry, id, name, def, child_id)?;
                            child_id
                        }
                    };
                    self.claimed.insert(child_id);
                    self.merge_branch(child_id, child)?;
                }
                Assignment::Many(members) => {
                    for member in members.values() {
                        let member_id = match self.cached(member)? {
                            Some(cached) => cached,
                            None => {
                                let slot = self.graph[id].many(name).to_vec();
                                let found = slot.into_iter().find(|c| {
                                    !self.claimed.contains(c)
                                        && self.graph[*c].class == member.class
                                        && self.matches(*c, member)
                                });
                                match found {
                                    Some(existing) => existing,
                                    None => self.create(&member.class),
                                }
                            }
                        };
                        self.graph.link(self.registry, id, name, def, member_id)?;
                        self.claimed.insert(member_id);
                        self.merge_branch(member_id, member)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn link_entry(
        &mut self,
        ids: &BTreeMap<String, NodeId>,
        alias: &str,
        link: &OwnerLink,
    ) -> Result<(), ValidationError> {
        let child = ids[alias];
        match link {
            OwnerLink::Down { owner, attribute } => {
                let owner = ids[owner.as_str()];
                let def = self.attribute(&self.graph[owner].class, attribute)?;
                self.graph.link(self.registry, owner, attribute, def, child)
            }
            OwnerLink::Up { owner, attribute } => {
                let owner = ids[owner.as_str()];
                let def = self.attribute(&self.graph[child].class, attribute)?;
                self.graph.link(self.registry, child, attribute, def, owner)
            }
        }
    }

    /// Links plain references between entries when the row holds exactly one
    /// candidate of the referenced class.
    fn link_independent(
        &mut self,
        tree: &AssignmentTree,
        ids: &BTreeMap<String, NodeId>,
    ) -> Result<(), ValidationError> {
        for (alias, branch) in &tree.entries {
            let def = self.class_def(&branch.class)?;
            let id = ids[alias];
            for (name, attr) in def.all_attributes() {
                if attr.role != Role::Independent {
                    continue;
                }
                let Some(target) = attr.kind.reference() else {
                    continue;
                };
                let mut candidates = tree
                    .entries
                    .iter()
                    .filter(|(other, b)| *other != alias && b.class == target);
                let (Some((other, _)), None) = (candidates.next(), candidates.next()) else {
                    continue;
                };
                self.graph.link(self.registry, id, name, attr, ids[other])?;
            }
        }
        Ok(())
    }
}

fn containment_attribute(def: &ClassDef, role: Role, target: &str) -> Option<String> {
    def.all_attributes()
        .find(|(_, attr)| attr.role == role && attr.kind.reference() == Some(target))
        .map(|(name, _)| name.clone())
}

/// Address of a branch: entry alias plus (attribute, member index) steps.
type Location = (String, Vec<(String, Option<usize>)>);

fn collect_locations(tree: &AssignmentTree) -> Vec<(Location, String)> {
    fn walk(branch: &Branch, location: Location, out: &mut Vec<(Location, String)>) {
        for (name, assignment) in &branch.fields {
            match assignment {
                Assignment::One(child) => {
                    let mut next = location.clone();
                    next.1.push((name.clone(), None));
                    walk(child, next, out);
                }
                Assignment::Many(members) => {
                    for (idx, member) in members {
                        let mut next = location.clone();
                        next.1.push((name.clone(), Some(*idx)));
                        walk(member, next, out);
                    }
                }
                Assignment::Value { .. } => {}
            }
        }
        out.push((location, branch.class.clone()));
    }

    let mut out = Vec::new();
    for (alias, branch) in &tree.entries {
        walk(branch, (alias.clone(), Vec::new()), &mut out);
    }
    out
}

fn branch_at_mut<'t>(tree: &'t mut AssignmentTree, location: &Location) -> Option<&'t mut Branch> {
    let mut branch = tree.entries.get_mut(&location.0)?;
    for (name, index) in &location.1 {
        branch = match (branch.fields.get_mut(name)?, index) {
            (Assignment::One(child), None) => child,
            (Assignment::Many(members), Some(idx)) => members.get_mut(idx)?,
            _ => return None,
        };
    }
    Some(branch)
}

fn branch_at<'t>(tree: &'t AssignmentTree, location: &Location) -> Option<&'t Branch> {
    let mut branch = tree.entries.get(&location.0)?;
    for (name, index) in &location.1 {
        branch = match (branch.fields.get(name)?, index) {
            (Assignment::One(child), None) => child,
            (Assignment::Many(members), Some(idx)) => members.get(idx)?,
            _ => return None,
        };
    }
    Some(branch)
}

/// True when `other` lies inside the subtree at `location.attribute`.
fn is_within(other: &Location, location: &Location, attribute: &str) -> bool {
    other.0 == location.0
        && other.1.len() > location.1.len()
        && other.1[..location.1.len()] == location.1[..]
        && other.1[location.1.len()].0 == attribute
}

fn dependent_slot(registry: &dyn TypeRegistry, host: &str, child: &str) -> Option<String> {
    registry
        .class(host)?
        .all_attributes()
        .find(|(_, attr)| {
            attr.role == Role::Dependent && !attr.collection && attr.kind.reference() == Some(child)
        })
        .map(|(name, _)| name.clone())
}

/// Moves single-valued branches to the best-ranked owner present in the row.
fn relocate_by_precedence(
    registry: &dyn TypeRegistry,
    tree: &mut AssignmentTree,
) -> Result<(), ValidationError> {
    let hosts = collect_locations(tree);
    let mut moves: Vec<(Location, String, Location, String)> = Vec::new();
    for (location, host_class) in &hosts {
        let Some(branch) = branch_at(tree, location) else {
            continue;
        };
        for (attribute, assignment) in &branch.fields {
            let Assignment::One(child) = assignment else {
                continue;
            };
            let Some(child_def) = registry.class(&child.class) else {
                continue;
            };
            if child_def.owner_precedence.is_empty() {
                continue;
            }
            let current = child_def.owner_rank(host_class);
            let mut best: Option<(usize, &Location, String)> = None;
            let mut tied = false;
            for (other, other_class) in &hosts {
                if other == location || is_within(other, location, attribute) {
                    continue;
                }
                let rank = child_def.owner_rank(other_class);
                if rank >= current {
                    continue;
                }
                let Some(slot) = dependent_slot(registry, other_class, &child.class) else {
                    continue;
                };
                let best_rank = best.as_ref().map(|(r, ..)| *r);
                if best_rank == Some(rank) {
                    tied = true;
                } else if best_rank.is_none_or(|r| rank < r) {
                    best = Some((rank, other, slot));
                    tied = false;
                }
            }
            if let Some((_, destination, slot)) = best
                && !tied
            {
                moves.push((location.clone(), attribute.clone(), destination.clone(), slot));
            }
        }
    }

    for (source, attribute, destination, slot) in moves {
        let Some(Assignment::One(child)) =
            branch_at_mut(tree, &source).and_then(|b| b.fields.remove(&attribute))
        else {
            continue;
        };
        let Some(host) = branch_at_mut(tree, &destination) else {
            if let Some(origin) = branch_at_mut(tree, &source) {
                origin.fields.insert(attribute, Assignment::One(child));
            }
            continue;
        };
        debug!("Moving {} from {}.{attribute} to {}.{slot}", child.class, source.0, destination.0);
        match host.fields.remove(&slot) {
            Some(Assignment::One(mut existing)) => {
                merge_branches(&mut existing, child)?;
                host.fields.insert(slot, Assignment::One(existing));
            }
            Some(_) => {
                return Err(ValidationError::Conflict {
                    class: host.class.clone(),
                    attribute: slot,
                    existing: "(value)".to_string(),
                    incoming: child.class,
                });
            }
            None => {
                host.fields.insert(slot, Assignment::One(child));
            }
        }
    }
    Ok(())
}

fn merge_branches(target: &mut Branch, incoming: Branch) -> Result<(), ValidationError> {
    let class = target.class.clone();
    for (name, assignment) in incoming.fields {
        if !target.fields.contains_key(&name) {
            target.fields.insert(name, assignment);
            continue;
        }
        let Some(existing) = target.fields.get_mut(&name) else {
            continue;
        };
        match (existing, assignment) {
            (Assignment::Value { value: current, .. }, Assignment::Value { value, .. }) => {
                if *current != value {
                    return Err(ValidationError::Conflict {
                        class,
                        attribute: name,
                        existing: current.as_display(),
                        incoming: value.as_display(),
                    });
                }
            }
            (Assignment::One(current), Assignment::One(child)) => merge_branches(current, child)?,
            (Assignment::Many(current), Assignment::Many(members)) => {
                for (idx, member) in members {
                    match current.entry(idx) {
                        Entry::Occupied(mut slot) => merge_branches(slot.get_mut(), member)?,
                        Entry::Vacant(slot) => {
                            slot.insert(member);
                        }
                    }
                }
            }
            _ => {
                return Err(ValidationError::Conflict {
                    class,
                    attribute: name,
                    existing: "(value)".to_string(),
                    incoming: "(reference)".to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Applies status cascades of every node connected to `roots`. Returns the
/// number of values forced.
pub fn cascade(registry: &dyn TypeRegistry, graph: &mut Graph, roots: &[NodeId]) -> usize {
    let mut queue: VecDeque<NodeId> = graph.reachable(roots).into();
    let mut visited = BTreeSet::new();
    let mut forced = 0;
    while let Some(id) = queue.pop_front() {
        if !graph.contains(id) || !visited.insert(id) {
            continue;
        }
        let Some(def) = registry.class(&graph[id].class) else {
            continue;
        };
        for rule in &def.cascades {
            let triggered = graph
                .value(id, &rule.attribute)
                .is_some_and(|v| v.matches_literal(&rule.when));
            if !triggered {
                continue;
            }
            let targets: Vec<NodeId> = graph[id]
                .references()
                .filter(|(name, _)| *name == rule.target)
                .map(|(_, target)| target)
                .collect();
            for target in targets {
                let applies = match &rule.from {
                    Some(from) => graph
                        .value(target, &rule.target_attribute)
                        .is_some_and(|v| v.matches_literal(from)),
                    None => true,
                };
                let set = Value::String(rule.set.clone());
                if applies && graph.force(target, &rule.target_attribute, set) {
                    debug!(
                        "Cascade {}.{}={} set {}.{} to {}",
                        graph[id].class,
                        rule.attribute,
                        rule.when,
                        graph.describe(target),
                        rule.target_attribute,
                        rule.set
                    );
                    forced += 1;
                    queue.push_back(target);
                }
            }
        }
    }
    forced
}
