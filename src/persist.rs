//! Persistence driver and gateways.
//!
//! The driver walks everything reachable from a row's nodes, keeps what still
//! needs writing (never persisted, or persisted and since changed), orders it
//! so owners and referenced objects come first, and hands each node to a
//! [`PersistenceGateway`]. Nodes flagged `defer_until_siblings` are written
//! after every other child of their owner.
//!
//! Per node: `Unpersisted -> Submitted -> Persisted`, or `Submitted -> Failed`
//! which aborts the row. Nothing is retried here.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write,
};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    data::Value,
    error::PersistenceError,
    graph::{Graph, Node, NodeId, PersistState, Provenance, Slot},
    model::{Role, TypeRegistry},
};

/// Flat view of one object as the gateway sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<u64>,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, Vec<u64>>,
}

impl Record {
    pub fn template(class: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        Self {
            class: class.into(),
            identifier: None,
            values,
            references: BTreeMap::new(),
        }
    }

    /// Scalars plus references to nodes that already have identifiers.
    pub fn from_node(graph: &Graph, id: NodeId) -> Self {
        let node = &graph[id];
        let values = node
            .slots
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Scalar(field) => Some((name.clone(), field.value.clone())),
                _ => None,
            })
            .collect();
        let mut references: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (name, target) in node.references() {
            if let Some(identifier) = graph.get(target).and_then(|n| n.identifier) {
                references.entry(name.to_string()).or_default().push(identifier);
            }
        }
        Self {
            class: node.class.clone(),
            identifier: node.identifier,
            values,
            references,
        }
    }

    /// Same class, the template's identifier if it has one, every template
    /// value present and equal, and every template reference held.
    pub fn matches(&self, template: &Record) -> bool {
        self.class == template.class
            && template.identifier.is_none_or(|id| self.identifier == Some(id))
            && template
                .values
                .iter()
                .all(|(name, value)| self.values.get(name) == Some(value))
            && template.references.iter().all(|(name, ids)| {
                let held = self.references.get(name).map(Vec::as_slice).unwrap_or_default();
                ids.iter().all(|id| held.contains(id))
            })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct GatewayError(pub String);

/// The three operations the migration core needs from the target system.
pub trait PersistenceGateway {
    fn create(&mut self, record: &Record) -> Result<u64, GatewayError>;
    fn update(&mut self, record: &Record) -> Result<(), GatewayError>;
    fn query(&self, template: &Record) -> Result<Vec<Record>, GatewayError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedIds {
    pub ids: BTreeMap<NodeId, u64>,
    pub created: usize,
    pub updated: usize,
    pub fetched: usize,
}

pub struct PersistenceDriver<'a> {
    registry: &'a dyn TypeRegistry,
}

impl<'a> PersistenceDriver<'a> {
    pub fn new(registry: &'a dyn TypeRegistry) -> Self {
        Self { registry }
    }

    pub fn persist<G>(
        &self,
        graph: &mut Graph,
        gateway: &mut G,
        roots: &[NodeId],
    ) -> Result<PersistedIds, PersistenceError>
    where
        G: PersistenceGateway + ?Sized,
    {
        let work: BTreeSet<NodeId> = graph
            .reachable(roots)
            .into_iter()
            .filter(|id| needs_work(&graph[*id]))
            .collect();
        let order = self.order(graph, &work)?;
        let mut persisted = PersistedIds::default();
        for id in order {
            self.persist_node(graph, gateway, id, &mut persisted)?;
        }
        Ok(persisted)
    }

    /// Topological order over `work`: owners before dependents, referenced
    /// objects before referrers, deferred children after their siblings.
    pub fn order(
        &self,
        graph: &Graph,
        work: &BTreeSet<NodeId>,
    ) -> Result<Vec<NodeId>, PersistenceError> {
        let mut edges: BTreeSet<(NodeId, NodeId)> = BTreeSet::new();
        for &id in work {
            let node = &graph[id];
            for (name, target) in node.references() {
                if target == id || !work.contains(&target) {
                    continue;
                }
                match self.registry.attribute(&node.class, name).map(|d| d.role) {
                    Some(Role::Dependent) => {
                        edges.insert((id, target));
                    }
                    Some(Role::Owner) => {
                        edges.insert((target, id));
                    }
                    Some(Role::Independent) if !edges.contains(&(id, target)) => {
                        edges.insert((target, id));
                    }
                    _ => {}
                }
            }
            if self.is_deferred(node)
                && let Some(owner) = node.owner
            {
                for sibling in graph.owned_by(owner, None) {
                    if sibling != id
                        && work.contains(&sibling)
                        && !self.is_deferred(&graph[sibling])
                    {
                        edges.insert((sibling, id));
                    }
                }
            }
        }

        let mut incoming: BTreeMap<NodeId, usize> = work.iter().map(|id| (*id, 0)).collect();
        for (_, to) in &edges {
            if let Some(count) = incoming.get_mut(to) {
                *count += 1;
            }
        }
        let mut ready: BTreeSet<NodeId> = incoming
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(work.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for (_, to) in edges.range((id, NodeId(0))..).take_while(|(from, _)| *from == id) {
                if let Some(count) = incoming.get_mut(to) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*to);
                    }
                }
            }
        }
        if order.len() < work.len() {
            return Err(PersistenceError::Unordered(work.len() - order.len()));
        }
        Ok(order)
    }

    fn is_deferred(&self, node: &Node) -> bool {
        self.registry
            .class(&node.class)
            .is_some_and(|c| c.defer_until_siblings)
    }

    /// Identifiers of existing objects matching every key attribute of `id`,
    /// with the key rendered for messages. `None` when the class has no key or
    /// a key value is missing.
    fn existing<G>(
        &self,
        graph: &Graph,
        gateway: &G,
        id: NodeId,
    ) -> Result<Option<(String, BTreeSet<u64>)>, GatewayError>
    where
        G: PersistenceGateway + ?Sized,
    {
        let node = &graph[id];
        let Some(def) = self.registry.class(&node.class) else {
            return Ok(None);
        };
        let mut described = Vec::with_capacity(def.key.len());
        let mut matches: Option<BTreeSet<u64>> = None;
        for path in &def.key {
            let Some(value) = graph.value_at(id, path) else {
                return Ok(None);
            };
            described.push(format!("{path}={value}"));
            let found = self.candidates(gateway, &node.class, path, value)?;
            matches = Some(match matches {
                Some(prior) => prior.intersection(&found).copied().collect(),
                None => found,
            });
        }
        Ok(matches.map(|found| (described.join(", "), found)))
    }

    /// Identifiers of stored `class` objects whose `path` holds `value`. A
    /// dotted path resolves the referenced objects first, then steps back to
    /// `class` through the stored reference or its declared inverse.
    fn candidates<G>(
        &self,
        gateway: &G,
        class: &str,
        path: &str,
        value: &Value,
    ) -> Result<BTreeSet<u64>, GatewayError>
    where
        G: PersistenceGateway + ?Sized,
    {
        let Some((head, rest)) = path.split_once('.') else {
            let values = BTreeMap::from([(path.to_string(), value.clone())]);
            let template = Record::template(class, values);
            return Ok(gateway
                .query(&template)?
                .into_iter()
                .filter_map(|r| r.identifier)
                .collect());
        };
        let def = self
            .registry
            .attribute(class, head)
            .ok_or_else(|| GatewayError(format!("{class} has no attribute '{head}'")))?;
        let target = def
            .kind
            .reference()
            .ok_or_else(|| GatewayError(format!("{class}.{head} is not a reference")))?;

        let mut found = BTreeSet::new();
        for target_id in self.candidates(gateway, target, rest, value)? {
            let referrers = Record {
                references: BTreeMap::from([(head.to_string(), vec![target_id])]),
                ..Record::template(class, BTreeMap::new())
            };
            found.extend(gateway.query(&referrers)?.into_iter().filter_map(|r| r.identifier));
            if let Some(inverse) = &def.inverse {
                let stored = Record {
                    identifier: Some(target_id),
                    ..Record::template(target, BTreeMap::new())
                };
                for record in gateway.query(&stored)? {
                    found.extend(record.references.get(inverse).into_iter().flatten().copied());
                }
            }
        }
        Ok(found)
    }

    fn persist_node<G>(
        &self,
        graph: &mut Graph,
        gateway: &mut G,
        id: NodeId,
        persisted: &mut PersistedIds,
    ) -> Result<(), PersistenceError>
    where
        G: PersistenceGateway + ?Sized,
    {
        let class = graph[id].class.clone();
        let rejected = |action: &str, err: GatewayError| PersistenceError::Rejected {
            action: action.to_string(),
            class: class.clone(),
            message: err.0,
        };

        if graph[id].is_persisted() {
            let record = Record::from_node(graph, id);
            gateway.update(&record).map_err(|e| rejected("update", e))?;
            debug!("Updated {} as {:?}", graph.describe(id), record.identifier);
            graph[id].dirty = false;
            if let Some(identifier) = record.identifier {
                persisted.ids.insert(id, identifier);
            }
            persisted.updated += 1;
            return Ok(());
        }

        graph[id].state = PersistState::Submitted;
        let outcome = self.submit(graph, gateway, id);
        match outcome {
            Ok((identifier, fetched)) => {
                let node = &mut graph[id];
                node.state = PersistState::Persisted;
                node.identifier = Some(identifier);
                node.dirty = false;
                if fetched {
                    node.provenance = Provenance::Fetched;
                    persisted.fetched += 1;
                } else {
                    persisted.created += 1;
                }
                debug!("Persisted {} as {identifier}", graph.describe(id));
                persisted.ids.insert(id, identifier);
                Ok(())
            }
            Err(err) => {
                graph[id].state = PersistState::Failed;
                Err(match err {
                    Submit::Gateway(action, e) => rejected(action, e),
                    Submit::Ambiguous(key, count) => PersistenceError::AmbiguousMatch {
                        class: class.clone(),
                        key,
                        count,
                    },
                })
            }
        }
    }

    /// Adopts a single existing match or creates the object. Returns the
    /// identifier and whether it was adopted.
    fn submit<G>(
        &self,
        graph: &mut Graph,
        gateway: &mut G,
        id: NodeId,
    ) -> Result<(u64, bool), Submit>
    where
        G: PersistenceGateway + ?Sized,
    {
        let existing = self
            .existing(graph, &*gateway, id)
            .map_err(|e| Submit::Gateway("query", e))?;
        if let Some((key, found)) = existing {
            match (found.len(), found.first()) {
                (0, _) => {}
                (1, Some(&identifier)) => {
                    graph[id].identifier = Some(identifier);
                    let record = Record::from_node(graph, id);
                    gateway.update(&record).map_err(|e| Submit::Gateway("update", e))?;
                    return Ok((identifier, true));
                }
                (count, _) => return Err(Submit::Ambiguous(key, count)),
            }
        }
        let record = Record::from_node(graph, id);
        let identifier = gateway.create(&record).map_err(|e| Submit::Gateway("create", e))?;
        Ok((identifier, false))
    }
}

enum Submit {
    Gateway(&'static str, GatewayError),
    Ambiguous(String, usize),
}

fn needs_work(node: &Node) -> bool {
    match node.state {
        PersistState::Persisted => node.dirty,
        PersistState::Unpersisted | PersistState::Failed => true,
        PersistState::Submitted => false,
    }
}

/// In-process gateway; backs dry runs, tests and the JSON lines writer.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    records: BTreeMap<u64, Record>,
    next_id: u64,
    rejected: BTreeSet<String>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every create or update of `class` fail.
    pub fn reject_class(mut self, class: impl Into<String>) -> Self {
        self.rejected.insert(class.into());
        self
    }

    /// Stores an object as if it pre-existed in the target system.
    pub fn seed(&mut self, record: Record) -> u64 {
        self.next_id += 1;
        let identifier = self.next_id;
        self.records.insert(
            identifier,
            Record {
                identifier: Some(identifier),
                ..record
            },
        );
        identifier
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn find(&self, class: &str) -> Vec<&Record> {
        self.records.values().filter(|r| r.class == class).collect()
    }

    pub fn get(&self, identifier: u64) -> Option<&Record> {
        self.records.get(&identifier)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check(&self, record: &Record) -> Result<(), GatewayError> {
        if self.rejected.contains(&record.class) {
            Err(GatewayError(format!("{} objects are not accepted", record.class)))
        } else {
            Ok(())
        }
    }
}

impl PersistenceGateway for MemoryGateway {
    fn create(&mut self, record: &Record) -> Result<u64, GatewayError> {
        self.check(record)?;
        Ok(self.seed(record.clone()))
    }

    fn update(&mut self, record: &Record) -> Result<(), GatewayError> {
        self.check(record)?;
        let identifier = record.identifier.ok_or_else(|| {
            GatewayError("cannot update an object without an identifier".to_string())
        })?;
        let Some(stored) = self.records.get_mut(&identifier) else {
            return Err(GatewayError(format!("no object with identifier {identifier}")));
        };
        stored.values.extend(record.values.clone());
        stored.references.extend(record.references.clone());
        Ok(())
    }

    fn query(&self, template: &Record) -> Result<Vec<Record>, GatewayError> {
        Ok(self
            .records
            .values()
            .filter(|r| r.matches(template))
            .cloned()
            .collect())
    }
}

#[derive(Serialize)]
struct Line<'a> {
    action: &'a str,
    id: u64,
    class: &'a str,
    values: BTreeMap<&'a str, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    references: &'a BTreeMap<String, Vec<u64>>,
}

/// Writes every create and update as one JSON object per line and answers
/// queries from what it has written.
pub struct JsonLinesGateway<W: Write> {
    writer: W,
    index: MemoryGateway,
}

impl<W: Write> JsonLinesGateway<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            index: MemoryGateway::new(),
        }
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, action: &str, id: u64, record: &Record) -> Result<(), GatewayError> {
        let line = Line {
            action,
            id,
            class: &record.class,
            values: record
                .values
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_display()))
                .collect(),
            references: &record.references,
        };
        serde_json::to_writer(&mut self.writer, &line).map_err(|e| GatewayError(e.to_string()))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| GatewayError(e.to_string()))
    }
}

impl<W: Write> PersistenceGateway for JsonLinesGateway<W> {
    fn create(&mut self, record: &Record) -> Result<u64, GatewayError> {
        let id = self.index.create(record)?;
        self.write_line("create", id, record)?;
        Ok(id)
    }

    fn update(&mut self, record: &Record) -> Result<(), GatewayError> {
        self.index.update(record)?;
        let id = record.identifier.unwrap_or_default();
        self.write_line("update", id, record)
    }

    fn query(&self, template: &Record) -> Result<Vec<Record>, GatewayError> {
        self.index.query(template)
    }
}
