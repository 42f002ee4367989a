//! Default & uniqueness resolution, and the validation pass that follows it.
//!
//! Default rules are keyed by (class, attribute) and only ever fill unset
//! attributes. Rules come from configuration (`value`, `copy`, `today`,
//! `create`) or are registered in code as closures. Application walks the
//! dependents of the row's nodes breadth-first and repeats until no rule fires,
//! so a rule copying from an owner sees values other rules filled in.
//!
//! Uniquification rewrites configured key attributes with a process-wide
//! counter. A node is rewritten at most once per run, however many rows reuse it.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{Local, Utc};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    coerce::{Coercer, ScalarTarget},
    data::Value,
    error::{MappingError, ValidationError},
    graph::{Graph, NodeId},
    hooks::HookRegistry,
    model::{AttributeType, TypeRegistry, ValueType},
};

const MAX_DEFAULT_PASSES: usize = 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultSpec {
    pub class: String,
    pub attribute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Dotted path to copy from; `owner` steps to the node's owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<String>,
    #[serde(default)]
    pub today: bool,
    /// Instantiate a fresh object of the attribute's class.
    #[serde(default)]
    pub create: bool,
}

pub type DefaultFn = Arc<dyn Fn(&Graph, NodeId) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
pub enum DefaultRule {
    Value(Value),
    Copy(String),
    Today,
    Create(String),
    Custom(DefaultFn),
}

impl fmt::Debug for DefaultRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultRule::Value(value) => f.debug_tuple("Value").field(value).finish(),
            DefaultRule::Copy(path) => f.debug_tuple("Copy").field(path).finish(),
            DefaultRule::Today => f.write_str("Today"),
            DefaultRule::Create(class) => f.debug_tuple("Create").field(class).finish(),
            DefaultRule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefaultsOutcome {
    pub filled: usize,
    pub created: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    rules: BTreeMap<String, Vec<(String, DefaultRule)>>,
    unique: BTreeMap<String, Vec<String>>,
}

impl Resolver {
    pub fn compile(
        defaults: &[DefaultSpec],
        unique: &BTreeMap<String, Vec<String>>,
        registry: &dyn TypeRegistry,
        coercer: &Coercer,
    ) -> Result<Self, MappingError> {
        let mut resolver = Resolver::default();
        for spec in defaults {
            let rule = compile_rule(spec, registry, coercer)?;
            resolver.push(spec.class.clone(), spec.attribute.clone(), rule);
        }
        for (class, attributes) in unique {
            if registry.class(class).is_none() {
                return Err(MappingError::UnknownClass(class.clone()));
            }
            for attribute in attributes {
                let invalid = |reason: &str| MappingError::InvalidUniqueKey {
                    class: class.clone(),
                    attribute: attribute.clone(),
                    reason: reason.to_string(),
                };
                let attr = registry
                    .attribute(class, attribute)
                    .ok_or_else(|| invalid("no such attribute"))?;
                if attr.kind != AttributeType::Scalar(ValueType::String) {
                    return Err(invalid("only string attributes can be uniquified"));
                }
            }
        }
        resolver.unique = unique.clone();
        Ok(resolver)
    }

    /// Registers a rule computed in code.
    pub fn register<F>(&mut self, class: impl Into<String>, attribute: impl Into<String>, rule: F)
    where
        F: Fn(&Graph, NodeId) -> Option<Value> + Send + Sync + 'static,
    {
        self.push(class.into(), attribute.into(), DefaultRule::Custom(Arc::new(rule)));
    }

    fn push(&mut self, class: String, attribute: String, rule: DefaultRule) {
        self.rules.entry(class).or_default().push((attribute, rule));
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_unique(&self, class: &str) -> bool {
        self.unique.contains_key(class)
    }

    /// Fills unset attributes reachable from `roots` until no rule fires.
    pub fn apply_defaults(
        &self,
        registry: &dyn TypeRegistry,
        graph: &mut Graph,
        roots: &[NodeId],
    ) -> Result<DefaultsOutcome, ValidationError> {
        let mut outcome = DefaultsOutcome::default();
        if self.rules.is_empty() {
            return Ok(outcome);
        }
        let mut roots = roots.to_vec();
        for _ in 0..MAX_DEFAULT_PASSES {
            let order = graph.reachable(&roots);
            let mut changed = false;
            for id in order {
                let class = graph[id].class.clone();
                for (attribute, rule) in self.rules.get(&class).into_iter().flatten() {
                    if graph[id].is_set(attribute) {
                        continue;
                    }
                    if let Some(created) = fill(registry, graph, id, attribute, rule)? {
                        debug!("Defaulted {}.{attribute}", graph.describe(id));
                        changed = true;
                        outcome.filled += 1;
                        if let Some(created) = created {
                            outcome.created.push(created);
                            roots.push(created);
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
        Ok(outcome)
    }

    /// Rewrites the unique keys of every registered node connected to `roots`
    /// that has not been rewritten yet.
    pub fn uniquify(&self, graph: &mut Graph, roots: &[NodeId], uniquifier: &Uniquifier) -> usize {
        if self.unique.is_empty() {
            return 0;
        }
        let mut rewritten = 0;
        for id in graph.reachable(roots) {
            if graph[id].uniquified {
                continue;
            }
            let Some(attributes) = self.unique.get(&graph[id].class) else {
                continue;
            };
            for attribute in attributes {
                if let Some(Value::String(original)) = graph.value(id, attribute).cloned()
                    && graph.uniquify(id, attribute, Value::String(uniquifier.next(&original)))
                {
                    rewritten += 1;
                }
            }
            graph[id].uniquified = true;
        }
        rewritten
    }
}

fn compile_rule(
    spec: &DefaultSpec,
    registry: &dyn TypeRegistry,
    coercer: &Coercer,
) -> Result<DefaultRule, MappingError> {
    let invalid = |reason: String| MappingError::InvalidDefault {
        class: spec.class.clone(),
        attribute: spec.attribute.clone(),
        reason,
    };
    if registry.class(&spec.class).is_none() {
        return Err(MappingError::UnknownClass(spec.class.clone()));
    }
    let attr = registry
        .attribute(&spec.class, &spec.attribute)
        .ok_or_else(|| invalid("no such attribute".to_string()))?;
    let chosen = [spec.value.is_some(), spec.copy.is_some(), spec.today, spec.create]
        .into_iter()
        .filter(|set| *set)
        .count();
    if chosen != 1 {
        return Err(invalid("exactly one of value, copy, today or create is required".to_string()));
    }

    if let Some(literal) = &spec.value {
        let target = ScalarTarget::resolve(attr, registry)
            .ok_or_else(|| invalid("literal defaults need a scalar attribute".to_string()))?;
        return coercer
            .coerce_literal(literal, &target)
            .map(DefaultRule::Value)
            .map_err(invalid);
    }
    if let Some(path) = &spec.copy {
        if path.trim().is_empty() || path.ends_with("owner") {
            return Err(invalid(format!("'{path}' does not name a value")));
        }
        return Ok(DefaultRule::Copy(path.trim().to_string()));
    }
    if spec.today {
        return match attr.kind.scalar() {
            Some(ValueType::Date | ValueType::DateTime) => Ok(DefaultRule::Today),
            _ => Err(invalid("'today' needs a date or datetime attribute".to_string())),
        };
    }
    match attr.kind.reference() {
        Some(class) if !attr.collection => Ok(DefaultRule::Create(class.to_string())),
        _ => Err(invalid("'create' needs a single-valued reference".to_string())),
    }
}

/// Returns `None` when the rule produced nothing, otherwise the node it created.
fn fill(
    registry: &dyn TypeRegistry,
    graph: &mut Graph,
    id: NodeId,
    attribute: &str,
    rule: &DefaultRule,
) -> Result<Option<Option<NodeId>>, ValidationError> {
    let filled = |applied: bool| if applied { Some(None) } else { None };
    Ok(match rule {
        DefaultRule::Value(value) => filled(graph.derive(id, attribute, value.clone())),
        DefaultRule::Copy(path) => match graph.value_at(id, path).cloned() {
            Some(value) => filled(graph.derive(id, attribute, value)),
            None => None,
        },
        DefaultRule::Today => {
            let kind = registry
                .attribute(&graph[id].class, attribute)
                .and_then(|a| a.kind.scalar());
            let value = match kind {
                Some(ValueType::DateTime) => Value::DateTime(Local::now().naive_local()),
                _ => Value::Date(Local::now().date_naive()),
            };
            filled(graph.derive(id, attribute, value))
        }
        DefaultRule::Create(class) => {
            let def = registry
                .attribute(&graph[id].class, attribute)
                .ok_or_else(|| ValidationError::UnknownAttribute {
                    class: graph[id].class.clone(),
                    attribute: attribute.to_string(),
                })?;
            let child = graph.insert(class.as_str());
            graph.link(registry, id, attribute, def, child)?;
            Some(Some(child))
        }
        DefaultRule::Custom(rule) => match rule(graph, id) {
            Some(value) => filled(graph.derive(id, attribute, value)),
            None => None,
        },
    })
}

static UNIQUE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Produces values distinct from every other value it produced in this process.
#[derive(Debug, Clone)]
pub struct Uniquifier {
    tag: String,
}

impl Default for Uniquifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Uniquifier {
    /// Tags values with the current time so separate runs do not collide.
    pub fn new() -> Self {
        let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        Self { tag: base36(millis) }
    }

    pub fn with_tag(tag: impl Into<String>) -> Self {
        let tag: String = tag.into();
        Self {
            tag: tag.chars().filter(char::is_ascii_alphanumeric).collect(),
        }
    }

    /// `{original}_{tag}{n}`. The text after the last `_` is unique to this call.
    pub fn next(&self, original: &str) -> String {
        let n = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{original}_{}{n}", self.tag)
    }
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Checks mandatory attributes, per-class hooks and containment cycles for
/// everything connected to `roots`, owners included.
pub fn validate(
    registry: &dyn TypeRegistry,
    graph: &Graph,
    hooks: &HookRegistry,
    roots: &[NodeId],
) -> Result<(), ValidationError> {
    let order = graph.reachable(roots);
    for &id in &order {
        let node = &graph[id];
        let Some(def) = registry.class(&node.class) else {
            continue;
        };
        if let Some((name, _)) = def
            .all_attributes()
            .find(|(name, attr)| attr.mandatory && !node.is_set(name))
        {
            return Err(ValidationError::MissingMandatory {
                class: node.class.clone(),
                attribute: name.clone(),
            });
        }
    }
    hooks.validate(graph, &order)?;
    if let Some(cycle) = graph.find_cycle(registry) {
        return Err(ValidationError::Cycle(
            cycle.iter().map(|id| graph.describe(*id)).join(" -> "),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{graph::Slot, model::Model};
    use std::collections::BTreeSet;

    const MODEL: &str = r#"
classes:
  Group:
    attributes:
      name: { type: string }
      status: { type: string, mandatory: true }
      collected_on: { type: date }
      specimens: { type: Specimen, collection: true, role: dependent, inverse: group }
      received_event: { type: ReceivedEvent, role: dependent, inverse: group }
  Specimen:
    attributes:
      label: { type: string, mandatory: true }
      status: { type: string }
      quantity: { type: integer }
      group: { type: Group, role: owner, inverse: specimens }
  ReceivedEvent:
    attributes:
      user: { type: string, mandatory: true }
      group: { type: Group, role: owner, inverse: received_event }
"#;

    fn model() -> Model {
        Model::from_yaml_str(MODEL).unwrap()
    }

    fn spec(class: &str, attribute: &str) -> DefaultSpec {
        DefaultSpec {
            class: class.into(),
            attribute: attribute.into(),
            ..DefaultSpec::default()
        }
    }

    fn resolver(defaults: &[DefaultSpec], model: &Model) -> Resolver {
        Resolver::compile(defaults, &BTreeMap::new(), model, &Coercer::default()).unwrap()
    }

    fn group_with_specimen(model: &Model) -> (Graph, NodeId, NodeId) {
        let mut graph = Graph::new();
        let group = graph.insert("Group");
        let specimen = graph.insert("Specimen");
        let def = model.attribute("Group", "specimens").unwrap().clone();
        graph.link(model, group, "specimens", &def, specimen).unwrap();
        (graph, group, specimen)
    }

    #[test]
    fn defaults_fill_only_unset_attributes_to_fixpoint() {
        let model = model();
        let defaults = vec![
            DefaultSpec {
                copy: Some("owner.status".into()),
                ..spec("Specimen", "status")
            },
            DefaultSpec {
                value: Some("Pending".into()),
                ..spec("Group", "status")
            },
            DefaultSpec {
                value: Some("7".into()),
                ..spec("Specimen", "quantity")
            },
        ];
        let resolver = resolver(&defaults, &model);
        let (mut graph, group, specimen) = group_with_specimen(&model);
        graph.assign(specimen, "quantity", Value::Integer(3)).unwrap();

        let outcome = resolver.apply_defaults(&model, &mut graph, &[group]).unwrap();
        assert_eq!(outcome.filled, 2);
        assert_eq!(graph.value(group, "status"), Some(&Value::from("Pending")));
        assert_eq!(graph.value(specimen, "status"), Some(&Value::from("Pending")));
        assert_eq!(graph.value(specimen, "quantity"), Some(&Value::Integer(3)));
    }

    #[test]
    fn create_default_builds_a_linked_node() {
        let model = model();
        let defaults = vec![
            DefaultSpec {
                create: true,
                ..spec("Group", "received_event")
            },
            DefaultSpec {
                value: Some("admin".into()),
                ..spec("ReceivedEvent", "user")
            },
            DefaultSpec {
                today: true,
                ..spec("Group", "collected_on")
            },
        ];
        let resolver = resolver(&defaults, &model);
        let (mut graph, group, _) = group_with_specimen(&model);
        let outcome = resolver.apply_defaults(&model, &mut graph, &[group]).unwrap();
        let event = graph[group].one("received_event").expect("event created");
        assert_eq!(outcome.created, vec![event]);
        assert_eq!(graph[event].owner, Some(group));
        assert_eq!(graph.value(event, "user"), Some(&Value::from("admin")));
        assert!(matches!(graph.value(group, "collected_on"), Some(Value::Date(_))));
    }

    #[test]
    fn custom_rules_may_decline() {
        let model = model();
        let mut resolver = resolver(&[], &model);
        resolver.register("Specimen", "label", |graph: &Graph, id: NodeId| {
            graph.value_at(id, "owner.name").map(|name| Value::String(format!("{name}-1")))
        });
        let (mut graph, group, specimen) = group_with_specimen(&model);
        let outcome = resolver.apply_defaults(&model, &mut graph, &[group]).unwrap();
        assert_eq!(outcome.filled, 0);
        assert!(validate(&model, &graph, &HookRegistry::new(), &[group]).is_err());

        graph.assign(group, "name", Value::from("G")).unwrap();
        resolver.apply_defaults(&model, &mut graph, &[group]).unwrap();
        assert_eq!(graph.value(specimen, "label"), Some(&Value::from("G-1")));
    }

    #[test]
    fn compile_rejects_bad_rules() {
        let model = model();
        let coercer = Coercer::default();
        let bad_literal = DefaultSpec {
            value: Some("many".into()),
            ..spec("Specimen", "quantity")
        };
        assert!(matches!(
            Resolver::compile(&[bad_literal], &BTreeMap::new(), &model, &coercer),
            Err(MappingError::InvalidDefault { .. })
        ));
        let create_scalar = DefaultSpec {
            create: true,
            ..spec("Specimen", "label")
        };
        assert!(Resolver::compile(&[create_scalar], &BTreeMap::new(), &model, &coercer).is_err());
        let two_kinds = DefaultSpec {
            today: true,
            value: Some("x".into()),
            ..spec("Group", "collected_on")
        };
        assert!(Resolver::compile(&[two_kinds], &BTreeMap::new(), &model, &coercer).is_err());
        let unique = BTreeMap::from([("Specimen".to_string(), vec!["quantity".to_string()])]);
        assert!(matches!(
            Resolver::compile(&[], &unique, &model, &coercer),
            Err(MappingError::InvalidUniqueKey { .. })
        ));
    }

    #[test]
    fn uniquify_rewrites_each_node_once() {
        let model = model();
        let unique = BTreeMap::from([("Specimen".to_string(), vec!["label".to_string()])]);
        let resolver = Resolver::compile(&[], &unique, &model, &Coercer::default()).unwrap();
        let uniquifier = Uniquifier::with_tag("t");
        let (mut graph, group, specimen) = group_with_specimen(&model);
        graph.assign(specimen, "label", Value::from("S1")).unwrap();

        assert_eq!(resolver.uniquify(&mut graph, &[group], &uniquifier), 1);
        let first = graph.value(specimen, "label").cloned().unwrap();
        assert!(first.as_display().starts_with("S1_t"));
        assert_eq!(resolver.uniquify(&mut graph, &[group], &uniquifier), 0);
        assert_eq!(graph.value(specimen, "label"), Some(&first));
    }

    #[test]
    fn uniquifier_values_are_distinct() {
        let uniquifier = Uniquifier::new();
        let values: BTreeSet<String> = (0..100).map(|_| uniquifier.next("S")).collect();
        assert_eq!(values.len(), 100);
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }

    #[test]
    fn validation_reports_missing_mandatory_and_cycles() {
        let model = model();
        let (mut graph, group, specimen) = group_with_specimen(&model);
        let hooks = HookRegistry::new();
        let err = validate(&model, &graph, &hooks, &[group]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingMandatory {
                class: "Group".into(),
                attribute: "status".into()
            }
        );
        graph.assign(group, "status", Value::from("Pending")).unwrap();
        graph.assign(specimen, "label", Value::from("S1")).unwrap();
        validate(&model, &graph, &hooks, &[group]).unwrap();

        graph[group]
            .slots
            .insert("specimens".into(), Slot::Many(vec![specimen, group]));
        let err = validate(&model, &graph, &hooks, &[group]).unwrap_err();
        assert!(matches!(err, ValidationError::Cycle(_)), "{err}");
    }

    #[test]
    fn owner_side_nodes_are_defaulted_uniquified_and_validated() {
        let model = model();
        let defaults = vec![DefaultSpec {
            value: Some("Pending".into()),
            ..spec("Group", "status")
        }];
        let unique = BTreeMap::from([("Group".to_string(), vec!["name".to_string()])]);
        let resolver = Resolver::compile(&defaults, &unique, &model, &Coercer::default()).unwrap();
        let (mut graph, group, specimen) = group_with_specimen(&model);
        graph.assign(specimen, "label", Value::from("S1")).unwrap();
        graph.assign(group, "name", Value::from("G1")).unwrap();
        let hooks = HookRegistry::new();

        let err = validate(&model, &graph, &hooks, &[specimen]).unwrap_err();
        assert!(
            matches!(err, ValidationError::MissingMandatory { ref class, .. } if class == "Group"),
            "{err}"
        );

        let outcome = resolver.apply_defaults(&model, &mut graph, &[specimen]).unwrap();
        assert_eq!(outcome.filled, 1);
        assert_eq!(graph.value(group, "status"), Some(&Value::from("Pending")));

        let uniquifier = Uniquifier::with_tag("o");
        assert_eq!(resolver.uniquify(&mut graph, &[specimen], &uniquifier), 1);
        assert!(graph.value(group, "name").unwrap().as_display().starts_with("G1_o"));
        validate(&model, &graph, &hooks, &[specimen]).unwrap();
    }
}
