//! Column to attribute-path mapping and the per-row field mapper.
//!
//! A [`MappingSpec`] is the declarative part of a migration configuration:
//! named row entries (alias -> class) and one [`FieldMapping`] per column.
//! [`MappingPlan::compile`] checks every path against the type registry once,
//! up front, so a broken path is a [`MappingError`] for the whole run rather
//! than a failure on every row. [`MappingPlan::map`] then turns each row into
//! an [`AssignmentTree`].
//!
//! Paths start with an entry alias followed by attribute names, e.g.
//! `group.registration.participant.first_name`. A collection segment may carry
//! a repeat index, `specimens[2].label`, to fill several members from one row.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    sync::OnceLock,
};

use heck::ToSnakeCase;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    coerce::{Coercer, ScalarTarget},
    data::Value,
    error::{ConversionError, MappingError},
    model::TypeRegistry,
    rows::{Row, RowContext},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub column: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_from: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingSpec {
    /// Row entry aliases and the class each one instantiates.
    pub entries: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    pub columns: Vec<FieldMapping>,
    /// Column whose value change closes the shared-ancestor scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub index: Option<usize>,
}

/// `entry.step[i].step.attribute`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributePath {
    pub entry: String,
    pub steps: Vec<Segment>,
    pub attribute: String,
}

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:\[([0-9]+)\])?$")
            .unwrap_or_else(|err| panic!("invalid segment pattern: {err}"))
    })
}

impl FromStr for AttributePath {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        for part in raw.trim().split('.') {
            let captures = segment_pattern()
                .captures(part)
                .ok_or_else(|| format!("'{part}' is not a valid path segment"))?;
            let index = match captures.get(2) {
                Some(m) => Some(
                    m.as_str()
                        .parse::<usize>()
                        .map_err(|_| format!("'{part}' has an out of range index"))?,
                ),
                None => None,
            };
            segments.push(Segment {
                name: captures[1].to_string(),
                index,
            });
        }
        if segments.len() < 2 {
            return Err("a path needs an entry and at least one attribute".to_string());
        }
        let attribute = segments.pop().map(|s| (s.name, s.index));
        let entry = segments.remove(0);
        match (entry, attribute) {
            (Segment { index: Some(_), .. }, _) => {
                Err("the entry segment cannot be indexed".into())
            }
            (_, Some((_, Some(_)))) => Err("the terminal attribute cannot be indexed".into()),
            (entry, Some((attribute, None))) => Ok(Self {
                entry: entry.name,
                steps: segments,
                attribute,
            }),
            (_, None) => Err("a path needs a terminal attribute".into()),
        }
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entry)?;
        for step in &self.steps {
            match step.index {
                Some(idx) => write!(f, ".{}[{idx}]", step.name)?,
                None => write!(f, ".{}", step.name)?,
            }
        }
        write!(f, ".{}", self.attribute)
    }
}

/// A subtree of assignments destined for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub class: String,
    pub fields: BTreeMap<String, Assignment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Value { value: Value, column: String },
    One(Branch),
    Many(BTreeMap<usize, Branch>),
}

impl Branch {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn value(&self, attribute: &str) -> Option<&Value> {
        match self.fields.get(attribute) {
            Some(Assignment::Value { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Follows a dotted path through single-valued children.
    pub fn value_at(&self, path: &str) -> Option<&Value> {
        match path.split_once('.') {
            None => self.value(path),
            Some((head, rest)) => match self.fields.get(head) {
                Some(Assignment::One(child)) => child.value_at(rest),
                _ => None,
            },
        }
    }

    fn child_mut(&mut self, step: &Segment, class: &str) -> &mut Branch {
        let fresh = || match step.index {
            Some(_) => Assignment::Many(BTreeMap::new()),
            None => Assignment::One(Branch::new(class)),
        };
        let slot = self.fields.entry(step.name.clone()).or_insert_with(fresh);
        if matches!(slot, Assignment::Value { .. }) {
            *slot = fresh();
        }
        match slot {
            Assignment::One(branch) => branch,
            Assignment::Many(members) => members
                .entry(step.index.unwrap_or_default())
                .or_insert_with(|| Branch::new(class)),
            Assignment::Value { .. } => unreachable!("scalar slot replaced above"),
        }
    }
}

/// The typed assignments of one row, keyed by entry alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentTree {
    pub entries: BTreeMap<String, Branch>,
}

impl AssignmentTree {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn assign(&mut self, plan: &ColumnPlan, value: Value) {
        let mut branch = self
            .entries
            .entry(plan.path.entry.clone())
            .or_insert_with(|| Branch::new(plan.classes[0].clone()));
        for (step, class) in plan.path.steps.iter().zip(&plan.classes[1..]) {
            branch = branch.child_mut(step, class);
        }
        branch.fields.insert(
            plan.path.attribute.clone(),
            Assignment::Value {
                value,
                column: plan.column.clone(),
            },
        );
    }
}

#[derive(Debug, Clone)]
pub struct ColumnPlan {
    pub column: String,
    pub index: usize,
    pub path: AttributePath,
    /// Class at each hop: the entry class, then one per step.
    pub classes: Vec<String>,
    pub target: ScalarTarget,
    pub convert: Option<String>,
    pub default: Option<String>,
    pub default_index: Option<usize>,
}

impl ColumnPlan {
    pub fn owner_class(&self) -> &str {
        self.classes.last().map(String::as_str).unwrap_or_default()
    }
}

/// Output of mapping one row.
#[derive(Debug, Clone, Default)]
pub struct Mapped {
    pub tree: AssignmentTree,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MappingPlan {
    pub entries: BTreeMap<String, String>,
    pub root: String,
    pub columns: Vec<ColumnPlan>,
    pub scope_index: Option<usize>,
}

pub fn find_header(headers: &[String], column: &str) -> Option<usize> {
    headers.iter().position(|h| h == column).or_else(|| {
        let wanted = column.to_snake_case();
        headers.iter().position(|h| h.to_snake_case() == wanted)
    })
}

impl MappingPlan {
    pub fn compile(
        spec: &MappingSpec,
        headers: &[String],
        registry: &dyn TypeRegistry,
        coercer: &Coercer,
    ) -> Result<Self, MappingError> {
        if spec.entries.is_empty() {
            return Err(MappingError::Invalid("no entries are declared".into()));
        }
        for class in spec.entries.values() {
            if registry.class(class).is_none() {
                return Err(MappingError::UnknownClass(class.clone()));
            }
        }
        let root = match &spec.root {
            Some(root) if spec.entries.contains_key(root) => root.clone(),
            Some(root) => {
                return Err(MappingError::Invalid(format!("root '{root}' is not an entry")));
            }
            None if spec.entries.len() == 1 => {
                spec.entries.keys().next().cloned().unwrap_or_default()
            }
            None => {
                return Err(MappingError::Invalid(
                    "a root entry is required when several entries are declared".into(),
                ));
            }
        };

        let mut seen: HashMap<String, String> = HashMap::new();
        let mut columns = Vec::with_capacity(spec.columns.len());
        for mapping in &spec.columns {
            let plan = compile_column(mapping, &spec.entries, headers, registry, coercer)?;
            let rendered = plan.path.to_string();
            if let Some(first) = seen.insert(rendered.clone(), plan.column.clone()) {
                return Err(MappingError::DuplicatePath {
                    first,
                    second: plan.column,
                    path: rendered,
                });
            }
            columns.push(plan);
        }

        let scope_index = match &spec.scope {
            Some(column) => Some(
                find_header(headers, column)
                    .ok_or_else(|| MappingError::UnknownColumn(column.clone()))?,
            ),
            None => None,
        };

        Ok(Self {
            entries: spec.entries.clone(),
            root,
            columns,
            scope_index,
        })
    }

    pub fn map(
        &self,
        row: &Row,
        coercer: &Coercer,
        ctx: &RowContext<'_>,
    ) -> Result<Mapped, ConversionError> {
        let mut mapped = Mapped::default();
        for plan in &self.columns {
            let Some(raw) = self.raw_value(plan, row) else {
                continue;
            };
            let convert = plan.convert.as_deref();
            let coerced = coercer.coerce(raw, &plan.target, convert, &plan.column, ctx)?;
            if let Some(warning) = coerced.warning {
                mapped.warnings.push(format!("{}: {warning}", plan.column));
            }
            mapped.tree.assign(plan, coerced.value);
        }
        Ok(mapped)
    }

    /// Blank fields are absent; defaults only apply to absent fields.
    fn raw_value<'r>(&'r self, plan: &'r ColumnPlan, row: &'r Row) -> Option<&'r str> {
        let present = |idx: usize| {
            row.fields
                .get(idx)
                .map(String::as_str)
                .filter(|v| !v.trim().is_empty())
        };
        present(plan.index)
            .or(plan.default.as_deref())
            .or_else(|| plan.default_index.and_then(present))
    }

    pub fn scope_value<'r>(&self, row: &'r Row) -> Option<&'r str> {
        self.scope_index
            .and_then(|idx| row.fields.get(idx))
            .map(String::as_str)
    }

    pub fn root_class(&self) -> &str {
        self.entries.get(&self.root).map(String::as_str).unwrap_or_default()
    }

    /// One display row per column: position, column, path, type, hook, default.
    pub fn describe(&self) -> Vec<Vec<String>> {
        self.columns
            .iter()
            .enumerate()
            .map(|(idx, plan)| {
                let default = match (&plan.default, plan.default_index) {
                    (Some(literal), _) => literal.clone(),
                    (None, Some(_)) => "(from column)".to_string(),
                    (None, None) => String::new(),
                };
                vec![
                    (idx + 1).to_string(),
                    plan.column.clone(),
                    plan.path.to_string(),
                    format!(
                        "{}.{}: {}",
                        plan.owner_class(),
                        plan.path.attribute,
                        plan.target.describe()
                    ),
                    plan.convert.clone().unwrap_or_default(),
                    default,
                ]
            })
            .collect()
    }
}

fn compile_column(
    mapping: &FieldMapping,
    entries: &BTreeMap<String, String>,
    headers: &[String],
    registry: &dyn TypeRegistry,
    coercer: &Coercer,
) -> Result<ColumnPlan, MappingError> {
    let invalid = |reason: String| MappingError::InvalidPath {
        column: mapping.column.clone(),
        path: mapping.path.clone(),
        reason,
    };
    let index = find_header(headers, &mapping.column)
        .ok_or_else(|| MappingError::UnknownColumn(mapping.column.clone()))?;
    let mut path = AttributePath::from_str(&mapping.path).map_err(invalid)?;
    let entry_class = entries
        .get(&path.entry)
        .ok_or_else(|| invalid(format!("unknown entry '{}'", path.entry)))?;

    let mut classes = vec![entry_class.clone()];
    let mut current = entry_class.clone();
    for step in &mut path.steps {
        let attr = registry
            .attribute(&current, &step.name)
            .ok_or_else(|| invalid(format!("{current} has no attribute '{}'", step.name)))?;
        let target = attr
            .kind
            .reference()
            .ok_or_else(|| invalid(format!("{current}.{} is not a reference", step.name)))?;
        match (attr.collection, step.index) {
            (false, Some(_)) => {
                return Err(invalid(format!("{current}.{} is not a collection", step.name)));
            }
            (true, None) => step.index = Some(0),
            _ => {}
        }
        current = target.to_string();
        classes.push(current.clone());
    }

    let attr = registry
        .attribute(&current, &path.attribute)
        .ok_or_else(|| invalid(format!("{current} has no attribute '{}'", path.attribute)))?;
    let target = ScalarTarget::resolve(attr, registry)
        .ok_or_else(|| invalid(format!("{current}.{} is not a scalar attribute", path.attribute)))?;

    if let Some(hook) = &mapping.convert
        && !coercer.has_hook(hook)
    {
        return Err(MappingError::UnknownHook {
            column: mapping.column.clone(),
            hook: hook.clone(),
        });
    }
    if let Some(literal) = &mapping.default
        && mapping.convert.is_none()
    {
        coercer
            .coerce_literal(literal, &target)
            .map_err(|reason| MappingError::InvalidDefault {
                class: current.clone(),
                attribute: path.attribute.clone(),
                reason,
            })?;
    }
    let default_index = match &mapping.default_from {
        Some(column) => Some(
            find_header(headers, column)
                .ok_or_else(|| MappingError::UnknownColumn(column.clone()))?,
        ),
        None => None,
    };

    Ok(ColumnPlan {
        column: mapping.column.clone(),
        index,
        path,
        classes,
        target,
        convert: mapping.convert.clone(),
        default: mapping.default.clone(),
        default_index,
    })
}
