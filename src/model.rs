//! Target object model: classes, attributes and controlled vocabularies.
//!
//! The model is the migration core's view of the wrapped application's
//! metadata. It answers, for a declaring class and an attribute name, what the
//! attribute holds (a scalar of some [`ValueType`] or a reference to another
//! class), whether it is collection-valued, and which way ownership runs.
//!
//! ## Roles
//!
//! - `owner`: the attribute references the declaring object's owner.
//! - `dependent`: the attribute references objects owned by the declaring object.
//! - `independent`: a plain reference; the target is persisted first.
//!
//! Classes may also carry `extensions`, dynamic attribute sets resolved through
//! the [`Extensible`] capability when the static lookup misses.

use std::{collections::BTreeMap, fmt, fs::File, io::BufReader, path::Path, str::FromStr};

use anyhow::{Context, Result, anyhow, bail, ensure};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Measurement,
    Vocabulary,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::Decimal => "decimal",
            ValueType::Boolean => "boolean",
            ValueType::Date => "date",
            ValueType::DateTime => "datetime",
            ValueType::Measurement => "measurement",
            ValueType::Vocabulary => "vocabulary",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "string" => Ok(ValueType::String),
            "integer" | "int" => Ok(ValueType::Integer),
            "float" | "double" => Ok(ValueType::Float),
            "decimal" => Ok(ValueType::Decimal),
            "boolean" | "bool" => Ok(ValueType::Boolean),
            "date" => Ok(ValueType::Date),
            "datetime" | "timestamp" => Ok(ValueType::DateTime),
            "measurement" | "quantity" => Ok(ValueType::Measurement),
            "vocabulary" | "enum" => Ok(ValueType::Vocabulary),
            other => Err(anyhow!("Unknown scalar type '{other}'")),
        }
    }
}

/// What an attribute holds: a scalar or a reference to another class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    Scalar(ValueType),
    Reference(String),
}

impl AttributeType {
    pub fn reference(&self) -> Option<&str> {
        match self {
            AttributeType::Reference(class) => Some(class),
            AttributeType::Scalar(_) => None,
        }
    }

    pub fn scalar(&self) -> Option<ValueType> {
        match self {
            AttributeType::Scalar(ty) => Some(*ty),
            AttributeType::Reference(_) => None,
        }
    }
}

impl Serialize for AttributeType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            AttributeType::Scalar(ty) => serializer.serialize_str(ty.as_str()),
            AttributeType::Reference(class) => serializer.serialize_str(class),
        }
    }
}

impl<'de> Deserialize<'de> for AttributeType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        if token.trim().is_empty() {
            return Err(de::Error::custom("attribute type cannot be empty"));
        }
        Ok(match ValueType::from_str(&token) {
            Ok(ty) => AttributeType::Scalar(ty),
            Err(_) => AttributeType::Reference(token.trim().to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Independent,
    Owner,
    Dependent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDef {
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default)]
    pub collection: bool,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocabulary: Option<String>,
}

impl AttributeDef {
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, AttributeType::Reference(_))
    }

    /// True when ownership runs along this attribute in either direction.
    pub fn is_containment(&self) -> bool {
        self.is_reference() && matches!(self.role, Role::Owner | Role::Dependent)
    }
}

/// Forces dependent values when an owner attribute reaches a trigger value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cascade {
    pub attribute: String,
    pub when: String,
    pub target: String,
    pub target_attribute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub set: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassDef {
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDef>,
    /// Attribute paths identifying a real-world entity; drives sharing across rows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<String>,
    /// Attributes deciding whether two siblings occupy the same slot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub minimal_match: Vec<String>,
    /// Owner classes in order of preference when several are plausible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_precedence: Vec<String>,
    #[serde(default)]
    pub defer_until_siblings: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cascades: Vec<Cascade>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, AttributeDef>,
}

/// Capability interface for attributes that are not part of the static class model.
pub trait Extensible {
    fn has_dynamic_attribute(&self, name: &str) -> bool;
    fn dynamic_attribute(&self, name: &str) -> Option<&AttributeDef>;
}

impl Extensible for ClassDef {
    fn has_dynamic_attribute(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    fn dynamic_attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.extensions.get(name)
    }
}

impl ClassDef {
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes
            .get(name)
            .or_else(|| self.dynamic_attribute(name))
    }

    /// Static and dynamic attributes, static first.
    pub fn all_attributes(&self) -> impl Iterator<Item = (&String, &AttributeDef)> {
        self.attributes.iter().chain(
            self.extensions
                .iter()
                .filter(|(name, _)| !self.attributes.contains_key(*name)),
        )
    }

    /// Attributes used to recognise an existing sibling; falls back to the key.
    pub fn match_attributes(&self) -> &[String] {
        if self.minimal_match.is_empty() {
            &self.key
        } else {
            &self.minimal_match
        }
    }

    /// Position of `owner_class` in the precedence list; unlisted owners rank last.
    pub fn owner_rank(&self, owner_class: &str) -> usize {
        self.owner_precedence
            .iter()
            .position(|c| c == owner_class)
            .unwrap_or(self.owner_precedence.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub values: Vec<String>,
    /// Qualifier suffixes toggled once when an exact match fails.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifiers: Vec<String>,
}

/// Outcome of a vocabulary lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VocabularyMatch {
    Exact(String),
    Fallback(String),
}

impl Vocabulary {
    pub fn resolve(&self, raw: &str) -> Option<VocabularyMatch> {
        if let Some(found) = self.values.iter().find(|v| v.as_str() == raw) {
            return Some(VocabularyMatch::Exact(found.clone()));
        }
        self.qualifiers.iter().find_map(|qualifier| {
            let candidate = match raw.strip_suffix(qualifier.as_str()) {
                Some(stripped) => stripped.to_string(),
                None => format!("{raw}{qualifier}"),
            };
            self.values
                .iter()
                .find(|v| **v == candidate)
                .map(|v| VocabularyMatch::Fallback(v.clone()))
        })
    }
}

/// Metadata lookups the migration core needs from the target system.
pub trait TypeRegistry {
    fn class(&self, name: &str) -> Option<&ClassDef>;
    fn vocabulary(&self, name: &str) -> Option<&Vocabulary>;

    fn attribute(&self, class: &str, attribute: &str) -> Option<&AttributeDef> {
        self.class(class).and_then(|c| c.attribute(attribute))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub classes: BTreeMap<String, ClassDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vocabularies: BTreeMap<String, Vocabulary>,
}

impl TypeRegistry for Model {
    fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(name)
    }

    fn vocabulary(&self, name: &str) -> Option<&Vocabulary> {
        self.vocabularies.get(name)
    }
}

impl Model {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening model file {path:?}"))?;
        let model: Model = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing model YAML {path:?}"))?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let model: Model = serde_yaml::from_str(input).context("Parsing model YAML")?;
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        for (class_name, class) in &self.classes {
            for (name, attr) in class.all_attributes() {
                self.validate_attribute(class_name, name, attr)?;
            }
            for key in class.key.iter().chain(class.minimal_match.iter()) {
                self.validate_key_path(class_name, key)?;
            }
            for owner in &class.owner_precedence {
                ensure!(
                    self.classes.contains_key(owner),
                    "{class_name}: owner precedence names unknown class '{owner}'"
                );
            }
            for cascade in &class.cascades {
                self.validate_cascade(class_name, class, cascade)?;
            }
        }
        Ok(())
    }

    fn validate_attribute(&self, class_name: &str, name: &str, attr: &AttributeDef) -> Result<()> {
        match &attr.kind {
            AttributeType::Reference(target) => {
                let Some(target_class) = self.classes.get(target) else {
                    bail!("{class_name}.{name} references unknown class '{target}'");
                };
                if let Some(inverse) = &attr.inverse {
                    let Some(back) = target_class.attribute(inverse) else {
                        bail!("{class_name}.{name}: inverse '{target}.{inverse}' does not exist");
                    };
                    ensure!(
                        back.kind.reference() == Some(class_name),
                        "{class_name}.{name}: inverse '{target}.{inverse}' does not \
                         reference {class_name}"
                    );
                }
            }
            AttributeType::Scalar(ValueType::Measurement) => {
                ensure!(
                    attr.unit.is_some(),
                    "{class_name}.{name}: measurement attributes require a unit"
                );
            }
            AttributeType::Scalar(ValueType::Vocabulary) => {
                let vocabulary = attr.vocabulary.as_deref().ok_or_else(|| {
                    anyhow!("{class_name}.{name}: vocabulary attributes require a vocabulary")
                })?;
                ensure!(
                    self.vocabularies.contains_key(vocabulary),
                    "{class_name}.{name}: unknown vocabulary '{vocabulary}'"
                );
            }
            AttributeType::Scalar(_) => {}
        }
        ensure!(
            !attr.collection || attr.is_reference(),
            "{class_name}.{name}: only reference attributes can be collections"
        );
        Ok(())
    }

    fn validate_key_path(&self, class_name: &str, path: &str) -> Result<()> {
        let mut current = class_name;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let attr = self
                .attribute(current, segment)
                .ok_or_else(|| anyhow!("{class_name}: key path '{path}' has unknown '{segment}'"))?;
            match (&attr.kind, segments.peek().is_some()) {
                (AttributeType::Reference(next), true) if !attr.collection => current = next,
                (AttributeType::Scalar(_), false) => {}
                _ => bail!("{class_name}: key path '{path}' must end at a scalar attribute"),
            }
        }
        Ok(())
    }

    fn validate_cascade(
        &self,
        class_name: &str,
        class: &ClassDef,
        cascade: &Cascade,
    ) -> Result<()> {
        ensure!(
            class.attribute(&cascade.attribute).is_some(),
            "{class_name}: cascade attribute '{}' does not exist",
            cascade.attribute
        );
        let target = class
            .attribute(&cascade.target)
            .and_then(|a| a.kind.reference())
            .ok_or_else(|| {
                anyhow!("{class_name}: cascade target '{}' is not a reference", cascade.target)
            })?;
        let attr = self
            .attribute(target, &cascade.target_attribute)
            .ok_or_else(|| {
                anyhow!(
                    "{class_name}: cascade attribute '{target}.{}' does not exist",
                    cascade.target_attribute
                )
            })?;
        ensure!(
            matches!(
                attr.kind,
                AttributeType::Scalar(ValueType::String | ValueType::Vocabulary)
            ),
            "{class_name}: cascade attribute '{target}.{}' must be textual",
            cascade.target_attribute
        );
        Ok(())
    }
}
