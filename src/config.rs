//! Migration configuration: which columns land where, which attributes get
//! defaults, and which keys are uniquified.

use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    coerce::Coercer,
    defaults::{DefaultSpec, Resolver},
    error::MappingError,
    mapping::{MappingPlan, MappingSpec},
    model::TypeRegistry,
};

/// Supplies the field mappings and per-class default and uniqueness
/// registrations for one migration.
pub trait SchemaProvider {
    fn mapping(&self) -> &MappingSpec;
    fn defaults(&self) -> &[DefaultSpec];
    fn unique(&self) -> &BTreeMap<String, Vec<String>>;

    /// Compiles the mapping against the input headers and the default rules
    /// against the registry.
    fn compile(
        &self,
        headers: &[String],
        registry: &dyn TypeRegistry,
        coercer: &Coercer,
    ) -> Result<(MappingPlan, Resolver), MappingError> {
        let plan = MappingPlan::compile(self.mapping(), headers, registry, coercer)?;
        let resolver = Resolver::compile(self.defaults(), self.unique(), registry, coercer)?;
        Ok((plan, resolver))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(flatten)]
    pub mapping: MappingSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defaults: Vec<DefaultSpec>,
    /// Class name to the string attributes rewritten in uniqueness mode.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unique: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub options: RunOptions,
}

impl MigrationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening migration config {path:?}"))?;
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).context("Parsing migration config YAML")
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).context("Parsing migration config YAML")
    }
}

impl SchemaProvider for MigrationConfig {
    fn mapping(&self) -> &MappingSpec {
        &self.mapping
    }

    fn defaults(&self) -> &[DefaultSpec] {
        &self.defaults
    }

    fn unique(&self) -> &BTreeMap<String, Vec<String>> {
        &self.unique
    }
}
