#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use graph_migrate::{
    config::MigrationConfig,
    io_utils,
    migrator::MigrationContext,
    model::Model,
    persist::MemoryGateway,
    rows::RowSource,
};
use tempfile::{TempDir, tempdir};

pub const SPECIMEN_MODEL: &str = r#"
vocabularies:
  specimen_types:
    values: [Fixed Tissue, Frozen Tissue, Whole Blood]
    qualifiers: [" Block"]
classes:
  Participant:
    key: [medical_identifier.mrn]
    attributes:
      first_name: { type: string }
      last_name: { type: string }
      medical_identifier: { type: MedicalIdentifier, role: dependent, inverse: participant }
      registrations: { type: Registration, collection: true, role: dependent, inverse: participant }
  MedicalIdentifier:
    attributes:
      mrn: { type: string, mandatory: true }
      participant: { type: Participant, role: owner, inverse: medical_identifier }
  Registration:
    attributes:
      participant: { type: Participant, role: owner, inverse: registrations }
      groups: { type: Group, collection: true, role: dependent, inverse: registration }
  Group:
    key: [surgical_pathology_number]
    cascades:
      - attribute: collection_status
        when: Complete
        target: specimens
        target_attribute: collection_status
        from: Pending
        set: Collected
    attributes:
      surgical_pathology_number: { type: string, mandatory: true }
      collection_status: { type: string }
      registration: { type: Registration, role: owner, inverse: groups }
      specimens: { type: Specimen, collection: true, role: dependent, inverse: group }
      received_event: { type: ReceivedEvent, role: dependent, inverse: group }
  Specimen:
    minimal_match: [label]
    attributes:
      label: { type: string, mandatory: true }
      specimen_type: { type: vocabulary, vocabulary: specimen_types }
      initial_quantity: { type: measurement, unit: g }
      collection_status: { type: string }
      group: { type: Group, role: owner, inverse: specimens }
  ReceivedEvent:
    attributes:
      timestamp: { type: date, mandatory: true }
      user: { type: string, mandatory: true }
      group: { type: Group, role: owner, inverse: received_event }
"#;

pub const SPECIMEN_CONFIG: &str = r#"
entries:
  group: Group
  specimen: Specimen
root: group
columns:
  - { column: spn, path: group.surgical_pathology_number }
  - { column: label, path: specimen.label }
  - { column: specimen_type, path: specimen.specimen_type }
  - { column: qty, path: specimen.initial_quantity }
  - { column: mrn, path: group.registration.participant.medical_identifier.mrn }
  - { column: first, path: group.registration.participant.first_name }
  - { column: last, path: group.registration.participant.last_name }
  - { column: received, path: group.received_event.timestamp }
  - { column: status, path: group.collection_status }
defaults:
  - { class: Specimen, attribute: collection_status, value: Pending }
  - { class: Group, attribute: received_event, create: true }
  - { class: ReceivedEvent, attribute: user, value: admin }
  - { class: ReceivedEvent, attribute: timestamp, today: true }
unique:
  Group: [surgical_pathology_number]
"#;

pub const SPECIMEN_HEADER: &str = "spn,label,specimen_type,qty,mrn,first,last,received,status";

/// Header line followed by `rows`, newline terminated.
pub fn specimen_csv(rows: &[&str]) -> String {
    let mut text = String::from(SPECIMEN_HEADER);
    text.push('\n');
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    text
}

pub fn specimen_model() -> Model {
    Model::from_yaml_str(SPECIMEN_MODEL).expect("parse specimen model")
}

pub fn specimen_config() -> MigrationConfig {
    MigrationConfig::from_yaml_str(SPECIMEN_CONFIG).expect("parse specimen config")
}

/// Row source over in-memory CSV text.
pub fn source(csv: &str) -> RowSource<&[u8]> {
    let reader = io_utils::open_csv_reader(csv.as_bytes(), b',');
    RowSource::new(reader, encoding_rs::UTF_8).expect("read headers")
}

pub fn specimen_context(
    headers: &[String],
    gateway: MemoryGateway,
) -> MigrationContext<MemoryGateway> {
    MigrationContext::new(specimen_model(), &specimen_config(), headers.to_vec(), gateway)
        .expect("compile specimen mapping")
}

/// Context over a variant of the specimen model and config.
pub fn context_from(
    model: &str,
    config: &str,
    headers: &[String],
    gateway: MemoryGateway,
) -> MigrationContext<MemoryGateway> {
    let model = Model::from_yaml_str(model).expect("parse model");
    let config = MigrationConfig::from_yaml_str(config).expect("parse config");
    MigrationContext::new(model, &config, headers.to_vec(), gateway).expect("compile mapping")
}

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// Model, config and input CSV for the specimen domain.
    pub fn specimen_files(&self, rows: &[&str]) -> (PathBuf, PathBuf, PathBuf) {
        (
            self.write("model.yaml", SPECIMEN_MODEL),
            self.write("config.yaml", SPECIMEN_CONFIG),
            self.write("rows.csv", &specimen_csv(rows)),
        )
    }
}
