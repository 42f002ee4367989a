use std::fmt::Write as _;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use encoding_rs::UTF_8;
use graph_migrate::{
    config::MigrationConfig,
    io_utils,
    migrator::{DiscardRejects, MigrationContext, MigrationOptions},
    model::Model,
    persist::MemoryGateway,
    rows::RowSource,
};

const MODEL: &str = r#"
classes:
  Participant:
    key: [mrn]
    attributes:
      mrn: { type: string, mandatory: true }
      groups: { type: Group, collection: true, role: dependent, inverse: participant }
  Group:
    key: [spn]
    attributes:
      spn: { type: string, mandatory: true }
      participant: { type: Participant, role: owner, inverse: groups }
      specimens: { type: Specimen, collection: true, role: dependent, inverse: group }
  Specimen:
    minimal_match: [label]
    attributes:
      label: { type: string, mandatory: true }
      quantity: { type: measurement, unit: g }
      received: { type: date }
      status: { type: string }
      group: { type: Group, role: owner, inverse: specimens }
"#;

const CONFIG: &str = r#"
entries:
  group: Group
  specimen: Specimen
root: group
scope: mrn
columns:
  - { column: mrn, path: group.participant.mrn }
  - { column: spn, path: group.spn }
  - { column: label, path: specimen.label }
  - { column: qty, path: specimen.quantity }
  - { column: received, path: specimen.received }
defaults:
  - { class: Specimen, attribute: status, value: Pending }
"#;

fn generate_rows(rows: usize) -> String {
    let mut csv = String::from("mrn,spn,label,qty,received\n");
    for i in 0..rows {
        let participant = i / 50;
        let group = i / 10;
        let day = (i % 28) + 1;
        let _ = writeln!(csv, "{participant},G{group},S{i},{}.5 mg,2024-01-{day:02}", i % 900);
    }
    csv
}

fn bench_migrate_rows(c: &mut Criterion) {
    let csv = generate_rows(5_000);
    let model = Model::from_yaml_str(MODEL).expect("parse model");
    let config = MigrationConfig::from_yaml_str(CONFIG).expect("parse config");

    let mut group = c.benchmark_group("migrate_rows");
    for (name, dry_run) in [("memory_gateway", false), ("dry_run", true)] {
        let options = MigrationOptions {
            dry_run,
            ..MigrationOptions::default()
        };
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let reader = io_utils::open_csv_reader(csv.as_bytes(), b',');
                    let source = RowSource::new(reader, UTF_8).expect("read headers");
                    let context = MigrationContext::new(
                        model.clone(),
                        &config,
                        source.headers().to_vec(),
                        MemoryGateway::new(),
                    )
                    .expect("compile mapping");
                    (source, context)
                },
                |(source, mut context)| {
                    let report = context
                        .run(source, &options, &mut DiscardRejects)
                        .expect("migrate rows");
                    assert_eq!(report.rejected, 0);
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_migrate_rows);
criterion_main!(benches);
