mod common;

use common::{SPECIMEN_CONFIG, SPECIMEN_MODEL, context_from, source, specimen_context, specimen_csv};
use graph_migrate::{
    data::Value,
    graph::{Graph, NodeId, Origin},
    migrator::{DiscardRejects, MigrationOptions, Rejection},
    persist::{MemoryGateway, Record},
};

fn record_of<'a>(gateway: &'a MemoryGateway, class: &str) -> &'a Record {
    let found = gateway.find(class);
    assert_eq!(found.len(), 1, "expected one {class}");
    found[0]
}

fn value(record: &Record, attribute: &str) -> String {
    record
        .values
        .get(attribute)
        .map(Value::as_display)
        .unwrap_or_default()
}

fn reference(gateway: &MemoryGateway, record: &Record, attribute: &str) -> Record {
    let id = record.references[attribute][0];
    gateway.get(id).cloned().expect("referenced record")
}

fn nodes_of(graph: &Graph, class: &str) -> Vec<NodeId> {
    graph.nodes().filter(|n| n.class == class).map(|n| n.id).collect()
}

#[test]
fn single_row_builds_the_full_specimen_graph() {
    let csv = specimen_csv(&["4001,S1,Fixed Tissue,3.4,20001,U,Z,2007-01-04,"]);
    let rows = source(&csv);
    let mut ctx = specimen_context(rows.headers(), MemoryGateway::new());
    let report = ctx
        .run(rows, &MigrationOptions::default(), &mut DiscardRejects)
        .expect("run");
    assert_eq!((report.succeeded, report.rejected), (1, 0));

    let gateway = ctx.gateway();
    let specimen = record_of(gateway, "Specimen");
    assert_eq!(value(specimen, "initial_quantity"), "3.4 g");
    assert_eq!(value(specimen, "specimen_type"), "Fixed Tissue");
    assert_eq!(value(specimen, "collection_status"), "Pending");

    let group = reference(gateway, specimen, "group");
    assert_eq!(value(&group, "surgical_pathology_number"), "4001");

    let registration = reference(gateway, &group, "registration");
    let participant = reference(gateway, &registration, "participant");
    assert_eq!(value(&participant, "first_name"), "U");
    assert_eq!(value(&participant, "last_name"), "Z");

    let identifier = record_of(gateway, "MedicalIdentifier");
    assert_eq!(value(identifier, "mrn"), "20001");
    assert_eq!(identifier.references["participant"], vec![participant.identifier.unwrap()]);

    let event = record_of(gateway, "ReceivedEvent");
    assert_eq!(value(event, "timestamp"), "2007-01-04");
    assert_eq!(value(event, "user"), "admin");
    assert_eq!(event.references["group"], vec![group.identifier.unwrap()]);
}

#[test]
fn unparseable_quantity_rejects_only_that_row() {
    let csv = specimen_csv(&[
        "4001,S1,Fixed Tissue,3.4,20001,U,Z,2007-01-04,",
        "4001,S2,Fixed Tissue,abc,20001,U,Z,2007-01-04,",
        "4001,S3,Whole Blood,1,20001,U,Z,2007-01-04,",
        "4002,S4,Frozen Tissue,2,20002,A,B,2007-01-05,",
    ]);
    let rows = source(&csv);
    let mut ctx = specimen_context(rows.headers(), MemoryGateway::new());
    let mut rejects: Vec<Rejection> = Vec::new();
    let report = ctx
        .run(rows, &MigrationOptions::default(), &mut rejects)
        .expect("run");
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.succeeded + report.rejected, report.total);
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].row, 2);
    assert!(rejects[0].reason.contains("'qty'"), "{}", rejects[0].reason);
    assert_eq!(rejects[0].fields[3], "abc");
    assert_eq!(ctx.gateway().find("Specimen").len(), 3);
}

#[test]
fn rows_sharing_an_mrn_share_one_participant() {
    let csv = specimen_csv(&[
        "4001,S1,Fixed Tissue,1,20001,U,Z,2007-01-04,",
        "4002,S2,Fixed Tissue,2,20001,U,Z,2007-01-04,",
    ]);
    let rows = source(&csv);
    let mut ctx = specimen_context(rows.headers(), MemoryGateway::new());
    ctx.run(rows, &MigrationOptions::default(), &mut DiscardRejects)
        .expect("run");

    let graph = ctx.graph();
    assert_eq!(nodes_of(graph, "Participant").len(), 1);
    let specimens = nodes_of(graph, "Specimen");
    assert_eq!(specimens.len(), 2);
    let participant_of = |specimen: NodeId| {
        let group = graph[specimen].owner.expect("group");
        let registration = graph[group].owner.expect("registration");
        graph[registration].owner.expect("participant")
    };
    assert_eq!(participant_of(specimens[0]), participant_of(specimens[1]));
    assert_eq!(ctx.gateway().find("Participant").len(), 1);
    assert_eq!(ctx.gateway().find("Group").len(), 2);
}

#[test]
fn conflicting_participant_names_are_rejected() {
    let csv = specimen_csv(&[
        "4001,S1,Fixed Tissue,1,20001,U,Z,2007-01-04,",
        "4002,S2,Fixed Tissue,2,20001,V,Z,2007-01-04,",
    ]);
    let rows = source(&csv);
    let mut ctx = specimen_context(rows.headers(), MemoryGateway::new());
    let mut rejects: Vec<Rejection> = Vec::new();
    ctx.run(rows, &MigrationOptions::default(), &mut rejects)
        .expect("run");
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].kind, "validation");
    assert!(rejects[0].reason.contains("first_name"));
    assert!(rejects[0].reason.contains("'U' versus 'V'"));
}

#[test]
fn completing_a_group_cascades_to_pending_specimens() {
    let csv = specimen_csv(&[
        "4001,S1,Fixed Tissue,1,20001,U,Z,2007-01-04,",
        "4001,S2,Fixed Tissue,2,20001,U,Z,2007-01-04,Complete",
        "4001,S1,Fixed Tissue,1,20001,U,Z,2007-01-04,",
    ]);
    let rows = source(&csv);
    let mut ctx = specimen_context(rows.headers(), MemoryGateway::new());
    let mut rejects: Vec<Rejection> = Vec::new();
    let report = ctx
        .run(rows, &MigrationOptions::default(), &mut rejects)
        .expect("run");
    assert!(rejects.is_empty(), "{rejects:?}");
    assert_eq!(report.succeeded, 3);
    assert!(report.updated >= 1);

    let gateway = ctx.gateway();
    let specimens = gateway.find("Specimen");
    assert_eq!(specimens.len(), 2);
    assert!(specimens.iter().all(|s| value(s, "collection_status") == "Collected"));

    let graph = ctx.graph();
    for id in nodes_of(graph, "Specimen") {
        let field = graph[id].field("collection_status").expect("status");
        assert_eq!(field.origin, Origin::Derived);
    }
}

#[test]
fn vocabulary_fallback_is_a_warning_not_a_rejection() {
    let csv = specimen_csv(&["4001,S1,Fixed Tissue Block,1,20001,U,Z,2007-01-04,"]);
    let rows = source(&csv);
    let mut ctx = specimen_context(rows.headers(), MemoryGateway::new());
    let report = ctx
        .run(rows, &MigrationOptions::default(), &mut DiscardRejects)
        .expect("run");
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.warnings, 1);
    assert_eq!(
        value(record_of(ctx.gateway(), "Specimen"), "specimen_type"),
        "Fixed Tissue"
    );
}

#[test]
fn missing_received_date_is_defaulted_with_a_fresh_event() {
    let csv = specimen_csv(&["4001,S1,Fixed Tissue,1,20001,U,Z,,"]);
    let rows = source(&csv);
    let mut ctx = specimen_context(rows.headers(), MemoryGateway::new());
    let report = ctx
        .run(rows, &MigrationOptions::default(), &mut DiscardRejects)
        .expect("run");
    assert_eq!(report.succeeded, 1);
    let event = record_of(ctx.gateway(), "ReceivedEvent");
    assert_eq!(value(event, "user"), "admin");
    assert!(!value(event, "timestamp").is_empty());
}

#[test]
fn existing_groups_are_reused_instead_of_recreated() {
    let mut gateway = MemoryGateway::new();
    let existing = gateway.seed(Record::template(
        "Group",
        [("surgical_pathology_number".to_string(), Value::from("4001"))]
            .into_iter()
            .collect(),
    ));
    let csv = specimen_csv(&["4001,S1,Fixed Tissue,1,20001,U,Z,2007-01-04,"]);
    let rows = source(&csv);
    let mut ctx = specimen_context(rows.headers(), gateway);
    let report = ctx
        .run(rows, &MigrationOptions::default(), &mut DiscardRejects)
        .expect("run");
    assert_eq!(report.fetched, 1);
    assert_eq!(ctx.gateway().find("Group").len(), 1);
    let specimen = record_of(ctx.gateway(), "Specimen");
    assert_eq!(specimen.references["group"], vec![existing]);
}

#[test]
fn dry_run_persists_nothing() {
    let csv = specimen_csv(&[
        "4001,S1,Fixed Tissue,1,20001,U,Z,2007-01-04,",
        "4001,S2,Fixed Tissue,oops,20001,U,Z,2007-01-04,",
    ]);
    let rows = source(&csv);
    let mut ctx = specimen_context(rows.headers(), MemoryGateway::new());
    let options = MigrationOptions {
        dry_run: true,
        ..MigrationOptions::default()
    };
    let report = ctx.run(rows, &options, &mut DiscardRejects).expect("run");
    assert_eq!((report.succeeded, report.rejected), (1, 1));
    assert!(ctx.gateway().is_empty());
    assert_eq!(report.created, 0);
}

#[test]
fn missing_mandatory_owner_attribute_rejects_the_row() {
    let model = SPECIMEN_MODEL.replace(
        "      last_name: { type: string }\n",
        "      last_name: { type: string, mandatory: true }\n",
    );
    let csv = specimen_csv(&["4001,S1,Fixed Tissue,3.4,20001,U,,2007-01-04,"]);
    let rows = source(&csv);
    let mut ctx = context_from(&model, SPECIMEN_CONFIG, rows.headers(), MemoryGateway::new());
    let mut rejects: Vec<Rejection> = Vec::new();
    let report = ctx
        .run(rows, &MigrationOptions::default(), &mut rejects)
        .expect("run");
    assert_eq!((report.succeeded, report.rejected), (0, 1));
    assert_eq!(rejects[0].kind, "validation");
    assert!(rejects[0].reason.contains("Participant.last_name"), "{}", rejects[0].reason);
    assert!(ctx.gateway().is_empty());
}

#[test]
fn owner_side_nodes_get_defaults_and_unique_keys() {
    let config = SPECIMEN_CONFIG
        .replace(
            "defaults:\n",
            "defaults:\n  - { class: Participant, attribute: last_name, value: Unknown }\n",
        )
        .replace(
            "  Group: [surgical_pathology_number]\n",
            "  Group: [surgical_pathology_number]\n  MedicalIdentifier: [mrn]\n",
        );
    let csv = specimen_csv(&["4001,S1,Fixed Tissue,3.4,20001,U,,2007-01-04,"]);
    let rows = source(&csv);
    let mut ctx = context_from(SPECIMEN_MODEL, &config, rows.headers(), MemoryGateway::new());
    let options = MigrationOptions {
        unique: true,
        ..MigrationOptions::default()
    };
    let report = ctx.run(rows, &options, &mut DiscardRejects).expect("run");
    assert_eq!(report.succeeded, 1);

    let gateway = ctx.gateway();
    assert_eq!(value(record_of(gateway, "Participant"), "last_name"), "Unknown");
    let mrn = value(record_of(gateway, "MedicalIdentifier"), "mrn");
    assert!(mrn.starts_with("20001_"), "{mrn}");
    let spn = value(record_of(gateway, "Group"), "surgical_pathology_number");
    assert!(spn.starts_with("4001_"), "{spn}");
}

#[test]
fn rerunning_a_file_reuses_keyed_owners() {
    let csv = specimen_csv(&["4001,S1,Fixed Tissue,3.4,20001,U,Z,2007-01-04,"]);
    let rows = source(&csv);
    let mut first = specimen_context(rows.headers(), MemoryGateway::new());
    first
        .run(rows, &MigrationOptions::default(), &mut DiscardRejects)
        .expect("first run");
    let participant = record_of(first.gateway(), "Participant").identifier;

    let rows = source(&csv);
    let mut second = specimen_context(rows.headers(), first.into_gateway());
    let report = second
        .run(rows, &MigrationOptions::default(), &mut DiscardRejects)
        .expect("second run");
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.fetched, 2);
    let gateway = second.gateway();
    assert_eq!(record_of(gateway, "Participant").identifier, participant);
    assert_eq!(gateway.find("Group").len(), 1);
    assert_eq!(gateway.find("Specimen").len(), 2);
}
