mod common;

use std::fs;

use assert_cmd::Command;
use common::TestWorkspace;
use predicates::str::contains;

fn graph_migrate() -> Command {
    Command::cargo_bin("graph-migrate").expect("binary exists")
}

#[test]
fn migrate_writes_objects_and_rejects() {
    let workspace = TestWorkspace::new();
    let (model, config, input) = workspace.specimen_files(&[
        "4001,S1,Fixed Tissue,3.4,20001,U,Z,2007-01-04,",
        "4001,S2,Fixed Tissue,abc,20001,U,Z,2007-01-04,",
        "4001,S3,Whole Blood,1,20001,U,Z,2007-01-04,",
        "4002,S4,Frozen Tissue,2,20002,A,B,2007-01-05,",
    ]);
    let output = workspace.path().join("objects.jsonl");
    let rejects = workspace.path().join("rejects.csv");

    graph_migrate()
        .args([
            "migrate",
            "-i",
            input.to_str().unwrap(),
            "-c",
            config.to_str().unwrap(),
            "-M",
            model.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--rejects",
            rejects.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stderr(contains("succeeded"))
        .stderr(contains("rejected"));

    let objects = fs::read_to_string(&output).expect("read output");
    let lines: Vec<serde_json::Value> = objects
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    let specimens = lines
        .iter()
        .filter(|l| l["class"] == "Specimen" && l["action"] == "create")
        .count();
    assert_eq!(specimens, 3);

    let rejected = fs::read_to_string(&rejects).expect("read rejects");
    assert_eq!(rejected.lines().count(), 1);
    assert!(rejected.contains("abc"));
    assert!(rejected.contains("qty"));
}

#[test]
fn dry_run_writes_no_objects() {
    let workspace = TestWorkspace::new();
    let (model, config, input) =
        workspace.specimen_files(&["4001,S1,Fixed Tissue,3.4,20001,U,Z,2007-01-04,"]);
    let output = workspace.path().join("objects.jsonl");

    graph_migrate()
        .args([
            "migrate",
            "-i",
            input.to_str().unwrap(),
            "-c",
            config.to_str().unwrap(),
            "-M",
            model.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--dry-run",
        ])
        .assert()
        .success();

    let objects = fs::read_to_string(&output).expect("read output");
    assert!(objects.is_empty());
}

#[test]
fn limit_stops_after_n_rows() {
    let workspace = TestWorkspace::new();
    let (model, config, input) = workspace.specimen_files(&[
        "4001,S1,Fixed Tissue,1,20001,U,Z,2007-01-04,",
        "4002,S2,Fixed Tissue,1,20002,U,Z,2007-01-04,",
        "4003,S3,Fixed Tissue,1,20003,U,Z,2007-01-04,",
    ]);
    let output = workspace.path().join("objects.jsonl");

    graph_migrate()
        .args([
            "migrate",
            "-i",
            input.to_str().unwrap(),
            "-c",
            config.to_str().unwrap(),
            "-M",
            model.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--limit",
            "2",
        ])
        .assert()
        .success();

    let objects = fs::read_to_string(&output).expect("read output");
    let groups = objects.lines().filter(|l| l.contains("\"class\":\"Group\"")).count();
    assert_eq!(groups, 2);
}

#[test]
fn plan_prints_compiled_columns() {
    let workspace = TestWorkspace::new();
    let (model, config, input) = workspace.specimen_files(&[]);

    graph_migrate()
        .args([
            "plan",
            "-c",
            config.to_str().unwrap(),
            "-M",
            model.to_str().unwrap(),
            "-i",
            input.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(contains("group.registration.participant.medical_identifier.mrn"))
        .stdout(contains("Specimen.initial_quantity: measurement"));
}

#[test]
fn plan_without_input_uses_configured_columns() {
    let workspace = TestWorkspace::new();
    let (model, config, _) = workspace.specimen_files(&[]);

    graph_migrate()
        .args(["plan", "-c", config.to_str().unwrap(), "-M", model.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("group.surgical_pathology_number"));
}

#[test]
fn plan_rejects_unknown_attribute_paths() {
    let workspace = TestWorkspace::new();
    let (model, _, _) = workspace.specimen_files(&[]);
    let config = workspace.write(
        "broken.yaml",
        "entries:\n  group: Group\ncolumns:\n  - { column: spn, path: group.no_such_attribute }\n",
    );

    graph_migrate()
        .args(["plan", "-c", config.to_str().unwrap(), "-M", model.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("error:"));
}

#[test]
fn migrate_fails_when_a_mapped_column_is_missing() {
    let workspace = TestWorkspace::new();
    let (model, config, _) = workspace.specimen_files(&[]);
    let input = workspace.write("short.csv", "spn,label\n4001,S1\n");

    graph_migrate()
        .args([
            "migrate",
            "-i",
            input.to_str().unwrap(),
            "-c",
            config.to_str().unwrap(),
            "-M",
            model.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(contains("Compiling mapping"));
}
