mod common;

use std::collections::BTreeMap;
use std::fs;

use assert_matches::assert_matches;
use common::{MockOpenbis, RecordingSink, code, summary};
use openbis_toolkit::app::{App, InfoRequest};
use openbis_toolkit::cache::DEFAULT_EXPIRY;
use openbis_toolkit::domain::SearchTarget;
use openbis_toolkit::error::ObisError;
use openbis_toolkit::openbis::{SampleInfo, SpaceSummary};
use openbis_toolkit::output::JsonOutput;
use openbis_toolkit::reconcile::RemoteFileDescriptor;
use openbis_toolkit::upload::{FileKind, UploadRequest};

fn space(code: &str) -> SpaceSummary {
    SpaceSummary {
        code: code.to_string(),
        description: None,
    }
}

#[test]
fn connect_lists_spaces_only_when_verbose() {
    let client = MockOpenbis {
        spaces: vec![space("DDB"), space("LAB")],
        ..MockOpenbis::default()
    };
    let app = App::new(client, DEFAULT_EXPIRY);

    let quiet = app.connect(false, &JsonOutput).unwrap();
    let verbose = app.connect(true, &JsonOutput).unwrap();

    assert_eq!(quiet.space_count, 2);
    assert!(quiet.spaces.is_empty());
    assert_eq!(verbose.spaces.len(), 2);
}

#[test]
fn search_collects_per_kind_failures() {
    let client = MockOpenbis::default()
        .with_dataset("DS-100", Vec::new())
        .with_dataset("DS-101", Vec::new())
        .with_dataset("OTHER-1", Vec::new());
    let app = App::new(client, DEFAULT_EXPIRY);

    let result = app.search("DS-", SearchTarget::All, 1, &JsonOutput).unwrap();

    let datasets = result.datasets.unwrap();
    assert_eq!(datasets.total, 2);
    assert_eq!(datasets.items.len(), 1);
    assert_eq!(datasets.items[0].code, "DS-100");
    assert!(result.experiments.is_none());
    assert_eq!(result.samples.unwrap().total, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("experiments:"));
}

#[test]
fn search_limited_to_one_target() {
    let app = App::new(MockOpenbis::default().with_dataset("DS-1", Vec::new()), DEFAULT_EXPIRY);

    let result = app.search("DS", SearchTarget::Datasets, 10, &JsonOutput).unwrap();

    assert!(result.errors.is_empty());
    assert!(result.samples.is_none());
    assert_eq!(result.datasets.unwrap().total, 1);
}

#[test]
fn list_files_requires_existing_dataset() {
    let files = vec![RemoteFileDescriptor::new("original/x.raw").with_size(10)];
    let app = App::new(MockOpenbis::default().with_dataset("DS-1", files), DEFAULT_EXPIRY);

    let listed = app.list_dataset_files(&code("DS-1"), &JsonOutput).unwrap();
    let missing = app.list_dataset_files(&code("DS-2"), &JsonOutput).unwrap_err();

    assert_eq!(listed.files.len(), 1);
    assert_matches!(missing, ObisError::DatasetNotFound(_));
}

#[test]
fn list_collection_truncates_but_reports_total() {
    let mut client = MockOpenbis::default();
    client.collections.insert(
        "/DDB/CK/RAW".to_string(),
        vec![summary("A"), summary("B"), summary("C")],
    );
    let app = App::new(client, DEFAULT_EXPIRY);

    let result = app
        .list_collection(&"/ddb/ck/raw".parse().unwrap(), Some(2), &JsonOutput)
        .unwrap();

    assert_eq!(result.total, 3);
    assert_eq!(result.datasets.len(), 2);
}

#[test]
fn info_without_selection_is_rejected() {
    let app = App::new(MockOpenbis::default(), DEFAULT_EXPIRY);
    let err = app.info(&InfoRequest::default(), &JsonOutput).unwrap_err();
    assert_matches!(err, ObisError::NothingRequested);
}

#[test]
fn info_combines_spaces_dataset_and_sample() {
    let mut client = MockOpenbis {
        spaces: vec![space("DDB")],
        ..MockOpenbis::default()
    }
    .with_dataset("DS-1", vec![RemoteFileDescriptor::new("a.txt").with_size(1)]);
    client.samples.insert(
        "S-1".to_string(),
        SampleInfo {
            code: "S-1".to_string(),
            identifier: Some("/DDB/CK/S-1".to_string()),
            sample_type: "SAMPLE".to_string(),
            experiment: None,
            registration_date: None,
            properties: BTreeMap::new(),
        },
    );
    let app = App::new(client, DEFAULT_EXPIRY);
    let request = InfoRequest {
        spaces: true,
        dataset: Some(code("DS-1")),
        sample: Some("S-1".to_string()),
    };

    let result = app.info(&request, &JsonOutput).unwrap();

    let spaces = result.spaces.unwrap();
    assert_eq!(spaces[0].projects, Some(2));
    assert_eq!(result.dataset.unwrap().files.unwrap().len(), 1);
    // related datasets are optional; the lookup failure does not fail the command
    assert!(result.sample.unwrap().datasets.is_none());
}

#[test]
fn info_for_unknown_sample_fails() {
    let app = App::new(MockOpenbis::default(), DEFAULT_EXPIRY);
    let request = InfoRequest {
        sample: Some("NOPE".to_string()),
        ..InfoRequest::default()
    };
    let err = app.info(&request, &JsonOutput).unwrap_err();
    assert_matches!(err, ObisError::SampleNotFound(_));
}

#[test]
fn dry_run_upload_never_creates_a_dataset() {
    let temp = tempfile::tempdir().unwrap();
    let fasta = temp.path().join("human.fasta");
    fs::write(&fasta, ">sp|P1|A OS=Homo sapiens OX=9606\nMKV\n").unwrap();
    let app = App::new(MockOpenbis::default(), DEFAULT_EXPIRY);
    let request = UploadRequest {
        file: fasta,
        version: Some("2025_01".to_string()),
        dry_run: true,
        ..UploadRequest::default()
    };

    let result = app.upload(&request, None, &JsonOutput).unwrap();

    assert!(result.dry_run);
    assert!(result.dataset_code.is_none());
    assert_eq!(result.plan.kind, FileKind::Fasta);
    assert_eq!(result.plan.name, "human v2025_01 (Homo sapiens)");
    assert!(app.client().calls.lock().unwrap().created.is_empty());
}

#[test]
fn upload_sends_library_with_log_file() {
    let temp = tempfile::tempdir().unwrap();
    let library = temp.path().join("report-lib.tsv");
    let log = temp.path().join("report.log.txt");
    fs::write(&library, "header\n").unwrap();
    fs::write(&log, "DIA-NN 1.8.1 (Data-Independent Acquisition by Neural Networks)\n").unwrap();
    let app = App::new(MockOpenbis::default(), DEFAULT_EXPIRY);
    let request = UploadRequest {
        file: library.clone(),
        log_file: Some(log.clone()),
        ..UploadRequest::default()
    };
    let sink = RecordingSink::default();

    let result = app.upload(&request, None, &sink).unwrap();

    assert_eq!(result.dataset_code.as_deref(), Some("20250101000000000-1"));
    let calls = app.client().calls.lock().unwrap();
    let created = &calls.created[0];
    assert_eq!(created.dataset_type, "SPECTRAL_LIBRARY");
    assert_eq!(created.collection.as_str(), "/DDB/CK/PREDSPECLIB");
    assert_eq!(created.files, vec![library, log]);
    assert_eq!(
        created.properties.get("notes").map(String::as_str),
        Some("DIANN_VERSION: 1.8.1")
    );
    assert!(
        sink.messages
            .lock()
            .unwrap()
            .iter()
            .any(|msg| msg.starts_with("created dataset"))
    );
}

#[test]
fn upload_of_missing_file_fails_before_server_call() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(MockOpenbis::default(), DEFAULT_EXPIRY);
    let request = UploadRequest {
        file: temp.path().join("missing.fasta"),
        ..UploadRequest::default()
    };

    let err = app.upload(&request, None, &JsonOutput).unwrap_err();

    assert_matches!(err, ObisError::UploadFileMissing(_));
    assert!(app.client().calls.lock().unwrap().created.is_empty());
}
