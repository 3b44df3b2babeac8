use assert_matches::assert_matches;
use openbis_toolkit::domain::{CollectionPath, DatasetCode, RelationKind, SearchTarget};
use openbis_toolkit::error::ObisError;

#[test]
fn dataset_code_is_uppercased() {
    let code: DatasetCode = "20250807085639331-abc".parse().unwrap();
    assert_eq!(code.to_string(), "20250807085639331-ABC");
}

#[test]
fn collection_path_needs_three_segments() {
    let path: CollectionPath = "/ddb/ck/fasta".parse().unwrap();
    assert_eq!(path.as_str(), "/DDB/CK/FASTA");
    assert_eq!(path.space(), "DDB");

    for invalid in ["DDB/CK/FASTA", "/DDB/CK", "/DDB//FASTA", "/DDB/CK/FASTA/X"] {
        assert_matches!(
            invalid.parse::<CollectionPath>(),
            Err(ObisError::InvalidCollectionPath(_))
        );
    }
}

#[test]
fn relation_kind_parses_case_insensitively() {
    assert_eq!("Parents".parse::<RelationKind>().unwrap(), RelationKind::Parents);
    assert_matches!(
        "siblings".parse::<RelationKind>(),
        Err(ObisError::InvalidRelationKind(_))
    );
}

#[test]
fn search_target_all_includes_every_kind() {
    assert!(SearchTarget::All.includes(SearchTarget::Samples));
    assert!(SearchTarget::Datasets.includes(SearchTarget::Datasets));
    assert!(!SearchTarget::Datasets.includes(SearchTarget::Experiments));
}
