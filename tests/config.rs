use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use openbis_toolkit::config::{ConfigKey, ConfigScope, ConfigSource, ConfigStore};
use openbis_toolkit::error::ObisError;

fn store(temp: &tempfile::TempDir) -> ConfigStore {
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    ConfigStore::new_with_paths(root.join("home/.openbis"), root.join("project/.openbis"))
}

#[test]
fn unset_values_come_from_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);

    let entry = store.get(ConfigKey::OutputDir).unwrap();

    assert_eq!(entry.value.as_deref(), Some("openbis-data"));
    assert_eq!(entry.source, ConfigSource::Default);
    assert_eq!(store.get(ConfigKey::OpenbisUrl).unwrap().value, None);
}

#[test]
fn set_writes_scope_file_and_local_wins() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);

    store
        .set(ConfigScope::Global, ConfigKey::OpenbisUrl, "https://openbis.example.org/")
        .unwrap();
    store
        .set(ConfigScope::Global, ConfigKey::OutputDir, "/data/global")
        .unwrap();
    store
        .set(ConfigScope::Local, ConfigKey::OutputDir, "/data/local")
        .unwrap();

    let url = store.get(ConfigKey::OpenbisUrl).unwrap();
    let output = store.get(ConfigKey::OutputDir).unwrap();
    assert_eq!(url.value.as_deref(), Some("https://openbis.example.org"));
    assert_eq!(url.source, ConfigSource::Global);
    assert_eq!(output.value.as_deref(), Some("/data/local"));
    assert_eq!(output.source, ConfigSource::Local);
    assert!(store.config_path(ConfigScope::Local).as_std_path().exists());
}

#[test]
fn set_reports_whether_value_changed() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);

    let first = store
        .set(ConfigScope::Local, ConfigKey::VerifyChecksum, "yes")
        .unwrap();
    let second = store
        .set(ConfigScope::Local, ConfigKey::VerifyChecksum, "true")
        .unwrap();

    assert!(first.changed);
    assert_eq!(first.value.as_deref(), Some("true"));
    assert!(!second.changed);
}

#[test]
fn unset_falls_back_to_lower_layer() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    store
        .set(ConfigScope::Global, ConfigKey::DefaultCollection, "/DDB/CK/FASTA")
        .unwrap();
    store
        .set(ConfigScope::Local, ConfigKey::DefaultCollection, "/LAB/P1/LIBS")
        .unwrap();

    let removed = store
        .unset(ConfigScope::Local, ConfigKey::DefaultCollection)
        .unwrap();
    let again = store
        .unset(ConfigScope::Local, ConfigKey::DefaultCollection)
        .unwrap();

    assert!(removed.changed);
    assert!(!again.changed);
    let entry = store.get(ConfigKey::DefaultCollection).unwrap();
    assert_eq!(entry.value.as_deref(), Some("/DDB/CK/FASTA"));
    assert_eq!(entry.source, ConfigSource::Global);
}

#[test]
fn invalid_values_are_rejected_and_not_written() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);

    let url = store
        .set(ConfigScope::Global, ConfigKey::OpenbisUrl, "openbis.example.org")
        .unwrap_err();
    let collection = store
        .set(ConfigScope::Global, ConfigKey::DefaultCollection, "/only/two")
        .unwrap_err();
    let minutes = store
        .set(ConfigScope::Global, ConfigKey::CacheExpiryMinutes, "soon")
        .unwrap_err();

    assert_matches!(url, ObisError::InvalidConfigValue { .. });
    assert_matches!(collection, ObisError::InvalidConfigValue { .. });
    assert_matches!(minutes, ObisError::InvalidConfigValue { .. });
    assert!(!store.config_path(ConfigScope::Global).as_std_path().exists());
}

#[test]
fn list_covers_every_key() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);

    let entries = store.list().unwrap();

    let keys = entries.iter().map(|entry| entry.key.as_str()).collect::<Vec<_>>();
    assert_eq!(
        keys,
        vec![
            "openbis_url",
            "output_dir",
            "default_collection",
            "verify_certificates",
            "verify_checksum",
            "cache_expiry_minutes",
        ]
    );
}

#[test]
fn resolve_applies_typed_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    store
        .set(ConfigScope::Local, ConfigKey::CacheExpiryMinutes, "5")
        .unwrap();

    let resolved = store.resolve().unwrap();

    assert!(resolved.verify_certificates);
    assert!(!resolved.verify_checksum);
    assert_eq!(resolved.cache_expiry, Duration::from_secs(300));
    assert_eq!(resolved.output_dir.as_str(), "openbis-data");
    assert!(resolved.default_collection.is_none());
}

#[test]
fn huge_expiry_saturates_instead_of_overflowing() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    store
        .set(ConfigScope::Global, ConfigKey::CacheExpiryMinutes, &u64::MAX.to_string())
        .unwrap();

    let resolved = store.resolve().unwrap();

    assert_eq!(resolved.cache_expiry, Duration::from_secs(u64::MAX));
}

#[test]
fn malformed_config_file_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    let path = store.config_path(ConfigScope::Global);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{ not json").unwrap();

    let err = store.resolve().unwrap_err();

    assert_matches!(err, ObisError::ConfigParse(_));
}

#[test]
fn unknown_key_is_rejected() {
    let err = "colour".parse::<ConfigKey>().unwrap_err();
    assert_matches!(err, ObisError::InvalidConfigKey(_));
}
