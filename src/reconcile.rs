//! Decides, per remote file, whether the local copy can be trusted.
//!
//! Decisions are computed fresh from the filesystem every time; nothing here
//! is cached. Checksum failures never abort a decision, they only remove the
//! checksum step from consideration.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::error::ObisError;
use crate::fs_util;

const CHECKSUM_CHUNK: usize = 8 * 1024;

/// Modification time as reported by the server.
///
/// `Text` holds timestamps the adapter could not turn into an instant. They
/// are kept for display and never compared.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RemoteTimestamp {
    Instant(DateTime<Utc>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteFileDescriptor {
    pub path: String,
    pub size: Option<u64>,
    pub modified: Option<RemoteTimestamp>,
    pub checksum: Option<String>,
}

impl RemoteFileDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: None,
            modified: None,
            checksum: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_modified(mut self, modified: RemoteTimestamp) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalFileState {
    pub exists: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl LocalFileState {
    pub fn read(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Self {
                exists: true,
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            },
            _ => Self {
                exists: false,
                size: 0,
                modified: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Skip,
    Fetch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipDecision {
    pub verdict: Verdict,
    pub reason: String,
}

impl SkipDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Skip,
            reason: reason.into(),
        }
    }

    fn fetch(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Fetch,
            reason: reason.into(),
        }
    }

    pub fn is_skip(&self) -> bool {
        self.verdict == Verdict::Skip
    }
}

pub fn decide(
    local_path: &Path,
    remote: &RemoteFileDescriptor,
    verify_checksum: bool,
) -> SkipDecision {
    let local = LocalFileState::read(local_path);
    decide_with_state(&local, local_path, remote, verify_checksum)
}

/// Same precedence as [`decide`], with the local state supplied by the caller.
/// `local_path` is only read when a checksum has to be computed.
pub fn decide_with_state(
    local: &LocalFileState,
    local_path: &Path,
    remote: &RemoteFileDescriptor,
    verify_checksum: bool,
) -> SkipDecision {
    if !local.exists {
        return SkipDecision::fetch("File does not exist locally");
    }

    if let Some(remote_size) = remote.size {
        if remote_size != local.size {
            return SkipDecision::fetch(format!(
                "Size mismatch (local: {}, remote: {})",
                local.size, remote_size
            ));
        }
    }

    if let (Some(RemoteTimestamp::Instant(remote_mtime)), Some(local_mtime)) =
        (&remote.modified, local.modified)
    {
        if *remote_mtime <= local_mtime {
            return SkipDecision::skip("Local file is newer or same age");
        }
    }

    if verify_checksum {
        if let Some(expected) = remote.checksum.as_deref() {
            match sha1_file(local_path) {
                Ok(actual) if actual.eq_ignore_ascii_case(expected.trim()) => {
                    return SkipDecision::skip("Checksum verified");
                }
                Ok(_) => return SkipDecision::fetch("Checksum mismatch"),
                Err(err) => {
                    tracing::warn!(
                        path = %local_path.display(),
                        %err,
                        "could not verify checksum; falling back to size check"
                    );
                }
            }
        }
    }

    match remote.size {
        None => SkipDecision::skip("File exists with matching size"),
        Some(size) if size == local.size => SkipDecision::skip("File exists with matching size"),
        Some(_) => SkipDecision::fetch("Unknown verification failure"),
    }
}

pub fn sha1_file(path: &Path) -> Result<String, ObisError> {
    let mut file = File::open(path)
        .map_err(|err| ObisError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; CHECKSUM_CHUNK];
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|err| ObisError::Filesystem(format!("read {}: {err}", path.display())))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    pub force: bool,
    pub verify_checksum: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedFile {
    pub path: String,
    pub reason: String,
}

/// Manifest split into files to keep and files to transfer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferPlan {
    pub skip: Vec<PlannedFile>,
    pub fetch: Vec<PlannedFile>,
}

impl TransferPlan {
    pub fn total(&self) -> usize {
        self.skip.len() + self.fetch.len()
    }

    pub fn is_complete(&self) -> bool {
        self.fetch.is_empty()
    }

    pub fn fetch_paths(&self) -> Vec<String> {
        self.fetch.iter().map(|file| file.path.clone()).collect()
    }
}

/// Classifies every manifest entry against `root` before any transfer starts.
pub fn plan(
    root: &Path,
    manifest: &[RemoteFileDescriptor],
    options: ReconcileOptions,
) -> TransferPlan {
    let mut plan = TransferPlan::default();
    for remote in manifest {
        if options.force {
            plan.fetch.push(PlannedFile {
                path: remote.path.clone(),
                reason: "Forced re-download".to_string(),
            });
            continue;
        }

        let decision = match fs_util::enclosed_path(root, &remote.path) {
            Ok(local_path) => decide(&local_path, remote, options.verify_checksum),
            Err(err) => {
                tracing::warn!(path = %remote.path, %err, "remote path outside dataset directory");
                SkipDecision::fetch("Path escapes dataset directory")
            }
        };
        tracing::debug!(
            path = %remote.path,
            verdict = ?decision.verdict,
            reason = %decision.reason,
            "reconciled"
        );
        let entry = PlannedFile {
            path: remote.path.clone(),
            reason: decision.reason,
        };
        match decision.verdict {
            Verdict::Skip => plan.skip.push(entry),
            Verdict::Fetch => plan.fetch.push(entry),
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_file_is_fetched() {
        let temp = tempfile::tempdir().unwrap();
        let remote = RemoteFileDescriptor::new("b.txt").with_size(50);
        let decision = decide(&temp.path().join("b.txt"), &remote, false);
        assert_eq!(decision.verdict, Verdict::Fetch);
        assert_eq!(decision.reason, "File does not exist locally");
    }

    #[test]
    fn size_mismatch_wins_over_mtime() {
        let temp = tempfile::tempdir().unwrap();
        let path = write(temp.path(), "a.txt", b"0123456789");
        let old = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let remote = RemoteFileDescriptor::new("a.txt")
            .with_size(11)
            .with_modified(RemoteTimestamp::Instant(old));
        let decision = decide(&path, &remote, false);
        assert_eq!(decision.verdict, Verdict::Fetch);
        assert_eq!(decision.reason, "Size mismatch (local: 10, remote: 11)");
    }

    #[test]
    fn older_remote_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let path = write(temp.path(), "a.txt", b"abc");
        let old = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        let remote = RemoteFileDescriptor::new("a.txt")
            .with_size(3)
            .with_modified(RemoteTimestamp::Instant(old));
        let decision = decide(&path, &remote, true);
        assert_eq!(decision.reason, "Local file is newer or same age");
    }

    #[test]
    fn text_timestamp_is_not_compared() {
        let temp = tempfile::tempdir().unwrap();
        let path = write(temp.path(), "a.txt", b"abc");
        let remote = RemoteFileDescriptor::new("a.txt")
            .with_size(3)
            .with_modified(RemoteTimestamp::Text("yesterday".to_string()));
        let decision = decide(&path, &remote, false);
        assert_eq!(decision.reason, "File exists with matching size");
    }

    #[test]
    fn newer_remote_falls_through_to_checksum() {
        let temp = tempfile::tempdir().unwrap();
        let path = write(temp.path(), "a.txt", b"abc");
        let future = Utc::now() + chrono::Duration::hours(1);
        let remote = RemoteFileDescriptor::new("a.txt")
            .with_size(3)
            .with_modified(RemoteTimestamp::Instant(future))
            .with_checksum("A9993E364706816ABA3E25717850C26C9CD0D89D");
        let decision = decide(&path, &remote, true);
        assert_eq!(decision.reason, "Checksum verified");
    }

    #[test]
    fn checksum_mismatch_overrides_matching_size() {
        let temp = tempfile::tempdir().unwrap();
        let path = write(temp.path(), "a.txt", b"abc");
        let remote = RemoteFileDescriptor::new("a.txt")
            .with_size(3)
            .with_checksum("0000000000000000000000000000000000000000");
        let decision = decide(&path, &remote, true);
        assert_eq!(decision.verdict, Verdict::Fetch);
        assert_eq!(decision.reason, "Checksum mismatch");
    }

    #[test]
    fn checksum_ignored_without_flag() {
        let temp = tempfile::tempdir().unwrap();
        let path = write(temp.path(), "a.txt", b"abc");
        let remote = RemoteFileDescriptor::new("a.txt")
            .with_size(3)
            .with_checksum("deadbeef");
        assert!(decide(&path, &remote, false).is_skip());
    }

    #[test]
    fn unreadable_file_degrades_to_size_check() {
        let temp = tempfile::tempdir().unwrap();
        let local = LocalFileState {
            exists: true,
            size: 3,
            modified: None,
        };
        let remote = RemoteFileDescriptor::new("gone.txt")
            .with_size(3)
            .with_checksum("deadbeef");
        let decision = decide_with_state(&local, &temp.path().join("gone.txt"), &remote, true);
        assert_eq!(decision.reason, "File exists with matching size");
    }

    #[test]
    fn escaping_path_is_never_reconciled_against_outside_file() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "outside.txt", b"abc");
        let dataset = temp.path().join("DS1");
        let manifest = [RemoteFileDescriptor::new("../outside.txt").with_size(3)];

        let plan = plan(&dataset, &manifest, ReconcileOptions::default());

        assert!(plan.skip.is_empty());
        assert_eq!(plan.fetch[0].reason, "Path escapes dataset directory");
    }

    #[test]
    fn repeated_decisions_are_identical() {
        let temp = tempfile::tempdir().unwrap();
        let path = write(temp.path(), "a.txt", b"abc");
        let future = Utc::now() + chrono::Duration::hours(1);
        let cases = [
            (RemoteFileDescriptor::new("a.txt").with_size(3), false),
            (RemoteFileDescriptor::new("a.txt").with_size(4), false),
            (
                RemoteFileDescriptor::new("a.txt")
                    .with_size(3)
                    .with_modified(RemoteTimestamp::Instant(future))
                    .with_checksum("a9993e364706816aba3e25717850c26c9cd0d89d"),
                true,
            ),
            (
                RemoteFileDescriptor::new("a.txt")
                    .with_size(3)
                    .with_checksum("0000000000000000000000000000000000000000"),
                true,
            ),
            (RemoteFileDescriptor::new("missing.txt"), false),
        ];

        for (remote, verify) in &cases {
            let local = temp.path().join(&remote.path);
            let first = decide(&local, remote, *verify);
            let second = decide(&local, remote, *verify);
            assert_eq!(first, second, "{}", remote.path);
        }
        assert_eq!(decide(&path, &cases[2].0, true).reason, "Checksum verified");
        assert_eq!(decide(&path, &cases[3].0, true).reason, "Checksum mismatch");
    }

    #[test]
    fn plan_twice_without_changes_is_stable() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "a.txt", b"abc");
        let manifest = [
            RemoteFileDescriptor::new("a.txt")
                .with_size(3)
                .with_checksum("A9993E364706816ABA3E25717850C26C9CD0D89D"),
            RemoteFileDescriptor::new("b.txt").with_size(5),
        ];
        let options = ReconcileOptions {
            force: false,
            verify_checksum: true,
        };

        let first = plan(temp.path(), &manifest, options);
        let second = plan(temp.path(), &manifest, options);

        let summary = |plan: &TransferPlan| {
            (
                plan.skip.iter().map(|f| (f.path.clone(), f.reason.clone())).collect::<Vec<_>>(),
                plan.fetch.iter().map(|f| (f.path.clone(), f.reason.clone())).collect::<Vec<_>>(),
            )
        };
        assert_eq!(summary(&first), summary(&second));
        assert_eq!(first.skip[0].reason, "Checksum verified");
    }

    #[test]
    fn sha1_matches_known_digest() {
        let temp = tempfile::tempdir().unwrap();
        let path = write(temp.path(), "abc", b"abc");
        assert_eq!(
            sha1_file(&path).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
