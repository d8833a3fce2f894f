//! Artifact Store
//!
//! Append-only, content-addressed storage of phase outputs and their
//! bounded summaries.
//!
//! ## Layout
//!
//! ```text
//! .forge/artifacts/
//!   blobs/<aa>/<sha256>      full outputs and summaries, keyed by digest
//!   index/<artifact-id>.json one entry per stored attempt, created once
//! ```
//!
//! An artifact id is `run-<n>-<phase>-<attempt>`, so it is stable for the
//! run+phase pair and distinct across REVISE attempts. Index entries and
//! blobs are both written to a temp file first. Blobs are renamed into
//! place; index entries are hard-linked, which fails if the id is taken.
//! Readers never observe a partial file. An unreadable entry left by an
//! older writer is treated as absent and may be replaced.

mod summary;

pub use summary::{SummaryPolicy, extract_findings, split_sentences, summarize};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;

use crate::errors::{FlowError, FlowResult};
use crate::models::RunId;
use crate::phase::PhaseKind;

/// Identifies one attempt of one phase of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub run_id: RunId,
    pub phase: PhaseKind,
    pub attempt: u32,
}

impl ArtifactKey {
    pub fn new(run_id: RunId, phase: PhaseKind, attempt: u32) -> Self {
        Self {
            run_id,
            phase,
            attempt,
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.run_id, self.phase, self.attempt)
    }
}

/// Index entry for a stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextArtifact {
    pub id: String,
    pub run_id: RunId,
    pub phase: PhaseKind,
    pub attempt: u32,
    pub full_digest: String,
    pub summary_digest: String,
    pub full_bytes: usize,
    pub summary_bytes: usize,
    pub created_at: DateTime<Utc>,
    /// Path of the index entry.
    #[serde(skip)]
    pub location: PathBuf,
}

impl ContextArtifact {
    /// Summary size as a fraction of the full output.
    pub fn ratio(&self) -> f64 {
        if self.full_bytes == 0 {
            return 0.0;
        }
        self.summary_bytes as f64 / self.full_bytes as f64
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

static ARTIFACT_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^run-\d+-(research|plan|implement|validate|integrate)-\d+$").unwrap()
});

/// Whether `id` has the `run-<n>-<phase>-<attempt>` shape.
pub fn is_artifact_id(id: &str) -> bool {
    ARTIFACT_ID_REGEX.is_match(id)
}

pub struct ArtifactStore {
    root: PathBuf,
    policy: SummaryPolicy,
}

impl ArtifactStore {
    pub fn new(root: &Path, policy: SummaryPolicy) -> FlowResult<Self> {
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("index"))?;
        Ok(Self {
            root: root.to_path_buf(),
            policy,
        })
    }

    /// Persist `full_output` verbatim with its summary. Fails with
    /// `AlreadyExists` if this key was stored before.
    pub fn store(&self, key: ArtifactKey, full_output: &str) -> FlowResult<ContextArtifact> {
        let id = key.id();
        let summary = summarize(full_output, &self.policy);

        let full_digest = self.write_blob(full_output.as_bytes())?;
        let summary_digest = self.write_blob(summary.as_bytes())?;

        let location = self.index_path(&id);
        let artifact = ContextArtifact {
            id: id.clone(),
            run_id: key.run_id,
            phase: key.phase,
            attempt: key.attempt,
            full_digest,
            summary_digest,
            full_bytes: full_output.len(),
            summary_bytes: summary.len(),
            created_at: Utc::now(),
            location: location.clone(),
        };

        let json = serde_json::to_vec_pretty(&artifact).map_err(anyhow::Error::from)?;
        let tmp = self.temp_path(&self.root.join("index"), &id);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        let published = self.publish_index(&id, &tmp, &location);
        if let Err(e) = fs::remove_file(&tmp)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %tmp.display(), "Failed to remove temp index entry: {}", e);
        }
        published?;

        tracing::debug!(
            artifact = %id,
            full_bytes = artifact.full_bytes,
            summary_bytes = artifact.summary_bytes,
            "stored artifact"
        );
        Ok(artifact)
    }

    pub fn get(&self, id: &str) -> FlowResult<ContextArtifact> {
        if !is_artifact_id(id) {
            return Err(FlowError::not_found("artifact", id));
        }
        let location = self.index_path(id);
        let content = match fs::read(&location) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FlowError::not_found("artifact", id));
            }
            Err(e) => return Err(e.into()),
        };
        let mut artifact: ContextArtifact =
            serde_json::from_slice(&content).map_err(|_| FlowError::Corrupt { id: id.to_string() })?;
        artifact.location = location;
        Ok(artifact)
    }

    /// Look up the artifact for a key without failing when absent. An
    /// unreadable index entry counts as absent so the phase can re-run.
    pub fn find(&self, key: ArtifactKey) -> FlowResult<Option<ContextArtifact>> {
        match self.get(&key.id()) {
            Ok(a) => Ok(Some(a)),
            Err(FlowError::NotFound { .. }) => Ok(None),
            Err(FlowError::Corrupt { id }) => {
                tracing::warn!(artifact = %id, "ignoring unreadable index entry");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn summary_of(&self, id: &str) -> FlowResult<String> {
        let artifact = self.get(id)?;
        self.read_blob(id, &artifact.summary_digest)
    }

    pub fn full_of(&self, id: &str) -> FlowResult<String> {
        let artifact = self.get(id)?;
        self.read_blob(id, &artifact.full_digest)
    }

    /// All artifacts of a run, ordered by phase then attempt.
    pub fn list_for_run(&self, run_id: RunId) -> FlowResult<Vec<ContextArtifact>> {
        let prefix = format!("{}-", run_id);
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(self.root.join("index"))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            if !id.starts_with(&prefix) {
                continue;
            }
            match self.get(id) {
                Ok(a) => artifacts.push(a),
                Err(FlowError::Corrupt { .. } | FlowError::NotFound { .. }) => {
                    tracing::warn!(artifact = %id, "skipping unreadable index entry");
                }
                Err(e) => return Err(e),
            }
        }
        artifacts.sort_by_key(|a| (a.phase, a.attempt));
        Ok(artifacts)
    }

    fn index_path(&self, id: &str) -> PathBuf {
        self.root.join("index").join(format!("{}.json", id))
    }

    /// Link the finished entry at `tmp` into place. An existing entry that
    /// cannot be parsed is replaced; a readable one is never overwritten.
    fn publish_index(&self, id: &str, tmp: &Path, location: &Path) -> FlowResult<()> {
        match fs::hard_link(tmp, location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match self.get(id) {
                Err(FlowError::Corrupt { .. }) => {
                    tracing::warn!(artifact = %id, "replacing partial index entry");
                    fs::rename(tmp, location)?;
                    Ok(())
                }
                _ => Err(FlowError::already_exists("artifact", id)),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self, dir: &Path, tag: &str) -> PathBuf {
        dir.join(format!(
            ".tmp-{}-{}-{}",
            tag,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs").join(&digest[..2]).join(digest)
    }

    fn write_blob(&self, bytes: &[u8]) -> FlowResult<String> {
        let digest = digest_hex(bytes);
        let path = self.blob_path(&digest);
        if path.exists() {
            return Ok(digest);
        }
        let dir = path.parent().ok_or_else(|| {
            FlowError::Storage(anyhow::anyhow!("Blob path has no parent directory"))
        })?;
        fs::create_dir_all(dir)?;

        let tmp = self.temp_path(dir, &digest[..12]);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(digest)
    }

    fn read_blob(&self, id: &str, digest: &str) -> FlowResult<String> {
        let bytes = fs::read(self.blob_path(digest)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FlowError::Corrupt { id: id.to_string() },
            _ => e.into(),
        })?;
        if digest_hex(&bytes) != digest {
            return Err(FlowError::Corrupt { id: id.to_string() });
        }
        String::from_utf8(bytes).map_err(|_| FlowError::Corrupt { id: id.to_string() })
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (ArtifactStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), SummaryPolicy::default()).unwrap();
        (store, dir)
    }

    fn sample_output() -> String {
        let mut out = String::from("# Research\n\n");
        for i in 0..40 {
            out.push_str(&format!("- Finding {}: the validator skips field {}.\n", i, i));
            out.push_str("Background prose that pads the output considerably for testing.\n");
        }
        out
    }

    #[test]
    fn test_store_and_lookup() {
        let (store, _dir) = store();
        let key = ArtifactKey::new(RunId(7), PhaseKind::Research, 1);
        let full = sample_output();
        let artifact = store.store(key, &full).unwrap();

        assert_eq!(artifact.id, "run-7-research-1");
        assert_eq!(store.full_of(&artifact.id).unwrap(), full);
        let summary = store.summary_of(&artifact.id).unwrap();
        assert!(!summary.is_empty());
        assert!(summary.len() <= (full.len() as f64 * 0.15) as usize);
        assert_eq!(artifact.summary_bytes, summary.len());
        assert!(artifact.ratio() <= 0.15);
    }

    #[test]
    fn test_lookups_are_stable() {
        let (store, _dir) = store();
        let a = store
            .store(ArtifactKey::new(RunId(1), PhaseKind::Plan, 1), &sample_output())
            .unwrap();
        let first_full = store.full_of(&a.id).unwrap();
        let first_summary = store.summary_of(&a.id).unwrap();
        for attempt in 2..5 {
            store
                .store(
                    ArtifactKey::new(RunId(1), PhaseKind::Plan, attempt),
                    &format!("- attempt {} output.\n", attempt).repeat(50),
                )
                .unwrap();
        }
        assert_eq!(store.full_of(&a.id).unwrap(), first_full);
        assert_eq!(store.summary_of(&a.id).unwrap(), first_summary);
    }

    #[test]
    fn test_same_key_twice_is_rejected() {
        let (store, _dir) = store();
        let key = ArtifactKey::new(RunId(2), PhaseKind::Plan, 1);
        store.store(key, "first").unwrap();
        let err = store.store(key, "second").unwrap_err();
        assert!(matches!(err, FlowError::AlreadyExists { .. }));
        assert_eq!(store.full_of(&key.id()).unwrap(), "first");
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let (store, _dir) = store();
        assert!(matches!(
            store.full_of("run-9-plan-1"),
            Err(FlowError::NotFound { .. })
        ));
        assert!(matches!(
            store.summary_of("run-9-plan-1"),
            Err(FlowError::NotFound { .. })
        ));
        assert!(
            store
                .find(ArtifactKey::new(RunId(9), PhaseKind::Plan, 1))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_partial_index_entry_is_replaced() {
        let (store, dir) = store();
        let key = ArtifactKey::new(RunId(4), PhaseKind::Research, 1);
        fs::write(dir.path().join("index/run-4-research-1.json"), "{\"id\": \"run-4").unwrap();

        assert!(matches!(store.get(&key.id()), Err(FlowError::Corrupt { .. })));
        assert!(store.find(key).unwrap().is_none());
        assert!(store.list_for_run(RunId(4)).unwrap().is_empty());

        let a = store.store(key, "- Finding: recovered.\n").unwrap();
        assert_eq!(store.full_of(&a.id).unwrap(), "- Finding: recovered.\n");
        assert!(matches!(
            store.store(key, "again"),
            Err(FlowError::AlreadyExists { .. })
        ));

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("index"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["run-4-research-1.json".to_string()]);
    }

    #[test]
    fn test_malformed_ids_are_rejected() {
        let (store, dir) = store();
        fs::write(dir.path().join("secret.json"), "{}").unwrap();
        for id in ["../secret", "run-1-research-1/../../secret", "", "run-1-deploy-1", "/etc/passwd"] {
            assert!(!is_artifact_id(id), "{id}");
            assert!(matches!(store.get(id), Err(FlowError::NotFound { .. })), "{id}");
            assert!(store.full_of(id).is_err(), "{id}");
        }
        assert!(is_artifact_id("run-12-integrate-3"));
    }

    #[test]
    fn test_empty_output() {
        let (store, _dir) = store();
        let a = store
            .store(ArtifactKey::new(RunId(3), PhaseKind::Research, 1), "")
            .unwrap();
        assert_eq!(store.full_of(&a.id).unwrap(), "");
        assert_eq!(store.summary_of(&a.id).unwrap(), "");
        assert_eq!(a.ratio(), 0.0);
    }

    #[test]
    fn test_identical_content_shares_blob() {
        let (store, dir) = store();
        let full = sample_output();
        let a = store
            .store(ArtifactKey::new(RunId(1), PhaseKind::Plan, 1), &full)
            .unwrap();
        let b = store
            .store(ArtifactKey::new(RunId(1), PhaseKind::Plan, 2), &full)
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.full_digest, b.full_digest);
        assert!(dir.path().join("blobs").join(&a.full_digest[..2]).join(&a.full_digest).exists());
    }

    #[test]
    fn test_tampered_blob_is_detected() {
        let (store, dir) = store();
        let a = store
            .store(ArtifactKey::new(RunId(1), PhaseKind::Research, 1), "original text.")
            .unwrap();
        let blob = dir
            .path()
            .join("blobs")
            .join(&a.full_digest[..2])
            .join(&a.full_digest);
        fs::write(&blob, "tampered").unwrap();
        assert!(matches!(store.full_of(&a.id), Err(FlowError::Corrupt { .. })));
    }

    #[test]
    fn test_list_for_run_orders_and_filters() {
        let (store, _dir) = store();
        store
            .store(ArtifactKey::new(RunId(1), PhaseKind::Plan, 2), "p2")
            .unwrap();
        store
            .store(ArtifactKey::new(RunId(1), PhaseKind::Research, 1), "r1")
            .unwrap();
        store
            .store(ArtifactKey::new(RunId(1), PhaseKind::Plan, 1), "p1")
            .unwrap();
        store
            .store(ArtifactKey::new(RunId(12), PhaseKind::Research, 1), "other run")
            .unwrap();

        let ids: Vec<_> = store
            .list_for_run(RunId(1))
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["run-1-research-1", "run-1-plan-1", "run-1-plan-2"]);
    }

    #[test]
    fn test_concurrent_stores_across_runs() {
        let (store, _dir) = store();
        let store = std::sync::Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .store(
                            ArtifactKey::new(RunId(n), PhaseKind::Research, 1),
                            &sample_output(),
                        )
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            let artifact = handle.join().unwrap();
            assert_eq!(store.full_of(&artifact.id).unwrap(), sample_output());
        }
    }
}
