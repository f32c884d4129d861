//! Append-only artifact store for benchmark runs.
//!
//! Layout per run:
//!
//! ```text
//! <root>/<run_id>/report.json      report.digest
//! <root>/<run_id>/summary.md
//! <root>/<run_id>/patches/<artifact_name(instance_id)>.diff
//! <root>/<run_id>/projects/<project_id>.json   <project_id>.digest
//! ```
//!
//! Files are created with `create_new`; an existing artifact is never
//! overwritten. JSON artifacts carry a SHA-256 sibling that reads verify.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::{AutocoderError, Result};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Make an identifier safe to use as one path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// File name for an identifier. When sanitizing had to change it, a short
/// digest of the raw id keeps distinct ids (`a/b`, `a_b`) apart.
pub fn artifact_name(raw: &str) -> String {
    let cleaned = sanitize_component(raw);
    if cleaned == raw {
        cleaned
    } else {
        format!("{}-{}", cleaned, &sha256_hex(raw.as_bytes())[..8])
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(sanitize_component(run_id))
    }

    /// Write `value` as pretty JSON at `<run>/<relative>` plus its digest.
    pub fn write_json<T: Serialize>(&self, run_id: &str, relative: &str, value: &T) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(value)?;
        let path = self.target(run_id, relative);
        let digest_path = path.with_extension("digest");
        if digest_path.exists() {
            return Err(AutocoderError::ArtifactExists(digest_path));
        }
        create_new(&path, &json)?;
        create_new(&digest_path, sha256_hex(&json).as_bytes())?;
        Ok(path)
    }

    pub fn write_text(&self, run_id: &str, relative: &str, text: &str) -> Result<PathBuf> {
        let path = self.target(run_id, relative);
        create_new(&path, text.as_bytes())?;
        Ok(path)
    }

    /// Read a JSON artifact, failing with `DigestMismatch` if it was altered.
    pub fn read_json<T: DeserializeOwned>(&self, run_id: &str, relative: &str) -> Result<T> {
        let path = self.target(run_id, relative);
        let json = std::fs::read(&path)?;
        let expected = std::fs::read_to_string(path.with_extension("digest"))?;
        let actual = sha256_hex(&json);
        if expected.trim() != actual {
            return Err(AutocoderError::DigestMismatch {
                expected: expected.trim().to_string(),
                actual,
            });
        }
        Ok(serde_json::from_slice(&json)?)
    }

    fn target(&self, run_id: &str, relative: &str) -> PathBuf {
        let mut path = self.run_dir(run_id);
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            path.push(sanitize_component(part));
        }
        path
    }
}

fn create_new(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(AutocoderError::ArtifactExists(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_artifact_roundtrip_verifies_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = store
            .write_json("run-1", "report.json", &json!({"total": 10}))
            .unwrap();
        assert!(path.ends_with("run-1/report.json"));
        assert!(dir.path().join("run-1/report.digest").exists());

        let value: serde_json::Value = store.read_json("run-1", "report.json").unwrap();
        assert_eq!(value["total"], 10);
    }

    #[test]
    fn test_artifacts_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write_text("run-1", "summary.md", "first").unwrap();
        let err = store.write_text("run-1", "summary.md", "second").unwrap_err();
        assert!(matches!(err, AutocoderError::ArtifactExists(_)));
        let text = std::fs::read_to_string(dir.path().join("run-1/summary.md")).unwrap();
        assert_eq!(text, "first");
    }

    #[test]
    fn test_tampered_artifact_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = store
            .write_json("run-1", "projects/p.json", &json!({"phase": "complete"}))
            .unwrap();
        std::fs::write(&path, br#"{"phase":"failed"}"#).unwrap();
        let err = store
            .read_json::<serde_json::Value>("run-1", "projects/p.json")
            .unwrap_err();
        assert!(matches!(err, AutocoderError::DigestMismatch { .. }));
    }

    #[test]
    fn test_path_components_are_sanitized() {
        assert_eq!(sanitize_component("../etc"), ".._etc");
        assert_eq!(sanitize_component("acme/widgets"), "acme_widgets");
        assert_eq!(sanitize_component("org__repo-1"), "org__repo-1");
        assert_eq!(sanitize_component(".."), "_");
    }

    #[test]
    fn test_artifact_names_keep_distinct_ids_apart() {
        assert_eq!(artifact_name("acme__widgets-42"), "acme__widgets-42");
        let slash = artifact_name("a/b");
        assert!(slash.starts_with("a_b-"));
        assert_eq!(slash.len(), "a_b-".len() + 8);
        assert_ne!(slash, artifact_name("a_b"));
        assert_eq!(slash, artifact_name("a/b"));
    }
}
