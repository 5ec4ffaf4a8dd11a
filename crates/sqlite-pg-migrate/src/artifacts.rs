//! Timestamped, append-only run artifacts.
//!
//! Every report and generated script gets a new file named
//! `<UTC timestamp>_<stem>.<ext>`. Existing files are never replaced: a name
//! collision within the same second gets a numeric suffix.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::error::Result;

/// Timestamp format used in artifact names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Writes artifacts below a root directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    /// Create a writer rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serialize `value` as pretty JSON into `<root>/<subdir>/<ts>_<stem>.json`.
    pub fn write_json<T: Serialize>(&self, subdir: &str, stem: &str, value: &T) -> Result<PathBuf> {
        let content = serde_json::to_string_pretty(value)?;
        self.write_text(subdir, stem, "json", &content)
    }

    /// Write text into `<root>/<subdir>/<ts>_<stem>.<ext>`.
    pub fn write_text(&self, subdir: &str, stem: &str, ext: &str, content: &str) -> Result<PathBuf> {
        let dir = self.root.join(subdir);
        std::fs::create_dir_all(&dir)?;

        let ts = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let temp_path = dir.join(format!(".{}_{}.{}.tmp", ts, stem, std::process::id()));
        std::fs::write(&temp_path, content)?;

        // Publish by hard link: it fails instead of replacing an existing file.
        let mut attempt = 0u32;
        let path = loop {
            let name = if attempt == 0 {
                format!("{}_{}.{}", ts, stem, ext)
            } else {
                format!("{}_{}_{}.{}", ts, stem, attempt, ext)
            };
            let candidate = dir.join(name);
            match std::fs::hard_link(&temp_path, &candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    let _ = std::fs::remove_file(&temp_path);
                    return Err(e.into());
                }
            }
        };
        std::fs::remove_file(&temp_path)?;

        info!("Wrote {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifacts_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());

        let first = writer.write_text("analysis", "report", "json", "{\"n\":1}").unwrap();
        let second = writer.write_text("analysis", "report", "json", "{\"n\":2}").unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "{\"n\":1}");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "{\"n\":2}");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("analysis"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_json_artifact_name() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());
        let path = writer
            .write_json("analysis", "integrity_report", &serde_json::json!({"ok": true}))
            .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_integrity_report.json"));
        assert_eq!(name.len(), "20240101T000000Z_integrity_report.json".len());
    }
}
