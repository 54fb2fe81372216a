//! File-backed memory persistence
//!
//! One JSON file per source document, named from the document basename plus a
//! short hash of its absolute path so distinct documents with the same
//! basename never collide. Writes go through a temp file and rename so a
//! crash mid-write can never corrupt an existing file.

use crate::models::MemoryEntry;
use crate::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

pub struct MemoryStore {
    dir: PathBuf,
}

impl MemoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Memory file for one document: `memory_<basename>_<hash10>.json`.
    pub fn path_for(&self, document: &str) -> PathBuf {
        let path = Path::new(document);
        let basename = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let digest = Sha256::digest(document.as_bytes());
        let short = &hex::encode(digest)[..10];
        self.dir.join(format!("memory_{}_{}.json", basename, short))
    }

    /// Load all entries for one document. A missing file is an empty memory;
    /// an unreadable or corrupt file is logged and treated the same.
    pub async fn load(&self, document: &str) -> Vec<MemoryEntry> {
        self.read_entries(&self.path_for(document)).await
    }

    /// Load entries across every document in the store directory.
    pub async fn load_all(&self) -> Vec<MemoryEntry> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(_) => return entries,
        };
        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            let name = item.file_name().to_string_lossy().into_owned();
            if name.starts_with("memory_") && name.ends_with(".json") {
                entries.extend(self.read_entries(&path).await);
            }
        }
        entries
    }

    /// Append one entry to the document's memory file. Read-modify-write with
    /// an atomic rename; entries already present are never rewritten.
    pub async fn append(&self, entry: MemoryEntry) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&entry.document);
        let mut entries = self.read_entries(&path).await;
        entries.push(entry);

        let serialized = serde_json::to_vec_pretty(&entries)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &serialized).await?;
        fs::rename(&tmp, &path).await?;
        debug!(file = %path.display(), count = entries.len(), "Memory appended");
        Ok(())
    }

    /// Reset the memory for one document to an empty log. Same temp-file and
    /// rename discipline as `append`.
    pub async fn clear(&self, document: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(document);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, b"[]").await?;
        fs::rename(&tmp, &path).await?;
        debug!(file = %path.display(), "Memory cleared");
        Ok(())
    }

    async fn read_entries(&self, path: &Path) -> Vec<MemoryEntry> {
        let raw = match fs::read(path).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Memory file unreadable");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<MemoryEntry>>(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Memory file corrupt, ignoring");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(document: &str, question: &str) -> MemoryEntry {
        MemoryEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            document: document.to_string(),
            question: question.to_string(),
            answer: "an answer".to_string(),
            partials: vec![],
            evidence: vec![],
            embedding: None,
            confidence: Some(0.8),
            flags: vec![],
            model_id: "test-model".to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        store.append(entry("/docs/report.pdf", "q1")).await.unwrap();
        store.append(entry("/docs/report.pdf", "q2")).await.unwrap();

        let loaded = store.load("/docs/report.pdf").await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].question, "q1");
        assert_eq!(loaded[1].question, "q2");
    }

    #[tokio::test]
    async fn test_same_basename_different_paths_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        store.append(entry("/a/report.pdf", "about a")).await.unwrap();
        store.append(entry("/b/report.pdf", "about b")).await.unwrap();

        let a = store.load("/a/report.pdf").await;
        let b = store.load("/b/report.pdf").await;
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].question, b[0].question);
        assert_ne!(
            store.path_for("/a/report.pdf"),
            store.path_for("/b/report.pdf")
        );
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        assert!(store.load("/docs/none.pdf").await.is_empty());

        let path = store.path_for("/docs/bad.pdf");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(store.load("/docs/bad.pdf").await.is_empty());
    }

    #[tokio::test]
    async fn test_load_all_spans_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.append(entry("/a/x.pdf", "qa")).await.unwrap();
        store.append(entry("/b/y.pdf", "qb")).await.unwrap();
        assert_eq!(store.load_all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_truncates_to_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.append(entry("/a/x.pdf", "q")).await.unwrap();
        store.clear("/a/x.pdf").await.unwrap();
        store.clear("/a/x.pdf").await.unwrap();
        // The file survives as an empty list and accepts new appends.
        assert!(store.path_for("/a/x.pdf").exists());
        assert!(store.load("/a/x.pdf").await.is_empty());
        store.append(entry("/a/x.pdf", "q2")).await.unwrap();
        assert_eq!(store.load("/a/x.pdf").await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.append(entry("/a/x.pdf", "q")).await.unwrap();
        let tmp = store.path_for("/a/x.pdf").with_extension("json.tmp");
        assert!(!tmp.exists());
    }
}
