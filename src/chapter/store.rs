//! Persisted pipeline state.
//!
//! One [`ChapterRecord`] is written per transition, so the history on disk is
//! append-only and the latest record is always the resume point. The
//! combined output gets a single [`CombinedRecord`] per document.
//!
//! Layout of [`FileStateStore`]:
//!
//! ```text
//! <root>/<document>/chapters/<chapter>/state_00000_<timestamp>.json
//! <root>/<document>/chapters/<chapter>/state_00001_<timestamp>.json
//! <root>/<document>/combined.json
//! ```

use super::{ChapterUnit, PipelineState, Stage};
use crate::document::{CombinedDocument, SegmentOutput};
use crate::error::{ChapterError, Diagnostic, DoctreeError};
use crate::persist::write_atomic;
use crate::reconcile::{ContentEntry, ContentUnit, StyleEntry};
use crate::sources::SegmentRef;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Output of every completed stage, carried forward so a resumed chapter
/// never repeats one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageArtifacts {
    /// Set by `extracting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<SegmentRef>,
    /// Set by `parsing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentEntry>>,
    /// Set by `parsing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Vec<StyleEntry>>,
    /// Set by `reconciling`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<Vec<ContentUnit>>,
    /// Set by `converting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<SegmentOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

/// Persisted state of one chapter at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub document_id: String,
    pub chapter: ChapterUnit,
    pub state: PipelineState,
    #[serde(default)]
    pub artifacts: StageArtifacts,
    pub saved_at: DateTime<Utc>,
}

impl ChapterRecord {
    pub fn new(document_id: impl Into<String>, chapter: ChapterUnit) -> Self {
        Self {
            document_id: document_id.into(),
            chapter,
            state: PipelineState::new(),
            artifacts: StageArtifacts::default(),
            saved_at: Utc::now(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.state.stage
    }
}

/// Per-chapter line of the combined record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub id: String,
    pub title: String,
    pub start_page: u32,
    pub end_page: u32,
    pub stage: Stage,
    #[serde(default)]
    pub needs_review: usize,
    #[serde(default)]
    pub repairs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChapterError>,
}

impl ChapterSummary {
    pub fn from_record(record: &ChapterRecord) -> Self {
        let manifest = record.artifacts.output.as_ref().map(|o| &o.manifest);
        Self {
            id: record.chapter.id.clone(),
            title: record.chapter.title.clone(),
            start_page: record.chapter.start_page,
            end_page: record.chapter.end_page,
            stage: record.state.stage,
            needs_review: manifest.map_or(0, |m| m.needs_review.len()),
            repairs: manifest.map_or(0, |m| m.repair_count()),
            error: record.state.error.clone(),
        }
    }
}

/// Persisted combined output of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedRecord {
    pub document_id: String,
    /// Document-level aggregate state.
    pub state: PipelineState,
    pub chapters: Vec<ChapterSummary>,
    pub document: CombinedDocument,
    pub saved_at: DateTime<Utc>,
}

/// Where pipeline state lives.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The latest record of a chapter, if any was saved.
    async fn load_chapter(
        &self,
        document_id: &str,
        chapter_id: &str,
    ) -> Result<Option<ChapterRecord>, DoctreeError>;

    /// Append a record. Earlier records are kept.
    async fn save_chapter(&self, record: &ChapterRecord) -> Result<(), DoctreeError>;

    async fn save_combined(&self, record: &CombinedRecord) -> Result<(), DoctreeError>;

    async fn load_combined(&self, document_id: &str) -> Result<Option<CombinedRecord>, DoctreeError>;
}

// ── File store ───────────────────────────────────────────────────────────

/// JSON files under a root directory, written atomically.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_dir(&self, document_id: &str) -> PathBuf {
        self.root.join(path_component(document_id))
    }

    fn chapter_dir(&self, document_id: &str, chapter_id: &str) -> PathBuf {
        self.document_dir(document_id)
            .join("chapters")
            .join(path_component(chapter_id))
    }

    fn combined_path(&self, document_id: &str) -> PathBuf {
        self.document_dir(document_id).join("combined.json")
    }

    /// Every state file of a chapter, oldest first.
    pub fn chapter_history(&self, document_id: &str, chapter_id: &str) -> Result<Vec<PathBuf>, DoctreeError> {
        state_files(&self.chapter_dir(document_id, chapter_id))
    }
}

/// Escape an id into a single path component. Bytes outside `[A-Za-z0-9_-]`
/// (and a leading `.`) become `%XX`, so distinct ids never share a directory.
fn path_component(id: &str) -> String {
    if id.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(id.len());
    for (i, b) in id.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn state_files(dir: &Path) -> Result<Vec<PathBuf>, DoctreeError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(DoctreeError::StateIo {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DoctreeError::StateIo {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("state_") && name.ends_with(".json") {
            files.push(entry.path());
        }
    }
    // zero-padded sequence numbers sort by name
    files.sort();
    Ok(files)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, DoctreeError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DoctreeError::StateIo {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| DoctreeError::StateCorrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DoctreeError> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| DoctreeError::Internal(format!("state serialisation failed: {e}")))?;
    write_atomic(path, &json).map_err(|source| DoctreeError::StateIo {
        path: path.to_path_buf(),
        source,
    })
}

async fn blocking<T, F>(f: F) -> Result<T, DoctreeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DoctreeError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DoctreeError::Internal(format!("state store task failed: {e}")))?
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_chapter(
        &self,
        document_id: &str,
        chapter_id: &str,
    ) -> Result<Option<ChapterRecord>, DoctreeError> {
        let dir = self.chapter_dir(document_id, chapter_id);
        blocking(move || match state_files(&dir)?.last() {
            Some(latest) => read_json(latest),
            None => Ok(None),
        })
        .await
    }

    async fn save_chapter(&self, record: &ChapterRecord) -> Result<(), DoctreeError> {
        let dir = self.chapter_dir(&record.document_id, &record.chapter.id);
        let record = record.clone();
        blocking(move || {
            let seq = state_files(&dir)?.len();
            let name = format!(
                "state_{:05}_{}.json",
                seq,
                record.saved_at.format("%Y%m%dT%H%M%S%.6fZ")
            );
            let path = dir.join(name);
            debug!("Saving {} at {} -> {}", record.chapter.id, record.state.stage, path.display());
            write_json(&path, &record)
        })
        .await
    }

    async fn save_combined(&self, record: &CombinedRecord) -> Result<(), DoctreeError> {
        let path = self.combined_path(&record.document_id);
        let record = record.clone();
        blocking(move || write_json(&path, &record)).await
    }

    async fn load_combined(&self, document_id: &str) -> Result<Option<CombinedRecord>, DoctreeError> {
        let path = self.combined_path(document_id);
        blocking(move || read_json(&path)).await
    }
}

// ── Memory store ─────────────────────────────────────────────────────────

/// In-process store keeping every saved record. Intended for tests and
/// embedding; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    chapters: Mutex<HashMap<(String, String), Vec<ChapterRecord>>>,
    combined: Mutex<HashMap<String, CombinedRecord>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as if an earlier run had saved it.
    pub fn preload(&self, record: ChapterRecord) {
        self.chapters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((record.document_id.clone(), record.chapter.id.clone()))
            .or_default()
            .push(record);
    }

    /// Every record saved for a chapter, oldest first.
    pub fn history(&self, document_id: &str, chapter_id: &str) -> Vec<ChapterRecord> {
        self.chapters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(document_id.to_string(), chapter_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Make every later save of `chapter_id` fail with an I/O error.
    pub fn fail_saves_for(&self, chapter_id: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chapter_id.into());
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_chapter(
        &self,
        document_id: &str,
        chapter_id: &str,
    ) -> Result<Option<ChapterRecord>, DoctreeError> {
        Ok(self.history(document_id, chapter_id).pop())
    }

    async fn save_chapter(&self, record: &ChapterRecord) -> Result<(), DoctreeError> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&record.chapter.id);
        if failing {
            return Err(DoctreeError::StateIo {
                path: PathBuf::from(&record.chapter.id),
                source: std::io::Error::other("simulated write failure"),
            });
        }
        self.preload(record.clone());
        Ok(())
    }

    async fn save_combined(&self, record: &CombinedRecord) -> Result<(), DoctreeError> {
        self.combined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.document_id.clone(), record.clone());
        Ok(())
    }

    async fn load_combined(&self, document_id: &str) -> Result<Option<CombinedRecord>, DoctreeError> {
        Ok(self
            .combined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_id)
            .cloned())
    }
}
