//! External collaborators of the chapter pipeline.
//!
//! Segment extraction, layout parsing and style extraction happen outside
//! this crate (PDF splitters, layout models, font scrapers). Each is an
//! async trait so the orchestrator can time it out, retry it on a rerun and
//! swap it for a deterministic double in tests.

use crate::chapter::ChapterUnit;
use crate::reconcile::{ContentEntry, StyleEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Failure reported by a collaborator. Fails only the current chapter.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{path}' is malformed: {detail}")]
    Malformed { path: PathBuf, detail: String },

    #[error("{0}")]
    Other(String),
}

/// A chapter's page range cut out of the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub chapter_id: String,
    pub start_page: u32,
    pub end_page: u32,
    /// Where the extracted segment lives (file path, object key, ...).
    pub location: String,
}

/// Cuts a chapter's pages out of the source document.
#[async_trait]
pub trait SegmentExtractor: Send + Sync {
    async fn extract(&self, chapter: &ChapterUnit) -> Result<SegmentRef, SourceError>;
}

/// Produces the typed content stream of a segment, in reading order.
#[async_trait]
pub trait ContentParser: Send + Sync {
    async fn parse(&self, segment: &SegmentRef) -> Result<Vec<ContentEntry>, SourceError>;
}

/// Produces the style stream of a segment. Page numbers must agree with
/// the content parser's.
#[async_trait]
pub trait StyleExtractor: Send + Sync {
    async fn extract_style(&self, segment: &SegmentRef) -> Result<Vec<StyleEntry>, SourceError>;
}

/// The three collaborators a chapter pipeline needs.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn SegmentExtractor>,
    pub parser: Arc<dyn ContentParser>,
    pub style: Arc<dyn StyleExtractor>,
}

impl Collaborators {
    pub fn new(
        extractor: Arc<dyn SegmentExtractor>,
        parser: Arc<dyn ContentParser>,
        style: Arc<dyn StyleExtractor>,
    ) -> Self {
        Self {
            extractor,
            parser,
            style,
        }
    }

    /// One value serving all three roles.
    pub fn from_source<S>(source: Arc<S>) -> Self
    where
        S: SegmentExtractor + ContentParser + StyleExtractor + 'static,
    {
        Self {
            extractor: source.clone(),
            parser: source.clone(),
            style: source,
        }
    }
}

// ── JSON fixture source ──────────────────────────────────────────────────

/// Serves streams that were extracted ahead of time.
///
/// For chapter `<id>` the directory holds `<id>.content.json` (a JSON array
/// of [`ContentEntry`]) and optionally `<id>.style.json` (an array of
/// [`StyleEntry`]). A missing style file yields an empty style stream.
#[derive(Debug, Clone)]
pub struct JsonFixtureSource {
    dir: PathBuf,
}

impl JsonFixtureSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, chapter_id: &str, stream: &str) -> PathBuf {
        self.dir.join(format!("{chapter_id}.{stream}.json"))
    }
}

async fn read_entries<T>(path: &Path, missing_ok: bool) -> Result<Vec<T>, SourceError>
where
    T: serde::de::DeserializeOwned,
{
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if missing_ok && e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not found; empty stream", path.display());
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(SourceError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&raw).map_err(|e| SourceError::Malformed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

#[async_trait]
impl SegmentExtractor for JsonFixtureSource {
    async fn extract(&self, chapter: &ChapterUnit) -> Result<SegmentRef, SourceError> {
        let content = self.path(&chapter.id, "content");
        if !tokio::fs::try_exists(&content).await.unwrap_or(false) {
            return Err(SourceError::Other(format!(
                "no extracted content for {} at {}",
                chapter.id,
                content.display()
            )));
        }
        Ok(SegmentRef {
            chapter_id: chapter.id.clone(),
            start_page: chapter.start_page,
            end_page: chapter.end_page,
            location: self.dir.display().to_string(),
        })
    }
}

#[async_trait]
impl ContentParser for JsonFixtureSource {
    async fn parse(&self, segment: &SegmentRef) -> Result<Vec<ContentEntry>, SourceError> {
        read_entries(&self.path(&segment.chapter_id, "content"), false).await
    }
}

#[async_trait]
impl StyleExtractor for JsonFixtureSource {
    async fn extract_style(&self, segment: &SegmentRef) -> Result<Vec<StyleEntry>, SourceError> {
        read_entries(&self.path(&segment.chapter_id, "style"), true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn serves_streams_from_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("c1.content.json"),
            r#"[{"page": 1, "kind": "heading", "text": "Intro", "bbox": {"x0": 0, "y0": 0, "x1": 100, "y1": 20}, "level": 1}]"#,
        )
        .unwrap();
        let source = JsonFixtureSource::new(dir.path());
        let chapter = ChapterUnit::new("c1", "Intro", 1, 3);

        let segment = source.extract(&chapter).await.unwrap();
        assert_eq!((segment.start_page, segment.end_page), (1, 3));
        let content = source.parse(&segment).await.unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].level, Some(1));
        // no style file: empty stream, not an error
        assert!(source.extract_style(&segment).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_content_fails_extraction() {
        let dir = TempDir::new().unwrap();
        let source = JsonFixtureSource::new(dir.path());
        let err = source.extract(&ChapterUnit::new("c9", "Nine", 1, 1)).await.unwrap_err();
        assert!(err.to_string().contains("c9"));
    }

    #[tokio::test]
    async fn malformed_content_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("c1.content.json"), "{").unwrap();
        let source = JsonFixtureSource::new(dir.path());
        let segment = source.extract(&ChapterUnit::new("c1", "One", 1, 1)).await.unwrap();
        assert!(matches!(
            source.parse(&segment).await,
            Err(SourceError::Malformed { .. })
        ));
    }
}
