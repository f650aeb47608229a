//! Chapter Units and their persisted pipeline state machine.
//!
//! A [`ChapterUnit`] is a contiguous page range processed independently of
//! its siblings. Each unit owns exactly one [`PipelineState`], which only ever
//! moves forward through [`Stage`] (an explicit rerun resets it to
//! `extracting`) and keeps an append-only, timestamped history so a crashed
//! run can resume at the last completed stage.

pub mod detect;
pub mod store;

use crate::error::{ChapterError, DoctreeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use detect::{detect_chapters, parse_chapter_text, HeaderCriteria};
pub use store::{
    ChapterRecord, ChapterSummary, CombinedRecord, FileStateStore, MemoryStateStore,
    StageArtifacts, StateStore,
};

/// Human approval status of a detected chapter.
///
/// Nothing is persisted for a chapter until it is [`ApprovalStatus::Approved`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// A page-range segment of the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterUnit {
    /// Stable identifier, e.g. `chapter_2_Methods`.
    pub id: String,
    /// Chapter number parsed from the header, when present.
    #[serde(default)]
    pub number: Option<u32>,
    pub title: String,
    /// Header text exactly as detected.
    #[serde(default)]
    pub header_text: String,
    /// First page (1-indexed, inclusive).
    pub start_page: u32,
    /// Last page (1-indexed, inclusive).
    pub end_page: u32,
    #[serde(default)]
    pub approval: ApprovalStatus,
}

impl ChapterUnit {
    pub fn new(id: impl Into<String>, title: impl Into<String>, start_page: u32, end_page: u32) -> Self {
        Self {
            id: id.into(),
            number: None,
            title: title.into(),
            header_text: String::new(),
            start_page,
            end_page,
            approval: ApprovalStatus::Pending,
        }
    }

    pub fn approved(mut self) -> Self {
        self.approval = ApprovalStatus::Approved;
        self
    }

    pub fn approve(&mut self) {
        self.approval = ApprovalStatus::Approved;
    }

    pub fn reject(&mut self) {
        self.approval = ApprovalStatus::Rejected;
    }

    pub fn is_approved(&self) -> bool {
        self.approval == ApprovalStatus::Approved
    }

    /// Number of pages covered by this chapter.
    pub fn page_count(&self) -> u32 {
        self.end_page.saturating_sub(self.start_page) + 1
    }
}

/// Pipeline stage of a chapter (or of the whole document).
///
/// Declaration order is the forward order of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detected,
    Extracting,
    Parsing,
    Reconciling,
    Converting,
    Combined,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Detected => "detected",
            Stage::Extracting => "extracting",
            Stage::Parsing => "parsing",
            Stage::Reconciling => "reconciling",
            Stage::Converting => "converting",
            Stage::Combined => "combined",
            Stage::Failed => "failed",
        }
    }

    /// `combined` and `failed` end a pipeline.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Combined | Stage::Failed)
    }

    /// The stage that follows a successful completion of `self`.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Detected => Some(Stage::Extracting),
            Stage::Extracting => Some(Stage::Parsing),
            Stage::Parsing => Some(Stage::Reconciling),
            Stage::Reconciling => Some(Stage::Converting),
            Stage::Converting => Some(Stage::Combined),
            Stage::Combined | Stage::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// `None` for the creating transition.
    pub from: Option<Stage>,
    pub to: Stage,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Persisted state machine for a chapter or a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub stage: Stage,
    pub history: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChapterError>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    /// A fresh state at `detected`.
    pub fn new() -> Self {
        Self {
            stage: Stage::Detected,
            history: vec![Transition {
                from: None,
                to: Stage::Detected,
                at: Utc::now(),
                note: None,
            }],
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Move forward to `to`.
    ///
    /// Rejects backward moves, moves out of a terminal stage, and `failed`
    /// (use [`PipelineState::fail`] so the cause is recorded).
    pub fn advance(&mut self, to: Stage) -> Result<(), DoctreeError> {
        if self.stage.is_terminal() || to <= self.stage || to == Stage::Failed {
            return Err(DoctreeError::IllegalTransition {
                from: self.stage,
                to,
            });
        }
        self.push(to, None);
        Ok(())
    }

    /// Mark the pipeline failed with its cause.
    pub fn fail(&mut self, error: ChapterError) {
        let note = error.to_string();
        self.error = Some(error);
        self.push(Stage::Failed, Some(note));
    }

    /// Force the pipeline back to `extracting`, from any stage.
    pub fn rerun(&mut self) {
        self.error = None;
        self.push(Stage::Extracting, Some("rerun requested".to_string()));
    }

    /// Timestamp of the latest transition.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|t| t.at)
    }

    fn push(&mut self, to: Stage, note: Option<String>) {
        self.history.push(Transition {
            from: Some(self.stage),
            to,
            at: Utc::now(),
            note,
        });
        self.stage = to;
    }
}
