//! Error types for the edgequake-doctree library.
//!
//! Three tiers reflect three distinct outcomes:
//!
//! * [`DoctreeError`] - **Fatal**: the run cannot proceed at all (schema
//!   cannot be loaded, rule registry is corrupt, the combined record cannot
//!   be written). Returned as `Err(DoctreeError)` from top-level entry points.
//!
//! * [`ChapterError`] - **Chapter-fatal**: one chapter's pipeline stopped
//!   (no usable content, an external call failed or timed out, its state
//!   could not be persisted). Stored in that chapter's
//!   [`crate::chapter::PipelineState`]; sibling chapters are unaffected.
//!
//! * [`Diagnostic`] - **Recorded**: the pipeline degraded but produced
//!   output (style stream missing, grammar repair, rejected rule proposal,
//!   duplicate rule). Carried in manifests so nothing is silently dropped.

use crate::chapter::Stage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-doctree library.
#[derive(Debug, Error)]
pub enum DoctreeError {
    // ── Schema errors ─────────────────────────────────────────────────────
    /// The schema descriptor file could not be read.
    #[error("Failed to read schema descriptor '{path}': {source}")]
    SchemaRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The schema descriptor is not valid JSON or has the wrong shape.
    #[error("Schema descriptor is malformed: {0}")]
    SchemaParse(String),

    /// The descriptor parsed but describes an unusable schema.
    #[error("Schema is invalid: {0}")]
    InvalidSchema(String),

    /// A node's content expression failed to parse or names an unknown type.
    #[error("Content expression '{expr}' of node '{node}' is invalid: {detail}")]
    InvalidExpression {
        node: String,
        expr: String,
        detail: String,
    },

    // ── Rule registry errors ──────────────────────────────────────────────
    /// The registry file could not be read or written.
    #[error("Failed to access rule registry '{path}': {source}")]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry file exists but cannot be decoded.
    #[error("Rule registry '{path}' is corrupt: {detail}")]
    RegistryCorrupt { path: PathBuf, detail: String },

    /// A rule references a node or mark type the schema does not define.
    #[error("Rule '{rule}' targets '{target}', which is not defined by the schema")]
    UnknownTargetType { rule: String, target: String },

    /// A rule's predicate cannot be evaluated (bad pattern, inverted range).
    #[error("Rule '{rule}' has an invalid predicate: {detail}")]
    InvalidPredicate { rule: String, detail: String },

    /// A rule's action cannot produce a node (undeclared attribute, unknown group).
    #[error("Rule '{rule}' has an invalid action: {detail}")]
    InvalidAction { rule: String, detail: String },

    // ── Pipeline state errors ─────────────────────────────────────────────
    /// A persisted state record could not be read or written.
    #[error("Failed to access pipeline state '{path}': {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted state record exists but cannot be decoded.
    #[error("Pipeline state '{path}' is corrupt: {detail}")]
    StateCorrupt { path: PathBuf, detail: String },

    /// A stage transition would move the state machine backwards.
    #[error("Illegal stage transition {from} -> {to}")]
    IllegalTransition { from: Stage, to: Stage },

    // ── Orchestration errors ──────────────────────────────────────────────
    /// The job contained no approved chapters, so nothing may be written.
    #[error("Document '{document}' has no approved chapters")]
    NoApprovedChapters { document: String },

    /// The run was cancelled before every chapter reached a terminal stage.
    #[error("Run of '{document}' was cancelled; {pending} chapter(s) will resume on the next run")]
    Cancelled { document: String, pending: usize },

    // ── Oracle provider errors ────────────────────────────────────────────
    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// An error that stops one chapter's pipeline.
///
/// Stored in the chapter's persisted state; the orchestrator marks the chapter
/// `failed` and continues with the rest of the document.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChapterError {
    /// The content stream was empty: there is nothing to convert.
    #[error("Chapter {chapter}: no usable content: {detail}")]
    ExtractionFailure { chapter: String, detail: String },

    /// An external collaborator failed during a stage.
    #[error("Chapter {chapter}: stage {stage} failed: {detail}")]
    StageFailure {
        chapter: String,
        stage: Stage,
        detail: String,
    },

    /// A stage exceeded its time budget.
    #[error("Chapter {chapter}: stage {stage} timed out after {secs}s")]
    StageTimeout {
        chapter: String,
        stage: Stage,
        secs: u64,
    },

    /// The chapter's state record could not be persisted or loaded.
    #[error("Chapter {chapter}: state storage failed: {detail}")]
    Storage { chapter: String, detail: String },
}

impl ChapterError {
    /// The chapter this error belongs to.
    pub fn chapter(&self) -> &str {
        match self {
            ChapterError::ExtractionFailure { chapter, .. }
            | ChapterError::StageFailure { chapter, .. }
            | ChapterError::StageTimeout { chapter, .. }
            | ChapterError::Storage { chapter, .. } => chapter,
        }
    }
}

/// A non-fatal condition recorded during processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// The style stream was empty; every unit is marked `style_missing`.
    StyleJoinDegraded { chapter: String, units: usize },

    /// A node's children violated its content expression and were repaired.
    SchemaViolation {
        path: Vec<usize>,
        node: String,
        detail: String,
    },

    /// No rule matched and no usable rule could be synthesised.
    RuleSynthesisFailure { unit: String, reason: String },

    /// A rule was added whose predicate already exists; usage was bumped instead.
    RegistryConflict { signature: String, existing: String },

    /// A heading's level disagrees with other headings set in the same font
    /// and size, and no single level could be chosen for it.
    TypographyMismatch {
        unit: String,
        style: String,
        level: u64,
        candidates: Vec<u64>,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::StyleJoinDegraded { chapter, units } => write!(
                f,
                "chapter {chapter}: style stream empty, {units} unit(s) carry no style"
            ),
            Diagnostic::SchemaViolation { path, node, detail } => {
                write!(f, "{node} at {path:?}: {detail}")
            }
            Diagnostic::RuleSynthesisFailure { unit, reason } => {
                write!(f, "unit {unit}: no rule synthesised ({reason})")
            }
            Diagnostic::RegistryConflict {
                signature,
                existing,
            } => write!(f, "predicate {signature} already registered as {existing}"),
            Diagnostic::TypographyMismatch {
                unit,
                style,
                level,
                candidates,
            } => write!(
                f,
                "unit {unit}: heading level {level}, but {style} is set at level(s) {candidates:?}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_display() {
        let e = ChapterError::StageFailure {
            chapter: "chapter_2_Methods".into(),
            stage: Stage::Parsing,
            detail: "parser returned 503".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("chapter_2_Methods"), "got: {msg}");
        assert!(msg.contains("parsing"), "got: {msg}");
    }

    #[test]
    fn stage_timeout_display() {
        let e = ChapterError::StageTimeout {
            chapter: "c1".into(),
            stage: Stage::Extracting,
            secs: 30,
        };
        assert!(e.to_string().contains("30s"));
        assert_eq!(e.chapter(), "c1");
    }

    #[test]
    fn chapter_error_serialises_with_kind_tag() {
        let e = ChapterError::ExtractionFailure {
            chapter: "c1".into(),
            detail: "empty".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "extraction_failure");
        let back: ChapterError = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn cancelled_display() {
        let e = DoctreeError::Cancelled {
            document: "plan".into(),
            pending: 2,
        };
        assert!(e.to_string().contains("2 chapter(s)"));
    }

    #[test]
    fn diagnostic_display() {
        let d = Diagnostic::RuleSynthesisFailure {
            unit: "c1:u3".into(),
            reason: "unknown target".into(),
        };
        assert!(d.to_string().contains("c1:u3"));
    }
}
