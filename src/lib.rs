//! # edgequake-doctree
//!
//! Turn the extraction streams of a PDF into schema-valid Tiptap/ProseMirror
//! document trees, chapter by chapter.
//!
//! ## Why this crate?
//!
//! Layout parsers know *what* a block is (heading, table, list item) and
//! style extractors know *how* it looks (font, size, colour), but neither
//! produces a tree an editor will accept. This crate joins the two streams
//! spatially, maps each joined unit to editor nodes through an auditable
//! rule registry, asks an LLM for a new rule only when nothing matches, and
//! repairs whatever still violates the editor schema's grammar.
//!
//! ## Pipeline Overview
//!
//! ```text
//! approved chapter
//!  │
//!  ├─ 1. Extract    cut the page range out of the source (SegmentExtractor)
//!  ├─ 2. Parse      content stream + style stream, concurrently
//!  ├─ 3. Reconcile  spatial join → ordered Content Units
//!  ├─ 4. Convert    rule lookup → (oracle) → frame stack → grammar repair
//!  │                → images only the style stream saw
//!  └─ 5. Combine    chapters in page order under the schema's top node
//!                   → heading levels aligned with heading typography
//! ```
//!
//! Every stage persists its artefact with the transition, so an interrupted
//! run resumes at the last completed stage.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_doctree::{
//!     Collaborators, DocumentJob, FileStateStore, JsonFixtureSource, Orchestrator,
//!     PipelineConfig, RuleRegistry, SchemaRegistry, SharedRegistry, ChapterUnit,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = Arc::new(SchemaRegistry::load("schema.json")?);
//!     let mut rules = RuleRegistry::open("rules.json", &schema)?;
//!     edgequake_doctree::rules::seed_curated(&mut rules, &schema)?;
//!     let registry = SharedRegistry::new(rules);
//!
//!     let source = Arc::new(JsonFixtureSource::new("streams/"));
//!     let orchestrator = Orchestrator::new(
//!         PipelineConfig::default(),
//!         schema,
//!         registry.clone(),
//!         Collaborators::from_source(source),
//!         Arc::new(FileStateStore::new("state/")),
//!     );
//!
//!     let chapters = vec![ChapterUnit::new("chapter_1_Intro", "Intro", 1, 12).approved()];
//!     let doc = orchestrator.run(DocumentJob::new("report", chapters)).await?;
//!     println!("{}", serde_json::to_string_pretty(&doc.root.without_meta())?);
//!     registry.read().save("rules.json")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doctree` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-doctree = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod chapter;
pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod oracle;
pub mod orchestrator;
pub mod persist;
pub mod postprocess;
pub mod progress;
pub mod prompts;
pub mod reconcile;
pub mod rules;
pub mod schema;
pub mod sources;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use chapter::{
    detect_chapters, ApprovalStatus, ChapterRecord, ChapterUnit, FileStateStore, HeaderCriteria,
    MemoryStateStore, PipelineState, Stage, StateStore,
};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use convert::{Converter, ConverterOptions};
pub use document::{CombinedDocument, Mark, Node, ReviewManifest, SegmentOutput};
pub use error::{ChapterError, Diagnostic, DoctreeError};
pub use oracle::{LlmOracleConfig, LlmRuleOracle, RuleOracle, Synthesizer};
pub use orchestrator::{CancelHandle, DocumentJob, Orchestrator, Rerun};
pub use postprocess::{check_typography, insert_images, TypographyRegistry};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use reconcile::{reconcile, BBox, ContentEntry, ContentUnit, StyleEntry, StyleKind};
pub use rules::{Rule, RuleRegistry, SharedRegistry};
pub use schema::SchemaRegistry;
pub use sources::{Collaborators, JsonFixtureSource, SegmentRef, SourceError};
