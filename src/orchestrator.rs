//! Chapter Orchestrator: drives every approved chapter through its stages
//! and combines the results.
//!
//! ## Stage protocol
//!
//! A chapter's persisted stage names the work still to do. Running a stage
//! produces its artefact; the artefact and the forward transition are saved
//! in one record. A crash, timeout or cancellation inside a stage therefore
//! leaves the previous record as the resume point and nothing half-done on
//! disk.
//!
//! ```text
//! detected ─► extracting ─► parsing ─► reconciling ─► converting ─► combined
//!                  │            │            │              │
//!              SegmentRef   content +      units          segment
//!                           style                         tree
//! ```
//!
//! Chapters are the unit of parallelism (`buffer_unordered(concurrency)`).
//! They share nothing but the rule registry, and a failed chapter never
//! stops its siblings.

use crate::chapter::{
    ChapterRecord, ChapterSummary, ChapterUnit, CombinedRecord, PipelineState, Stage, StateStore,
};
use crate::config::PipelineConfig;
use crate::convert::{validate, Converter};
use crate::document::{ChapterFailure, CombinedDocument, Node, ReviewEntry, ReviewManifest};
use crate::error::{ChapterError, DoctreeError};
use crate::oracle::{RuleOracle, Synthesizer};
use crate::postprocess::{check_typography, insert_images};
use crate::reconcile::{reconcile, ContentUnit};
use crate::rules::SharedRegistry;
use crate::schema::SchemaRegistry;
use crate::sources::{Collaborators, SourceError};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Which chapters to restart from `extracting`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Rerun {
    /// Resume every chapter where it stopped.
    #[default]
    None,
    All,
    Chapters(Vec<String>),
}

impl Rerun {
    pub fn applies_to(&self, chapter_id: &str) -> bool {
        match self {
            Rerun::None => false,
            Rerun::All => true,
            Rerun::Chapters(ids) => ids.iter().any(|id| id == chapter_id),
        }
    }
}

/// One document to process.
#[derive(Debug, Clone)]
pub struct DocumentJob {
    pub document_id: String,
    /// Detected chapters; only approved ones are processed.
    pub chapters: Vec<ChapterUnit>,
    pub rerun: Rerun,
}

impl DocumentJob {
    pub fn new(document_id: impl Into<String>, chapters: Vec<ChapterUnit>) -> Self {
        Self {
            document_id: document_id.into(),
            chapters,
            rerun: Rerun::None,
        }
    }

    pub fn with_rerun(mut self, rerun: Rerun) -> Self {
        self.rerun = rerun;
        self
    }
}

/// Stops a run at the next stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Allow the next run to proceed.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs documents through the chapter pipeline.
pub struct Orchestrator {
    config: PipelineConfig,
    schema: Arc<SchemaRegistry>,
    registry: SharedRegistry,
    collaborators: Collaborators,
    store: Arc<dyn StateStore>,
    synthesizer: Option<Arc<Synthesizer>>,
    cancel: CancelHandle,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        schema: Arc<SchemaRegistry>,
        registry: SharedRegistry,
        collaborators: Collaborators,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            schema,
            registry,
            collaborators,
            store,
            synthesizer: None,
            cancel: CancelHandle::default(),
        }
    }

    /// Consult `synthesizer` for units no rule matches.
    pub fn with_synthesizer(mut self, synthesizer: Arc<Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Consult `oracle` for units no rule matches, with the configured timeout.
    pub fn with_oracle(self, oracle: Arc<dyn RuleOracle>) -> Self {
        let synth = Synthesizer::new(oracle, self.config.oracle_timeout());
        self.with_synthesizer(Arc::new(synth))
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn synthesizer(&self) -> Option<&Arc<Synthesizer>> {
        self.synthesizer.as_ref()
    }

    /// Process every approved chapter of `job` and write the combined output.
    ///
    /// Returns the combined document once every approved chapter is
    /// `combined` or `failed`. Fails with [`DoctreeError::Cancelled`] if the
    /// run was cancelled first; the next run resumes where it stopped.
    pub async fn run(&self, job: DocumentJob) -> Result<CombinedDocument, DoctreeError> {
        let DocumentJob {
            document_id,
            chapters,
            rerun,
        } = job;

        let mut approved: Vec<ChapterUnit> = chapters.into_iter().filter(|c| c.is_approved()).collect();
        if approved.is_empty() {
            return Err(DoctreeError::NoApprovedChapters {
                document: document_id,
            });
        }
        approved.sort_by_key(|c| c.start_page);

        if let Some(synth) = &self.synthesizer {
            synth.cache().clear();
        }
        let converter = Converter::new(
            Arc::clone(&self.schema),
            self.registry.clone(),
            self.synthesizer.clone(),
            self.config.converter_options(),
        )?;

        info!(
            "Document {}: {} approved chapter(s), concurrency {}",
            document_id,
            approved.len(),
            self.config.concurrency
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_start(&document_id, approved.len());
        }

        let mut doc_state = PipelineState::new();
        doc_state.advance(Stage::Converting)?;

        let mut records: Vec<(usize, ChapterRecord)> = stream::iter(approved.iter().enumerate().map(
            |(i, chapter)| {
                let converter = &converter;
                let document_id = document_id.as_str();
                let rerun = &rerun;
                async move { (i, self.run_chapter(document_id, chapter, rerun, converter).await) }
            },
        ))
        .buffer_unordered(self.config.concurrency.max(1))
        .collect()
        .await;
        records.sort_by_key(|(i, _)| *i);
        let records: Vec<ChapterRecord> = records.into_iter().map(|(_, r)| r).collect();

        let pending = records.iter().filter(|r| !r.state.is_terminal()).count();
        if pending > 0 {
            warn!("Document {}: cancelled with {} chapter(s) pending", document_id, pending);
            return Err(DoctreeError::Cancelled {
                document: document_id,
                pending,
            });
        }

        let combined = self.combine(&document_id, &records);
        doc_state.advance(Stage::Combined)?;
        let record = CombinedRecord {
            document_id: document_id.clone(),
            state: doc_state,
            chapters: records.iter().map(ChapterSummary::from_record).collect(),
            document: combined.clone(),
            saved_at: Utc::now(),
        };
        self.store.save_combined(&record).await?;

        info!(
            "Document {}: combined {} chapter(s), {} failed, {} node(s) for review",
            document_id,
            combined.chapters.len(),
            combined.failed.len(),
            combined.manifest.needs_review.len()
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_complete(&document_id, combined.chapters.len(), combined.failed.len());
        }
        Ok(combined)
    }

    // ── Chapter pipeline ─────────────────────────────────────────────────

    /// Drive one chapter until it is terminal or the run is cancelled.
    async fn run_chapter(
        &self,
        document_id: &str,
        chapter: &ChapterUnit,
        rerun: &Rerun,
        converter: &Converter,
    ) -> ChapterRecord {
        let loaded = match self.store.load_chapter(document_id, &chapter.id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Chapter {}: cannot load state: {}", chapter.id, e);
                let mut record = ChapterRecord::new(document_id, chapter.clone());
                self.fail(&mut record, storage_error(&chapter.id, &e)).await;
                return record;
            }
        };

        let mut record = match loaded {
            Some(mut record) => {
                record.chapter = chapter.clone();
                if rerun.applies_to(&chapter.id) {
                    info!("Chapter {}: rerun from {}", chapter.id, record.state.stage);
                    record.state.rerun();
                    record.artifacts = Default::default();
                    if let Err(e) = self.persist(&mut record).await {
                        self.fail(&mut record, e).await;
                        return record;
                    }
                } else {
                    debug!("Chapter {}: resuming at {}", chapter.id, record.state.stage);
                }
                record
            }
            None => {
                let mut record = ChapterRecord::new(document_id, chapter.clone());
                if let Err(e) = self.persist(&mut record).await {
                    self.fail(&mut record, e).await;
                    return record;
                }
                record
            }
        };

        while !record.state.is_terminal() {
            if self.cancel.is_cancelled() {
                info!("Chapter {}: cancelled at {}", chapter.id, record.state.stage);
                break;
            }
            let stage = record.state.stage;
            if let Some(ref cb) = self.config.progress_callback {
                cb.on_stage(&chapter.id, stage);
            }

            if let Err(e) = self.run_stage(stage, &mut record, converter).await {
                warn!("Chapter {}: {}", chapter.id, e);
                self.fail(&mut record, e).await;
                break;
            }
            let Some(next) = stage.next() else { break };
            if let Err(e) = record.state.advance(next) {
                let e = ChapterError::StageFailure {
                    chapter: chapter.id.clone(),
                    stage,
                    detail: e.to_string(),
                };
                self.fail(&mut record, e).await;
                break;
            }
            if let Err(e) = self.persist(&mut record).await {
                self.fail(&mut record, e).await;
                break;
            }
            info!("Chapter {}: {} -> {}", chapter.id, stage, next);
        }

        if record.state.stage == Stage::Combined {
            if let Some(ref cb) = self.config.progress_callback {
                let (nodes, review) = record
                    .artifacts
                    .output
                    .as_ref()
                    .map_or((0, 0), |o| (o.root.count(), o.manifest.needs_review.len()));
                cb.on_chapter_complete(&chapter.id, nodes, review);
            }
        }
        record
    }

    /// Run the work of `stage`, storing its artefact in `record` only on success.
    async fn run_stage(
        &self,
        stage: Stage,
        record: &mut ChapterRecord,
        converter: &Converter,
    ) -> Result<(), ChapterError> {
        let id = record.chapter.id.clone();
        match stage {
            Stage::Detected => Ok(()),
            Stage::Extracting => {
                let segment = self
                    .external(&id, stage, self.collaborators.extractor.extract(&record.chapter))
                    .await?;
                record.artifacts.segment = Some(segment);
                Ok(())
            }
            Stage::Parsing => {
                let segment = record
                    .artifacts
                    .segment
                    .clone()
                    .ok_or_else(|| missing_artifact(&id, stage, "segment"))?;
                let (content, style) = tokio::join!(
                    self.external(&id, stage, self.collaborators.parser.parse(&segment)),
                    self.external(&id, stage, self.collaborators.style.extract_style(&segment)),
                );
                let content = content?;
                let style = style.unwrap_or_else(|e| {
                    warn!("Chapter {}: style stream unavailable, continuing without it: {}", id, e);
                    Vec::new()
                });
                debug!(
                    "Chapter {}: {} content entries, {} style entries",
                    id,
                    content.len(),
                    style.len()
                );
                record.artifacts.content = Some(content);
                record.artifacts.style = Some(style);
                Ok(())
            }
            Stage::Reconciling => {
                let content = record
                    .artifacts
                    .content
                    .clone()
                    .ok_or_else(|| missing_artifact(&id, stage, "content stream"))?;
                let style = record.artifacts.style.clone().unwrap_or_default();
                let reconciled = reconcile(&id, content, &style, self.config.overlap_threshold)?;
                if reconciled.discarded_style > 0 {
                    debug!(
                        "Chapter {}: {} style entries matched no content",
                        id, reconciled.discarded_style
                    );
                }
                record.artifacts.units = Some(reconciled.units);
                record.artifacts.diagnostics.extend(reconciled.diagnostics);
                Ok(())
            }
            Stage::Converting => {
                let units = record
                    .artifacts
                    .units
                    .as_deref()
                    .ok_or_else(|| missing_artifact(&id, stage, "content units"))?;
                let timeout = self.config.stage_timeout();
                let mut output = tokio::time::timeout(timeout, converter.convert(&id, units))
                    .await
                    .map_err(|_| ChapterError::StageTimeout {
                        chapter: id.clone(),
                        stage,
                        secs: timeout.as_secs(),
                    })?;
                let style = record.artifacts.style.as_deref().unwrap_or_default();
                let inserted = insert_images(
                    &mut output.root,
                    units,
                    style,
                    &self.config.image_node,
                    &self.schema,
                    &mut output.manifest,
                );
                if inserted > 0 {
                    info!("Chapter {}: {} image(s) placed from the style stream", id, inserted);
                    validate::repair(&mut output.root, &self.schema, &mut output.manifest);
                }
                let mut diagnostics = record.artifacts.diagnostics.clone();
                diagnostics.append(&mut output.manifest.diagnostics);
                output.manifest.diagnostics = diagnostics;
                record.artifacts.output = Some(output);
                Ok(())
            }
            Stage::Combined | Stage::Failed => Ok(()),
        }
    }

    /// Await an external collaborator under the stage deadline.
    async fn external<T, F>(&self, chapter: &str, stage: Stage, call: F) -> Result<T, ChapterError>
    where
        F: Future<Output = Result<T, SourceError>>,
    {
        let timeout = self.config.stage_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ChapterError::StageFailure {
                chapter: chapter.to_string(),
                stage,
                detail: e.to_string(),
            }),
            Err(_) => Err(ChapterError::StageTimeout {
                chapter: chapter.to_string(),
                stage,
                secs: timeout.as_secs(),
            }),
        }
    }

    async fn persist(&self, record: &mut ChapterRecord) -> Result<(), ChapterError> {
        record.saved_at = Utc::now();
        self.store
            .save_chapter(record)
            .await
            .map_err(|e| storage_error(&record.chapter.id, &e))
    }

    /// Mark the chapter failed and try to record it.
    async fn fail(&self, record: &mut ChapterRecord, cause: ChapterError) {
        let message = cause.to_string();
        record.state.fail(cause);
        if let Err(e) = self.persist(record).await {
            error!("Chapter {}: failure could not be recorded: {}", record.chapter.id, e);
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_chapter_failed(&record.chapter.id, &message);
        }
    }

    // ── Combine ──────────────────────────────────────────────────────────

    /// Concatenate chapter trees in chapter order under one top node.
    fn combine(&self, document_id: &str, records: &[ChapterRecord]) -> CombinedDocument {
        let top = self.schema.top_node();
        let mut root = Node::new(top);
        let mut manifest = ReviewManifest::default();
        let mut included = Vec::new();
        let mut failed = Vec::new();

        for record in records {
            let id = &record.chapter.id;
            match (&record.state.stage, &record.artifacts.output) {
                (Stage::Combined, Some(output)) => {
                    let offset = root.content.len();
                    let children = if output.root.kind == top {
                        manifest.absorb_spliced(output.manifest.clone(), offset);
                        output.root.content.clone()
                    } else {
                        manifest.absorb(output.manifest.clone(), &[offset]);
                        vec![output.root.clone()]
                    };
                    for mut child in children {
                        child.meta_mut().chapter = Some(id.clone());
                        root.content.push(child);
                    }
                    included.push(id.clone());
                }
                _ => {
                    let error = record.state.error.clone().unwrap_or_else(|| ChapterError::StageFailure {
                        chapter: id.clone(),
                        stage: record.state.stage,
                        detail: "chapter produced no output".to_string(),
                    });
                    manifest.needs_review.push(ReviewEntry {
                        unit: id.clone(),
                        reading_order: root.content.len(),
                        reason: error.to_string(),
                    });
                    root.content.push(self.placeholder(record, &error));
                    failed.push(ChapterFailure {
                        chapter: id.clone(),
                        error,
                    });
                }
            }
        }

        validate::repair(&mut root, &self.schema, &mut manifest);
        if self.config.typography_check {
            let units: Vec<ContentUnit> = records
                .iter()
                .filter_map(|r| r.artifacts.units.as_deref())
                .flatten()
                .cloned()
                .collect();
            check_typography(&mut root, &units, &self.config.heading_node, &mut manifest);
        }
        CombinedDocument {
            document_id: document_id.to_string(),
            root,
            manifest,
            chapters: included,
            failed,
        }
    }

    /// Visible stand-in for a failed chapter.
    fn placeholder(&self, record: &ChapterRecord, error: &ChapterError) -> Node {
        let kind = self
            .config
            .fallback_node
            .clone()
            .or_else(|| self.schema.text_container().map(str::to_string))
            .unwrap_or_else(|| "paragraph".to_string());
        let text = format!(
            "[{} (pages {}-{}) failed: {}]",
            record.chapter.title, record.chapter.start_page, record.chapter.end_page, error
        );
        let mut node = Node::new(kind).with_content(vec![Node::text(text)]);
        let meta = node.meta_mut();
        meta.chapter = Some(record.chapter.id.clone());
        meta.needs_review = true;
        node
    }
}

fn storage_error(chapter: &str, e: &DoctreeError) -> ChapterError {
    ChapterError::Storage {
        chapter: chapter.to_string(),
        detail: e.to_string(),
    }
}

fn missing_artifact(chapter: &str, stage: Stage, what: &str) -> ChapterError {
    ChapterError::StageFailure {
        chapter: chapter.to_string(),
        stage,
        detail: format!("persisted state lacks the {what}; rerun the chapter"),
    }
}
