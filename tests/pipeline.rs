//! End-to-end runs of the chapter pipeline with in-memory collaborators.
//!
//! No network and no PDF tooling: streams are fixed per chapter, the oracle
//! is scripted, and state lives in a `MemoryStateStore` (or a temp dir for
//! the file-store scenario).

use async_trait::async_trait;
use edgequake_doctree::chapter::StateStore;
use edgequake_doctree::oracle::{OracleError, ProposalRequest, RuleProposal};
use edgequake_doctree::rules::{seed_curated, Action, ChildPolicy, Predicate, Provenance};
use edgequake_doctree::sources::{ContentParser, SegmentExtractor, StyleExtractor};
use edgequake_doctree::{
    BBox, ChapterError, ChapterRecord, ChapterUnit, Collaborators, ContentEntry, Diagnostic,
    DoctreeError, DocumentJob, FileStateStore, JsonFixtureSource, MemoryStateStore, Node,
    Orchestrator, PipelineConfig, PipelineProgressCallback, Rerun, RuleOracle, RuleRegistry,
    SchemaRegistry, SegmentRef, SharedRegistry, SourceError, Stage, StyleEntry, StyleKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const SCHEMA: &str = r#"{
    "topNode": "doc",
    "nodes": {
        "doc":            { "content": "block+" },
        "paragraph":      { "group": "block", "content": "inline*" },
        "heading":        { "group": "block", "content": "inline*", "defining": true,
                            "attrs": { "level": { "default": 1 } } },
        "blockquote":     { "group": "block", "content": "block+" },
        "bulletList":     { "group": "block", "content": "listItem+" },
        "listItem":       { "content": "paragraph block*", "defining": true },
        "table":          { "group": "block", "content": "tableRow+" },
        "tableRow":       { "content": "tableCell+" },
        "tableCell":      { "content": "block+" },
        "image":          { "group": "block", "marks": "",
                            "attrs": { "src": {}, "alt": { "default": null } } },
        "text":           { "group": "inline", "inline": true }
    },
    "marks": { "bold": {}, "italic": {} }
}"#;

const DOC: &str = "handbook";

// ── Test doubles ─────────────────────────────────────────────────────────

fn entry(page: u32, kind: &str, text: &str, y: f64) -> ContentEntry {
    ContentEntry {
        page,
        kind: kind.to_string(),
        text: text.to_string(),
        media_ref: None,
        bbox: BBox::new(50.0, y, 550.0, y + 20.0),
        level: (kind == "heading").then_some(1),
        rows: None,
        containers: Vec::new(),
    }
}

fn style(page: u32, y: f64, size: f64) -> StyleEntry {
    StyleEntry {
        page,
        bbox: BBox::new(50.0, y, 550.0, y + 20.0),
        kind: StyleKind::Text,
        src: None,
        text: String::new(),
        font: Some("Georgia".to_string()),
        size: Some(size),
        color: None,
        flags: 0,
    }
}

/// Serves fixed streams per chapter and counts calls.
#[derive(Default)]
struct MemorySource {
    content: HashMap<String, Vec<ContentEntry>>,
    style: HashMap<String, Vec<StyleEntry>>,
    extract_calls: Mutex<HashMap<String, usize>>,
    slow_extract: Option<Duration>,
}

impl MemorySource {
    fn with_chapter(mut self, id: &str, content: Vec<ContentEntry>, style: Vec<StyleEntry>) -> Self {
        self.content.insert(id.to_string(), content);
        if !style.is_empty() {
            self.style.insert(id.to_string(), style);
        }
        self
    }

    fn extracts(&self, id: &str) -> usize {
        self.extract_calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SegmentExtractor for MemorySource {
    async fn extract(&self, chapter: &ChapterUnit) -> Result<SegmentRef, SourceError> {
        *self
            .extract_calls
            .lock()
            .unwrap()
            .entry(chapter.id.clone())
            .or_default() += 1;
        if let Some(delay) = self.slow_extract {
            tokio::time::sleep(delay).await;
        }
        Ok(SegmentRef {
            chapter_id: chapter.id.clone(),
            start_page: chapter.start_page,
            end_page: chapter.end_page,
            location: format!("memory://{}", chapter.id),
        })
    }
}

#[async_trait]
impl ContentParser for MemorySource {
    async fn parse(&self, segment: &SegmentRef) -> Result<Vec<ContentEntry>, SourceError> {
        Ok(self.content.get(&segment.chapter_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl StyleExtractor for MemorySource {
    async fn extract_style(&self, segment: &SegmentRef) -> Result<Vec<StyleEntry>, SourceError> {
        Ok(self.style.get(&segment.chapter_id).cloned().unwrap_or_default())
    }
}

/// Proposes `blockquote > paragraph` for any `quote` unit.
struct QuoteOracle {
    calls: AtomicUsize,
}

#[async_trait]
impl RuleOracle for QuoteOracle {
    async fn propose(&self, request: &ProposalRequest) -> Result<RuleProposal, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(request.available_types.iter().any(|t| t.name == "blockquote"));
        Ok(RuleProposal {
            description: "Pull quotes become block quotes".to_string(),
            predicate: Predicate::kind("quote"),
            action: Action::node("blockquote").with_policy(ChildPolicy::Wrap {
                inner: "paragraph".to_string(),
            }),
        })
    }
}

#[derive(Default)]
struct Events {
    stages: Mutex<Vec<(String, Stage)>>,
    completed: AtomicUsize,
    failed: AtomicUsize,
    finished: Mutex<Option<(usize, usize)>>,
}

impl PipelineProgressCallback for Events {
    fn on_stage(&self, chapter_id: &str, stage: Stage) {
        self.stages.lock().unwrap().push((chapter_id.to_string(), stage));
    }

    fn on_chapter_complete(&self, _chapter_id: &str, _nodes: usize, _needs_review: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_chapter_failed(&self, _chapter_id: &str, _error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_run_complete(&self, _document_id: &str, combined: usize, failed: usize) {
        *self.finished.lock().unwrap() = Some((combined, failed));
    }
}

// ── Fixture ──────────────────────────────────────────────────────────────

struct Harness {
    schema: Arc<SchemaRegistry>,
    registry: SharedRegistry,
    source: Arc<MemorySource>,
    store: Arc<MemoryStateStore>,
}

impl Harness {
    fn new(source: MemorySource) -> Self {
        let schema = Arc::new(SchemaRegistry::from_json(SCHEMA).unwrap());
        let mut rules = RuleRegistry::new();
        seed_curated(&mut rules, &schema).unwrap();
        Self {
            schema,
            registry: SharedRegistry::new(rules),
            source: Arc::new(source),
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    fn orchestrator(&self, config: PipelineConfig) -> Orchestrator {
        Orchestrator::new(
            config,
            Arc::clone(&self.schema),
            self.registry.clone(),
            Collaborators::from_source(Arc::clone(&self.source)),
            self.store.clone(),
        )
    }
}

fn two_chapter_source() -> MemorySource {
    MemorySource::default()
        .with_chapter(
            "c1",
            vec![
                entry(1, "heading", "Getting Started", 40.0),
                entry(1, "text", "Install the tools.", 80.0),
            ],
            vec![style(1, 40.0, 24.0), style(1, 80.0, 11.0)],
        )
        .with_chapter(
            "c2",
            vec![
                entry(5, "heading", "Advanced Use", 40.0),
                entry(5, "text", "Tune the settings.", 80.0),
            ],
            vec![style(5, 40.0, 24.0), style(5, 80.0, 11.0)],
        )
}

fn chapters() -> Vec<ChapterUnit> {
    vec![
        ChapterUnit::new("c2", "Advanced Use", 5, 9).approved(),
        ChapterUnit::new("c1", "Getting Started", 1, 4).approved(),
    ]
}

fn texts(root: &Node) -> Vec<String> {
    root.content.iter().map(Node::text_content).collect()
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn combines_chapters_in_page_order() {
    let h = Harness::new(two_chapter_source());
    let events = Arc::new(Events::default());
    let config = PipelineConfig::builder()
        .concurrency(2)
        .progress_callback(events.clone())
        .build()
        .unwrap();

    let doc = h
        .orchestrator(config)
        .run(DocumentJob::new(DOC, chapters()))
        .await
        .unwrap();

    assert_eq!(doc.chapters, vec!["c1", "c2"]);
    assert!(doc.failed.is_empty());
    assert_eq!(doc.root.kind, "doc");
    assert_eq!(
        doc.root.child_types(),
        vec!["heading", "paragraph", "heading", "paragraph"]
    );
    assert_eq!(
        texts(&doc.root),
        vec!["Getting Started", "Install the tools.", "Advanced Use", "Tune the settings."]
    );
    let owners: Vec<_> = doc
        .root
        .content
        .iter()
        .map(|n| n.meta.as_ref().and_then(|m| m.chapter.clone()))
        .collect();
    assert_eq!(
        owners,
        vec![Some("c1".into()), Some("c1".into()), Some("c2".into()), Some("c2".into())]
    );

    for id in ["c1", "c2"] {
        let history = h.store.history(DOC, id);
        assert_eq!(history.last().unwrap().stage(), Stage::Combined);
    }
    assert_eq!(events.completed.load(Ordering::SeqCst), 2);
    assert_eq!(*events.finished.lock().unwrap(), Some((2, 0)));
    let c1_stages: Vec<Stage> = events
        .stages
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| id == "c1")
        .map(|(_, s)| *s)
        .collect();
    assert_eq!(
        c1_stages,
        vec![
            Stage::Detected,
            Stage::Extracting,
            Stage::Parsing,
            Stage::Reconciling,
            Stage::Converting
        ]
    );
    assert!(h.store.load_combined(DOC).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_chapter_does_not_stop_its_sibling() {
    let source = MemorySource::default()
        .with_chapter(
            "c1",
            vec![entry(1, "text", "Survives.", 80.0)],
            vec![style(1, 80.0, 11.0)],
        )
        .with_chapter("c2", Vec::new(), Vec::new());
    let h = Harness::new(source);
    let events = Arc::new(Events::default());
    let config = PipelineConfig::builder()
        .progress_callback(events.clone())
        .build()
        .unwrap();

    let doc = h
        .orchestrator(config)
        .run(DocumentJob::new(DOC, chapters()))
        .await
        .unwrap();

    assert_eq!(doc.chapters, vec!["c1"]);
    assert_eq!(doc.failed.len(), 1);
    assert_eq!(doc.failed[0].chapter, "c2");
    assert!(matches!(doc.failed[0].error, ChapterError::ExtractionFailure { .. }));

    // the failed chapter keeps its slot, flagged for review
    assert_eq!(doc.root.content.len(), 2);
    let placeholder = &doc.root.content[1];
    assert!(placeholder.needs_review());
    assert!(placeholder.text_content().contains("Advanced Use"));
    assert!(doc.manifest.needs_review.iter().any(|e| e.unit == "c2"));

    let c2 = h.store.history(DOC, "c2");
    let last = c2.last().unwrap();
    assert_eq!(last.stage(), Stage::Failed);
    assert!(last.state.error.is_some());
    assert_eq!(events.failed.load(Ordering::SeqCst), 1);
    assert_eq!(events.completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resumes_at_the_persisted_stage() {
    let h = Harness::new(two_chapter_source());

    let chapter = ChapterUnit::new("c1", "Getting Started", 1, 4).approved();
    let mut record = ChapterRecord::new(DOC, chapter.clone());
    record.state.advance(Stage::Extracting).unwrap();
    record.state.advance(Stage::Parsing).unwrap();
    record.artifacts.segment = Some(SegmentRef {
        chapter_id: "c1".into(),
        start_page: 1,
        end_page: 4,
        location: "memory://c1".into(),
    });
    h.store.preload(record);

    let doc = h
        .orchestrator(PipelineConfig::default())
        .run(DocumentJob::new(DOC, vec![chapter]))
        .await
        .unwrap();

    assert_eq!(h.source.extracts("c1"), 0);
    assert_eq!(doc.chapters, vec!["c1"]);
    let stages: Vec<Stage> = h
        .store
        .history(DOC, "c1")
        .iter()
        .map(ChapterRecord::stage)
        .collect();
    assert_eq!(
        stages,
        vec![Stage::Parsing, Stage::Reconciling, Stage::Converting, Stage::Combined]
    );
}

#[tokio::test]
async fn finished_chapters_are_not_redone_unless_rerun() {
    let h = Harness::new(two_chapter_source());
    let orchestrator = h.orchestrator(PipelineConfig::default());

    let first = orchestrator.run(DocumentJob::new(DOC, chapters())).await.unwrap();
    assert_eq!(h.source.extracts("c1"), 1);

    let again = orchestrator.run(DocumentJob::new(DOC, chapters())).await.unwrap();
    assert_eq!(h.source.extracts("c1"), 1);
    assert_eq!(h.source.extracts("c2"), 1);
    assert_eq!(again.root, first.root);

    let job = DocumentJob::new(DOC, chapters()).with_rerun(Rerun::Chapters(vec!["c2".into()]));
    let rerun = orchestrator.run(job).await.unwrap();
    assert_eq!(h.source.extracts("c1"), 1);
    assert_eq!(h.source.extracts("c2"), 2);
    assert_eq!(rerun.root.without_meta(), first.root.without_meta());

    let c2 = h.store.history(DOC, "c2");
    let last = c2.last().unwrap();
    assert!(last
        .state
        .history
        .iter()
        .any(|t| t.to == Stage::Extracting && t.note.as_deref() == Some("rerun requested")));
}

#[tokio::test]
async fn synthesized_rule_is_committed_and_reused() {
    let source = MemorySource::default().with_chapter(
        "c1",
        vec![
            entry(1, "quote", "Simplicity is prerequisite for reliability.", 40.0),
            entry(1, "text", "So keep it small.", 80.0),
            entry(2, "quote", "Premature optimisation is the root of all evil.", 40.0),
        ],
        vec![style(1, 40.0, 14.0), style(1, 80.0, 11.0), style(2, 40.0, 14.0)],
    );
    let h = Harness::new(source);
    let oracle = Arc::new(QuoteOracle {
        calls: AtomicUsize::new(0),
    });
    let orchestrator = h.orchestrator(PipelineConfig::default()).with_oracle(oracle.clone());

    let doc = orchestrator
        .run(DocumentJob::new(DOC, vec![ChapterUnit::new("c1", "Quotes", 1, 2).approved()]))
        .await
        .unwrap();

    assert_eq!(doc.root.child_types(), vec!["blockquote", "paragraph", "blockquote"]);
    assert!(doc.manifest.needs_review.is_empty());
    assert_eq!(doc.manifest.synthesized_rules.len(), 1);
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);

    let registry = h.registry.read();
    let rule = registry
        .get(&doc.manifest.synthesized_rules[0])
        .expect("synthesised rule is in the registry");
    assert_eq!(rule.provenance, Provenance::Synthesized);
    assert_eq!(rule.action.target, "blockquote");
    assert_eq!(rule.usage, 2);
}

#[tokio::test]
async fn figures_only_the_style_stream_saw_are_placed() {
    let mut figure = entry(1, "image", "Figure 1", 100.0);
    figure.media_ref = Some("img/fig1.png".to_string());
    let source = MemorySource::default().with_chapter(
        "c1",
        vec![
            entry(1, "heading", "Figures", 40.0),
            figure,
            entry(1, "text", "Both figures show the setup.", 300.0),
        ],
        vec![
            style(1, 40.0, 24.0),
            style(1, 300.0, 11.0),
            StyleEntry::image(1, BBox::new(50.0, 100.0, 550.0, 180.0), "img/fig1.png"),
            StyleEntry::image(1, BBox::new(50.0, 200.0, 550.0, 280.0), "img/fig2.png"),
        ],
    );
    let h = Harness::new(source);

    let doc = h
        .orchestrator(PipelineConfig::default())
        .run(DocumentJob::new(DOC, vec![ChapterUnit::new("c1", "Figures", 1, 1).approved()]))
        .await
        .unwrap();

    assert_eq!(doc.root.child_types(), vec!["heading", "image", "image", "paragraph"]);
    assert_eq!(doc.root.content[1].attrs["src"], "img/fig1.png");
    assert_eq!(doc.root.content[2].attrs["src"], "img/fig2.png");
    assert_eq!(doc.manifest.inserted_images.len(), 1);
    assert_eq!(doc.manifest.inserted_images[0].path, vec![2]);
}

#[tokio::test]
async fn heading_levels_follow_typography_across_chapters() {
    let mut sub = entry(5, "heading", "Tuning", 40.0);
    sub.level = Some(2);
    let source = MemorySource::default()
        .with_chapter(
            "c1",
            vec![
                entry(1, "heading", "Getting Started", 40.0),
                entry(2, "heading", "Installing", 40.0),
            ],
            vec![style(1, 40.0, 24.0), style(2, 40.0, 24.0)],
        )
        .with_chapter("c2", vec![sub], vec![style(5, 40.0, 24.0)]);
    let h = Harness::new(source);

    let doc = h
        .orchestrator(PipelineConfig::default())
        .run(DocumentJob::new(DOC, chapters()))
        .await
        .unwrap();

    let levels: Vec<_> = doc.root.content.iter().map(|n| n.attrs["level"].clone()).collect();
    assert_eq!(levels, vec![1, 1, 1]);
    assert_eq!(doc.manifest.relevelled.len(), 1);
    assert_eq!(doc.manifest.relevelled[0].path, vec![2]);

    let untouched = h
        .orchestrator(PipelineConfig::builder().typography_check(false).build().unwrap())
        .run(DocumentJob::new(DOC, chapters()))
        .await
        .unwrap();
    assert_eq!(untouched.root.content[2].attrs["level"], 2);
}

#[tokio::test]
async fn unmatched_units_fall_back_without_an_oracle() {
    let source = MemorySource::default().with_chapter(
        "c1",
        vec![entry(1, "sidebar", "Did you know?", 40.0)],
        vec![style(1, 40.0, 9.0)],
    );
    let h = Harness::new(source);

    let doc = h
        .orchestrator(PipelineConfig::default())
        .run(DocumentJob::new(DOC, vec![ChapterUnit::new("c1", "One", 1, 1).approved()]))
        .await
        .unwrap();

    assert_eq!(doc.root.child_types(), vec!["paragraph"]);
    assert!(doc.root.content[0].needs_review());
    assert_eq!(doc.manifest.needs_review.len(), 1);
    assert!(doc
        .manifest
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::RuleSynthesisFailure { .. })));
}

#[tokio::test]
async fn missing_style_degrades_but_keeps_order() {
    let source = MemorySource::default().with_chapter(
        "c1",
        vec![
            entry(1, "heading", "Plain", 40.0),
            entry(1, "text", "No fonts here.", 80.0),
        ],
        Vec::new(),
    );
    let h = Harness::new(source);

    let doc = h
        .orchestrator(PipelineConfig::default())
        .run(DocumentJob::new(DOC, vec![ChapterUnit::new("c1", "Plain", 1, 1).approved()]))
        .await
        .unwrap();

    assert_eq!(texts(&doc.root), vec!["Plain", "No fonts here."]);
    assert!(doc
        .manifest
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::StyleJoinDegraded { units: 2, .. })));

    let record = h.store.history(DOC, "c1").pop().unwrap();
    let units = record.artifacts.units.unwrap();
    assert!(units.iter().all(|u| u.style_missing));
}

#[tokio::test]
async fn no_approved_chapters_is_an_error() {
    let h = Harness::new(two_chapter_source());
    let pending = vec![ChapterUnit::new("c1", "Getting Started", 1, 4)];

    let err = h
        .orchestrator(PipelineConfig::default())
        .run(DocumentJob::new(DOC, pending))
        .await
        .unwrap_err();

    assert!(matches!(err, DoctreeError::NoApprovedChapters { .. }));
    assert!(h.store.history(DOC, "c1").is_empty());
}

#[tokio::test]
async fn cancelled_run_resumes_later() {
    let h = Harness::new(two_chapter_source());
    let orchestrator = h.orchestrator(PipelineConfig::default());
    let cancel = orchestrator.cancel_handle();

    cancel.cancel();
    let err = orchestrator.run(DocumentJob::new(DOC, chapters())).await.unwrap_err();
    assert!(matches!(err, DoctreeError::Cancelled { pending: 2, .. }));
    assert_eq!(h.source.extracts("c1"), 0);
    assert!(h.store.load_combined(DOC).await.unwrap().is_none());

    cancel.reset();
    let doc = orchestrator.run(DocumentJob::new(DOC, chapters())).await.unwrap();
    assert_eq!(doc.chapters, vec!["c1", "c2"]);
}

#[tokio::test]
async fn storage_failure_fails_only_that_chapter() {
    let h = Harness::new(two_chapter_source());
    h.store.fail_saves_for("c2");

    let doc = h
        .orchestrator(PipelineConfig::default())
        .run(DocumentJob::new(DOC, chapters()))
        .await
        .unwrap();

    assert_eq!(doc.chapters, vec!["c1"]);
    assert_eq!(doc.failed.len(), 1);
    assert!(matches!(doc.failed[0].error, ChapterError::Storage { .. }));
    assert_eq!(h.source.extracts("c2"), 0);
}

#[tokio::test]
async fn slow_collaborator_times_out_the_stage() {
    let mut source = two_chapter_source();
    source.slow_extract = Some(Duration::from_secs(5));
    let h = Harness::new(source);
    let config = PipelineConfig::builder().stage_timeout_secs(1).build().unwrap();

    let doc = h
        .orchestrator(config)
        .run(DocumentJob::new(DOC, vec![ChapterUnit::new("c1", "Getting Started", 1, 4).approved()]))
        .await
        .unwrap();

    assert!(doc.chapters.is_empty());
    assert!(matches!(
        doc.failed[0].error,
        ChapterError::StageTimeout {
            stage: Stage::Extracting,
            secs: 1,
            ..
        }
    ));
}

#[tokio::test]
async fn file_store_and_fixture_source_round_trip() {
    let streams = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    std::fs::write(
        streams.path().join("c1.content.json"),
        serde_json::to_string(&vec![
            entry(1, "heading", "Getting Started", 40.0),
            entry(1, "list_item", "Install Rust", 80.0),
            entry(1, "list_item", "Clone the repo", 110.0),
        ])
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        streams.path().join("c1.style.json"),
        serde_json::to_string(&vec![style(1, 40.0, 24.0)]).unwrap(),
    )
    .unwrap();

    let schema = Arc::new(SchemaRegistry::from_json(SCHEMA).unwrap());
    let rules_path = state.path().join("rules.json");
    let mut rules = RuleRegistry::open(&rules_path, &schema).unwrap();
    seed_curated(&mut rules, &schema).unwrap();
    let registry = SharedRegistry::new(rules);
    let store = Arc::new(FileStateStore::new(state.path()));

    let orchestrator = Orchestrator::new(
        PipelineConfig::default(),
        Arc::clone(&schema),
        registry.clone(),
        Collaborators::from_source(Arc::new(JsonFixtureSource::new(streams.path()))),
        store.clone(),
    );
    let doc = orchestrator
        .run(DocumentJob::new(DOC, vec![ChapterUnit::new("c1", "Getting Started", 1, 3).approved()]))
        .await
        .unwrap();

    assert_eq!(doc.root.child_types(), vec!["heading", "bulletList"]);
    assert_eq!(doc.root.content[1].child_types(), vec!["listItem", "listItem"]);
    assert_eq!(doc.manifest.rewrapped.len(), 1);

    // one state file per transition, the latest one is combined
    let history = store.chapter_history(DOC, "c1").unwrap();
    assert_eq!(history.len(), 6);
    let latest = store.load_chapter(DOC, "c1").await.unwrap().unwrap();
    assert_eq!(latest.stage(), Stage::Combined);
    let combined = store.load_combined(DOC).await.unwrap().unwrap();
    assert_eq!(combined.document, doc);

    // usage tallies reach the saved registry
    registry.read().save(&rules_path).unwrap();
    let reloaded = RuleRegistry::load(&rules_path, &schema).unwrap();
    assert_eq!(reloaded.get("curated.list_item").unwrap().usage, 2);
}
