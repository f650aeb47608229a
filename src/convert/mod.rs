//! Converter: Content Units in reading order → one schema-valid segment tree.
//!
//! ## Why an explicit frame stack
//!
//! A `container` rule opens a frame whose content-expression automaton is
//! stepped with every following node. The first node the automaton refuses
//! closes the frame and becomes the container's next sibling. No other
//! lookahead or backtracking happens, so nesting is decided in one pass and
//! alternation or optional groups in the expression need no special cases.
//!
//! After assembly the whole tree goes through [`validate::repair`], which
//! rewraps, fills or lifts whatever the rules left out of grammar and records
//! each change in the [`ReviewManifest`].

pub mod build;
pub mod validate;

use crate::document::{Node, ReviewEntry, ReviewManifest, SegmentOutput};
use crate::error::{Diagnostic, DoctreeError};
use crate::oracle::{SynthesisOutcome, Synthesizer};
use crate::reconcile::ContentUnit;
use crate::rules::{ChildPolicy, MatchPolicy, Provenance, Rule, SharedRegistry};
use crate::schema::{MatchState, SchemaRegistry};
use build::{apply_action, default_node};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use validate::{check_strict, minimal_node, repair};

/// Converter settings, usually derived from [`crate::PipelineConfig`].
#[derive(Debug, Clone)]
pub struct ConverterOptions {
    pub match_policy: MatchPolicy,
    /// Node type for units no rule converts. Default: the schema's text container.
    pub fallback_node: Option<String>,
    /// Root type of each segment. Default: the schema's top node.
    pub segment_root: Option<String>,
    /// Already-converted nodes sent to the oracle as context (1 or 2).
    pub neighbor_context: usize,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self {
            match_policy: MatchPolicy::default(),
            fallback_node: None,
            segment_root: None,
            neighbor_context: 2,
        }
    }
}

/// Turns a chapter's Content Units into a segment tree.
#[derive(Clone)]
pub struct Converter {
    schema: Arc<SchemaRegistry>,
    registry: SharedRegistry,
    synthesizer: Option<Arc<Synthesizer>>,
    options: ConverterOptions,
    fallback: String,
    root: String,
}

/// An open node and the automaton state over its children so far.
struct Frame {
    node: Node,
    /// `None` once the children stopped matching (only possible at the root).
    state: Option<MatchState>,
    group: Option<String>,
}

/// A converted unit waiting to be placed.
struct Placed {
    node: Node,
    /// `Some(group)` when the node opens a container frame.
    opens: Option<Option<String>>,
}

impl Converter {
    pub fn new(
        schema: Arc<SchemaRegistry>,
        registry: SharedRegistry,
        synthesizer: Option<Arc<Synthesizer>>,
        options: ConverterOptions,
    ) -> Result<Self, DoctreeError> {
        let root = options
            .segment_root
            .clone()
            .unwrap_or_else(|| schema.top_node().to_string());
        match schema.node(&root) {
            Some(spec) if !spec.is_leaf() => {}
            Some(_) => {
                return Err(DoctreeError::InvalidConfig(format!(
                    "segment root '{root}' cannot hold children"
                )))
            }
            None => {
                return Err(DoctreeError::InvalidConfig(format!(
                    "segment root '{root}' is not defined by the schema"
                )))
            }
        }

        let fallback = match &options.fallback_node {
            Some(name) if schema.node(name).is_some_and(|n| n.is_constructible()) => name.clone(),
            Some(name) => {
                return Err(DoctreeError::InvalidConfig(format!(
                    "fallback node '{name}' is not a constructible node type"
                )))
            }
            None => schema
                .text_container()
                .map(str::to_string)
                .ok_or_else(|| {
                    DoctreeError::InvalidSchema(
                        "no node type can hold plain text; set a fallback node".to_string(),
                    )
                })?,
        };

        Ok(Self {
            schema,
            registry,
            synthesizer,
            options,
            fallback,
            root,
        })
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn synthesizer(&self) -> Option<&Arc<Synthesizer>> {
        self.synthesizer.as_ref()
    }

    /// Convert one chapter. Never fails: units without a usable rule become
    /// fallback nodes flagged for review, and grammar violations are repaired.
    pub async fn convert(&self, chapter_id: &str, units: &[ContentUnit]) -> SegmentOutput {
        let mut manifest = ReviewManifest::default();
        let mut usage: HashMap<String, u64> = HashMap::new();
        let mut recent: VecDeque<Node> = VecDeque::new();
        let neighbors = self.options.neighbor_context.clamp(1, 2);

        let root_matcher = self.schema.node(&self.root).map(|s| s.matcher().start());
        let mut stack = vec![Frame {
            node: Node::new(self.root.clone()),
            state: root_matcher,
            group: None,
        }];

        for unit in units {
            let context: Vec<Node> = recent.iter().cloned().collect();
            let placed = self.node_for(unit, &context, &mut manifest, &mut usage).await;

            recent.push_back(placed.node.clone());
            if recent.len() > neighbors {
                recent.pop_front();
            }
            self.place(&mut stack, placed);
        }

        let mut root = close_all(stack);
        validate::repair(&mut root, &self.schema, &mut manifest);
        for entry in &manifest.unresolved {
            manifest.diagnostics.push(Diagnostic::SchemaViolation {
                path: entry.path.clone(),
                node: entry.parent.clone(),
                detail: entry.detail.clone(),
            });
        }

        if !usage.is_empty() {
            self.registry.write().record_usage(&usage);
        }

        info!(
            "Chapter {}: {} unit(s) → {} node(s), {} repair(s), {} for review",
            chapter_id,
            units.len(),
            root.count(),
            manifest.repair_count(),
            manifest.needs_review.len()
        );

        SegmentOutput {
            chapter_id: chapter_id.to_string(),
            root,
            manifest,
        }
    }

    /// Find or synthesise a rule for `unit` and build its node.
    async fn node_for(
        &self,
        unit: &ContentUnit,
        neighbors: &[Node],
        manifest: &mut ReviewManifest,
        usage: &mut HashMap<String, u64>,
    ) -> Placed {
        let matched = self
            .registry
            .read()
            .find(unit, &self.options.match_policy)
            .cloned();

        let rule = match matched {
            Some(rule) => {
                debug!("{}: matched {}", unit.id, rule.id);
                rule
            }
            None => match self.synthesize(unit, neighbors, manifest).await {
                Ok(rule) => rule,
                Err(reason) => {
                    manifest.diagnostics.push(Diagnostic::RuleSynthesisFailure {
                        unit: unit.id.clone(),
                        reason: reason.clone(),
                    });
                    return self.fallback(unit, reason, manifest);
                }
            },
        };

        match apply_action(&rule.action, unit, &self.schema, Some(&rule.id)) {
            Ok(node) => {
                *usage.entry(rule.id.clone()).or_default() += 1;
                let opens = match &rule.action.policy {
                    ChildPolicy::Container { group, .. } if !rule.is_mark_rule(&self.schema) => {
                        Some(group.clone())
                    }
                    _ => None,
                };
                Placed { node, opens }
            }
            Err(e) => {
                warn!("{}: rule {} cannot build a node: {}", unit.id, rule.id, e);
                self.fallback(unit, format!("rule {} not applicable: {e}", rule.id), manifest)
            }
        }
    }

    async fn synthesize(
        &self,
        unit: &ContentUnit,
        neighbors: &[Node],
        manifest: &mut ReviewManifest,
    ) -> Result<Rule, String> {
        let Some(synth) = &self.synthesizer else {
            return Err("no rule matched and no oracle is configured".to_string());
        };
        match synth
            .resolve(unit, neighbors, &self.schema, &self.registry)
            .await
        {
            SynthesisOutcome::Accepted { rule, conflict } => {
                match conflict {
                    Some(d) => manifest.diagnostics.push(d),
                    None if rule.provenance == Provenance::Synthesized
                        && !manifest.synthesized_rules.contains(&rule.id) =>
                    {
                        manifest.synthesized_rules.push(rule.id.clone());
                    }
                    None => {}
                }
                Ok(rule)
            }
            SynthesisOutcome::Rejected { reason } => Err(reason),
        }
    }

    fn fallback(&self, unit: &ContentUnit, reason: String, manifest: &mut ReviewManifest) -> Placed {
        manifest.needs_review.push(ReviewEntry {
            unit: unit.id.clone(),
            reading_order: unit.reading_order,
            reason,
        });
        Placed {
            node: default_node(&self.fallback, unit, &self.schema),
            opens: None,
        }
    }

    /// Put a node into the innermost frame that permits it, closing frames
    /// that do not. The root frame takes anything.
    fn place(&self, stack: &mut Vec<Frame>, placed: Placed) {
        let kind = placed.node.kind.clone();
        while stack.len() > 1 {
            let Some(top) = stack.last() else { break };
            if self.permits(top, &kind).is_some() {
                break;
            }
            close_top(stack);
        }

        let Some(top) = stack.last_mut() else { return };
        top.state = top.state.as_ref().and_then(|s| {
            self.schema
                .node(&top.node.kind)
                .and_then(|spec| spec.matcher().step(s, &kind))
        });

        match placed.opens {
            Some(group) => {
                let state = self.schema.node(&kind).and_then(|spec| {
                    let m = spec.matcher();
                    placed
                        .node
                        .content
                        .iter()
                        .try_fold(m.start(), |s, c| m.step(&s, &c.kind))
                });
                stack.push(Frame {
                    node: placed.node,
                    state,
                    group,
                });
            }
            None => top.node.content.push(placed.node),
        }
    }

    fn permits(&self, frame: &Frame, kind: &str) -> Option<MatchState> {
        if let Some(group) = &frame.group {
            if !self.schema.in_group(kind, group) {
                return None;
            }
        }
        let state = frame.state.as_ref()?;
        self.schema
            .node(&frame.node.kind)?
            .matcher()
            .step(state, kind)
    }
}

fn close_top(stack: &mut Vec<Frame>) {
    if let Some(frame) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            parent.node.content.push(frame.node);
        }
    }
}

fn close_all(mut stack: Vec<Frame>) -> Node {
    while stack.len() > 1 {
        close_top(&mut stack);
    }
    stack
        .pop()
        .map(|f| f.node)
        .unwrap_or_else(|| Node::new("doc"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{OracleError, ProposalRequest, RuleOracle, RuleProposal};
    use crate::reconcile::{BBox, ContentEntry};
    use crate::rules::{seed_curated, Action, Predicate, RuleRegistry};
    use crate::schema::tests::fixture;
    use async_trait::async_trait;
    use std::time::Duration;

    fn units(kinds: &[(&str, &str)]) -> Vec<ContentUnit> {
        kinds
            .iter()
            .enumerate()
            .map(|(i, (kind, text))| {
                ContentUnit::from_entry(
                    "c",
                    i,
                    ContentEntry {
                        page: 1,
                        kind: kind.to_string(),
                        text: text.to_string(),
                        media_ref: None,
                        bbox: BBox::new(0.0, i as f64 * 10.0, 100.0, i as f64 * 10.0 + 9.0),
                        level: None,
                        rows: None,
                        containers: Vec::new(),
                    },
                )
            })
            .collect()
    }

    fn registry_with(extra: Vec<Rule>) -> SharedRegistry {
        let schema = fixture();
        let mut reg = RuleRegistry::new();
        seed_curated(&mut reg, &schema).unwrap();
        for rule in extra {
            reg.add(rule, &schema).unwrap();
        }
        SharedRegistry::new(reg)
    }

    fn converter(registry: SharedRegistry, synth: Option<Arc<Synthesizer>>) -> Converter {
        Converter::new(Arc::new(fixture()), registry, synth, ConverterOptions::default()).unwrap()
    }

    struct Proposes(&'static str);

    #[async_trait]
    impl RuleOracle for Proposes {
        async fn propose(&self, request: &ProposalRequest) -> Result<RuleProposal, OracleError> {
            Ok(RuleProposal {
                description: "scripted".into(),
                predicate: Predicate::kind(request.unit.kind.clone()),
                action: Action::node(self.0),
            })
        }
    }

    fn synth(target: &'static str) -> Arc<Synthesizer> {
        Arc::new(Synthesizer::new(Arc::new(Proposes(target)), Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn container_takes_following_units_until_refused() {
        let callout = Rule::curated(
            "test.callout",
            "callouts",
            Predicate::kind("callout"),
            Action::node("callout").with_policy(ChildPolicy::Container {
                lead: None,
                group: None,
            }),
        );
        let note = Rule::curated("test.note", "notes", Predicate::kind("note"), Action::node("note"));
        let conv = converter(registry_with(vec![callout, note]), None);

        let input = units(&[
            ("callout", ""),
            ("text", "lead"),
            ("note", "one"),
            ("note", "two"),
            ("heading", "Next"),
        ]);
        let out = conv.convert("c", &input).await;

        assert_eq!(out.root.child_types(), vec!["callout", "heading"]);
        assert_eq!(
            out.root.content[0].child_types(),
            vec!["paragraph", "note", "note"]
        );
        assert_eq!(out.manifest.repair_count(), 0);
        assert!(out.manifest.is_clean());
        assert!(check_strict(&out.root, &fixture()).is_ok());
    }

    #[tokio::test]
    async fn reading_order_is_preserved() {
        let conv = converter(registry_with(vec![]), None);
        let out = conv
            .convert("c", &units(&[("heading", "Title"), ("text", "Body")]))
            .await;
        assert_eq!(out.root.child_types(), vec!["heading", "paragraph"]);
        assert_eq!(out.root.content[0].attrs["level"], 1);
        assert_eq!(out.root.text_content(), "TitleBody");
    }

    #[tokio::test]
    async fn list_items_are_repaired_into_a_list() {
        let conv = converter(registry_with(vec![]), None);
        let out = conv
            .convert(
                "c",
                &units(&[("list_item", "a"), ("list_item", "b"), ("text", "after")]),
            )
            .await;
        assert_eq!(out.root.child_types(), vec!["bulletList", "paragraph"]);
        assert_eq!(out.root.content[0].child_types(), vec!["listItem", "listItem"]);
        assert_eq!(out.manifest.rewrapped.len(), 1);
        assert!(check_strict(&out.root, &fixture()).is_ok());
    }

    #[tokio::test]
    async fn unknown_proposal_target_falls_back_with_review_flag() {
        let conv = converter(registry_with(vec![]), Some(synth("sidebar")));
        let out = conv.convert("c", &units(&[("aside", "boxed text")])).await;

        let node = &out.root.content[0];
        assert_eq!(node.kind, "paragraph");
        assert!(node.needs_review());
        assert_eq!(node.text_content(), "boxed text");
        assert_eq!(out.manifest.needs_review.len(), 1);
        assert_eq!(out.manifest.needs_review[0].unit, "c:u0");
        assert!(out
            .manifest
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::RuleSynthesisFailure { .. })));
    }

    #[tokio::test]
    async fn no_oracle_falls_back() {
        let conv = converter(registry_with(vec![]), None);
        let out = conv.convert("c", &units(&[("aside", "x")])).await;
        assert!(out.root.content[0].needs_review());
        assert!(!out.manifest.is_clean());
    }

    #[tokio::test]
    async fn synthesised_rule_is_reused_for_similar_units() {
        let registry = registry_with(vec![]);
        let synth = synth("blockquote");
        let conv = converter(registry.clone(), Some(Arc::clone(&synth)));
        let out = conv
            .convert("c", &units(&[("quote", "first"), ("quote", "second")]))
            .await;

        assert_eq!(out.root.child_types(), vec!["blockquote", "blockquote"]);
        assert_eq!(synth.calls(), 1);
        assert_eq!(out.manifest.synthesized_rules.len(), 1);
        let id = &out.manifest.synthesized_rules[0];
        // second unit matched the committed rule directly
        assert_eq!(registry.read().get(id).map(|r| r.usage), Some(2));
    }

    #[tokio::test]
    async fn usage_is_recorded() {
        let registry = registry_with(vec![]);
        let conv = converter(registry.clone(), None);
        conv.convert("c", &units(&[("text", "a"), ("text", "b"), ("heading", "h")]))
            .await;
        let reg = registry.read();
        assert_eq!(reg.get("curated.text").map(|r| r.usage), Some(2));
        assert_eq!(reg.get("curated.heading").map(|r| r.usage), Some(1));
    }

    #[tokio::test]
    async fn conversion_is_idempotent() {
        let conv = converter(registry_with(vec![]), None);
        let input = units(&[
            ("heading", "H"),
            ("list_item", "a"),
            ("text", "t"),
            ("aside", "?"),
        ]);
        let a = conv.convert("c", &input).await;
        let b = conv.convert("c", &input).await;
        assert_eq!(a.root, b.root);
        assert_eq!(a.manifest.needs_review, b.manifest.needs_review);
    }

    #[test]
    fn rejects_bad_options() {
        let schema = Arc::new(fixture());
        let reg = SharedRegistry::new(RuleRegistry::new());
        let leaf_root = ConverterOptions {
            segment_root: Some("horizontalRule".into()),
            ..Default::default()
        };
        assert!(Converter::new(Arc::clone(&schema), reg.clone(), None, leaf_root).is_err());
        let bad_fallback = ConverterOptions {
            fallback_node: Some("image".into()),
            ..Default::default()
        };
        assert!(Converter::new(schema, reg, None, bad_fallback).is_err());
    }
}
