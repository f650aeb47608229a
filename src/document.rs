//! Output document trees and their review manifests.
//!
//! Trees serialise to the Tiptap/ProseMirror JSON shape (`type`, `attrs`,
//! `content`, `marks`, `text`). Provenance lives under a separate `meta` key
//! that editors ignore; strip it with [`Node::without_meta`] before handing a
//! tree to a client that rejects unknown keys.

use crate::error::{ChapterError, Diagnostic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A mark applied to a text node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
}

impl Mark {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attrs: BTreeMap::new(),
        }
    }
}

/// Provenance and review flags attached to a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Content Unit the node was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_unit: Option<String>,
    /// Chapter the node belongs to (set when chapters are combined).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    /// Rule that produced the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub needs_review: bool,
    /// Node was inserted by grammar repair rather than by a rule.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub repaired: bool,
}

/// One node of an output tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NodeMeta>,
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attrs: BTreeMap::new(),
            content: Vec::new(),
            marks: Vec::new(),
            text: None,
            meta: None,
        }
    }

    /// A `text` node.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            text: Some(value.into()),
            ..Self::new("text")
        }
    }

    pub fn with_attrs(mut self, attrs: BTreeMap<String, Value>) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_content(mut self, content: Vec<Node>) -> Self {
        self.content = content;
        self
    }

    pub fn with_mark(mut self, mark: Mark) -> Self {
        self.marks.push(mark);
        self
    }

    pub fn is_text(&self) -> bool {
        self.kind == "text"
    }

    pub fn child_types(&self) -> Vec<&str> {
        self.content.iter().map(|c| c.kind.as_str()).collect()
    }

    pub fn meta_mut(&mut self) -> &mut NodeMeta {
        self.meta.get_or_insert_with(NodeMeta::default)
    }

    pub fn needs_review(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.needs_review)
    }

    /// The node reached by following child indices from `self`.
    pub fn at(&self, path: &[usize]) -> Option<&Node> {
        path.iter().try_fold(self, |n, &i| n.content.get(i))
    }

    pub fn at_mut(&mut self, path: &[usize]) -> Option<&mut Node> {
        path.iter().try_fold(self, |n, &i| n.content.get_mut(i))
    }

    /// Id of the Content Unit this node was built from.
    pub fn source_unit(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.source_unit.as_deref())
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(t) = &self.text {
            out.push_str(t);
        }
        for c in &self.content {
            c.collect_text(out);
        }
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.content.iter().map(Node::count).sum::<usize>()
    }

    /// Pre-order visit of every node in the subtree.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Node)) {
        f(self);
        for c in &self.content {
            c.walk(f);
        }
    }

    /// A copy of the subtree with every `meta` entry removed.
    pub fn without_meta(&self) -> Node {
        Node {
            meta: None,
            content: self.content.iter().map(Node::without_meta).collect(),
            ..self.clone()
        }
    }
}

/// A unit that was converted without a confident rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub unit: String,
    pub reading_order: usize,
    pub reason: String,
}

/// One structural repair made to satisfy the grammar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairEntry {
    /// Child-index path of the repaired parent, from the segment root.
    pub path: Vec<usize>,
    /// Type of the repaired parent.
    pub parent: String,
    /// Types involved: the wrapper, the filled children, or the stripped marks.
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Everything a reviewer needs to audit a converted segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewManifest {
    #[serde(default)]
    pub needs_review: Vec<ReviewEntry>,
    /// Runs of children moved into a new wrapper node.
    #[serde(default)]
    pub rewrapped: Vec<RepairEntry>,
    /// Minimal children inserted to complete a content expression.
    #[serde(default)]
    pub filled: Vec<RepairEntry>,
    /// Nodes replaced by their own children because nothing could hold them.
    #[serde(default)]
    pub lifted: Vec<RepairEntry>,
    #[serde(default)]
    pub stripped_marks: Vec<RepairEntry>,
    /// Violations no repair step could fix.
    #[serde(default)]
    pub unresolved: Vec<RepairEntry>,
    /// Images from the style stream placed into the tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inserted_images: Vec<RepairEntry>,
    /// Headings whose level was changed to match their typography.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relevelled: Vec<RepairEntry>,
    /// Ids of rules synthesised and committed while converting.
    #[serde(default)]
    pub synthesized_rules: Vec<String>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl ReviewManifest {
    pub fn is_clean(&self) -> bool {
        self.needs_review.is_empty() && self.unresolved.is_empty()
    }

    pub fn repair_count(&self) -> usize {
        self.rewrapped.len() + self.filled.len() + self.lifted.len() + self.stripped_marks.len()
    }

    /// Append `other`, prefixing its repair paths with `prefix`.
    pub fn absorb(&mut self, other: ReviewManifest, prefix: &[usize]) {
        let shift = |mut e: RepairEntry| {
            let mut path = prefix.to_vec();
            path.append(&mut e.path);
            e.path = path;
            e
        };
        self.needs_review.extend(other.needs_review);
        self.rewrapped.extend(other.rewrapped.into_iter().map(shift));
        self.filled.extend(other.filled.into_iter().map(shift));
        self.lifted.extend(other.lifted.into_iter().map(shift));
        self.stripped_marks
            .extend(other.stripped_marks.into_iter().map(shift));
        self.unresolved.extend(other.unresolved.into_iter().map(shift));
        self.inserted_images
            .extend(other.inserted_images.into_iter().map(shift));
        self.relevelled.extend(other.relevelled.into_iter().map(shift));
        self.synthesized_rules.extend(other.synthesized_rules);
        self.diagnostics.extend(other.diagnostics);
    }

    /// Append the manifest of a segment whose root children were spliced
    /// into a parent starting at child index `offset`.
    pub fn absorb_spliced(&mut self, mut other: ReviewManifest, offset: usize) {
        other.shift_paths(0, offset);
        self.absorb(other, &[]);
    }

    /// Add `by` to the first path index of every repair entry whose first
    /// index is at least `from`, after root children were inserted there.
    pub fn shift_paths(&mut self, from: usize, by: usize) {
        for entry in self.repair_entries_mut() {
            if let Some(first) = entry.path.first_mut() {
                if *first >= from {
                    *first += by;
                }
            }
        }
    }

    fn repair_entries_mut(&mut self) -> impl Iterator<Item = &mut RepairEntry> {
        self.rewrapped
            .iter_mut()
            .chain(self.filled.iter_mut())
            .chain(self.lifted.iter_mut())
            .chain(self.stripped_marks.iter_mut())
            .chain(self.unresolved.iter_mut())
            .chain(self.inserted_images.iter_mut())
            .chain(self.relevelled.iter_mut())
    }
}

/// A converted chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentOutput {
    pub chapter_id: String,
    pub root: Node,
    pub manifest: ReviewManifest,
}

/// A chapter that did not reach `combined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterFailure {
    pub chapter: String,
    pub error: ChapterError,
}

/// The document assembled from every approved chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedDocument {
    pub document_id: String,
    pub root: Node,
    pub manifest: ReviewManifest,
    /// Chapters included, in document order.
    pub chapters: Vec<String>,
    #[serde(default)]
    pub failed: Vec<ChapterFailure>,
}
