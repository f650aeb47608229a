//! Schema Registry: the target document grammar, loaded from a descriptor.
//!
//! The descriptor is the same JSON shape a Tiptap/ProseMirror editor is
//! configured with:
//!
//! ```json
//! {
//!   "topNode": "doc",
//!   "nodes": {
//!     "doc":       { "content": "block+" },
//!     "paragraph": { "group": "block", "content": "inline*" },
//!     "heading":   { "group": "block", "content": "inline*", "defining": true,
//!                    "attrs": { "level": { "default": 1 } } },
//!     "text":      { "group": "inline", "inline": true }
//!   },
//!   "marks": { "bold": {} }
//! }
//! ```
//!
//! ## Why descriptor order matters
//!
//! Whenever the converter has to pick a node type on its own (a wrapper to
//! repair a run, a filler for a missing child, a default for an unmatched
//! unit) it takes the first candidate in descriptor order. Object order is
//! preserved while parsing, so the same descriptor always yields the same
//! choices.

pub mod expr;

use crate::error::DoctreeError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub use expr::{ContentMatcher, MatchState};

/// Which marks a node permits on its inline children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkSet {
    All,
    None,
    Only(Vec<String>),
}

impl MarkSet {
    pub fn allows(&self, mark: &str) -> bool {
        match self {
            MarkSet::All => true,
            MarkSet::None => false,
            MarkSet::Only(list) => list.iter().any(|m| m == mark),
        }
    }
}

/// Declaration of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrSpec {
    /// `None` means the attribute is required. A declared default of `null`
    /// is `Some(Value::Null)`.
    pub default: Option<Value>,
}

impl AttrSpec {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// A node type of the schema.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    name: String,
    groups: Vec<String>,
    matcher: ContentMatcher,
    marks: MarkSet,
    attrs: Vec<(String, AttrSpec)>,
    defining: bool,
    inline: bool,
}

impl NodeSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn content(&self) -> &str {
        self.matcher.source()
    }

    pub fn matcher(&self) -> &ContentMatcher {
        &self.matcher
    }

    pub fn is_leaf(&self) -> bool {
        self.matcher.is_leaf()
    }

    pub fn is_defining(&self) -> bool {
        self.defining
    }

    pub fn is_inline(&self) -> bool {
        self.inline
    }

    pub fn marks(&self) -> &MarkSet {
        &self.marks
    }

    pub fn allows_mark(&self, mark: &str) -> bool {
        self.marks.allows(mark)
    }

    /// True when `text` may appear among this node's children.
    pub fn accepts_text(&self) -> bool {
        self.matcher.mentions("text")
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &AttrSpec)> {
        self.attrs.iter().map(|(n, a)| (n.as_str(), a))
    }

    pub fn attr(&self, name: &str) -> Option<&AttrSpec> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    pub fn required_attrs(&self) -> impl Iterator<Item = &str> {
        self.attrs
            .iter()
            .filter(|(_, a)| a.is_required())
            .map(|(n, _)| n.as_str())
    }

    /// A node of this type can be built with no caller-supplied attributes.
    pub fn is_constructible(&self) -> bool {
        self.attrs.iter().all(|(_, a)| !a.is_required())
    }

    /// Declared defaults, keyed by attribute name.
    pub fn default_attrs(&self) -> BTreeMap<String, Value> {
        self.attrs
            .iter()
            .filter_map(|(n, a)| a.default.clone().map(|v| (n.clone(), v)))
            .collect()
    }
}

/// A mark type of the schema.
#[derive(Debug, Clone)]
pub struct MarkSpec {
    name: String,
    attrs: Vec<(String, AttrSpec)>,
}

impl MarkSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &AttrSpec)> {
        self.attrs.iter().map(|(n, a)| (n.as_str(), a))
    }
}

/// Compact description of one type, sent to the rule-proposal oracle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeSummary {
    pub name: String,
    /// `"node"` or `"mark"`.
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_attrs: Vec<String>,
}

/// The loaded, compiled schema. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    top: String,
    nodes: Vec<NodeSpec>,
    marks: Vec<MarkSpec>,
}

impl SchemaRegistry {
    /// Read and compile a descriptor file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DoctreeError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| DoctreeError::SchemaRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let schema = Self::from_json(&raw)?;
        debug!(
            "Loaded schema from {}: {} node types, {} marks",
            path.display(),
            schema.nodes.len(),
            schema.marks.len()
        );
        Ok(schema)
    }

    /// Compile a descriptor from its JSON text.
    pub fn from_json(raw: &str) -> Result<Self, DoctreeError> {
        let root: Value =
            serde_json::from_str(raw).map_err(|e| DoctreeError::SchemaParse(e.to_string()))?;
        let root = root
            .as_object()
            .ok_or_else(|| DoctreeError::SchemaParse("descriptor must be an object".into()))?;

        let node_defs = root
            .get("nodes")
            .and_then(Value::as_object)
            .ok_or_else(|| DoctreeError::SchemaParse("missing \"nodes\" object".into()))?;
        if node_defs.is_empty() {
            return Err(DoctreeError::InvalidSchema("no node types declared".into()));
        }
        if !node_defs.contains_key("text") {
            return Err(DoctreeError::InvalidSchema(
                "a \"text\" node type is required".into(),
            ));
        }

        let empty = Map::new();
        let mark_defs = match root.get("marks") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(m)) => m,
            Some(_) => return Err(DoctreeError::SchemaParse("\"marks\" must be an object".into())),
        };

        // Pass 1: names and group membership, in descriptor order.
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for (name, def) in node_defs {
            let def = def.as_object().ok_or_else(|| {
                DoctreeError::SchemaParse(format!("node '{name}' must be an object"))
            })?;
            for g in split_list(def.get("group")) {
                match groups.iter_mut().find(|(n, _)| *n == g) {
                    Some((_, members)) => members.push(name.clone()),
                    None => groups.push((g, vec![name.clone()])),
                }
            }
        }

        let resolve = |n: &str| -> Option<Vec<String>> {
            if node_defs.contains_key(n) {
                Some(vec![n.to_string()])
            } else {
                groups.iter().find(|(g, _)| g == n).map(|(_, m)| m.clone())
            }
        };

        let mut marks = Vec::with_capacity(mark_defs.len());
        for (name, def) in mark_defs {
            marks.push(MarkSpec {
                name: name.clone(),
                attrs: parse_attrs(name, def.get("attrs"))?,
            });
        }

        // Pass 2: compile.
        let mut nodes = Vec::with_capacity(node_defs.len());
        for (name, def) in node_defs {
            let content = def.get("content").and_then(Value::as_str).unwrap_or("");
            let matcher = ContentMatcher::compile(content, resolve).map_err(|detail| {
                DoctreeError::InvalidExpression {
                    node: name.clone(),
                    expr: content.to_string(),
                    detail,
                }
            })?;
            let node_marks = match def.get("marks").and_then(Value::as_str) {
                Some("_") => MarkSet::All,
                Some(s) if s.trim().is_empty() => MarkSet::None,
                Some(s) => {
                    let list: Vec<String> = s.split_whitespace().map(str::to_string).collect();
                    for m in &list {
                        if !mark_defs.contains_key(m) {
                            return Err(DoctreeError::InvalidSchema(format!(
                                "node '{name}' allows unknown mark '{m}'"
                            )));
                        }
                    }
                    MarkSet::Only(list)
                }
                None if matcher.mentions("text") => MarkSet::All,
                None => MarkSet::None,
            };
            nodes.push(NodeSpec {
                name: name.clone(),
                groups: split_list(def.get("group")),
                matcher,
                marks: node_marks,
                attrs: parse_attrs(name, def.get("attrs"))?,
                defining: def.get("defining").and_then(Value::as_bool).unwrap_or(false),
                inline: def.get("inline").and_then(Value::as_bool).unwrap_or(false),
            });
        }

        let top = match root.get("topNode").and_then(Value::as_str) {
            Some(t) if node_defs.contains_key(t) => t.to_string(),
            Some(t) => {
                return Err(DoctreeError::InvalidSchema(format!(
                    "topNode '{t}' is not a declared node type"
                )))
            }
            None if node_defs.contains_key("doc") => "doc".to_string(),
            None => nodes[0].name.clone(),
        };

        let schema = Self { top, nodes, marks };
        if schema.node(&schema.top).is_some_and(NodeSpec::is_leaf) {
            return Err(DoctreeError::InvalidSchema(format!(
                "top node '{}' cannot have content",
                schema.top
            )));
        }
        Ok(schema)
    }

    pub fn top_node(&self) -> &str {
        &self.top
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn mark(&self, name: &str) -> Option<&MarkSpec> {
        self.marks.iter().find(|m| m.name == name)
    }

    /// True if `name` is a node or mark type.
    pub fn has_type(&self, name: &str) -> bool {
        self.node(name).is_some() || self.mark(name).is_some()
    }

    /// Node types in descriptor order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter()
    }

    pub fn marks(&self) -> impl Iterator<Item = &MarkSpec> {
        self.marks.iter()
    }

    /// Members of `group`, in descriptor order.
    pub fn group_members(&self, group: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.groups.iter().any(|g| g == group))
            .map(|n| n.name.as_str())
            .collect()
    }

    pub fn in_group(&self, node: &str, group: &str) -> bool {
        self.node(node)
            .is_some_and(|n| n.groups.iter().any(|g| g == group))
    }

    /// The node used to hold bare text when nothing better is known: the
    /// first non-inline, non-top node that accepts `text` and needs no
    /// attributes.
    pub fn text_container(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| {
                n.name != self.top && !n.inline && n.accepts_text() && n.is_constructible()
            })
            .map(|n| n.name.as_str())
    }

    /// Summaries of every node and mark type, in descriptor order.
    pub fn summaries(&self) -> Vec<TypeSummary> {
        let nodes = self.nodes.iter().map(|n| TypeSummary {
            name: n.name.clone(),
            kind: "node",
            groups: n.groups.clone(),
            content: (!n.is_leaf()).then(|| n.content().to_string()),
            attrs: n.attrs.iter().map(|(a, _)| a.clone()).collect(),
            required_attrs: n.required_attrs().map(str::to_string).collect(),
        });
        let marks = self.marks.iter().map(|m| TypeSummary {
            name: m.name.clone(),
            kind: "mark",
            groups: Vec::new(),
            content: None,
            attrs: m.attrs.iter().map(|(a, _)| a.clone()).collect(),
            required_attrs: m
                .attrs
                .iter()
                .filter(|(_, a)| a.is_required())
                .map(|(a, _)| a.clone())
                .collect(),
        });
        nodes.chain(marks).collect()
    }
}

fn split_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_str)
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_attrs(owner: &str, v: Option<&Value>) -> Result<Vec<(String, AttrSpec)>, DoctreeError> {
    let Some(v) = v else {
        return Ok(Vec::new());
    };
    let obj = v.as_object().ok_or_else(|| {
        DoctreeError::SchemaParse(format!("attrs of '{owner}' must be an object"))
    })?;
    Ok(obj
        .iter()
        .map(|(name, spec)| {
            // `{"default": null}` declares a default; only a missing key makes the attr required.
            let default = spec.as_object().and_then(|o| o.get("default")).cloned();
            (name.clone(), AttrSpec { default })
        })
        .collect())
}
