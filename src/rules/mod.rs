//! Conversion rules: a predicate over Content Unit attributes and an action
//! that builds schema nodes from a matching unit.
//!
//! Rules are immutable once committed. A correction is a new, more specific
//! (or newer) rule that shadows the old one; only the usage counter changes
//! after commit.

pub mod curated;
pub mod registry;

use crate::reconcile::ContentUnit;
use crate::schema::SchemaRegistry;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub use curated::{curated_rules, seed_curated};
pub use registry::{AddOutcome, MatchPolicy, RuleRegistry, SharedRegistry};

// ── Predicate ────────────────────────────────────────────────────────────

/// A regular expression over a unit's text, compiled on first use.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextPattern {
    source: String,
    #[serde(skip)]
    compiled: OnceCell<Option<Regex>>,
}

impl TextPattern {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            compiled: OnceCell::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| Regex::new(&self.source).ok())
            .as_ref()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex().is_some_and(|r| r.is_match(text))
    }

    pub fn check(&self) -> Result<(), String> {
        Regex::new(&self.source)
            .map(|_| ())
            .map_err(|e| format!("text_pattern '{}': {e}", self.source))
    }
}

impl PartialEq for TextPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for TextPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.source)
    }
}

/// Inclusive font-size bounds; an absent bound is a wildcard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl SizeRange {
    pub fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn is_any(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, size: f64) -> bool {
        self.min.map_or(true, |m| size >= m) && self.max.map_or(true, |m| size <= m)
    }
}

/// Conditions over a Content Unit. Every `None` field is a wildcard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Coarse type hint from the content stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_pattern: Option<TextPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(default, skip_serializing_if = "SizeRange::is_any")]
    pub size: SizeRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Container context: the unit's container hints must include this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
}

impl Predicate {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Number of concrete (non-wildcard) fields.
    pub fn specificity(&self) -> u32 {
        [
            self.kind.is_some(),
            self.text_pattern.is_some(),
            self.font.is_some(),
            !self.size.is_any(),
            self.color.is_some(),
            self.within.is_some(),
        ]
        .into_iter()
        .filter(|b| *b)
        .count() as u32
    }

    /// Canonical form used to detect duplicate rules. Two predicates with the
    /// same signature match exactly the same units.
    pub fn signature(&self) -> String {
        fn field(v: Option<&str>) -> String {
            v.map_or_else(|| "*".to_string(), str::to_string)
        }
        fn bound(v: Option<f64>) -> String {
            v.map_or_else(|| "*".to_string(), |x| format!("{x}"))
        }
        format!(
            "kind={};text={};font={};size={}..{};color={};within={}",
            field(self.kind.as_deref()),
            field(self.text_pattern.as_ref().map(TextPattern::as_str)),
            field(self.font.as_deref().map(str::to_ascii_lowercase).as_deref()),
            bound(self.size.min),
            bound(self.size.max),
            field(self.color.as_deref().map(str::to_ascii_lowercase).as_deref()),
            field(self.within.as_deref()),
        )
    }

    pub fn matches(&self, unit: &ContentUnit) -> bool {
        if let Some(kind) = &self.kind {
            if *kind != unit.kind {
                return false;
            }
        }
        if let Some(pattern) = &self.text_pattern {
            if !pattern.is_match(&unit.text) {
                return false;
            }
        }
        if let Some(font) = &self.font {
            match &unit.font {
                Some(f) if f.eq_ignore_ascii_case(font) => {}
                _ => return false,
            }
        }
        if !self.size.is_any() {
            match unit.size {
                Some(s) if self.size.contains(s) => {}
                _ => return false,
            }
        }
        if let Some(color) = &self.color {
            match &unit.color {
                Some(c) if c.eq_ignore_ascii_case(color) => {}
                _ => return false,
            }
        }
        if let Some(within) = &self.within {
            if !unit.containers.iter().any(|c| c == within) {
                return false;
            }
        }
        true
    }

    /// Check that the predicate can be evaluated.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(p) = &self.text_pattern {
            p.check()?;
        }
        if let (Some(min), Some(max)) = (self.size.min, self.size.max) {
            if min > max {
                return Err(format!("size range {min}..{max} is inverted"));
            }
        }
        for (name, v) in [
            ("kind", &self.kind),
            ("font", &self.font),
            ("color", &self.color),
            ("within", &self.within),
        ] {
            if v.as_deref().is_some_and(|s| s.trim().is_empty()) {
                return Err(format!("{name} is present but empty"));
            }
        }
        Ok(())
    }
}

// ── Action ───────────────────────────────────────────────────────────────

/// Where an output attribute's value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum AttrSource {
    Const { value: Value },
    Level,
    Text,
    MediaRef,
    Font,
    FontSize,
    Color,
}

impl AttrSource {
    /// Resolve against a unit; `None` when the unit lacks the attribute.
    pub fn resolve(&self, unit: &ContentUnit) -> Option<Value> {
        match self {
            AttrSource::Const { value } => Some(value.clone()),
            AttrSource::Level => unit.level.map(Value::from),
            AttrSource::Text => Some(Value::from(unit.text.clone())),
            AttrSource::MediaRef => unit.media_ref.clone().map(Value::from),
            AttrSource::Font => unit.font.clone().map(Value::from),
            AttrSource::FontSize => unit.size.map(Value::from),
            AttrSource::Color => unit.color.clone().map(Value::from),
        }
    }
}

/// How the produced node takes children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChildPolicy {
    /// The unit's text becomes the node's only content.
    #[default]
    Atomic,
    /// The unit's text is placed inside an `inner` node, e.g. `blockquote > paragraph`.
    Wrap { inner: String },
    /// Opens a frame that accepts following units while the content
    /// expression permits them. `lead` receives the unit's own text;
    /// `group` further restricts which types may join the frame.
    Container {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lead: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
    /// Builds `target > row > cell > inner` from the unit's table rows.
    Grid {
        row: String,
        cell: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inner: Option<String>,
    },
}

/// What a rule produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Output node or mark type.
    pub target: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, AttrSource>,
    #[serde(default)]
    pub policy: ChildPolicy,
    /// Marks applied to the produced text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<String>,
}

impl Action {
    pub fn node(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attrs: BTreeMap::new(),
            policy: ChildPolicy::Atomic,
            marks: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, source: AttrSource) -> Self {
        self.attrs.insert(name.into(), source);
        self
    }

    pub fn with_policy(mut self, policy: ChildPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Every node or mark type the action names.
    pub fn referenced_types(&self) -> Vec<&str> {
        let mut out = vec![self.target.as_str()];
        match &self.policy {
            ChildPolicy::Atomic => {}
            ChildPolicy::Wrap { inner } => out.push(inner),
            ChildPolicy::Container { lead, .. } => out.extend(lead.as_deref()),
            ChildPolicy::Grid { row, cell, inner } => {
                out.push(row);
                out.push(cell);
                out.extend(inner.as_deref());
            }
        }
        out.extend(self.marks.iter().map(String::as_str));
        out
    }

    /// The first referenced type the schema does not define.
    pub fn unknown_type<'a>(&'a self, schema: &SchemaRegistry) -> Option<&'a str> {
        self.referenced_types()
            .into_iter()
            .find(|t| !schema.has_type(t))
    }

    /// Structural checks beyond type existence.
    pub fn check(&self, schema: &SchemaRegistry) -> Result<(), String> {
        let declared = |name: &str| match schema.node(&self.target) {
            Some(n) => n.attr(name).is_some(),
            None => schema
                .mark(&self.target)
                .is_some_and(|m| m.attrs().any(|(a, _)| a == name)),
        };
        if let Some(name) = self.attrs.keys().find(|k| !declared(k)) {
            return Err(format!("'{}' declares no attribute '{name}'", self.target));
        }
        for mark in &self.marks {
            if schema.mark(mark).is_none() {
                return Err(format!("'{mark}' is not a mark type"));
            }
        }
        if schema.mark(&self.target).is_some() && self.policy != ChildPolicy::Atomic {
            return Err(format!(
                "mark target '{}' only supports the atomic policy",
                self.target
            ));
        }
        if let ChildPolicy::Container {
            group: Some(group), ..
        } = &self.policy
        {
            if schema.group_members(group).is_empty() && schema.node(group).is_none() {
                return Err(format!("container group '{group}' is not defined"));
            }
        }
        Ok(())
    }
}

// ── Rule ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Curated,
    Synthesized,
}

/// A committed predicate → action mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub provenance: Provenance,
    pub predicate: Predicate,
    pub action: Action,
    #[serde(default)]
    pub usage: u64,
}

impl Rule {
    pub fn curated(
        id: impl Into<String>,
        description: impl Into<String>,
        predicate: Predicate,
        action: Action,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            created_at: Utc::now(),
            provenance: Provenance::Curated,
            predicate,
            action,
            usage: 0,
        }
    }

    /// A rule accepted from the oracle, with a fresh v4 id.
    pub fn synthesized(description: impl Into<String>, predicate: Predicate, action: Action) -> Self {
        Self {
            id: format!("syn-{}", uuid::Uuid::new_v4()),
            description: description.into(),
            created_at: Utc::now(),
            provenance: Provenance::Synthesized,
            predicate,
            action,
            usage: 0,
        }
    }

    pub fn specificity(&self) -> u32 {
        self.predicate.specificity()
    }

    pub fn is_mark_rule(&self, schema: &SchemaRegistry) -> bool {
        schema.mark(&self.action.target).is_some()
    }
}
