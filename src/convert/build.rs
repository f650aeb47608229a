//! Node construction: applying a rule's action to one Content Unit.

use crate::document::{Mark, Node};
use crate::reconcile::ContentUnit;
use crate::rules::{Action, AttrSource, ChildPolicy};
use crate::schema::{NodeSpec, SchemaRegistry};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Why an action could not be applied to a unit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("type '{0}' is not defined by the schema")]
    UnknownType(String),

    #[error("'{node}' requires attribute '{attr}', which the unit does not provide")]
    MissingAttr { node: String, attr: String },

    #[error("the schema has no text container to carry mark '{0}'")]
    NoTextContainer(String),
}

/// Build the node an action produces for `unit`.
///
/// A mark target yields the schema's text container holding the marked
/// text. For a `container` policy the returned node holds only the lead
/// child; the converter appends following units to it.
pub fn apply_action(
    action: &Action,
    unit: &ContentUnit,
    schema: &SchemaRegistry,
    rule_id: Option<&str>,
) -> Result<Node, BuildError> {
    let mut node = if let Some(mark_spec) = schema.mark(&action.target) {
        let container = schema
            .text_container()
            .ok_or_else(|| BuildError::NoTextContainer(action.target.clone()))?;
        let mut attrs: BTreeMap<String, Value> = mark_spec
            .attrs()
            .filter_map(|(n, a)| a.default.clone().map(|v| (n.to_string(), v)))
            .collect();
        attrs.extend(resolve_sources(&action.attrs, unit));
        if let Some((missing, _)) = mark_spec
            .attrs()
            .find(|(n, a)| a.is_required() && !attrs.contains_key(*n))
        {
            return Err(BuildError::MissingAttr {
                node: action.target.clone(),
                attr: missing.to_string(),
            });
        }
        let mut marks = vec![Mark {
            kind: action.target.clone(),
            attrs,
        }];
        marks.extend(action.marks.iter().map(Mark::new));
        text_holder(container, &unit.text, &marks, schema)?
    } else {
        let spec = node_spec(schema, &action.target)?;
        let attrs = node_attrs(spec, &action.attrs, unit)?;
        let marks: Vec<Mark> = action.marks.iter().map(Mark::new).collect();
        let content = match &action.policy {
            ChildPolicy::Atomic => fill_text(spec, &unit.text, &marks, schema)?,
            ChildPolicy::Wrap { inner } => vec![text_holder(inner, &unit.text, &marks, schema)?],
            ChildPolicy::Container { lead: Some(lead), .. } => {
                vec![text_holder(lead, &unit.text, &marks, schema)?]
            }
            ChildPolicy::Container { lead: None, .. } => fill_text(spec, &unit.text, &marks, schema)?,
            ChildPolicy::Grid { row, cell, inner } => {
                grid(unit, row, cell, inner.as_deref(), &marks, schema)?
            }
        };
        Node::new(spec.name()).with_attrs(attrs).with_content(content)
    };

    let meta = node.meta_mut();
    meta.source_unit = Some(unit.id.clone());
    meta.rule = rule_id.map(str::to_string);
    Ok(node)
}

/// The node emitted for a unit no rule could convert: `fallback` holding the
/// unit's text, flagged for review.
pub fn default_node(fallback: &str, unit: &ContentUnit, schema: &SchemaRegistry) -> Node {
    let mut node = match text_holder(fallback, &unit.text, &[], schema) {
        Ok(n) => n,
        Err(_) => Node::new(fallback),
    };
    let meta = node.meta_mut();
    meta.source_unit = Some(unit.id.clone());
    meta.needs_review = true;
    node
}

fn node_spec<'a>(schema: &'a SchemaRegistry, name: &str) -> Result<&'a NodeSpec, BuildError> {
    schema
        .node(name)
        .ok_or_else(|| BuildError::UnknownType(name.to_string()))
}

fn resolve_sources<'a>(
    sources: &'a BTreeMap<String, AttrSource>,
    unit: &'a ContentUnit,
) -> impl Iterator<Item = (String, Value)> + 'a {
    sources
        .iter()
        .filter_map(|(name, src)| src.resolve(unit).map(|v| (name.clone(), v)))
}

/// Declared defaults overlaid with the action's attribute sources.
fn node_attrs(
    spec: &NodeSpec,
    sources: &BTreeMap<String, AttrSource>,
    unit: &ContentUnit,
) -> Result<BTreeMap<String, Value>, BuildError> {
    let mut attrs = spec.default_attrs();
    attrs.extend(resolve_sources(sources, unit));
    require_attrs(spec, attrs)
}

/// Declared defaults only.
fn plain_attrs(spec: &NodeSpec) -> Result<BTreeMap<String, Value>, BuildError> {
    require_attrs(spec, spec.default_attrs())
}

fn require_attrs(
    spec: &NodeSpec,
    attrs: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, BuildError> {
    if let Some(missing) = spec.required_attrs().find(|a| !attrs.contains_key(*a)) {
        return Err(BuildError::MissingAttr {
            node: spec.name().to_string(),
            attr: missing.to_string(),
        });
    }
    Ok(attrs)
}

/// A node of type `name` with default attributes holding `text`.
fn text_holder(
    name: &str,
    text: &str,
    marks: &[Mark],
    schema: &SchemaRegistry,
) -> Result<Node, BuildError> {
    let spec = node_spec(schema, name)?;
    let attrs = plain_attrs(spec)?;
    let content = fill_text(spec, text, marks, schema)?;
    Ok(Node::new(name).with_attrs(attrs).with_content(content))
}

/// Content for a node that should carry `text`: inline text when the node
/// accepts it, otherwise the text container when that may lead.
fn fill_text(
    spec: &NodeSpec,
    text: &str,
    marks: &[Mark],
    schema: &SchemaRegistry,
) -> Result<Vec<Node>, BuildError> {
    if spec.is_leaf() || text.trim().is_empty() {
        return Ok(Vec::new());
    }
    if spec.accepts_text() {
        return Ok(inline_text(spec, text, marks, schema));
    }
    match schema.text_container() {
        Some(tc) if spec.matcher().step(&spec.matcher().start(), tc).is_some() => {
            Ok(vec![text_holder(tc, text, marks, schema)?])
        }
        _ => Ok(Vec::new()),
    }
}

/// Text nodes for `text`, with line breaks as `hardBreak` when the parent
/// allows it. Marks the parent does not allow are dropped.
fn inline_text(parent: &NodeSpec, text: &str, marks: &[Mark], schema: &SchemaRegistry) -> Vec<Node> {
    let marks: Vec<Mark> = marks
        .iter()
        .filter(|m| parent.allows_mark(&m.kind) && schema.mark(&m.kind).is_some())
        .cloned()
        .collect();
    let text_node = |s: &str| Node {
        marks: marks.clone(),
        ..Node::text(s)
    };

    let breaks = schema.node("hardBreak").is_some() && parent.matcher().mentions("hardBreak");
    let lines: Vec<&str> = text.lines().map(str::trim_end).filter(|l| !l.is_empty()).collect();
    if !breaks {
        return vec![text_node(&lines.join(" "))];
    }
    let mut out = Vec::with_capacity(lines.len() * 2);
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push(Node::new("hardBreak"));
        }
        out.push(text_node(line));
    }
    out
}

fn grid(
    unit: &ContentUnit,
    row: &str,
    cell: &str,
    inner: Option<&str>,
    marks: &[Mark],
    schema: &SchemaRegistry,
) -> Result<Vec<Node>, BuildError> {
    let rows = match &unit.rows {
        Some(rows) => rows.clone(),
        None if unit.text.trim().is_empty() => Vec::new(),
        None => vec![vec![unit.text.clone()]],
    };
    let row_spec = node_spec(schema, row)?;
    let cell_spec = node_spec(schema, cell)?;
    let row_attrs = plain_attrs(row_spec)?;
    let cell_attrs = plain_attrs(cell_spec)?;

    rows.iter()
        .map(|cells| -> Result<Node, BuildError> {
            let cells = cells
                .iter()
                .map(|text| -> Result<Node, BuildError> {
                    let content = match inner {
                        Some(inner) => vec![text_holder(inner, text, marks, schema)?],
                        None => fill_text(cell_spec, text, marks, schema)?,
                    };
                    Ok(Node::new(cell)
                        .with_attrs(cell_attrs.clone())
                        .with_content(content))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Node::new(row)
                .with_attrs(row_attrs.clone())
                .with_content(cells))
        })
        .collect()
}
