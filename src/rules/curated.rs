//! Built-in curated rules for the usual Tiptap node set.
//!
//! Seeds carry a fixed creation time (the Unix epoch) so that any rule
//! committed later, curated or synthesised, wins a specificity tie.

use super::{Action, AttrSource, ChildPolicy, Predicate, Provenance, Rule, RuleRegistry};
use crate::error::DoctreeError;
use crate::schema::SchemaRegistry;
use chrono::{DateTime, Utc};
use tracing::debug;

fn seed(id: &str, description: &str, predicate: Predicate, action: Action) -> Rule {
    Rule {
        id: id.to_string(),
        description: description.to_string(),
        created_at: DateTime::<Utc>::UNIX_EPOCH,
        provenance: Provenance::Curated,
        predicate,
        action,
        usage: 0,
    }
}

/// Every built-in rule, regardless of schema.
pub fn curated_rules() -> Vec<Rule> {
    vec![
        seed(
            "curated.heading",
            "Parser headings become heading nodes carrying their level",
            Predicate::kind("heading"),
            Action::node("heading").with_attr("level", AttrSource::Level),
        ),
        seed(
            "curated.text",
            "Body text becomes a paragraph",
            Predicate::kind("text"),
            Action::node("paragraph"),
        ),
        seed(
            "curated.table",
            "Tables are rebuilt row by row from the parsed cells",
            Predicate::kind("table"),
            Action::node("table").with_policy(ChildPolicy::Grid {
                row: "tableRow".into(),
                cell: "tableCell".into(),
                inner: Some("paragraph".into()),
            }),
        ),
        seed(
            "curated.list_item",
            "List items open a list item whose first child is a paragraph",
            Predicate::kind("list_item"),
            Action::node("listItem").with_policy(ChildPolicy::Container {
                lead: Some("paragraph".into()),
                group: None,
            }),
        ),
        seed(
            "curated.image",
            "Figures become images; the caption text is kept as alt text",
            Predicate::kind("image"),
            Action::node("image")
                .with_attr("src", AttrSource::MediaRef)
                .with_attr("alt", AttrSource::Text),
        ),
    ]
}

/// Add the built-in rules whose types exist in `schema`. Returns how many
/// were newly inserted.
pub fn seed_curated(registry: &mut RuleRegistry, schema: &SchemaRegistry) -> Result<usize, DoctreeError> {
    let mut inserted = 0;
    for rule in curated_rules() {
        if registry.get(&rule.id).is_some() {
            continue;
        }
        if let Some(missing) = rule.action.unknown_type(schema) {
            debug!("Skipping {}: schema has no '{}'", rule.id, missing);
            continue;
        }
        if rule.action.check(schema).is_err() {
            debug!("Skipping {}: action does not fit the schema", rule.id);
            continue;
        }
        if let super::AddOutcome::Inserted(_) = registry.add(rule, schema)? {
            inserted += 1;
        }
    }
    Ok(inserted)
}
