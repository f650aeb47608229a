//! Rule-Proposal Oracle: the generative fallback consulted only when no rule
//! matches a unit.
//!
//! ## Why a trait?
//!
//! The oracle is an external, non-deterministic collaborator. Expressing it
//! as [`RuleOracle`] keeps it an explicit dependency of the [`Synthesizer`]:
//! production wires in [`LlmRuleOracle`], tests wire in a scripted double,
//! and nothing reaches for a global client.
//!
//! Proposals are untrusted. [`validate_proposal`] runs every check before a
//! proposal may become a [`Rule`].

pub mod llm;
pub mod response;
pub mod synth;

use crate::convert::build::apply_action;
use crate::convert::validate::check_strict;
use crate::document::Node;
use crate::reconcile::{BBox, ContentUnit};
use crate::rules::{Action, Predicate, Rule};
use crate::schema::{SchemaRegistry, TypeSummary};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use llm::{LlmOracleConfig, LlmRuleOracle};
pub use synth::{SynthesisCache, SynthesisOutcome, Synthesizer};

/// Failure of an oracle call. Never fatal: the unit falls back to a default node.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    #[error("oracle provider error: {0}")]
    Provider(String),

    #[error("oracle response is not a rule proposal: {0}")]
    Malformed(String),

    #[error("oracle failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Predicate-relevant attributes of a unit, as sent to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFeatures {
    pub kind: String,
    pub text: String,
    pub page: u32,
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,
    pub has_media: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
}

impl UnitFeatures {
    pub fn from_unit(unit: &ContentUnit) -> Self {
        Self {
            kind: unit.kind.clone(),
            text: unit.text.clone(),
            page: unit.page,
            bbox: unit.bbox,
            font: unit.font.clone(),
            size: unit.size,
            color: unit.color.clone(),
            level: unit.level,
            containers: unit.containers.clone(),
            has_media: unit.media_ref.is_some(),
            rows: unit.rows.as_ref().map(Vec::len),
        }
    }

    /// Cache key: structurally identical units share one signature. Text,
    /// page and geometry are excluded.
    pub fn signature(&self) -> String {
        format!(
            "kind={};font={};size={};color={};level={};within={};media={};rows={}",
            self.kind,
            self.font.as_deref().unwrap_or("*"),
            self.size.map_or_else(|| "*".to_string(), |s| format!("{s:.1}")),
            self.color
                .as_deref()
                .map_or_else(|| "*".to_string(), str::to_ascii_lowercase),
            self.level.map_or_else(|| "*".to_string(), |l| l.to_string()),
            self.containers.join("/"),
            self.has_media,
            self.rows.is_some(),
        )
    }
}

/// What the oracle is asked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalRequest {
    pub unit: UnitFeatures,
    /// One or two already-converted nodes preceding the unit.
    pub neighbors: Vec<Node>,
    pub available_types: Vec<TypeSummary>,
}

/// What the oracle answers. No validity guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleProposal {
    #[serde(default)]
    pub description: String,
    pub predicate: Predicate,
    pub action: Action,
}

/// Capability interface to the generative rule proposer.
#[async_trait]
pub trait RuleOracle: Send + Sync {
    async fn propose(&self, request: &ProposalRequest) -> Result<RuleProposal, OracleError>;
}

/// Why a proposal was discarded.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProposalRejection {
    #[error("proposal references unknown type '{0}'")]
    UnknownType(String),

    #[error("proposal predicate has no concrete field")]
    NoConcreteField,

    #[error("proposal predicate is invalid: {0}")]
    InvalidPredicate(String),

    #[error("proposal action is invalid: {0}")]
    InvalidAction(String),

    #[error("proposal predicate does not match the unit it was proposed for")]
    PredicateMismatch,

    #[error("proposal produces an invalid node: {0}")]
    InvalidOutput(String),
}

/// Run every check on a proposal; on success return it as a synthesised rule.
///
/// 1. Every referenced type exists in the schema.
/// 2. The predicate has at least one concrete field and can be evaluated.
/// 3. The predicate holds for the triggering unit, and applying the action
///    to that unit alone yields a schema-valid node.
pub fn validate_proposal(
    proposal: RuleProposal,
    unit: &ContentUnit,
    schema: &SchemaRegistry,
) -> Result<Rule, ProposalRejection> {
    if let Some(t) = proposal.action.unknown_type(schema) {
        return Err(ProposalRejection::UnknownType(t.to_string()));
    }

    if proposal.predicate.specificity() == 0 {
        return Err(ProposalRejection::NoConcreteField);
    }
    proposal
        .predicate
        .validate()
        .map_err(ProposalRejection::InvalidPredicate)?;
    proposal
        .action
        .check(schema)
        .map_err(ProposalRejection::InvalidAction)?;

    if !proposal.predicate.matches(unit) {
        return Err(ProposalRejection::PredicateMismatch);
    }
    let node = apply_action(&proposal.action, unit, schema, None)
        .map_err(|e| ProposalRejection::InvalidOutput(e.to_string()))?;
    check_strict(&node, schema).map_err(ProposalRejection::InvalidOutput)?;

    let description = if proposal.description.trim().is_empty() {
        format!("synthesised for {} units", unit.kind)
    } else {
        proposal.description
    };
    Ok(Rule::synthesized(description, proposal.predicate, proposal.action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests::{styled, unit};
    use crate::rules::{AttrSource, ChildPolicy, Provenance};
    use crate::schema::tests::fixture;

    fn proposal(predicate: Predicate, action: Action) -> RuleProposal {
        RuleProposal {
            description: String::new(),
            predicate,
            action,
        }
    }

    #[test]
    fn signature_ignores_text_and_geometry() {
        let mut a = styled("caption", "Figure 1", "Sans", 9.0);
        let mut b = styled("caption", "Figure 22: something else", "Sans", 9.04);
        a.bbox = BBox::new(0.0, 0.0, 1.0, 1.0);
        b.page = 7;
        assert_eq!(
            UnitFeatures::from_unit(&a).signature(),
            UnitFeatures::from_unit(&b).signature()
        );
        let c = styled("caption", "Figure 1", "Serif", 9.0);
        assert_ne!(
            UnitFeatures::from_unit(&a).signature(),
            UnitFeatures::from_unit(&c).signature()
        );
    }

    #[test]
    fn accepts_a_valid_proposal() {
        let schema = fixture();
        let u = styled("caption", "Figure 1", "Sans", 9.0);
        let rule = validate_proposal(
            proposal(Predicate::kind("caption"), Action::node("paragraph")),
            &u,
            &schema,
        )
        .unwrap();
        assert_eq!(rule.provenance, Provenance::Synthesized);
        assert!(rule.id.starts_with("syn-"));
        assert!(!rule.description.is_empty());
    }

    #[test]
    fn rejects_unknown_target() {
        let schema = fixture();
        let err = validate_proposal(
            proposal(Predicate::kind("caption"), Action::node("figureCaption")),
            &unit("caption", "x"),
            &schema,
        )
        .unwrap_err();
        assert_eq!(err, ProposalRejection::UnknownType("figureCaption".into()));
    }

    #[test]
    fn rejects_wildcard_predicate() {
        let schema = fixture();
        let err = validate_proposal(
            proposal(Predicate::default(), Action::node("paragraph")),
            &unit("caption", "x"),
            &schema,
        )
        .unwrap_err();
        assert_eq!(err, ProposalRejection::NoConcreteField);
    }

    #[test]
    fn rejects_predicate_that_misses_the_unit() {
        let schema = fixture();
        let err = validate_proposal(
            proposal(Predicate::kind("footnote"), Action::node("paragraph")),
            &unit("caption", "x"),
            &schema,
        )
        .unwrap_err();
        assert_eq!(err, ProposalRejection::PredicateMismatch);
    }

    #[test]
    fn rejects_output_missing_required_attr() {
        let schema = fixture();
        // image requires src; the unit has no media reference
        let err = validate_proposal(
            proposal(
                Predicate::kind("figure"),
                Action::node("image").with_attr("src", AttrSource::MediaRef),
            ),
            &unit("figure", "x"),
            &schema,
        )
        .unwrap_err();
        assert!(matches!(err, ProposalRejection::InvalidOutput(_)));
    }

    #[test]
    fn rejects_grid_into_wrong_types() {
        let schema = fixture();
        let mut u = unit("table", "");
        u.rows = Some(vec![vec!["a".into()]]);
        let err = validate_proposal(
            proposal(
                Predicate::kind("table"),
                Action::node("table").with_policy(ChildPolicy::Grid {
                    row: "paragraph".into(),
                    cell: "tableCell".into(),
                    inner: None,
                }),
            ),
            &u,
            &schema,
        )
        .unwrap_err();
        assert!(matches!(err, ProposalRejection::InvalidOutput(_)));
    }

    #[test]
    fn proposal_parses_from_json() {
        let p: RuleProposal = serde_json::from_value(serde_json::json!({
            "description": "captions",
            "predicate": {"kind": "caption", "size": {"max": 10.0}},
            "action": {"target": "paragraph", "marks": ["italic"]}
        }))
        .unwrap();
        assert_eq!(p.predicate.specificity(), 2);
        assert_eq!(p.action.marks, vec!["italic".to_string()]);
    }
}
