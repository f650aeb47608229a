//! Synthesis of missing rules through the oracle, deduplicated per run.

use super::{validate_proposal, ProposalRequest, RuleOracle, UnitFeatures};
use crate::document::Node;
use crate::error::Diagnostic;
use crate::reconcile::ContentUnit;
use crate::rules::{AddOutcome, Rule, SharedRegistry};
use crate::schema::SchemaRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Result of resolving an unmatched unit.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutcome {
    /// A validated rule, committed to the registry. `conflict` is set when an
    /// equivalent rule already existed and was used instead.
    Accepted {
        rule: Rule,
        conflict: Option<Diagnostic>,
    },
    Rejected {
        reason: String,
    },
}

/// One outcome per feature signature. Concurrent requests for the same
/// signature wait on the same cell, so only one oracle call is in flight.
#[derive(Debug, Default)]
pub struct SynthesisCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<SynthesisOutcome>>>>,
}

impl SynthesisCache {
    fn cell(&self, signature: &str) -> Arc<OnceCell<SynthesisOutcome>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(entries.entry(signature.to_string()).or_default())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Resolves unmatched units through a [`RuleOracle`].
pub struct Synthesizer {
    oracle: Arc<dyn RuleOracle>,
    cache: SynthesisCache,
    timeout: Duration,
    calls: AtomicUsize,
}

impl Synthesizer {
    pub fn new(oracle: Arc<dyn RuleOracle>, timeout: Duration) -> Self {
        Self {
            oracle,
            cache: SynthesisCache::default(),
            timeout,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of oracle calls issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &SynthesisCache {
        &self.cache
    }

    /// Obtain a rule for `unit`: reuse the cached outcome for its feature
    /// signature, or ask the oracle, validate the proposal and commit it.
    pub async fn resolve(
        &self,
        unit: &ContentUnit,
        neighbors: &[Node],
        schema: &SchemaRegistry,
        registry: &SharedRegistry,
    ) -> SynthesisOutcome {
        let features = UnitFeatures::from_unit(unit);
        let signature = features.signature();
        let cell = self.cache.cell(&signature);
        let outcome = cell
            .get_or_init(|| self.synthesize(unit, features, neighbors, schema, registry))
            .await
            .clone();

        match outcome {
            SynthesisOutcome::Accepted { ref rule, .. } if !rule.predicate.matches(unit) => {
                debug!("{}: cached rule {} does not match", unit.id, rule.id);
                SynthesisOutcome::Rejected {
                    reason: format!("cached rule {} does not match this unit", rule.id),
                }
            }
            other => other,
        }
    }

    async fn synthesize(
        &self,
        unit: &ContentUnit,
        features: UnitFeatures,
        neighbors: &[Node],
        schema: &SchemaRegistry,
        registry: &SharedRegistry,
    ) -> SynthesisOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let request = ProposalRequest {
            unit: features,
            neighbors: neighbors.iter().map(Node::without_meta).collect(),
            available_types: schema.summaries(),
        };

        let proposal = match tokio::time::timeout(self.timeout, self.oracle.propose(&request)).await
        {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                warn!("{}: oracle failed: {}", unit.id, e);
                return SynthesisOutcome::Rejected {
                    reason: e.to_string(),
                };
            }
            Err(_) => {
                warn!("{}: oracle timed out after {:?}", unit.id, self.timeout);
                return SynthesisOutcome::Rejected {
                    reason: format!("oracle timed out after {}s", self.timeout.as_secs()),
                };
            }
        };

        let rule = match validate_proposal(proposal, unit, schema) {
            Ok(rule) => rule,
            Err(rejection) => {
                warn!("{}: proposal rejected: {}", unit.id, rejection);
                return SynthesisOutcome::Rejected {
                    reason: rejection.to_string(),
                };
            }
        };

        let signature = rule.predicate.signature();
        let added = registry.write().add(rule.clone(), schema);
        match added {
            Ok(AddOutcome::Inserted(id)) => {
                info!("{}: synthesised rule {} -> {}", unit.id, id, rule.action.target);
                SynthesisOutcome::Accepted {
                    rule,
                    conflict: None,
                }
            }
            Ok(AddOutcome::Existing(id)) => {
                let existing = registry.read().get(&id).cloned();
                match existing {
                    Some(existing) => SynthesisOutcome::Accepted {
                        rule: existing,
                        conflict: Some(Diagnostic::RegistryConflict {
                            signature,
                            existing: id,
                        }),
                    },
                    None => SynthesisOutcome::Rejected {
                        reason: format!("registry lost rule {id}"),
                    },
                }
            }
            Err(e) => SynthesisOutcome::Rejected {
                reason: e.to_string(),
            },
        }
    }
}
