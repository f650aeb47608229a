//! Rule Registry: persistent, versioned, append-only rule storage.
//!
//! The registry is explicit state. Components receive a [`SharedRegistry`]
//! handle; chapters read concurrently and every append goes through the
//! single write lock, so two chapters that synthesise the same rule at the
//! same time end up with one rule and a bumped usage counter.
//!
//! Never hold a guard across an `.await`: take what you need, drop the
//! guard, then await.

use super::{Provenance, Rule};
use crate::error::DoctreeError;
use crate::persist::write_atomic;
use crate::reconcile::ContentUnit;
use crate::schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Result of [`RuleRegistry::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The rule was committed under this id.
    Inserted(String),
    /// A rule with the same predicate signature already existed; its usage
    /// counter was bumped and the new rule discarded.
    Existing(String),
}

impl AddOutcome {
    pub fn id(&self) -> &str {
        match self {
            AddOutcome::Inserted(id) | AddOutcome::Existing(id) => id,
        }
    }
}

/// Scoring policy for [`RuleRegistry::find`].
///
/// A rule's score is its specificity, plus `curated_bonus` when it is
/// curated. Ties go to the newest rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchPolicy {
    pub curated_bonus: u32,
}

impl MatchPolicy {
    pub fn score(&self, rule: &Rule) -> u32 {
        let bonus = match rule.provenance {
            Provenance::Curated => self.curated_bonus,
            Provenance::Synthesized => 0,
        };
        rule.specificity() + bonus
    }
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u64,
    rules: Vec<Rule>,
}

/// The rule set. Bumps `version` on every committed rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
    version: u64,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Check a rule against the schema without committing it.
    pub fn check(rule: &Rule, schema: &SchemaRegistry) -> Result<(), DoctreeError> {
        if let Some(target) = rule.action.unknown_type(schema) {
            return Err(DoctreeError::UnknownTargetType {
                rule: rule.id.clone(),
                target: target.to_string(),
            });
        }
        rule.predicate
            .validate()
            .map_err(|detail| DoctreeError::InvalidPredicate {
                rule: rule.id.clone(),
                detail,
            })?;
        rule.action
            .check(schema)
            .map_err(|detail| DoctreeError::InvalidAction {
                rule: rule.id.clone(),
                detail,
            })
    }

    /// Commit `rule`, or bump the usage of the rule that already has its
    /// predicate signature.
    pub fn add(&mut self, rule: Rule, schema: &SchemaRegistry) -> Result<AddOutcome, DoctreeError> {
        Self::check(&rule, schema)?;
        let signature = rule.predicate.signature();
        if let Some(existing) = self
            .rules
            .iter_mut()
            .find(|r| r.predicate.signature() == signature)
        {
            existing.usage += 1;
            debug!(
                "Rule {} duplicates {} ({}); usage bumped",
                rule.id, existing.id, signature
            );
            return Ok(AddOutcome::Existing(existing.id.clone()));
        }
        if self.get(&rule.id).is_some() {
            return Err(DoctreeError::Internal(format!(
                "rule id '{}' is already taken",
                rule.id
            )));
        }
        let id = rule.id.clone();
        info!("Committed {:?} rule {} -> {}", rule.provenance, id, rule.action.target);
        self.rules.push(rule);
        self.version += 1;
        Ok(AddOutcome::Inserted(id))
    }

    /// The best rule whose predicate holds for `unit`.
    ///
    /// Highest score first, then the most recent `created_at`, then the
    /// latest inserted.
    pub fn find(&self, unit: &ContentUnit, policy: &MatchPolicy) -> Option<&Rule> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.predicate.matches(unit))
            .max_by(|(ia, a), (ib, b)| {
                policy
                    .score(a)
                    .cmp(&policy.score(b))
                    .then(a.created_at.cmp(&b.created_at))
                    .then(ia.cmp(ib))
            })
            .map(|(_, r)| r)
    }

    /// Apply usage counts gathered during a conversion.
    pub fn record_usage(&mut self, tallies: &HashMap<String, u64>) {
        for rule in &mut self.rules {
            if let Some(n) = tallies.get(&rule.id) {
                rule.usage += n;
            }
        }
    }

    /// Persist as JSON, atomically replacing `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DoctreeError> {
        let path = path.as_ref();
        let file = RegistryFile {
            version: self.version,
            rules: self.rules.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| DoctreeError::Internal(format!("serialise registry: {e}")))?;
        write_atomic(path, &json).map_err(|e| DoctreeError::RegistryIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!("Saved {} rule(s) to {}", self.rules.len(), path.display());
        Ok(())
    }

    /// Load a saved registry, checking every rule against `schema`.
    pub fn load(path: impl AsRef<Path>, schema: &SchemaRegistry) -> Result<Self, DoctreeError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| DoctreeError::RegistryIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file: RegistryFile =
            serde_json::from_slice(&raw).map_err(|e| DoctreeError::RegistryCorrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        for rule in &file.rules {
            Self::check(rule, schema)?;
        }
        info!(
            "Loaded {} rule(s), version {}, from {}",
            file.rules.len(),
            file.version,
            path.display()
        );
        Ok(Self {
            rules: file.rules,
            version: file.version,
        })
    }

    /// [`RuleRegistry::load`], or an empty registry when `path` does not exist.
    pub fn open(path: impl AsRef<Path>, schema: &SchemaRegistry) -> Result<Self, DoctreeError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path, schema)
        } else {
            Ok(Self::new())
        }
    }
}

/// Cloneable handle to a registry shared by concurrent chapters.
#[derive(Debug, Clone, Default)]
pub struct SharedRegistry(Arc<RwLock<RuleRegistry>>);

impl SharedRegistry {
    pub fn new(registry: RuleRegistry) -> Self {
        Self(Arc::new(RwLock::new(registry)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RuleRegistry> {
        // A panic while holding the lock cannot leave a half-applied append:
        // `add` pushes last.
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RuleRegistry> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    /// A point-in-time copy.
    pub fn snapshot(&self) -> RuleRegistry {
        self.read().clone()
    }
}

impl From<RuleRegistry> for SharedRegistry {
    fn from(registry: RuleRegistry) -> Self {
        Self::new(registry)
    }
}
