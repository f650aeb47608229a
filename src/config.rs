//! Configuration for a document pipeline run.
//!
//! Every orchestration knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Oracle settings live separately in
//! [`crate::oracle::LlmOracleConfig`] because the oracle is optional and
//! replaceable.
//!
//! # Design choice: builder over constructor
//! Callers set only what they care about and rely on documented defaults
//! for the rest; `build()` is the single place constraints are checked.

use crate::convert::ConverterOptions;
use crate::error::DoctreeError;
use crate::progress::ProgressCallback;
use crate::reconcile::DEFAULT_OVERLAP_THRESHOLD;
use crate::rules::MatchPolicy;
use std::fmt;
use std::time::Duration;

/// Configuration for [`crate::Orchestrator`].
///
/// # Example
/// ```rust
/// use edgequake_doctree::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .concurrency(2)
///     .stage_timeout_secs(120)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 2);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Chapters processed at once. Default: 4.
    ///
    /// Size it to the external parser's and oracle's concurrency limits;
    /// chapters share nothing but the rule registry.
    pub concurrency: usize,

    /// Minimum overlap ratio for a style entry to join a content entry.
    /// Range: (0, 1]. Default: 0.5.
    pub overlap_threshold: f64,

    /// Deadline for one stage of one chapter, in seconds. Default: 300.
    ///
    /// A stage that exceeds it fails the chapter with
    /// [`crate::error::ChapterError::StageTimeout`]; siblings continue.
    pub stage_timeout_secs: u64,

    /// Deadline for one oracle proposal, in seconds. Default: 60.
    ///
    /// A timed-out proposal counts as a synthesis failure: the unit becomes
    /// a fallback node flagged for review.
    pub oracle_timeout_secs: u64,

    /// Converted neighbours sent to the oracle with each request. Range: 1–2. Default: 2.
    pub neighbor_context: usize,

    /// Node type for units no rule converts. Default: the schema's text container.
    pub fallback_node: Option<String>,

    /// Root type of each segment. Default: the schema's top node.
    pub segment_root: Option<String>,

    /// Score bonus for curated rules over synthesised ones. Default: 0
    /// (specificity alone decides).
    pub curated_bonus: u32,

    /// Node type used for images the style stream found but the content
    /// parser missed. Default: `image`.
    pub image_node: String,

    /// Node type whose `level` the typography check reconciles. Default: `heading`.
    pub heading_node: String,

    /// Align heading levels with heading fonts across the combined
    /// document. Default: true.
    pub typography_check: bool,

    /// Optional progress callback for chapter and stage events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            stage_timeout_secs: 300,
            oracle_timeout_secs: 60,
            neighbor_context: 2,
            fallback_node: None,
            segment_root: None,
            curated_bonus: 0,
            image_node: "image".to_string(),
            heading_node: "heading".to_string(),
            typography_check: true,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("concurrency", &self.concurrency)
            .field("overlap_threshold", &self.overlap_threshold)
            .field("stage_timeout_secs", &self.stage_timeout_secs)
            .field("oracle_timeout_secs", &self.oracle_timeout_secs)
            .field("neighbor_context", &self.neighbor_context)
            .field("fallback_node", &self.fallback_node)
            .field("segment_root", &self.segment_root)
            .field("curated_bonus", &self.curated_bonus)
            .field("image_node", &self.image_node)
            .field("heading_node", &self.heading_node)
            .field("typography_check", &self.typography_check)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            curated_bonus: self.curated_bonus,
        }
    }

    pub fn converter_options(&self) -> ConverterOptions {
        ConverterOptions {
            match_policy: self.match_policy(),
            fallback_node: self.fallback_node.clone(),
            segment_root: self.segment_root.clone(),
            neighbor_context: self.neighbor_context,
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn overlap_threshold(mut self, t: f64) -> Self {
        self.config.overlap_threshold = t;
        self
    }

    pub fn stage_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stage_timeout_secs = secs;
        self
    }

    pub fn oracle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.oracle_timeout_secs = secs;
        self
    }

    pub fn neighbor_context(mut self, n: usize) -> Self {
        self.config.neighbor_context = n.clamp(1, 2);
        self
    }

    pub fn fallback_node(mut self, node: impl Into<String>) -> Self {
        self.config.fallback_node = Some(node.into());
        self
    }

    pub fn segment_root(mut self, node: impl Into<String>) -> Self {
        self.config.segment_root = Some(node.into());
        self
    }

    pub fn curated_bonus(mut self, bonus: u32) -> Self {
        self.config.curated_bonus = bonus;
        self
    }

    pub fn image_node(mut self, node: impl Into<String>) -> Self {
        self.config.image_node = node.into();
        self
    }

    pub fn heading_node(mut self, node: impl Into<String>) -> Self {
        self.config.heading_node = node.into();
        self
    }

    pub fn typography_check(mut self, enabled: bool) -> Self {
        self.config.typography_check = enabled;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, DoctreeError> {
        let c = &self.config;
        if !(c.overlap_threshold > 0.0 && c.overlap_threshold <= 1.0) {
            return Err(DoctreeError::InvalidConfig(format!(
                "overlap threshold must be in (0, 1], got {}",
                c.overlap_threshold
            )));
        }
        if c.stage_timeout_secs == 0 || c.oracle_timeout_secs == 0 {
            return Err(DoctreeError::InvalidConfig(
                "timeouts must be at least one second".into(),
            ));
        }
        Ok(self.config)
    }
}
