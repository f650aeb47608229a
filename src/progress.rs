//! Progress-callback trait for per-chapter pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the orchestrator moves chapters through their stages.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a broadcast channel, a review UI or a
//! terminal progress bar without the library knowing how the host
//! application communicates. Chapters run concurrently, so the trait is
//! `Send + Sync`.
//!
//! # Example
//!
//! ```rust
//! use edgequake_doctree::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counting {
//!     done: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for Counting {
//!     fn on_chapter_complete(&self, chapter_id: &str, nodes: usize, needs_review: usize) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{n}: {chapter_id} ({nodes} nodes, {needs_review} to review)");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(Counting { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::chapter::Stage;
use std::sync::Arc;

/// Called by the orchestrator as chapters progress.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Events of different chapters may arrive
/// concurrently and interleaved.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before any chapter starts.
    ///
    /// # Arguments
    /// * `document_id` - the document being processed
    /// * `chapters`    - number of approved chapters in the run
    fn on_run_start(&self, document_id: &str, chapters: usize) {
        let _ = (document_id, chapters);
    }

    /// Called when a chapter enters a stage (including when it resumes there).
    fn on_stage(&self, chapter_id: &str, stage: Stage) {
        let _ = (chapter_id, stage);
    }

    /// Called when a chapter reaches `combined`.
    ///
    /// # Arguments
    /// * `nodes`        - node count of the chapter's segment tree
    /// * `needs_review` - units converted without a confident rule
    fn on_chapter_complete(&self, chapter_id: &str, nodes: usize, needs_review: usize) {
        let _ = (chapter_id, nodes, needs_review);
    }

    /// Called when a chapter reaches `failed`.
    fn on_chapter_failed(&self, chapter_id: &str, error: &str) {
        let _ = (chapter_id, error);
    }

    /// Called once after the combined output has been written.
    ///
    /// # Arguments
    /// * `combined` - chapters included in the output
    /// * `failed`   - chapters that ended `failed`
    fn on_run_complete(&self, document_id: &str, combined: usize, failed: usize) {
        let _ = (document_id, combined, failed);
    }
}

/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
