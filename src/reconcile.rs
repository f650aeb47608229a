//! Extraction Reconciler: spatial join of the content and style streams.
//!
//! The content/layout parser knows reading order and coarse typing but has
//! only approximate geometry and no fonts. The style extractor has precise
//! geometry, font, size and colour but no structure. Each content entry is
//! matched to the style entry that covers most of its box on the same page;
//! the match contributes its style attributes to the resulting
//! [`ContentUnit`].
//!
//! ## Why ratio over the content box?
//!
//! Style entries are usually line or span sized while content entries are
//! block sized. Intersection-over-union would penalise that size mismatch
//! for every candidate alike. Dividing by the content box measures how much
//! of the block a style entry explains, so the entry that covers the block
//! best wins even when the parser pads its boxes.
//!
//! Image entries of the style stream take no part in the join; figures the
//! content parser missed are placed afterwards by
//! [`crate::postprocess::insert_images`].

use crate::error::{ChapterError, Diagnostic};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default minimum overlap ratio for a style entry to count as a match.
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.5;

/// Axis-aligned bounding box in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn area(&self) -> f64 {
        (self.x1 - self.x0).max(0.0) * (self.y1 - self.y0).max(0.0)
    }

    pub fn intersection(&self, other: &BBox) -> f64 {
        let w = self.x1.min(other.x1) - self.x0.max(other.x0);
        let h = self.y1.min(other.y1) - self.y0.max(other.y0);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    /// Fraction of `self` covered by `other`. Zero-area boxes never overlap.
    pub fn overlap_ratio(&self, other: &BBox) -> f64 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        self.intersection(other) / area
    }
}

/// One entry of the content/layout stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
    /// 1-indexed page number.
    pub page: u32,
    /// Coarse type hint, e.g. `heading`, `text`, `table`, `list_item`, `image`.
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    pub bbox: BBox,
    /// Heading level or list depth, when the parser reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    /// Table cells, row-major.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<String>>>,
    /// Container-membership hints, outermost first (e.g. `["table", "row"]`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,
}

/// What a style entry describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StyleKind {
    #[default]
    Text,
    /// An image block; `src` names the extracted file.
    Image,
}

/// One entry of the style-metadata stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleEntry {
    pub page: u32,
    pub bbox: BBox,
    #[serde(default)]
    pub kind: StyleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    /// Hex colour, e.g. `#1f3864`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Extractor-specific style bits (bold, italic, ...).
    #[serde(default)]
    pub flags: u32,
}

impl StyleEntry {
    /// An image block at `bbox`.
    pub fn image(page: u32, bbox: BBox, src: impl Into<String>) -> Self {
        Self {
            page,
            bbox,
            kind: StyleKind::Image,
            src: Some(src.into()),
            text: String::new(),
            font: None,
            size: None,
            color: None,
            flags: 0,
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == StyleKind::Image
    }
}

/// A reconciled piece of segment content. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    /// `{chapter_id}:u{reading_order}`.
    pub id: String,
    pub reading_order: usize,
    pub page: u32,
    pub bbox: BBox,
    pub kind: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,
    #[serde(default)]
    pub font: Option<String>,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub flags: u32,
    pub style_missing: bool,
}

impl ContentUnit {
    /// A unit built directly from a content entry, with no style attached.
    pub fn from_entry(chapter_id: &str, reading_order: usize, entry: ContentEntry) -> Self {
        Self {
            id: format!("{chapter_id}:u{reading_order}"),
            reading_order,
            page: entry.page,
            bbox: entry.bbox,
            kind: entry.kind,
            text: entry.text,
            media_ref: entry.media_ref,
            level: entry.level,
            rows: entry.rows,
            containers: entry.containers,
            font: None,
            size: None,
            color: None,
            flags: 0,
            style_missing: true,
        }
    }

    fn apply_style(&mut self, style: &StyleEntry) {
        self.font = style.font.clone();
        self.size = style.size;
        self.color = style.color.clone();
        self.flags = style.flags;
        self.style_missing = false;
    }
}

/// Result of reconciling one chapter's streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciled {
    pub units: Vec<ContentUnit>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    /// Style entries that matched no content entry.
    pub discarded_style: usize,
}

/// Merge the two streams of one chapter into ordered Content Units.
///
/// Only entries on the same page are compared. A style entry is a candidate
/// when its overlap ratio strictly exceeds `threshold`; the highest ratio
/// wins and equal ratios go to the earliest entry of the style stream.
pub fn reconcile(
    chapter_id: &str,
    content: Vec<ContentEntry>,
    style: &[StyleEntry],
    threshold: f64,
) -> Result<Reconciled, ChapterError> {
    if content.is_empty() {
        return Err(ChapterError::ExtractionFailure {
            chapter: chapter_id.to_string(),
            detail: "content stream is empty".to_string(),
        });
    }

    let mut diagnostics = Vec::new();
    if style.iter().all(StyleEntry::is_image) {
        warn!(
            "Chapter {}: style stream has no text entries, {} unit(s) will carry no style",
            chapter_id,
            content.len()
        );
        diagnostics.push(Diagnostic::StyleJoinDegraded {
            chapter: chapter_id.to_string(),
            units: content.len(),
        });
    }

    let mut used = vec![false; style.len()];
    let mut units = Vec::with_capacity(content.len());

    for (order, entry) in content.into_iter().enumerate() {
        let mut best: Option<(usize, f64)> = None;
        for (i, s) in style.iter().enumerate() {
            if s.is_image() || s.page != entry.page {
                continue;
            }
            let ratio = entry.bbox.overlap_ratio(&s.bbox);
            if ratio <= threshold {
                continue;
            }
            if best.map_or(true, |(_, r)| ratio > r) {
                best = Some((i, ratio));
            }
        }

        let mut unit = ContentUnit::from_entry(chapter_id, order, entry);
        if let Some((i, ratio)) = best {
            debug!("{}: style entry {} joined (overlap {:.2})", unit.id, i, ratio);
            unit.apply_style(&style[i]);
            used[i] = true;
        }
        units.push(unit);
    }

    let discarded_style = style
        .iter()
        .zip(&used)
        .filter(|(s, used)| !s.is_image() && !**used)
        .count();
    if discarded_style > 0 {
        debug!(
            "Chapter {}: {} style entr(ies) matched nothing and were discarded",
            chapter_id, discarded_style
        );
    }

    Ok(Reconciled {
        units,
        diagnostics,
        discarded_style,
    })
}
