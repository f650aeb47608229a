//! Chapter detection from the style stream.
//!
//! A header is a style entry in the configured font and size whose text
//! looks like a numbered title. Each header starts a chapter that runs to
//! the page before the next header; the last chapter runs to the end of the
//! document. Detected chapters start out `pending` and must be approved
//! before the orchestrator touches them.

use super::ChapterUnit;
use crate::reconcile::StyleEntry;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Title shapes recognised as chapter headers.
pub const DEFAULT_HEADER_PATTERNS: &[&str] = &[
    r"\d+\s+\w+",    // "1 Introduction"
    r"Chapter\s+\d+", // "Chapter 1"
    r"\d+\.\s*\w+",  // "1. Title"
    r"\d+:\s*\w+",   // "1: Title"
];

const SIZE_TOLERANCE: f64 = 0.05;

static FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static CHAPTER_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^Chapter\s+\d+[:\-\s]*").unwrap());
static NUMBER_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[:.\-\s]*").unwrap());

/// What a chapter header looks like.
#[derive(Debug, Clone)]
pub struct HeaderCriteria {
    /// Required font name (case-insensitive). `None` accepts any font.
    pub font: Option<String>,
    /// Required font size. `None` accepts any size.
    pub size: Option<f64>,
    patterns: Vec<Regex>,
}

impl Default for HeaderCriteria {
    fn default() -> Self {
        Self {
            font: None,
            size: None,
            patterns: DEFAULT_HEADER_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
                .collect(),
        }
    }
}

impl HeaderCriteria {
    pub fn with_font(mut self, font: impl Into<String>) -> Self {
        self.font = Some(font.into());
        self
    }

    pub fn with_size(mut self, size: f64) -> Self {
        self.size = Some(size);
        self
    }

    /// Replace the title patterns. Fails on the first pattern that does not compile.
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.patterns = patterns
            .into_iter()
            .map(|p| Regex::new(&format!("(?i){}", p.as_ref())))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub fn is_header(&self, entry: &StyleEntry) -> bool {
        if entry.is_image() {
            return false;
        }
        if let Some(font) = &self.font {
            if !entry
                .font
                .as_deref()
                .is_some_and(|f| f.eq_ignore_ascii_case(font))
            {
                return false;
            }
        }
        if let Some(size) = self.size {
            if !entry.size.is_some_and(|s| (s - size).abs() <= SIZE_TOLERANCE) {
                return false;
            }
        }
        let text = entry.text.trim();
        self.patterns.iter().any(|p| p.is_match(text))
    }
}

/// Split a header into its chapter number and title.
///
/// `"Chapter 3: Results"` gives `(Some(3), "Results")`; `"2. Methods"` gives
/// `(Some(2), "Methods")`.
pub fn parse_chapter_text(text: &str) -> (Option<u32>, String) {
    let number = FIRST_NUMBER
        .find(text)
        .and_then(|m| m.as_str().parse::<u32>().ok());
    let title = CHAPTER_PREFIX.replace(text, "");
    let title = NUMBER_PREFIX.replace(&title, "");
    (number, title.trim().to_string())
}

/// Chapter id used for persisted state: `chapter_<n>_<Title_With_Underscores>`.
pub fn chapter_id(number: Option<u32>, title: &str) -> String {
    let number = number.map_or_else(|| "unknown".to_string(), |n| n.to_string());
    format!("chapter_{}_{}", number, title.replace(' ', "_"))
}

/// Detect chapters in a document of `total_pages` pages.
///
/// Only the first header on a page counts. Returned units are in page order
/// and pending approval.
pub fn detect_chapters(entries: &[StyleEntry], total_pages: u32, criteria: &HeaderCriteria) -> Vec<ChapterUnit> {
    let mut headers: Vec<&StyleEntry> = entries.iter().filter(|e| criteria.is_header(e)).collect();
    headers.sort_by_key(|e| e.page);
    headers.dedup_by_key(|e| e.page);

    let chapters: Vec<ChapterUnit> = headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let text = header.text.trim();
            let (number, title) = parse_chapter_text(text);
            let title = if title.is_empty() {
                format!("Chapter {}", number.unwrap_or(i as u32 + 1))
            } else {
                title
            };
            let end_page = headers
                .get(i + 1)
                .map_or(total_pages, |next| next.page.saturating_sub(1))
                .max(header.page);

            let mut unit = ChapterUnit::new(chapter_id(number, &title), title, header.page, end_page);
            unit.number = number;
            unit.header_text = text.to_string();
            unit
        })
        .collect();

    debug!("Detected {} chapter(s) in {} page(s)", chapters.len(), total_pages);
    chapters
}
