//! Post-processing: deterministic passes over converted trees.
//!
//! Both passes run after conversion and only ever add or adjust nodes the
//! conversion already placed; every change lands in the review manifest.
//!
//! - [`insert_images`] places image blocks that only the style extractor saw.
//!   It runs per chapter, right after the chapter is converted.
//! - [`check_typography`] makes heading levels agree with heading fonts. It
//!   runs once over the combined document so every chapter votes.

use crate::document::{Node, RepairEntry, ReviewEntry, ReviewManifest};
use crate::error::Diagnostic;
use crate::reconcile::{ContentUnit, StyleEntry};
use crate::schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

// ── Image insertion ──────────────────────────────────────────────────────

/// Where a top-level node starts: page and top edge of its first source unit.
type Anchor = (u32, f64);

fn anchor(node: &Node, units: &HashMap<&str, &ContentUnit>) -> Option<Anchor> {
    let mut found = None;
    node.walk(&mut |n| {
        if found.is_none() {
            if let Some(unit) = n.source_unit().and_then(|id| units.get(id)) {
                found = Some((unit.page, unit.bbox.y0));
            }
        }
    });
    found
}

/// Sources of every `image_type` node already in the tree.
fn present_images<'a>(root: &'a Node, image_type: &str) -> HashSet<&'a str> {
    let mut srcs = HashSet::new();
    root.walk(&mut |n| {
        if n.kind == image_type {
            if let Some(src) = n.attrs.get("src").and_then(Value::as_str) {
                srcs.insert(src);
            }
        }
    });
    srcs
}

/// Insert the image entries of `style` that the tree does not show yet.
///
/// Each image goes before the first child of `root` that starts on a later
/// page, or on the same page below the image's top edge; with no such child
/// it is appended. Children whose position is unknown are skipped over.
/// Returns the number of images inserted.
pub fn insert_images(
    root: &mut Node,
    units: &[ContentUnit],
    style: &[StyleEntry],
    image_type: &str,
    schema: &SchemaRegistry,
    manifest: &mut ReviewManifest,
) -> usize {
    let mut pending: Vec<&StyleEntry> = style.iter().filter(|s| s.is_image() && s.src.is_some()).collect();
    if pending.is_empty() {
        return 0;
    }
    let Some(spec) = schema.node(image_type) else {
        warn!(
            "{} image block(s) left out: schema has no '{}' node",
            pending.len(),
            image_type
        );
        return 0;
    };

    let present: HashSet<String> = present_images(root, image_type)
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut seen: HashSet<String> = HashSet::new();
    pending.retain(|s| {
        s.src
            .as_deref()
            .is_some_and(|src| !present.contains(src) && seen.insert(src.to_string()))
    });
    pending.sort_by(|a, b| {
        a.page
            .cmp(&b.page)
            .then(a.bbox.y0.total_cmp(&b.bbox.y0))
    });

    let by_id: HashMap<&str, &ContentUnit> = units.iter().map(|u| (u.id.as_str(), u)).collect();
    let mut anchors: Vec<Option<Anchor>> = root.content.iter().map(|n| anchor(n, &by_id)).collect();

    let mut inserted = 0;
    for image in pending {
        let Some(src) = image.src.clone() else { continue };
        let (page, y0) = (image.page, image.bbox.y0);
        let index = anchors
            .iter()
            .position(|a| matches!(a, Some((p, y)) if *p > page || (*p == page && y0 < *y)))
            .unwrap_or(anchors.len());

        let mut attrs = spec.default_attrs();
        attrs.insert("src".to_string(), Value::from(src.clone()));
        if spec.attr("alt").is_some() {
            attrs.insert("alt".to_string(), Value::from(format!("Image from page {page}")));
        }
        if spec.attr("title").is_some() {
            attrs.insert("title".to_string(), Value::from(format!("Page {page} image")));
        }

        debug!("Image {} (page {}, y {:.1}) inserted at {}", src, page, y0, index);
        root.content.insert(index, Node::new(image_type).with_attrs(attrs));
        anchors.insert(index, Some((page, y0)));
        manifest.shift_paths(index, 1);
        manifest.inserted_images.push(RepairEntry {
            path: vec![index],
            parent: root.kind.clone(),
            types: vec![image_type.to_string()],
            detail: format!("{src} (page {page})"),
        });
        inserted += 1;
    }
    inserted
}

// ── Typography consistency ───────────────────────────────────────────────

/// Heading styles seen in a document and the levels they were used at.
///
/// A style is the lower-cased font name and the size to one decimal, e.g.
/// `georgia@24.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypographyRegistry {
    pub headings: BTreeMap<String, BTreeMap<u64, usize>>,
}

impl TypographyRegistry {
    pub fn style_key(font: &str, size: f64) -> String {
        format!("{}@{:.1}", font.to_lowercase(), size)
    }

    pub fn observe(&mut self, style: &str, level: u64) {
        *self
            .headings
            .entry(style.to_string())
            .or_default()
            .entry(level)
            .or_default() += 1;
    }

    /// Levels tied for the most uses of `style`, ascending.
    pub fn dominant(&self, style: &str) -> Vec<u64> {
        let Some(levels) = self.headings.get(style) else {
            return Vec::new();
        };
        let best = levels.values().copied().max().unwrap_or(0);
        levels
            .iter()
            .filter(|(_, n)| **n == best)
            .map(|(l, _)| *l)
            .collect()
    }
}

struct HeadingSite {
    path: Vec<usize>,
    unit: String,
    reading_order: usize,
    style: String,
    level: u64,
}

fn collect_headings(
    node: &Node,
    path: &mut Vec<usize>,
    heading_type: &str,
    units: &HashMap<&str, &ContentUnit>,
    out: &mut Vec<HeadingSite>,
) {
    if node.kind == heading_type {
        let unit = node.source_unit().and_then(|id| units.get(id));
        let level = node.attrs.get("level").and_then(Value::as_u64);
        if let (Some(unit), Some(level)) = (unit, level) {
            if let (Some(font), Some(size)) = (unit.font.as_deref(), unit.size) {
                out.push(HeadingSite {
                    path: path.clone(),
                    unit: unit.id.clone(),
                    reading_order: unit.reading_order,
                    style: TypographyRegistry::style_key(font, size),
                    level,
                });
            }
        }
    }
    for (i, child) in node.content.iter().enumerate() {
        path.push(i);
        collect_headings(child, path, heading_type, units, out);
        path.pop();
    }
}

/// Make heading levels agree with heading typography across `root`.
///
/// Every `heading_type` node whose source unit carries a font and size
/// votes for its level. A heading outside the single most used level of
/// its style is moved to that level; when several levels tie and the
/// heading's own level is not the only winner, the heading is flagged for
/// review instead. Returns the registry that was built.
pub fn check_typography(
    root: &mut Node,
    units: &[ContentUnit],
    heading_type: &str,
    manifest: &mut ReviewManifest,
) -> TypographyRegistry {
    let by_id: HashMap<&str, &ContentUnit> = units.iter().map(|u| (u.id.as_str(), u)).collect();
    let mut sites = Vec::new();
    collect_headings(root, &mut Vec::new(), heading_type, &by_id, &mut sites);

    let mut registry = TypographyRegistry::default();
    for site in &sites {
        registry.observe(&site.style, site.level);
    }

    for site in sites {
        let dominant = registry.dominant(&site.style);
        if dominant == [site.level] {
            continue;
        }
        let Some(node) = root.at_mut(&site.path) else { continue };
        match dominant.as_slice() {
            [expected] => {
                info!(
                    "{}: heading level {} -> {} to match {}",
                    site.unit, site.level, expected, site.style
                );
                node.attrs.insert("level".to_string(), Value::from(*expected));
                manifest.relevelled.push(RepairEntry {
                    path: site.path,
                    parent: node.kind.clone(),
                    types: vec![node.kind.clone()],
                    detail: format!("level {} -> {} ({})", site.level, expected, site.style),
                });
            }
            _ => {
                warn!(
                    "{}: heading level {} is ambiguous for {} (levels {:?})",
                    site.unit, site.level, site.style, dominant
                );
                node.meta_mut().needs_review = true;
                manifest.needs_review.push(ReviewEntry {
                    unit: site.unit.clone(),
                    reading_order: site.reading_order,
                    reason: format!("heading style {} is used at levels {:?}", site.style, dominant),
                });
                manifest.diagnostics.push(Diagnostic::TypographyMismatch {
                    unit: site.unit,
                    style: site.style,
                    level: site.level,
                    candidates: dominant,
                });
            }
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::BBox;
    use crate::rules::tests::{styled, unit};
    use crate::schema::tests::fixture;

    fn placed(kind: &str, u: &ContentUnit) -> Node {
        let mut n = Node::new(kind).with_content(vec![Node::text(u.text.clone())]);
        n.meta_mut().source_unit = Some(u.id.clone());
        n
    }

    fn at(mut u: ContentUnit, id: &str, page: u32, y0: f64) -> ContentUnit {
        u.id = id.to_string();
        u.page = page;
        u.bbox = BBox::new(0.0, y0, 500.0, y0 + 20.0);
        u
    }

    fn heading(id: &str, level: u64, font: &str, size: f64) -> (Node, ContentUnit) {
        let mut u = styled("heading", id, font, size);
        u.id = id.to_string();
        let node = placed("heading", &u).with_attr("level", level);
        (node, u)
    }

    #[test]
    fn missing_image_goes_before_the_block_below_it() {
        let schema = fixture();
        let units = vec![
            at(unit("text", "Above"), "c:u0", 1, 100.0),
            at(unit("image", "Figure 1"), "c:u1", 1, 200.0),
            at(unit("text", "Below"), "c:u2", 1, 600.0),
            at(unit("text", "Next page"), "c:u3", 2, 50.0),
        ];
        let mut root = Node::new("doc").with_content(vec![
            placed("paragraph", &units[0]),
            placed("image", &units[1]).with_attr("src", "img/fig1.png"),
            placed("paragraph", &units[2]),
            placed("paragraph", &units[3]),
        ]);
        let style = vec![
            StyleEntry::image(1, BBox::new(0.0, 200.0, 500.0, 400.0), "img/fig1.png"),
            StyleEntry::image(1, BBox::new(0.0, 420.0, 500.0, 580.0), "img/fig2.png"),
        ];
        let mut manifest = ReviewManifest::default();
        manifest.filled.push(RepairEntry {
            path: vec![3],
            parent: "doc".into(),
            types: vec!["paragraph".into()],
            detail: String::new(),
        });

        let n = insert_images(&mut root, &units, &style, "image", &schema, &mut manifest);

        assert_eq!(n, 1);
        assert_eq!(
            root.child_types(),
            vec!["paragraph", "image", "image", "paragraph", "paragraph"]
        );
        assert_eq!(root.content[2].attrs["src"], "img/fig2.png");
        assert_eq!(root.content[2].attrs["alt"], "Image from page 1");
        assert_eq!(manifest.inserted_images.len(), 1);
        assert_eq!(manifest.inserted_images[0].path, vec![2]);
        assert_eq!(manifest.filled[0].path, vec![4]);
    }

    #[test]
    fn images_keep_page_order_and_trail_when_nothing_follows() {
        let schema = fixture();
        let units = vec![at(unit("text", "Only"), "c:u0", 1, 100.0)];
        let mut root = Node::new("doc").with_content(vec![placed("paragraph", &units[0])]);
        let style = vec![
            StyleEntry::image(3, BBox::new(0.0, 10.0, 100.0, 90.0), "p3.png"),
            StyleEntry::image(1, BBox::new(0.0, 300.0, 100.0, 390.0), "p1b.png"),
            StyleEntry::image(1, BBox::new(0.0, 10.0, 100.0, 90.0), "p1a.png"),
            StyleEntry::image(1, BBox::new(0.0, 10.0, 100.0, 90.0), "p1a.png"),
        ];
        let mut manifest = ReviewManifest::default();

        let n = insert_images(&mut root, &units, &style, "image", &schema, &mut manifest);

        assert_eq!(n, 3);
        let srcs: Vec<_> = root
            .content
            .iter()
            .map(|c| c.attrs.get("src").and_then(Value::as_str).unwrap_or("-"))
            .collect();
        assert_eq!(srcs, vec!["p1a.png", "-", "p1b.png", "p3.png"]);
    }

    #[test]
    fn no_image_type_means_no_insertion() {
        let schema = SchemaRegistry::from_json(
            r#"{"topNode": "doc", "nodes": {
                "doc": {"content": "paragraph+"},
                "paragraph": {"content": "text*"},
                "text": {}
            }}"#,
        )
        .unwrap();
        let mut root = Node::new("doc").with_content(vec![Node::new("paragraph")]);
        let style = vec![StyleEntry::image(1, BBox::default(), "x.png")];
        let mut manifest = ReviewManifest::default();
        assert_eq!(insert_images(&mut root, &[], &style, "image", &schema, &mut manifest), 0);
        assert_eq!(root.content.len(), 1);
    }

    #[test]
    fn majority_level_wins_for_a_heading_style() {
        let (h1, u1) = heading("c:u0", 2, "Georgia", 18.0);
        let (h2, u2) = heading("c:u1", 2, "georgia", 18.0);
        let (h3, u3) = heading("c:u2", 3, "Georgia", 18.0);
        let (h4, u4) = heading("c:u3", 1, "Georgia", 24.0);
        let mut root = Node::new("doc").with_content(vec![h4, h1, h2, h3]);
        let mut manifest = ReviewManifest::default();

        let registry = check_typography(&mut root, &[u1, u2, u3, u4], "heading", &mut manifest);

        assert_eq!(registry.dominant("georgia@18.0"), vec![2]);
        assert_eq!(root.content[3].attrs["level"], 2);
        assert_eq!(root.content[0].attrs["level"], 1);
        assert_eq!(manifest.relevelled.len(), 1);
        assert_eq!(manifest.relevelled[0].path, vec![3]);
        assert!(manifest.needs_review.is_empty());
    }

    #[test]
    fn tied_levels_are_flagged_not_rewritten() {
        let (h1, u1) = heading("c:u0", 1, "Sans", 16.0);
        let (h2, u2) = heading("c:u1", 2, "Sans", 16.0);
        let mut root = Node::new("doc").with_content(vec![h1, h2]);
        let mut manifest = ReviewManifest::default();

        check_typography(&mut root, &[u1, u2], "heading", &mut manifest);

        assert_eq!(root.content[0].attrs["level"], 1);
        assert_eq!(root.content[1].attrs["level"], 2);
        assert!(root.content.iter().all(Node::needs_review));
        assert_eq!(manifest.needs_review.len(), 2);
        assert!(manifest.relevelled.is_empty());
        assert!(matches!(
            &manifest.diagnostics[0],
            Diagnostic::TypographyMismatch { candidates, .. } if candidates == &vec![1, 2]
        ));
    }

    #[test]
    fn unstyled_headings_do_not_vote() {
        let mut u = unit("heading", "Plain");
        u.id = "c:u0".into();
        let mut root = Node::new("doc").with_content(vec![placed("heading", &u).with_attr("level", 4)]);
        let mut manifest = ReviewManifest::default();
        let registry = check_typography(&mut root, &[u], "heading", &mut manifest);
        assert!(registry.headings.is_empty());
        assert_eq!(root.content[0].attrs["level"], 4);
    }
}
