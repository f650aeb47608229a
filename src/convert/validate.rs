//! Grammar validation and deterministic repair of assembled trees.
//!
//! Every node's child-type sequence is run through its content-expression
//! automaton, bottom-up. At the first child the automaton refuses, repair
//! tries in order:
//!
//! 1. **Rewrap**: move the maximal run of offending children into the first
//!    node type (descriptor order) that is permitted at that position and
//!    whose expression accepts the run. A defining node only shares a
//!    wrapper with siblings of its own type. Up to two wrapper levels are
//!    tried, so `table > paragraph` becomes
//!    `table > tableRow > tableCell > paragraph`.
//! 2. **Prefix**: insert the shortest sequence of minimal nodes after which
//!    the child is permitted (a `listItem` missing its lead paragraph).
//! 3. **Lift**: replace the child by its own children.
//!
//! A sequence that is valid so far but incomplete is completed with minimal
//! nodes. Marks the parent does not allow are stripped. Anything still
//! invalid is recorded as unresolved; nothing is dropped silently.

use crate::document::{Node, RepairEntry, ReviewManifest};
use crate::schema::{ContentMatcher, MatchState, NodeSpec, SchemaRegistry};

const MAX_FILL_DEPTH: usize = 8;

/// Check a tree without modifying it. Used on oracle proposals, which must
/// be valid as built.
pub fn check_strict(node: &Node, schema: &SchemaRegistry) -> Result<(), String> {
    let mut path = Vec::new();
    strict(node, schema, &mut path)
}

fn strict(node: &Node, schema: &SchemaRegistry, path: &mut Vec<usize>) -> Result<(), String> {
    if node.is_text() {
        if node.text.as_deref().map_or(true, str::is_empty) {
            return Err(format!("empty text node at {path:?}"));
        }
        if !node.content.is_empty() {
            return Err(format!("text node with children at {path:?}"));
        }
        return Ok(());
    }
    let spec = schema
        .node(&node.kind)
        .ok_or_else(|| format!("unknown node type '{}' at {path:?}", node.kind))?;

    if let Some(attr) = spec
        .required_attrs()
        .find(|a| node.attrs.get(*a).map_or(true, |v| v.is_null()))
    {
        return Err(format!("'{}' at {path:?} lacks required attribute '{attr}'", node.kind));
    }
    if let Some(attr) = node.attrs.keys().find(|a| spec.attr(a).is_none()) {
        return Err(format!("'{}' at {path:?} has undeclared attribute '{attr}'", node.kind));
    }
    let types = node.child_types();
    if let Some(i) = spec.matcher().first_mismatch(&types) {
        return Err(format!(
            "children {types:?} of '{}' at {path:?} violate '{}' at index {i}",
            node.kind,
            spec.content()
        ));
    }
    for (i, child) in node.content.iter().enumerate() {
        if let Some(mark) = child
            .marks
            .iter()
            .find(|m| schema.mark(&m.kind).is_none() || !spec.allows_mark(&m.kind))
        {
            return Err(format!(
                "mark '{}' is not allowed inside '{}' at {path:?}",
                mark.kind, node.kind
            ));
        }
        path.push(i);
        strict(child, schema, path)?;
        path.pop();
    }
    Ok(())
}

/// Repair `root` in place, recording every change in `manifest`.
pub fn repair(root: &mut Node, schema: &SchemaRegistry, manifest: &mut ReviewManifest) {
    let mut path = Vec::new();
    repair_node(root, &mut path, schema, manifest);
}

fn repair_node(
    node: &mut Node,
    path: &mut Vec<usize>,
    schema: &SchemaRegistry,
    manifest: &mut ReviewManifest,
) {
    for (i, child) in node.content.iter_mut().enumerate() {
        path.push(i);
        repair_node(child, path, schema, manifest);
        path.pop();
    }
    if node.is_text() {
        return;
    }
    let Some(spec) = schema.node(&node.kind) else {
        manifest.unresolved.push(entry(
            path,
            &node.kind,
            Vec::new(),
            "type is not defined by the schema",
        ));
        return;
    };
    strip_marks(node, spec, path, schema, manifest);
    fix_sequence(node, spec, path, schema, manifest);
}

fn entry(path: &[usize], parent: &str, types: Vec<String>, detail: impl Into<String>) -> RepairEntry {
    RepairEntry {
        path: path.to_vec(),
        parent: parent.to_string(),
        types,
        detail: detail.into(),
    }
}

fn strip_marks(
    node: &mut Node,
    spec: &NodeSpec,
    path: &[usize],
    schema: &SchemaRegistry,
    manifest: &mut ReviewManifest,
) {
    let mut stripped = Vec::new();
    for child in &mut node.content {
        child.marks.retain(|m| {
            let keep = schema.mark(&m.kind).is_some() && spec.allows_mark(&m.kind);
            if !keep {
                stripped.push(m.kind.clone());
            }
            keep
        });
    }
    if !stripped.is_empty() {
        stripped.sort();
        stripped.dedup();
        manifest
            .stripped_marks
            .push(entry(path, &node.kind, stripped, "marks not allowed here"));
    }
}

/// Types usable as filler: constructible without attributes and not text.
fn fillable(schema: &SchemaRegistry, ty: &str) -> bool {
    ty != "text" && schema.node(ty).is_some_and(NodeSpec::is_constructible)
}

/// Types usable as wrappers.
fn wrapper_candidate(spec: &NodeSpec, schema: &SchemaRegistry) -> bool {
    !spec.is_inline()
        && !spec.is_leaf()
        && spec.is_constructible()
        && spec.name() != "text"
        && spec.name() != schema.top_node()
}

/// The smallest valid node of type `ty`, or `None` if it needs attributes.
pub fn minimal_node(ty: &str, schema: &SchemaRegistry) -> Option<Node> {
    minimal(ty, schema, 0)
}

fn minimal(ty: &str, schema: &SchemaRegistry, depth: usize) -> Option<Node> {
    let spec = schema.node(ty).filter(|s| s.is_constructible())?;
    let mut node = Node::new(ty).with_attrs(spec.default_attrs());
    if !spec.is_leaf() && depth < MAX_FILL_DEPTH {
        let m = spec.matcher();
        let fill = m.shortest_completion(&m.start(), |t| fillable(schema, t))?;
        node.content = fill
            .iter()
            .map(|t| minimal(t, schema, depth + 1))
            .collect::<Option<Vec<_>>>()?;
    }
    node.meta_mut().repaired = true;
    Some(node)
}

fn state_after<S: AsRef<str>>(matcher: &ContentMatcher, types: &[S]) -> Option<MatchState> {
    types
        .iter()
        .try_fold(matcher.start(), |s, t| matcher.step(&s, t.as_ref()))
}

fn fix_sequence(
    node: &mut Node,
    spec: &NodeSpec,
    path: &mut Vec<usize>,
    schema: &SchemaRegistry,
    manifest: &mut ReviewManifest,
) {
    let matcher = spec.matcher();
    let budget = node.content.len() * 4 + 8;

    for _ in 0..budget {
        let types: Vec<String> = node.content.iter().map(|c| c.kind.clone()).collect();
        let Some(at) = matcher.first_mismatch(&types) else {
            return;
        };
        let Some(state) = state_after(matcher, &types[..at]) else {
            break;
        };

        if at == types.len() {
            let Some(fill) = matcher.shortest_completion(&state, |t| fillable(schema, t)) else {
                break;
            };
            let Some(nodes) = fill
                .iter()
                .map(|t| minimal_node(t, schema))
                .collect::<Option<Vec<_>>>()
            else {
                break;
            };
            node.content.extend(nodes);
            manifest
                .filled
                .push(entry(path, &node.kind, fill, "completed required children"));
            continue;
        }

        if try_rewrap(node, at, &state, spec, path, schema, manifest) {
            continue;
        }

        if let Some(prefix) = matcher.shortest_prefix_for(&state, &types[at], |t| fillable(schema, t)) {
            if let Some(nodes) = prefix
                .iter()
                .map(|t| minimal_node(t, schema))
                .collect::<Option<Vec<_>>>()
                .filter(|n| !n.is_empty())
            {
                node.content.splice(at..at, nodes);
                manifest.filled.push(entry(
                    path,
                    &node.kind,
                    prefix,
                    format!("inserted before '{}' at index {at}", types[at]),
                ));
                continue;
            }
        }

        if !node.content[at].is_text() && !node.content[at].content.is_empty() {
            let child = node.content.remove(at);
            let kind = child.kind;
            node.content.splice(at..at, child.content);
            manifest.lifted.push(entry(
                path,
                &node.kind,
                vec![kind],
                format!("children lifted into parent at index {at}"),
            ));
            continue;
        }
        break;
    }

    let types = node.child_types();
    if let Some(at) = matcher.first_mismatch(&types) {
        let detail = format!(
            "children do not satisfy '{}' at index {at}",
            spec.content()
        );
        let types = types.into_iter().map(str::to_string).collect();
        manifest.unresolved.push(entry(path, &node.kind, types, detail));
    }
}

/// End of the longest run from `at` that `wrapper` accepts as complete
/// content. The run stops at children the parent takes directly, and never
/// mixes a defining child with siblings of another type.
fn wrappable_run(
    wrapper: &ContentMatcher,
    children: &[Node],
    at: usize,
    parent: &ContentMatcher,
    parent_state: &MatchState,
    schema: &SchemaRegistry,
) -> Option<usize> {
    let defining = |n: &Node| schema.node(&n.kind).is_some_and(NodeSpec::is_defining);
    let mut state = wrapper.start();
    let mut best = None;
    for (j, child) in children.iter().enumerate().skip(at) {
        let mixes = child.kind != children[at].kind && (defining(&children[at]) || defining(child));
        if j > at && (mixes || parent.step(parent_state, &child.kind).is_some()) {
            break;
        }
        match wrapper.step(&state, &child.kind) {
            Some(next) => state = next,
            None => break,
        }
        if wrapper.accepts(&state) {
            best = Some(j + 1);
        }
    }
    best
}

fn wrap(spec: &NodeSpec, content: Vec<Node>) -> Node {
    let mut node = Node::new(spec.name())
        .with_attrs(spec.default_attrs())
        .with_content(content);
    node.meta_mut().repaired = true;
    node
}

#[allow(clippy::too_many_arguments)]
fn try_rewrap(
    node: &mut Node,
    at: usize,
    state: &MatchState,
    spec: &NodeSpec,
    path: &mut Vec<usize>,
    schema: &SchemaRegistry,
    manifest: &mut ReviewManifest,
) -> bool {
    let parent = spec.matcher();
    let permitted: Vec<&NodeSpec> = schema
        .nodes()
        .filter(|c| wrapper_candidate(c, schema) && parent.step(state, c.name()).is_some())
        .collect();

    // One level.
    let single = permitted.iter().find_map(|c| {
        wrappable_run(c.matcher(), &node.content, at, parent, state, schema).map(|end| (*c, end))
    });
    if let Some((wrapper, end)) = single {
        let run: Vec<Node> = node.content.drain(at..end).collect();
        node.content.insert(at, wrap(wrapper, run));
        manifest.rewrapped.push(entry(
            path,
            &node.kind,
            vec![wrapper.name().to_string()],
            format!("wrapped {} child(ren) at index {at}", end - at),
        ));
        path.push(at);
        repair_node(&mut node.content[at], path, schema, manifest);
        path.pop();
        return true;
    }

    // Two levels: outer is permitted here and accepts exactly one inner.
    for outer in &permitted {
        let om = outer.matcher();
        let Some(after_inner) = schema
            .nodes()
            .filter(|i| wrapper_candidate(i, schema) && i.name() != outer.name())
            .find_map(|inner| {
                let s = om.step(&om.start(), inner.name())?;
                if !om.accepts(&s) {
                    return None;
                }
                wrappable_run(inner.matcher(), &node.content, at, parent, state, schema)
                    .map(|end| (inner, end))
            })
        else {
            continue;
        };
        let (inner, end) = after_inner;
        let run: Vec<Node> = node.content.drain(at..end).collect();
        node.content.insert(at, wrap(outer, vec![wrap(inner, run)]));
        manifest.rewrapped.push(entry(
            path,
            &node.kind,
            vec![outer.name().to_string(), inner.name().to_string()],
            format!("wrapped {} child(ren) at index {at}", end - at),
        ));
        path.push(at);
        repair_node(&mut node.content[at], path, schema, manifest);
        path.pop();
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Mark;
    use crate::schema::tests::fixture;

    fn para(text: &str) -> Node {
        Node::new("paragraph").with_content(vec![Node::text(text)])
    }

    fn repaired(mut root: Node) -> (Node, ReviewManifest) {
        let schema = fixture();
        let mut manifest = ReviewManifest::default();
        repair(&mut root, &schema, &mut manifest);
        (root, manifest)
    }

    #[test]
    fn valid_tree_is_untouched() {
        let schema = fixture();
        let tree = Node::new("doc").with_content(vec![para("a"), para("b")]);
        assert!(check_strict(&tree, &schema).is_ok());
        let (out, manifest) = repaired(tree.clone());
        assert_eq!(out, tree);
        assert_eq!(manifest.repair_count(), 0);
        assert!(manifest.unresolved.is_empty());
    }

    #[test]
    fn list_items_under_doc_are_wrapped_in_one_list() {
        let li = |t: &str| Node::new("listItem").with_content(vec![para(t)]);
        let tree = Node::new("doc").with_content(vec![para("x"), li("a"), li("b"), para("y")]);
        let (out, manifest) = repaired(tree);
        assert_eq!(out.child_types(), vec!["paragraph", "bulletList", "paragraph"]);
        assert_eq!(out.content[1].content.len(), 2);
        assert_eq!(manifest.rewrapped.len(), 1);
        assert_eq!(manifest.rewrapped[0].types, vec!["bulletList".to_string()]);
        assert!(check_strict(&out, &fixture()).is_ok());
    }

    #[test]
    fn bare_text_under_doc_gets_text_container() {
        let tree = Node::new("doc").with_content(vec![Node::text("loose"), Node::text(" words")]);
        let (out, _) = repaired(tree);
        assert_eq!(out.child_types(), vec!["paragraph"]);
        assert_eq!(out.content[0].content.len(), 2);
    }

    #[test]
    fn defining_nodes_do_not_share_wrappers() {
        let h = Node::new("heading").with_attr("level", 1).with_content(vec![Node::text("h")]);
        let tree = Node::new("doc").with_content(vec![Node::new("table").with_content(vec![h, para("p")])]);
        let (out, manifest) = repaired(tree);
        let table = &out.content[0];
        assert_eq!(table.child_types(), vec!["tableRow", "tableRow"]);
        assert_eq!(table.at(&[0, 0]).unwrap().child_types(), vec!["heading"]);
        assert_eq!(table.at(&[1, 0]).unwrap().child_types(), vec!["paragraph"]);
        assert_eq!(manifest.rewrapped.len(), 2);
        assert!(check_strict(&out, &fixture()).is_ok());
    }

    #[test]
    fn paragraph_in_table_gets_two_wrappers() {
        let tree = Node::new("doc").with_content(vec![Node::new("table").with_content(vec![para("cell")])]);
        let (out, manifest) = repaired(tree);
        let table = &out.content[0];
        assert_eq!(table.child_types(), vec!["tableRow"]);
        assert_eq!(table.content[0].child_types(), vec!["tableCell"]);
        assert_eq!(table.text_content(), "cell");
        assert_eq!(
            manifest.rewrapped[0].types,
            vec!["tableRow".to_string(), "tableCell".to_string()]
        );
        assert!(check_strict(&out, &fixture()).is_ok());
    }

    #[test]
    fn missing_lead_is_inserted() {
        let tree = Node::new("doc").with_content(vec![Node::new("bulletList").with_content(vec![
            Node::new("listItem").with_content(vec![Node::new("blockquote").with_content(vec![para("q")])]),
        ])]);
        let (out, manifest) = repaired(tree);
        let item = out.at(&[0, 0]).unwrap();
        assert_eq!(item.child_types(), vec!["paragraph", "blockquote"]);
        assert_eq!(manifest.filled[0].path, vec![0, 0]);
        assert!(check_strict(&out, &fixture()).is_ok());
    }

    #[test]
    fn empty_required_content_is_filled() {
        let tree = Node::new("doc");
        let (out, manifest) = repaired(tree);
        assert_eq!(out.child_types(), vec!["paragraph"]);
        assert_eq!(manifest.filled[0].types, vec!["paragraph".to_string()]);
        assert!(out.content[0].meta.as_ref().unwrap().repaired);
    }

    #[test]
    fn disallowed_marks_are_stripped() {
        let tree = Node::new("doc").with_content(vec![Node::new("image")
            .with_attr("src", "a.png")
            .with_mark(Mark::new("bold"))]);
        let (out, manifest) = repaired(tree);
        assert!(out.content[0].marks.is_empty());
        assert_eq!(manifest.stripped_marks[0].types, vec!["bold".to_string()]);
    }

    #[test]
    fn unplaceable_node_is_lifted() {
        // `note` is only valid inside a callout, after its lead paragraph
        let tree = Node::new("doc").with_content(vec![
            para("a"),
            Node::new("note").with_content(vec![Node::text("n")]),
        ]);
        let (out, manifest) = repaired(tree);
        assert_eq!(manifest.lifted[0].types, vec!["note".to_string()]);
        assert_eq!(out.child_types(), vec!["paragraph", "paragraph"]);
        assert!(check_strict(&out, &fixture()).is_ok());
    }

    #[test]
    fn unrepairable_is_recorded() {
        // unknown node type with no children cannot be placed or lifted
        let tree = Node::new("doc").with_content(vec![Node::new("mystery")]);
        let (_, manifest) = repaired(tree);
        assert!(!manifest.unresolved.is_empty());
    }

    #[test]
    fn strict_reports_attrs_and_marks() {
        let schema = fixture();
        let img = Node::new("doc").with_content(vec![Node::new("image")]);
        assert!(check_strict(&img, &schema).unwrap_err().contains("src"));

        let extra = Node::new("doc").with_content(vec![para("a").with_attr("color", "red")]);
        assert!(check_strict(&extra, &schema).unwrap_err().contains("color"));

        let marked = Node::new("doc").with_content(vec![Node::new("paragraph")
            .with_content(vec![Node::text("a").with_mark(Mark::new("strike"))])]);
        assert!(check_strict(&marked, &schema).is_err());
    }

    #[test]
    fn minimal_nodes_are_valid() {
        let schema = fixture();
        for ty in ["paragraph", "bulletList", "table", "callout"] {
            let n = minimal_node(ty, &schema).unwrap();
            assert!(check_strict(&n, &schema).is_ok(), "{ty}: {n:?}");
        }
        assert!(minimal_node("image", &schema).is_none());
    }
}
