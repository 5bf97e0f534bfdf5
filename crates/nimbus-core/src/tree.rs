//! Arena of nodes addressed by handle
//!
//! The listing arrives as an unordered flat list. Nodes are stored by handle,
//! parents are handle lookups (never owning pointers), and the child index is
//! built in one pass after loading. That pass also classifies every node as
//! rooted, orphaned (an ancestor is missing) or cyclic, so a corrupt listing
//! can never send a parent walk into an endless loop.

use std::collections::{HashMap, HashSet};

use crate::error::{NimbusError, NimbusResult};
use crate::types::{Node, NodeHandle, NodeKind};

/// Problems found while indexing a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
    /// Nodes whose own parent handle is not in the listing
    pub orphans: Vec<NodeHandle>,
    /// Nodes that sit on a parent cycle
    pub cyclic: Vec<NodeHandle>,
    /// Nodes that cannot reach a parentless node (orphans, cycles and
    /// everything beneath them)
    pub unreachable: Vec<NodeHandle>,
    /// Handles listed more than once; the last occurrence wins
    pub duplicates: Vec<NodeHandle>,
}

impl TreeReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
            && self.cyclic.is_empty()
            && self.unreachable.is_empty()
            && self.duplicates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reach {
    Rooted,
    Detached,
    Cyclic,
}

#[derive(Debug, Default)]
pub struct NodeTree {
    nodes: HashMap<NodeHandle, Node>,
    children: HashMap<NodeHandle, Vec<NodeHandle>>,
    tops: Vec<NodeHandle>,
    report: TreeReport,
}

impl NodeTree {
    /// Index an unordered listing. Inconsistencies are recorded in the
    /// report rather than rejected.
    pub fn build(listing: impl IntoIterator<Item = Node>) -> Self {
        let mut nodes = HashMap::new();
        let mut report = TreeReport::default();

        for node in listing {
            if let Some(previous) = nodes.insert(node.handle.clone(), node) {
                report.duplicates.push(previous.handle);
            }
        }

        let reach = classify(&nodes, &mut report);

        let mut children: HashMap<NodeHandle, Vec<NodeHandle>> = HashMap::new();
        let mut tops = Vec::new();
        for node in nodes.values() {
            match &node.parent {
                Some(parent) if nodes.contains_key(parent) => {
                    children
                        .entry(parent.clone())
                        .or_default()
                        .push(node.handle.clone());
                }
                // Parentless nodes and orphans are both entry points
                _ => tops.push(node.handle.clone()),
            }
        }
        for list in children.values_mut() {
            list.sort();
        }
        tops.sort();

        report.unreachable = reach
            .into_iter()
            .filter(|(_, r)| *r != Reach::Rooted)
            .map(|(h, _)| h)
            .collect();
        report.orphans.sort();
        report.cyclic.sort();
        report.unreachable.sort();

        if !report.is_clean() {
            tracing::warn!(
                orphans = report.orphans.len(),
                cyclic = report.cyclic.len(),
                duplicates = report.duplicates.len(),
                "node listing is inconsistent"
            );
        }
        tracing::debug!(nodes = nodes.len(), tops = tops.len(), "indexed node tree");

        Self {
            nodes,
            children,
            tops,
            report,
        }
    }

    /// Like [`NodeTree::build`], but a parent cycle is an error.
    ///
    /// Orphans are tolerated: incoming shares legitimately reference parents
    /// that belong to another account's tree.
    pub fn build_strict(listing: impl IntoIterator<Item = Node>) -> NimbusResult<Self> {
        let tree = Self::build(listing);
        if !tree.report.cyclic.is_empty() {
            return Err(NimbusError::TreeInconsistent(format!(
                "parent cycle through {} node(s), first {}",
                tree.report.cyclic.len(),
                tree.report.cyclic[0]
            )));
        }
        Ok(tree)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn report(&self) -> &TreeReport {
        &self.report
    }

    pub fn get(&self, handle: &NodeHandle) -> Option<&Node> {
        self.nodes.get(handle)
    }

    pub fn parent(&self, handle: &NodeHandle) -> Option<&Node> {
        self.get(handle)
            .and_then(|n| n.parent.as_ref())
            .and_then(|p| self.nodes.get(p))
    }

    pub fn children(&self, handle: &NodeHandle) -> impl Iterator<Item = &Node> {
        self.children
            .get(handle)
            .into_iter()
            .flatten()
            .filter_map(|h| self.nodes.get(h))
    }

    /// Entry points: nodes without a parent, plus orphans.
    pub fn tops(&self) -> impl Iterator<Item = &Node> {
        self.tops.iter().filter_map(|h| self.nodes.get(h))
    }

    /// The first top-level container of the given kind (root, inbox, trash).
    pub fn container(&self, kind: NodeKind) -> Option<&Node> {
        self.tops().find(|n| n.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Walk the parent chain upwards, nearest first. Bounded by the arena
    /// size, so it terminates even on cyclic input.
    pub fn ancestors<'a>(&'a self, handle: &NodeHandle) -> impl Iterator<Item = &'a Node> + 'a {
        let mut current = self.parent(handle);
        let mut remaining = self.nodes.len();
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            let node = current?;
            current = node.parent.as_ref().and_then(|p| self.nodes.get(p));
            Some(node)
        })
    }

    pub fn is_ancestor(&self, ancestor: &NodeHandle, node: &NodeHandle) -> bool {
        self.ancestors(node).any(|n| &n.handle == ancestor)
    }

    /// Whether the node sits on a parent cycle.
    pub fn is_cyclic(&self, handle: &NodeHandle) -> bool {
        self.report.cyclic.binary_search(handle).is_ok()
    }
}

/// Follow each node's parent chain once, memoizing the outcome for every
/// node on the walked path.
fn classify(
    nodes: &HashMap<NodeHandle, Node>,
    report: &mut TreeReport,
) -> HashMap<NodeHandle, Reach> {
    let mut reach: HashMap<NodeHandle, Reach> = HashMap::with_capacity(nodes.len());

    for start in nodes.keys() {
        if reach.contains_key(start) {
            continue;
        }

        let mut path: Vec<&NodeHandle> = Vec::new();
        let mut on_path: HashSet<&NodeHandle> = HashSet::new();
        let mut current = start;

        let outcome = loop {
            if let Some(known) = reach.get(current) {
                // Whatever sits above a cycle member is detached, not cyclic
                break if *known == Reach::Cyclic {
                    Reach::Detached
                } else {
                    *known
                };
            }
            if !on_path.insert(current) {
                let cycle_start = path.iter().position(|h| *h == current).unwrap_or(0);
                for member in path.drain(cycle_start..) {
                    report.cyclic.push(member.clone());
                    reach.insert(member.clone(), Reach::Cyclic);
                }
                break Reach::Detached;
            }
            path.push(current);

            match nodes.get(current).and_then(|n| n.parent.as_ref()) {
                None => break Reach::Rooted,
                Some(parent) if !nodes.contains_key(parent) => {
                    report.orphans.push(current.clone());
                    break Reach::Detached;
                }
                Some(parent) => current = parent,
            }
        };

        for handle in path {
            reach.insert(handle.clone(), outcome);
        }
    }

    reach
}
