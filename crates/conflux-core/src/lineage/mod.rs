//! Append-only provenance DAG over message ids.
//!
//! Messages mostly form a tree (each child derived from one parent, with
//! structural sharing), but a stage may mint a *merge node* grouping
//! several real messages, which then acts as the single parent of further
//! derivations. Only one level of merging is allowed: a merge node's
//! parents are never themselves merge nodes. That restriction is what
//! keeps the trace tree reconstructible from observed stage outputs alone.
//!
//! The DAG is single-writer by design (the tracer folds trace events into
//! it); it is not internally synchronised.

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::msg::MessageId;
use crate::stage::TraceEvent;

#[cfg(test)]
mod tests;

#[derive(Debug, Default)]
struct Node {
    parents: SmallVec<[MessageId; 1]>,
    children: SmallVec<[MessageId; 2]>,
    merge: bool,
}

/// Append-only DAG of message ids with optional merge nodes.
#[derive(Debug, Default)]
pub struct LineageDag {
    nodes: FxHashMap<MessageId, Node>,
    debug: bool,
}

impl LineageDag {
    /// Creates an empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables expensive assertions (duplicate-edge and merge-set checks).
    #[must_use]
    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Records a parent→child edge, creating nodes on demand. `None`
    /// declares `child` a root.
    ///
    /// The argument order is canonical: parent first, child second.
    ///
    /// # Panics
    ///
    /// Panics if a root is declared twice for the same id, if a non-merge
    /// child would end up with a second parent, or (in debug mode) if the
    /// edge already exists.
    pub fn add_edge(&mut self, parent: Option<&MessageId>, child: &MessageId) {
        let existed = self.nodes.contains_key(child);
        self.nodes.entry(child.clone()).or_default();

        let Some(parent) = parent else {
            assert!(!existed, "root {child} already declared");
            return;
        };

        if self.debug {
            assert!(
                !self.has_edge(parent, child),
                "edge {parent} -> {child} already exists"
            );
        }

        let Some(child_node) = self.nodes.get_mut(child) else {
            unreachable!("child node was just created");
        };
        assert!(
            child_node.merge || child_node.parents.is_empty(),
            "node {child} already has a parent; group parents with a merge node"
        );
        child_node.parents.push(parent.clone());

        self.nodes
            .entry(parent.clone())
            .or_default()
            .children
            .push(child.clone());
    }

    /// Mints the merge node `id` grouping `parents`. Idempotent: minting
    /// the same merge node again is a no-op (in debug mode the parent set
    /// is verified to be unchanged).
    ///
    /// # Panics
    ///
    /// Panics if `parents` is empty, if any parent does not exist, or if a
    /// parent is itself a merge node (one-level merge invariant).
    pub fn create_merge_node(&mut self, parents: &[MessageId], id: &MessageId) {
        assert!(!parents.is_empty(), "merge node {id} needs at least one parent");

        if let Some(existing) = self.nodes.get(id) {
            if self.debug {
                let expected: FxHashSet<&MessageId> = parents.iter().collect();
                let actual: FxHashSet<&MessageId> = existing.parents.iter().collect();
                assert_eq!(
                    actual, expected,
                    "merge node {id} recreated with a different parent set"
                );
            }
            return;
        }

        for parent in parents {
            let Some(node) = self.nodes.get(parent) else {
                panic!("merge parent {parent} does not exist");
            };
            assert!(
                !node.merge,
                "merge parent {parent} is itself a merge node; only one level of merging is allowed"
            );
        }

        self.nodes.entry(id.clone()).or_default().merge = true;
        for parent in parents {
            self.add_edge(Some(parent), id);
        }
    }

    /// Returns `true` if `id` has been recorded.
    #[must_use]
    pub fn has_node(&self, id: &MessageId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Returns `true` if `id` is a merge node.
    #[must_use]
    pub fn is_merge_node(&self, id: &MessageId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.merge)
    }

    /// Number of recorded nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `id` plus every ancestor and every descendant, depth first.
    /// Siblings (other children of an ancestor) are not included.
    ///
    /// # Panics
    ///
    /// Panics if `id` has not been recorded.
    #[must_use]
    pub fn lineage(&self, id: &MessageId) -> Vec<MessageId> {
        let Some(node) = self.nodes.get(id) else {
            panic!("lineage query for unknown node {id}");
        };

        let mut visited = FxHashSet::default();
        visited.insert(id.clone());
        let mut result = vec![id.clone()];

        self.traverse(&node.parents, &mut visited, &mut result, parents_of, None);
        self.traverse(&node.children, &mut visited, &mut result, children_of, None);
        result
    }

    /// Returns every parentless ancestor of the given ids, deduplicated.
    ///
    /// Walks up only, which is cheaper than [`lineage`](Self::lineage)
    /// when only provenance roots are wanted.
    ///
    /// # Panics
    ///
    /// Panics if any of the ids has not been recorded.
    #[must_use]
    pub fn root_ancestors(&self, ids: &[MessageId]) -> Vec<MessageId> {
        let mut visited = FxHashSet::default();
        let mut result = Vec::new();
        let starts: Vec<MessageId> = ids
            .iter()
            .map(|id| {
                assert!(self.nodes.contains_key(id), "root query for unknown node {id}");
                id.clone()
            })
            .collect();
        self.traverse(
            &starts,
            &mut visited,
            &mut result,
            parents_of,
            Some(&|n: &Node| n.parents.is_empty()),
        );
        result
    }

    /// Folds a trace event into the DAG. `Send` records an edge (or a
    /// root); `Merge` mints a merge node; other events carry no lineage.
    ///
    /// This is the single-writer tracer hook: exactly one consumer of a
    /// flow's trace channel should apply events.
    pub fn apply(&mut self, event: &TraceEvent) {
        match event {
            TraceEvent::Send { parent, msg, .. } => {
                self.add_edge(parent.as_ref(), msg.id());
            }
            TraceEvent::Merge { parents, id, .. } => {
                self.create_merge_node(parents, id);
            }
            TraceEvent::Recv { .. } | TraceEvent::Succeeded { .. } | TraceEvent::Failed { .. } => {}
        }
    }

    /// Depth-first traversal from `starts` along `next`, appending visited
    /// ids to `result` (filtered by `include` when given).
    fn traverse(
        &self,
        starts: &[MessageId],
        visited: &mut FxHashSet<MessageId>,
        result: &mut Vec<MessageId>,
        next: fn(&Node) -> &[MessageId],
        include: Option<&dyn Fn(&Node) -> bool>,
    ) {
        let mut stack: Vec<MessageId> = Vec::new();
        for id in starts {
            if visited.insert(id.clone()) {
                stack.push(id.clone());
            }
        }
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if include.map_or(true, |f| f(node)) {
                result.push(id.clone());
            }
            for neighbor in next(node) {
                if visited.insert(neighbor.clone()) {
                    stack.push(neighbor.clone());
                }
            }
        }
    }

    /// Expensive edge-existence check used by debug-mode assertions.
    fn has_edge(&self, parent: &MessageId, child: &MessageId) -> bool {
        self.nodes
            .get(parent)
            .is_some_and(|n| n.children.contains(child))
            || self
                .nodes
                .get(child)
                .is_some_and(|n| n.parents.contains(parent))
    }
}

fn parents_of(node: &Node) -> &[MessageId] {
    &node.parents
}

fn children_of(node: &Node) -> &[MessageId] {
    &node.children
}
