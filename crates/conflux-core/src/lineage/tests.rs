//! Unit tests for the provenance DAG.

use std::time::SystemTime;

use serde_json::json;

use super::*;
use crate::msg::Message;

fn ids(n: usize) -> Vec<MessageId> {
    (0..n).map(|_| MessageId::new()).collect()
}

fn sorted(mut v: Vec<MessageId>) -> Vec<String> {
    v.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    v.into_iter().map(|id| id.to_string()).collect()
}

#[test]
fn roots_and_edges() {
    let mut dag = LineageDag::new();
    let [root, child] = &ids(2)[..] else { unreachable!() };

    dag.add_edge(None, root);
    dag.add_edge(Some(root), child);

    assert!(dag.has_node(root));
    assert!(dag.has_node(child));
    assert_eq!(dag.node_count(), 2);
    assert!(!dag.is_merge_node(root));
}

#[test]
#[should_panic(expected = "already declared")]
fn declaring_a_root_twice_panics() {
    let mut dag = LineageDag::new();
    let id = MessageId::new();
    dag.add_edge(None, &id);
    dag.add_edge(None, &id);
}

#[test]
#[should_panic(expected = "already has a parent")]
fn second_parent_without_merge_node_panics() {
    let mut dag = LineageDag::new();
    let [a, b, child] = &ids(3)[..] else { unreachable!() };
    dag.add_edge(None, a);
    dag.add_edge(None, b);
    dag.add_edge(Some(a), child);
    dag.add_edge(Some(b), child);
}

#[test]
#[should_panic(expected = "already exists")]
fn duplicate_edge_panics_in_debug_mode() {
    let mut dag = LineageDag::new().with_debug();
    let [parent, child] = &ids(2)[..] else { unreachable!() };
    dag.add_edge(None, parent);
    dag.add_edge(Some(parent), child);
    dag.add_edge(Some(parent), child);
}

#[test]
fn lineage_excludes_siblings() {
    // root -> {a, b}; a -> a1. Lineage of a is {a, root, a1}: b is
    // reachable only as a sibling and must not appear.
    let mut dag = LineageDag::new();
    let [root, a, b, a1] = &ids(4)[..] else { unreachable!() };
    dag.add_edge(None, root);
    dag.add_edge(Some(root), a);
    dag.add_edge(Some(root), b);
    dag.add_edge(Some(a), a1);

    let lineage = dag.lineage(a);
    assert_eq!(
        sorted(lineage),
        sorted(vec![a.clone(), root.clone(), a1.clone()])
    );
}

#[test]
fn lineage_is_closed_under_ancestors_and_descendants() {
    let mut dag = LineageDag::new();
    let [r, x, y, z] = &ids(4)[..] else { unreachable!() };
    dag.add_edge(None, r);
    dag.add_edge(Some(r), x);
    dag.add_edge(Some(x), y);
    dag.add_edge(Some(y), z);

    // Querying from the middle reaches both ends of the chain.
    assert_eq!(
        sorted(dag.lineage(y)),
        sorted(vec![r.clone(), x.clone(), y.clone(), z.clone()])
    );
}

#[test]
#[should_panic(expected = "unknown node")]
fn lineage_of_unknown_node_panics() {
    let dag = LineageDag::new();
    let _ = dag.lineage(&MessageId::new());
}

#[test]
fn merge_node_groups_parents() {
    let mut dag = LineageDag::new();
    let [a, b, merge, child] = &ids(4)[..] else { unreachable!() };
    dag.add_edge(None, a);
    dag.add_edge(None, b);
    dag.create_merge_node(&[a.clone(), b.clone()], merge);
    dag.add_edge(Some(merge), child);

    assert!(dag.is_merge_node(merge));
    // Lineage of the child climbs through the merge node to both parents.
    assert_eq!(
        sorted(dag.lineage(child)),
        sorted(vec![a.clone(), b.clone(), merge.clone(), child.clone()])
    );
}

#[test]
fn merge_node_creation_is_idempotent() {
    let mut dag = LineageDag::new().with_debug();
    let [a, b, merge] = &ids(3)[..] else { unreachable!() };
    dag.add_edge(None, a);
    dag.add_edge(None, b);
    let parents = [a.clone(), b.clone()];
    dag.create_merge_node(&parents, merge);
    dag.create_merge_node(&parents, merge);
    assert_eq!(dag.node_count(), 3);
}

#[test]
#[should_panic(expected = "one level of merging")]
fn merge_of_merge_panics() {
    let mut dag = LineageDag::new();
    let [a, b, m1, m2] = &ids(4)[..] else { unreachable!() };
    dag.add_edge(None, a);
    dag.add_edge(None, b);
    dag.create_merge_node(&[a.clone()], m1);
    dag.create_merge_node(&[m1.clone(), b.clone()], m2);
}

#[test]
#[should_panic(expected = "does not exist")]
fn merge_with_unknown_parent_panics() {
    let mut dag = LineageDag::new();
    let merge = MessageId::new();
    dag.create_merge_node(&[MessageId::new()], &merge);
}

#[test]
fn one_level_merge_invariant_holds() {
    let mut dag = LineageDag::new();
    let [a, b, c, merge, child] = &ids(5)[..] else { unreachable!() };
    for id in [a, b, c] {
        dag.add_edge(None, id);
    }
    dag.create_merge_node(&[a.clone(), b.clone(), c.clone()], merge);
    dag.add_edge(Some(merge), child);

    // Non-merge nodes have at most one parent; merge parents are real.
    for id in [a, b, c, child] {
        assert!(!dag.is_merge_node(id));
    }
    assert!(dag.is_merge_node(merge));
}

#[test]
fn root_ancestors_walks_up_only() {
    let mut dag = LineageDag::new();
    let [r1, r2, merge, child, grandchild] = &ids(5)[..] else {
        unreachable!()
    };
    dag.add_edge(None, r1);
    dag.add_edge(None, r2);
    dag.create_merge_node(&[r1.clone(), r2.clone()], merge);
    dag.add_edge(Some(merge), child);
    dag.add_edge(Some(child), grandchild);

    let roots = dag.root_ancestors(&[grandchild.clone()]);
    assert_eq!(sorted(roots), sorted(vec![r1.clone(), r2.clone()]));

    // Roots are deduplicated across query ids.
    let roots = dag.root_ancestors(&[child.clone(), grandchild.clone()]);
    assert_eq!(sorted(roots), sorted(vec![r1.clone(), r2.clone()]));
}

#[test]
fn apply_folds_send_and_merge_events() {
    let mut dag = LineageDag::new();
    let root = Message::new(json!(1));
    let child = root.child(json!(2));

    dag.apply(&TraceEvent::Send {
        time: SystemTime::now(),
        parent: None,
        msg: root.clone(),
    });
    dag.apply(&TraceEvent::Send {
        time: SystemTime::now(),
        parent: Some(root.id().clone()),
        msg: child.clone(),
    });
    dag.apply(&TraceEvent::Recv {
        time: SystemTime::now(),
        id: child.id().clone(),
    });

    let merge = MessageId::new();
    dag.apply(&TraceEvent::Merge {
        time: SystemTime::now(),
        parents: vec![child.id().clone()],
        id: merge.clone(),
    });

    assert!(dag.is_merge_node(&merge));
    assert_eq!(
        sorted(dag.lineage(root.id())),
        sorted(vec![root.id().clone(), child.id().clone(), merge])
    );
}
