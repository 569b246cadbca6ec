//! Topological ordering of resources and per-resource action plans

use crate::action::Action;
use crate::definition::ResourceDefinition;
use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceHandle};
use crate::types::Phase;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;

/// Order nodes so every node comes after all of its dependencies.
///
/// `deps[i]` holds the nodes `i` depends on. Among nodes that are ready at
/// the same time the lowest index goes first, so the result is a pure
/// function of the input. On a cycle the error holds the nodes of one cycle,
/// each depending on the next and the last on the first.
pub fn topological_order(deps: &[BTreeSet<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let count = deps.len();
    let mut pending: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut dependents = vec![Vec::new(); count];
    for (node, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(node, _)| Reverse(node))
        .collect();

    let mut order = Vec::with_capacity(count);
    let mut placed = vec![false; count];
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        placed[node] = true;
        for &dependent in &dependents[node] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() == count {
        return Ok(order);
    }
    Err(find_cycle(deps, &placed))
}

/// Walk unplaced dependencies from the first unplaced node until one repeats.
///
/// Every unplaced node has at least one unplaced dependency, so the walk
/// always closes a cycle.
fn find_cycle(deps: &[BTreeSet<usize>], placed: &[bool]) -> Vec<usize> {
    let Some(start) = placed.iter().position(|p| !p) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen_at = BTreeMap::from([(start, 0usize)]);
    let mut node = start;
    loop {
        let Some(&next) = deps[node].iter().find(|d| !placed[**d]) else {
            return path;
        };
        if let Some(&index) = seen_at.get(&next) {
            return path.split_off(index);
        }
        seen_at.insert(next, path.len());
        path.push(next);
        node = next;
    }
}

/// Order resources by their resolved dependencies
pub(crate) fn sort_resources(resources: &[Arc<Resource>]) -> Result<Vec<ResourceHandle>> {
    let deps: Vec<BTreeSet<usize>> = resources
        .iter()
        .map(|r| r.read().dependencies.iter().map(|h| h.0).collect())
        .collect();

    topological_order(&deps)
        .map(|order| order.into_iter().map(ResourceHandle).collect())
        .map_err(|cycle| cycle_error(resources, &cycle))
}

/// Order resources for the post-children passes
pub(crate) fn sort_post_children(
    resources: &[Arc<Resource>],
    order: &[ResourceHandle],
) -> Result<Vec<ResourceHandle>> {
    let parents: Vec<Option<ResourceHandle>> = resources.iter().map(|r| r.parent()).collect();
    let deps: Vec<BTreeSet<usize>> = resources
        .iter()
        .map(|r| r.dependencies().iter().map(|h| h.0).collect())
        .collect();

    post_children_order(order, &parents, &deps).map_err(|cycle| cycle_error(resources, &cycle))
}

/// Order for post-children passes: every resource after all of its
/// descendants and after its dependencies, ties following `order`.
///
/// Edges to a resource's own ancestors are replaced by the reverse
/// ancestor-after-descendant edges. On a cycle the error holds resource
/// indices as [`topological_order`] does.
pub(crate) fn post_children_order(
    order: &[ResourceHandle],
    parents: &[Option<ResourceHandle>],
    deps: &[BTreeSet<usize>],
) -> std::result::Result<Vec<ResourceHandle>, Vec<usize>> {
    let is_ancestor = |node: usize, candidate: usize| {
        let mut current = parents[node];
        while let Some(parent) = current {
            if parent.0 == candidate {
                return true;
            }
            current = parents[parent.0];
        }
        false
    };

    let mut position = vec![0; parents.len()];
    for (i, handle) in order.iter().enumerate() {
        position[handle.0] = i;
    }

    // nodes are positions in `order`, so ties keep execution order
    let mut post_deps = vec![BTreeSet::new(); order.len()];
    for (i, handle) in order.iter().enumerate() {
        for &dep in &deps[handle.0] {
            if !is_ancestor(handle.0, dep) {
                post_deps[i].insert(position[dep]);
            }
        }
        if let Some(parent) = parents[handle.0] {
            post_deps[position[parent.0]].insert(i);
        }
    }

    match topological_order(&post_deps) {
        Ok(sorted) => Ok(sorted.into_iter().map(|i| order[i]).collect()),
        Err(cycle) => Err(cycle.into_iter().map(|i| order[i].0).collect()),
    }
}

fn cycle_error(resources: &[Arc<Resource>], cycle: &[usize]) -> Error {
    let uids: Vec<&str> = cycle.iter().map(|i| resources[*i].uid()).collect();
    let first = uids.first().copied().unwrap_or_default();
    Error::dependency(
        first,
        format!("circular dependency: {} -> {}", uids.join(" -> "), first),
    )
}

/// Actions of one resource grouped by phase, each group sorted by order key
/// then declaration order.
#[derive(Debug, Clone, Default)]
pub(crate) struct ActionPlan {
    phases: BTreeMap<Phase, Vec<Action>>,
}

impl ActionPlan {
    pub(crate) fn new(definition: &ResourceDefinition) -> Self {
        let phases = Phase::ALL
            .iter()
            .map(|phase| {
                let actions = definition
                    .actions_for(*phase)
                    .into_iter()
                    .cloned()
                    .collect();
                (*phase, actions)
            })
            .collect();
        Self { phases }
    }

    pub(crate) fn actions(&self, phase: Phase) -> &[Action] {
        self.phases.get(&phase).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn graph(edges: &[(usize, usize)], count: usize) -> Vec<BTreeSet<usize>> {
        let mut deps = vec![BTreeSet::new(); count];
        for &(node, dep) in edges {
            deps[node].insert(dep);
        }
        deps
    }

    /// Random DAG: nodes are ranked by a shuffled labeling, edges only
    /// point from a higher rank to a lower one.
    fn arb_dag() -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
        (1usize..40).prop_flat_map(|count| {
            let labels = Just((0..count).collect::<Vec<_>>()).prop_shuffle();
            let edges = prop::collection::vec((0..count, 0..count), 0..count * 3);
            (labels, edges).prop_map(move |(labels, edges)| {
                let mut deps = vec![BTreeSet::new(); count];
                for (a, b) in edges {
                    if a > b {
                        deps[labels[a]].insert(labels[b]);
                    }
                }
                deps
            })
        })
    }

    /// A random DAG with one cycle threaded through some of its nodes
    fn arb_cyclic() -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
        arb_dag().prop_flat_map(|deps| {
            let count = deps.len();
            let nodes = Just((0..count).collect::<Vec<_>>()).prop_shuffle();
            (Just(deps), nodes, 1..=count).prop_map(|(mut deps, nodes, len)| {
                let cycle = &nodes[..len];
                for (i, &node) in cycle.iter().enumerate() {
                    deps[node].insert(cycle[(i + 1) % len]);
                }
                deps
            })
        })
    }

    proptest! {
        #[test]
        fn dependencies_come_first(deps in arb_dag()) {
            let order = topological_order(&deps).unwrap();
            prop_assert_eq!(order.len(), deps.len());
            let mut position = vec![0; deps.len()];
            for (i, node) in order.iter().enumerate() {
                position[*node] = i;
            }
            for (node, node_deps) in deps.iter().enumerate() {
                for dep in node_deps {
                    prop_assert!(position[*dep] < position[node], "{} placed before its dependency {}", node, dep);
                }
            }
        }

        #[test]
        fn sorting_is_deterministic(deps in arb_dag()) {
            prop_assert_eq!(topological_order(&deps), topological_order(&deps));
        }

        #[test]
        fn cycles_are_reported(deps in arb_cyclic()) {
            let cycle = topological_order(&deps).unwrap_err();
            prop_assert!(!cycle.is_empty());
            for (i, node) in cycle.iter().enumerate() {
                let next = cycle[(i + 1) % cycle.len()];
                prop_assert!(deps[*node].contains(&next), "{} -> {} is not an edge", node, next);
            }
        }
    }

    #[test]
    fn test_ties_follow_registration_order() {
        // 2 depends on 0; 1 and 0 are free
        let deps = graph(&[(2, 0)], 4);
        assert_eq!(topological_order(&deps).unwrap(), vec![0, 1, 2, 3]);

        let deps = graph(&[(0, 3)], 4);
        assert_eq!(topological_order(&deps).unwrap(), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let deps = graph(&[(1, 1)], 2);
        assert_eq!(topological_order(&deps).unwrap_err(), vec![1]);
    }

    #[test]
    fn test_cycle_excludes_tail() {
        // 0 -> 1 -> 2 -> 1
        let deps = graph(&[(0, 1), (1, 2), (2, 1)], 3);
        assert_eq!(topological_order(&deps).unwrap_err(), vec![1, 2]);
    }

    #[test]
    fn test_post_children_order_puts_descendants_first() {
        let h = ResourceHandle;
        // 0 root with children 1, 2; 1 has child 3 which also names 0; 4 root
        let parents = vec![None, Some(h(0)), Some(h(0)), Some(h(1)), None];
        let deps = graph(&[(1, 0), (2, 0), (3, 1), (3, 0)], 5);
        let order = vec![h(0), h(4), h(2), h(1), h(3)];
        assert_eq!(
            post_children_order(&order, &parents, &deps).unwrap(),
            vec![h(4), h(2), h(3), h(1), h(0)]
        );
    }

    #[test]
    fn test_post_children_order_respects_dependencies() {
        let h = ResourceHandle;
        // 0 root; 1 child of 0 depending on root 2
        let parents = vec![None, Some(h(0)), None];
        let deps = graph(&[(1, 0), (1, 2)], 3);
        let order = vec![h(0), h(2), h(1)];
        assert_eq!(
            post_children_order(&order, &parents, &deps).unwrap(),
            vec![h(2), h(1), h(0)]
        );
    }

    #[test]
    fn test_post_children_cycle_reports_resource_indices() {
        let h = ResourceHandle;
        // 0 follows its child 1, 1 follows 2 and 2 follows 0
        let parents = vec![None, Some(h(0)), None];
        let deps = graph(&[(1, 0), (1, 2), (2, 0)], 3);
        let order = vec![h(0), h(2), h(1)];
        let mut cycle = post_children_order(&order, &parents, &deps).unwrap_err();
        cycle.sort_unstable();
        assert_eq!(cycle, vec![0, 1, 2]);
    }
}
