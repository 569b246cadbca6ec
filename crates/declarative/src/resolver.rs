//! Dependency resolution
//!
//! Rebuilds every resource's `dependencies`/`dependents` sets from:
//! - declared edges (`add_dependency`, `add_dependency_query`)
//! - the `before`/`after` attributes, evaluated against the parent scope
//! - bulk relations, expanded into declared edges and then dropped
//!
//! Query scope is always passed explicitly to the query engine.

use crate::error::{Error, Result};
use crate::query::{GraphView, QueryEngine};
use crate::resource::{DeclaredDependency, Resource, ResourceHandle};
use crate::types::{Failure, State};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Attribute holding a query of resources this one must run after
pub const AFTER_ATTR: &str = "after";

/// Attribute holding a query of resources this one must run before
pub const BEFORE_ATTR: &str = "before";

/// One side of a bulk dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Explicit resources
    Resources(Vec<ResourceHandle>),
    /// Resources matching a query, evaluated in `scope`
    Query {
        expression: String,
        scope: Option<ResourceHandle>,
    },
}

impl Selector {
    pub fn query(expression: impl Into<String>) -> Self {
        Self::Query {
            expression: expression.into(),
            scope: None,
        }
    }
}

impl From<ResourceHandle> for Selector {
    fn from(handle: ResourceHandle) -> Self {
        Self::Resources(vec![handle])
    }
}

/// Every origin depends on every target
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BulkDependency {
    pub(crate) origins: Selector,
    pub(crate) targets: Selector,
}

pub(crate) struct Resolver<'a> {
    graph: GraphView<'a>,
    query: &'a dyn QueryEngine,
    strict: bool,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(graph: GraphView<'a>, query: &'a dyn QueryEngine, strict: bool) -> Self {
        Self {
            graph,
            query,
            strict,
        }
    }

    /// Expand bulk relations, rebuild all edges, then fail the dependents of
    /// resources that are already failed.
    pub(crate) fn resolve(&self, bulk: &mut Vec<BulkDependency>) -> Result<()> {
        for relation in bulk.iter() {
            self.expand(relation)?;
        }
        bulk.clear();

        let resources = self.graph.resources();
        let mut edges = Vec::new();
        for resource in resources {
            self.collect_edges(resource, &mut edges)?;
        }

        for resource in resources {
            let mut data = resource.write();
            data.dependencies.clear();
            data.dependents.clear();
        }
        for (origin, target) in edges {
            link(resources, origin, target);
        }
        log::debug!("Resolved dependencies of {} resources", resources.len());

        let failed: Vec<ResourceHandle> = resources
            .iter()
            .filter(|r| r.is_failed())
            .map(|r| r.handle())
            .collect();
        for handle in failed {
            fail_dependents(resources, handle);
        }
        Ok(())
    }

    fn select(&self, selector: &Selector) -> Result<Vec<ResourceHandle>> {
        match selector {
            Selector::Resources(handles) => Ok(handles.clone()),
            Selector::Query { expression, scope } => {
                let scope = scope.and_then(|h| self.graph.get(h)).map(Arc::as_ref);
                let found = self.query.find(expression, scope, &self.graph)?;
                if found.is_empty() && self.strict {
                    return Err(Error::dependency(
                        scope.map_or("<root>", Resource::uid),
                        format!("no resource matches '{expression}'"),
                    ));
                }
                Ok(found)
            }
        }
    }

    fn expand(&self, relation: &BulkDependency) -> Result<()> {
        let origins = self.select(&relation.origins)?;
        let targets = self.select(&relation.targets)?;
        for origin in origins {
            let Some(resource) = self.graph.get(origin) else {
                continue;
            };
            let mut data = resource.write();
            for &target in &targets {
                let declared = DeclaredDependency::Direct(target);
                if target != origin && !data.declared.contains(&declared) {
                    data.declared.push(declared);
                }
            }
        }
        Ok(())
    }

    fn evaluate(
        &self,
        origin: &Resource,
        expression: &str,
        scope: Option<&Resource>,
    ) -> Result<Vec<ResourceHandle>> {
        let mut found = self.query.find(expression, scope, &self.graph)?;
        found.retain(|h| *h != origin.handle());
        if found.is_empty() {
            if self.strict {
                return Err(Error::dependency(
                    origin.uid(),
                    format!("no resource matches '{expression}'"),
                ));
            }
            log::debug!("{}: '{}' matched nothing, skipped", origin.uid(), expression);
        }
        Ok(found)
    }

    /// Edges `(origin, target)` meaning origin depends on target
    fn collect_edges(
        &self,
        resource: &Arc<Resource>,
        edges: &mut Vec<(ResourceHandle, ResourceHandle)>,
    ) -> Result<()> {
        let origin = resource.handle();
        let declared = resource.read().declared.clone();
        for dependency in declared {
            match dependency {
                DeclaredDependency::Direct(target) if target != origin => {
                    edges.push((origin, target));
                }
                DeclaredDependency::Direct(_) => {}
                DeclaredDependency::Query(expression) => {
                    for target in self.evaluate(resource, &expression, Some(resource))? {
                        edges.push((origin, target));
                    }
                }
            }
        }

        let parent = resource
            .parent()
            .and_then(|h| self.graph.get(h))
            .map(Arc::as_ref);
        if let Some(expression) = resource.get(AFTER_ATTR).filter(|e| !e.trim().is_empty()) {
            for target in self.evaluate(resource, &expression, parent)? {
                edges.push((origin, target));
            }
        }
        if let Some(expression) = resource.get(BEFORE_ATTR).filter(|e| !e.trim().is_empty()) {
            for target in self.evaluate(resource, &expression, parent)? {
                edges.push((target, origin));
            }
        }
        Ok(())
    }
}

/// Add `origin depends on target`, keeping both sets mirrored
pub(crate) fn link(resources: &[Arc<Resource>], origin: ResourceHandle, target: ResourceHandle) {
    resources[origin.0].write().dependencies.insert(target);
    resources[target.0].write().dependents.insert(origin);
}

/// Fail every transitive dependent of `failed`; returns the newly failed.
///
/// Dependents that already executed get a `DependencyAfterRun` failure
/// instead of `Dependency`.
pub(crate) fn fail_dependents(
    resources: &[Arc<Resource>],
    failed: ResourceHandle,
) -> Vec<ResourceHandle> {
    let mut newly_failed = Vec::new();
    let mut queue = vec![failed];
    let mut visited = BTreeSet::from([failed]);
    while let Some(handle) = queue.pop() {
        let source = &resources[handle.0];
        let dependents = source.dependents();
        for dependent in dependents {
            if !visited.insert(dependent) {
                continue;
            }
            let newly = {
                let mut data = resources[dependent.0].write();
                let failure = if data.state == State::Executed {
                    Failure::dependency_after_run(source.uid())
                } else {
                    Failure::dependency(source.uid())
                };
                data.fail(failure)
            };
            if newly {
                log::debug!(
                    "{} failed because dependency {} failed",
                    resources[dependent.0].uid(),
                    source.uid()
                );
                newly_failed.push(dependent);
            }
            queue.push(dependent);
        }
    }
    newly_failed
}

/// Make every resource that depends on a non-parent resource also depend on
/// that resource's transitive children.
pub(crate) fn promote_to_children(graph: &GraphView<'_>) {
    let resources = graph.resources();
    let mut edges = Vec::new();
    for resource in resources {
        let origin = resource.handle();
        for dependency in resource.dependencies() {
            if Some(dependency) == resource.parent() {
                continue;
            }
            let mut queue: Vec<ResourceHandle> =
                graph.children(dependency).map(|c| c.handle()).collect();
            while let Some(child) = queue.pop() {
                // never descend into the origin's own subtree
                if child == origin {
                    continue;
                }
                edges.push((origin, child));
                queue.extend(graph.children(child).map(|c| c.handle()));
            }
        }
    }
    for (origin, target) in edges {
        link(resources, origin, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ResourceDefinition;
    use crate::query::AttributeQuery;
    use crate::types::FailureKind;
    use std::collections::HashMap;

    struct Fixture {
        resources: Vec<Arc<Resource>>,
        uids: HashMap<String, ResourceHandle>,
        bulk: Vec<BulkDependency>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                resources: Vec::new(),
                uids: HashMap::new(),
                bulk: Vec::new(),
            }
        }

        fn add(&mut self, id: &str, parent: Option<usize>) -> ResourceHandle {
            let def = Arc::new(ResourceDefinition::builder("test.node").build().unwrap());
            let handle = ResourceHandle(self.resources.len());
            let parent = parent.map(ResourceHandle);
            let uid = match parent {
                Some(p) => format!("{}.{}", self.resources[p.0].uid(), id),
                None => id.to_string(),
            };
            let resource = def.create(handle, id.into(), uid.clone(), parent, "localhost".into());
            self.uids.insert(uid, handle);
            self.resources.push(Arc::new(resource));
            handle
        }

        fn resolve(&mut self, strict: bool) -> Result<()> {
            let graph = GraphView::new(&self.resources, &self.uids);
            Resolver::new(graph, &AttributeQuery, strict).resolve(&mut self.bulk)
        }

        fn deps(&self, index: usize) -> Vec<usize> {
            self.resources[index]
                .dependencies()
                .into_iter()
                .map(ResourceHandle::index)
                .collect()
        }
    }

    #[test]
    fn test_after_and_before_attributes() {
        let mut f = Fixture::new();
        f.add("a", None);
        f.add("b", None);
        f.add("c", None);
        f.resources[1].set(AFTER_ATTR, "id=a");
        f.resources[1].set(BEFORE_ATTR, "id=c");
        f.resolve(true).unwrap();

        assert_eq!(f.deps(1), vec![0]);
        assert_eq!(f.deps(2), vec![1]);
        assert_eq!(f.resources[0].dependents(), vec![ResourceHandle(1)]);
        assert_eq!(f.resources[1].dependents(), vec![ResourceHandle(2)]);
    }

    #[test]
    fn test_attribute_queries_use_parent_scope() {
        let mut f = Fixture::new();
        let web = f.add("web", None);
        f.add("conf", Some(web.0));
        f.add("svc", Some(web.0));
        f.resources[2].set(AFTER_ATTR, "childof and id=conf");
        f.resolve(true).unwrap();
        assert_eq!(f.deps(2), vec![1]);
    }

    #[test]
    fn test_strict_mode_rejects_empty_match() {
        let mut f = Fixture::new();
        f.add("a", None);
        f.resources[0].set(AFTER_ATTR, "id=missing");
        let err = f.resolve(true).unwrap_err();
        assert!(matches!(err, Error::InvalidDependency { ref resource, .. } if resource == "a"));

        f.resolve(false).unwrap();
        assert!(f.deps(0).is_empty());
    }

    #[test]
    fn test_self_match_is_dropped() {
        let mut f = Fixture::new();
        f.add("a", None);
        f.add("b", None);
        f.resources[0].set(AFTER_ATTR, "type=test.node");
        f.resolve(true).unwrap();
        assert_eq!(f.deps(0), vec![1]);
    }

    #[test]
    fn test_resolution_rebuilds_edges() {
        let mut f = Fixture::new();
        f.add("a", None);
        f.add("b", None);
        f.resources[1].set(AFTER_ATTR, "id=a");
        f.resolve(true).unwrap();
        f.resources[1].set(AFTER_ATTR, "");
        f.resolve(true).unwrap();
        assert!(f.deps(1).is_empty());
        assert!(f.resources[0].dependents().is_empty());
    }

    #[test]
    fn test_bulk_dependency_is_expanded_once() {
        let mut f = Fixture::new();
        let a = f.add("a", None);
        let b = f.add("b", None);
        f.add("c", None);
        f.bulk.push(BulkDependency {
            origins: Selector::query("id=c"),
            targets: Selector::Resources(vec![a, b]),
        });
        f.resolve(true).unwrap();
        assert!(f.bulk.is_empty());
        assert_eq!(f.deps(2), vec![0, 1]);

        // expanded edges survive a second resolution
        f.resolve(true).unwrap();
        assert_eq!(f.deps(2), vec![0, 1]);
    }

    #[test]
    fn test_failed_target_fails_transitive_dependents() {
        let mut f = Fixture::new();
        f.add("a", None);
        f.add("b", None);
        f.add("c", None);
        f.resources[1].set(AFTER_ATTR, "id=a");
        f.resources[2].set(AFTER_ATTR, "id=b");
        f.resources[0].mark_failed("bad input");
        f.resolve(true).unwrap();

        let failure = f.resources[2].failure().unwrap();
        assert_eq!(
            failure.kind,
            FailureKind::Dependency { uid: "b".into() }
        );
        assert!(f.resources[1].is_failed());
    }

    #[test]
    fn test_promotion_to_transitive_children() {
        let mut f = Fixture::new();
        let a = f.add("a", None);
        let b = f.add("b", None);
        let c = f.add("c", Some(b.0));
        let d = f.add("d", Some(b.0));
        let e = f.add("e", Some(c.0));
        f.resources[a.0].set(AFTER_ATTR, "id=b");
        f.resolve(true).unwrap();

        let graph = GraphView::new(&f.resources, &f.uids);
        promote_to_children(&graph);
        assert_eq!(f.deps(a.0), vec![b.0, c.0, d.0, e.0]);
        assert!(f.resources[c.0].dependents().contains(&a));
    }

    #[test]
    fn test_promotion_skips_parent_link_and_own_subtree() {
        let mut f = Fixture::new();
        let root = f.add("root", None);
        let child = f.add("child", Some(root.0));
        let sibling = f.add("sibling", Some(root.0));
        let grandchild = f.add("leaf", Some(child.0));
        // child depends on its parent: never promoted
        f.resources[child.0].write().declared.push(DeclaredDependency::Direct(root));
        // grandchild depends on root (not its parent): promoted to root's
        // children except its own branch
        f.resources[grandchild.0].write().declared.push(DeclaredDependency::Direct(root));
        f.resolve(true).unwrap();

        let graph = GraphView::new(&f.resources, &f.uids);
        promote_to_children(&graph);
        assert_eq!(f.deps(child.0), vec![root.0]);
        assert_eq!(f.deps(grandchild.0), vec![root.0, child.0, sibling.0]);
    }
}
