//! Resource instances
//!
//! A Resource is one managed unit of desired state (a package, a file, ...).
//! Its identity (id, uid, parent, host) never changes after creation; its
//! attributes, edges and lifecycle state live behind a per-resource lock.

use crate::definition::ResourceDefinition;
use crate::fqname::FQName;
use crate::types::{Failure, State};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stable reference to a resource inside its manager.
///
/// Handles are registration indices, so comparing handles compares
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceHandle(pub(crate) usize);

impl ResourceHandle {
    /// Registration index
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Dependency declared before resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeclaredDependency {
    /// Known target
    Direct(ResourceHandle),
    /// Query evaluated in the origin's scope
    Query(String),
}

#[derive(Debug)]
pub(crate) struct ResourceData {
    pub(crate) definition: Arc<ResourceDefinition>,
    pub(crate) attributes: BTreeMap<String, String>,
    pub(crate) declared: Vec<DeclaredDependency>,
    pub(crate) dependencies: BTreeSet<ResourceHandle>,
    pub(crate) dependents: BTreeSet<ResourceHandle>,
    pub(crate) state: State,
    pub(crate) cleaned: bool,
    pub(crate) actions_run: Vec<String>,
}

impl ResourceData {
    /// Mark failed unless already failed; returns whether the state changed
    pub(crate) fn fail(&mut self, failure: Failure) -> bool {
        if self.state.is_failed() {
            return false;
        }
        self.state = State::Failed(failure);
        true
    }
}

/// A managed unit of desired state
pub struct Resource {
    handle: ResourceHandle,
    id: String,
    uid: String,
    parent: Option<ResourceHandle>,
    host: String,
    inner: RwLock<ResourceData>,
}

impl Resource {
    pub(crate) fn new(
        handle: ResourceHandle,
        id: String,
        uid: String,
        parent: Option<ResourceHandle>,
        host: String,
        definition: Arc<ResourceDefinition>,
    ) -> Self {
        let attributes = definition.defaults().clone();
        Self {
            handle,
            id,
            uid,
            parent,
            host,
            inner: RwLock::new(ResourceData {
                definition,
                attributes,
                declared: Vec::new(),
                dependencies: BTreeSet::new(),
                dependents: BTreeSet::new(),
                state: State::Created,
                cleaned: false,
                actions_run: Vec::new(),
            }),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ResourceData> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ResourceData> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    /// Id, unique among siblings
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id path from the root, unique per manager
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn parent(&self) -> Option<ResourceHandle> {
        self.parent
    }

    /// Name of the host this resource is bound to
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn definition(&self) -> Arc<ResourceDefinition> {
        Arc::clone(&self.read().definition)
    }

    pub fn fqname(&self) -> FQName {
        self.read().definition.fqname().clone()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.read().attributes.get(name).cloned()
    }

    pub fn set(&self, name: &str, value: impl Into<String>) {
        self.write().attributes.insert(name.to_string(), value.into());
    }

    /// Attributes in name order
    pub fn attributes(&self) -> BTreeMap<String, String> {
        self.read().attributes.clone()
    }

    pub fn dependencies(&self) -> Vec<ResourceHandle> {
        self.read().dependencies.iter().copied().collect()
    }

    pub fn dependents(&self) -> Vec<ResourceHandle> {
        self.read().dependents.iter().copied().collect()
    }

    /// Whether `other` is a direct dependency
    pub fn depends_on(&self, other: ResourceHandle) -> bool {
        self.read().dependencies.contains(&other)
    }

    pub fn state(&self) -> State {
        self.read().state.clone()
    }

    pub fn is_failed(&self) -> bool {
        self.read().state.is_failed()
    }

    pub fn failure(&self) -> Option<Failure> {
        self.read().state.failure().cloned()
    }

    /// Whether the cleanup pass has visited this resource
    pub fn is_cleaned(&self) -> bool {
        self.read().cleaned
    }

    /// Names of actions whose body ran, in order
    pub fn actions_run(&self) -> Vec<String> {
        self.read().actions_run.clone()
    }

    /// Fail the resource before execution; it and its dependents are skipped
    pub fn mark_failed(&self, message: impl Into<String>) {
        self.write().fail(Failure::external(message));
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        f.debug_struct("Resource")
            .field("uid", &self.uid)
            .field("type", &data.definition.fqname().to_string())
            .field("host", &self.host)
            .field("state", &data.state)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fqname(), self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> Resource {
        let def = ResourceDefinition::builder("core.file")
            .default_attr("mode", "0644")
            .build()
            .unwrap();
        Arc::new(def).create(
            ResourceHandle(0),
            "motd".into(),
            "motd".into(),
            None,
            "localhost".into(),
        )
    }

    #[test]
    fn test_defaults_seed_attributes() {
        let r = resource();
        assert_eq!(r.get("mode").as_deref(), Some("0644"));
        r.set("mode", "0600");
        r.set("path", "/etc/motd");
        let names: Vec<_> = r.attributes().into_keys().collect();
        assert_eq!(names, vec!["mode", "path"]);
        assert_eq!(r.get("mode").as_deref(), Some("0600"));
    }

    #[test]
    fn test_mark_failed_keeps_first_failure() {
        let r = resource();
        assert_eq!(r.state(), State::Created);
        r.mark_failed("broken");
        r.write().fail(Failure::dependency("other"));
        assert_eq!(r.failure().unwrap().message, "broken");
        assert_eq!(r.to_string(), "core.file:motd");
    }
}
