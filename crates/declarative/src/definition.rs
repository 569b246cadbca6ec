//! Resource definitions and their builder

use crate::action::{Action, NotificationHandler, VerifyFn};
use crate::context::ActionContext;
use crate::error::{Error, Result};
use crate::fqname::FQName;
use crate::resource::{Resource, ResourceHandle};
use crate::types::{Phase, UniqueScope};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Hook run when the manager closes
pub type CloseHook = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Template describing a resource type: its actions, handlers and constraints.
#[derive(Clone)]
pub struct ResourceDefinition {
    fqname: FQName,
    unique: UniqueScope,
    defaults: BTreeMap<String, String>,
    actions: Vec<Action>,
    handlers: Vec<NotificationHandler>,
    close_hooks: Vec<CloseHook>,
}

impl ResourceDefinition {
    /// Start building a definition for `fqname` (`"pkg.name"`)
    pub fn builder(fqname: impl Into<FQName>) -> ResourceDefinitionBuilder {
        ResourceDefinitionBuilder::new(fqname.into())
    }

    pub fn fqname(&self) -> &FQName {
        &self.fqname
    }

    pub fn unique(&self) -> UniqueScope {
        self.unique
    }

    /// Attributes every new resource of this type starts with
    pub fn defaults(&self) -> &BTreeMap<String, String> {
        &self.defaults
    }

    /// All actions in declaration order
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Actions of one phase sorted by order key, then declaration order
    pub fn actions_for(&self, phase: Phase) -> Vec<&Action> {
        let mut actions: Vec<&Action> = self.actions.iter().filter(|a| a.phase() == phase).collect();
        actions.sort_by_key(|a| (a.order(), a.seq));
        actions
    }

    pub fn handlers(&self) -> &[NotificationHandler] {
        &self.handlers
    }

    /// Handlers subscribed to `notification`, with their index
    pub fn handlers_for<'a>(
        &'a self,
        notification: &'a str,
    ) -> impl Iterator<Item = (usize, &'a NotificationHandler)> + 'a {
        self.handlers
            .iter()
            .enumerate()
            .filter(move |(_, h)| h.notification() == notification)
    }

    /// Check structural well-formedness
    pub fn validate(&self) -> Result<()> {
        if !self.fqname.is_qualified() || self.fqname.name().is_empty() {
            return Err(Error::definition(
                &self.fqname,
                "resource type must be qualified as pkg.name",
            ));
        }

        let mut seen = HashSet::new();
        for action in &self.actions {
            if action.name().is_empty() {
                return Err(Error::definition(&self.fqname, "action without a name"));
            }
            if !seen.insert((action.phase(), action.name())) {
                return Err(Error::definition(
                    &self.fqname,
                    format!(
                        "duplicate {} action '{}'",
                        action.phase(),
                        action.name()
                    ),
                ));
            }
            if action.phase().is_sync() && !action.has_verify() {
                return Err(Error::definition(
                    &self.fqname,
                    format!("sync '{}' has no matching verify", action.name()),
                ));
            }
            if !action.phase().is_sync() && action.has_verify() {
                return Err(Error::definition(
                    &self.fqname,
                    format!(
                        "verify attached to {} action '{}'",
                        action.phase(),
                        action.name()
                    ),
                ));
            }
            if !action.emitted().is_empty() && !action.phase().can_notify() {
                return Err(Error::definition(
                    &self.fqname,
                    format!(
                        "{} action '{}' cannot emit notifications",
                        action.phase(),
                        action.name()
                    ),
                ));
            }
        }

        if let Some(handler) = self.handlers.iter().find(|h| h.notification().is_empty()) {
            return Err(Error::definition(
                &self.fqname,
                format!("handler without a notification name: {handler:?}"),
            ));
        }
        Ok(())
    }

    /// Fold a second definition of the same type into this one.
    ///
    /// Actions and handlers are appended, missing defaults filled in and
    /// the stricter uniqueness constraint kept. On error `self` is unchanged.
    pub fn merge(&mut self, other: ResourceDefinition) -> Result<()> {
        if other.fqname != self.fqname {
            return Err(Error::definition(
                &self.fqname,
                format!("cannot merge definition of {}", other.fqname),
            ));
        }

        let mut merged = self.clone();
        let offset = merged.actions.len();
        merged
            .actions
            .extend(other.actions.into_iter().map(|mut action| {
                action.seq += offset;
                action
            }));
        merged.handlers.extend(other.handlers);
        merged.close_hooks.extend(other.close_hooks);
        for (key, value) in other.defaults {
            merged.defaults.entry(key).or_insert(value);
        }
        merged.unique = stricter(merged.unique, other.unique);
        merged.validate()?;

        *self = merged;
        Ok(())
    }

    /// Run close hooks, returning every error they raised
    pub fn close(&self) -> Vec<anyhow::Error> {
        self.close_hooks
            .iter()
            .filter_map(|hook| hook().err())
            .collect()
    }

    /// Instantiate a resource of this type
    pub(crate) fn create(
        self: &Arc<Self>,
        handle: ResourceHandle,
        id: String,
        uid: String,
        parent: Option<ResourceHandle>,
        host: String,
    ) -> Resource {
        Resource::new(handle, id, uid, parent, host, Arc::clone(self))
    }
}

fn stricter(a: UniqueScope, b: UniqueScope) -> UniqueScope {
    let rank = |scope: UniqueScope| match scope {
        UniqueScope::None => 0,
        UniqueScope::Host => 1,
        UniqueScope::Global => 2,
    };
    if rank(b) > rank(a) { b } else { a }
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("fqname", &self.fqname)
            .field("unique", &self.unique)
            .field("defaults", &self.defaults)
            .field("actions", &self.actions)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

/// Builder registering actions and handlers explicitly.
///
/// Sync bodies and verify predicates are paired by name; an unpaired half
/// or a duplicate makes `build()` fail.
pub struct ResourceDefinitionBuilder {
    fqname: FQName,
    unique: UniqueScope,
    defaults: BTreeMap<String, String>,
    actions: Vec<Action>,
    verifies: Vec<(String, VerifyFn)>,
    handlers: Vec<NotificationHandler>,
    close_hooks: Vec<CloseHook>,
}

impl ResourceDefinitionBuilder {
    fn new(fqname: FQName) -> Self {
        Self {
            fqname,
            unique: UniqueScope::None,
            defaults: BTreeMap::new(),
            actions: Vec::new(),
            verifies: Vec::new(),
            handlers: Vec::new(),
            close_hooks: Vec::new(),
        }
    }

    pub fn unique(mut self, scope: UniqueScope) -> Self {
        self.unique = scope;
        self
    }

    pub fn default_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.insert(name.into(), value.into());
        self
    }

    /// Add any action; sync actions are paired with a verify by name
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn prepare<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action(Action::prepare(name, body))
    }

    pub fn execute<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action(Action::execute(name, body))
    }

    pub fn post_children_execute<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action(Action::execute(name, body).post_children())
    }

    pub fn cleanup<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action(Action::cleanup(name, body))
    }

    /// Sync action (SYNC or POSTCHILDREN_SYNC), paired with `verify(name)`
    pub fn sync(self, action: Action) -> Self {
        self.action(action)
    }

    /// Verify predicate for the sync action of the same name
    pub fn verify<F>(mut self, name: impl Into<String>, verify: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.verifies.push((name.into(), Arc::new(verify)));
        self
    }

    pub fn handler(mut self, handler: NotificationHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.close_hooks.push(Arc::new(hook));
        self
    }

    /// Pair verify/sync halves, number actions and validate
    pub fn build(self) -> Result<ResourceDefinition> {
        let fqname = self.fqname;
        let mut verifies: BTreeMap<String, VerifyFn> = BTreeMap::new();
        for (name, verify) in self.verifies {
            if verifies.insert(name.clone(), verify).is_some() {
                return Err(Error::definition(
                    &fqname,
                    format!("duplicate verify '{name}'"),
                ));
            }
        }

        let mut actions = Vec::with_capacity(self.actions.len());
        for (seq, mut action) in self.actions.into_iter().enumerate() {
            if action.phase().is_sync() {
                let verify = verifies.remove(action.name()).ok_or_else(|| {
                    Error::definition(
                        &fqname,
                        format!("sync '{}' has no matching verify", action.name()),
                    )
                })?;
                action = action.with_verify(verify);
            }
            action.seq = seq;
            actions.push(action);
        }
        if let Some(name) = verifies.keys().next() {
            return Err(Error::definition(
                &fqname,
                format!("verify '{name}' has no matching sync"),
            ));
        }

        let definition = ResourceDefinition {
            fqname,
            unique: self.unique,
            defaults: self.defaults,
            actions,
            handlers: self.handlers,
            close_hooks: self.close_hooks,
        };
        definition.validate()?;
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop(_: &mut ActionContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_build_pairs_verify_and_sync() {
        let def = ResourceDefinition::builder("core.file")
            .verify("content", |_| Ok(true))
            .sync(Action::sync("content", noop))
            .execute("touch", noop)
            .build()
            .unwrap();
        assert_eq!(def.actions().len(), 2);
        assert!(def.actions_for(Phase::Sync)[0].has_verify());
        assert!(!def.actions_for(Phase::Execute)[0].has_verify());
    }

    #[test]
    fn test_unpaired_halves_are_rejected() {
        let err = ResourceDefinition::builder("core.file")
            .verify("content", |_| Ok(true))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no matching sync"));

        let err = ResourceDefinition::builder("core.file")
            .sync(Action::sync("content", noop))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no matching verify"));

        let err = ResourceDefinition::builder("core.file")
            .verify("content", |_| Ok(true))
            .verify("content", |_| Ok(false))
            .sync(Action::sync("content", noop))
            .build()
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Definition);
    }

    #[test]
    fn test_unqualified_type_is_rejected() {
        let err = ResourceDefinition::builder("file").build().unwrap_err();
        assert!(matches!(err, Error::InvalidResourceDefinition { .. }));
    }

    #[test]
    fn test_duplicate_action_name_in_phase() {
        let err = ResourceDefinition::builder("core.file")
            .execute("run", noop)
            .execute("run", noop)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate execute action 'run'"));

        // same name in different phases is fine
        ResourceDefinition::builder("core.file")
            .execute("run", noop)
            .cleanup("run", noop)
            .build()
            .unwrap();
    }

    #[test]
    fn test_actions_sorted_by_order_then_declaration() {
        let def = ResourceDefinition::builder("core.svc")
            .action(Action::execute("b", noop).with_order(5))
            .action(Action::execute("a", noop))
            .action(Action::execute("c", noop).with_order(-1))
            .action(Action::execute("d", noop))
            .build()
            .unwrap();
        let names: Vec<_> = def
            .actions_for(Phase::Execute)
            .iter()
            .map(|a| a.name())
            .collect();
        assert_eq!(names, vec!["c", "a", "d", "b"]);
    }

    #[test]
    fn test_merge_appends_and_keeps_stricter_scope() {
        let mut first = ResourceDefinition::builder("core.svc")
            .default_attr("state", "running")
            .execute("start", noop)
            .build()
            .unwrap();
        let second = ResourceDefinition::builder("core.svc")
            .unique(UniqueScope::Host)
            .default_attr("state", "stopped")
            .default_attr("enabled", "true")
            .execute("reload", noop)
            .build()
            .unwrap();

        first.merge(second).unwrap();
        let names: Vec<_> = first
            .actions_for(Phase::Execute)
            .iter()
            .map(|a| a.name())
            .collect();
        assert_eq!(names, vec!["start", "reload"]);
        assert_eq!(first.unique(), UniqueScope::Host);
        assert_eq!(first.defaults()["state"], "running");
        assert_eq!(first.defaults()["enabled"], "true");
    }

    #[test]
    fn test_merge_rejects_conflicts_without_changes() {
        let mut first = ResourceDefinition::builder("core.svc")
            .execute("start", noop)
            .build()
            .unwrap();
        let clash = ResourceDefinition::builder("core.svc")
            .execute("start", noop)
            .build()
            .unwrap();
        assert!(first.merge(clash).is_err());
        assert_eq!(first.actions().len(), 1);

        let other = ResourceDefinition::builder("core.pkg").build().unwrap();
        assert!(first.merge(other).is_err());
    }

    #[test]
    fn test_close_runs_every_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&calls);
        let c2 = Arc::clone(&calls);
        let def = ResourceDefinition::builder("core.svc")
            .on_close(move || {
                c1.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("boom")
            })
            .on_close(move || {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();
        let errors = def.close();
        assert_eq!(errors.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
