//! Resource manager - owns the registries and the graph lifecycle
//!
//! All mutation happens under the manager's write lock, queries under its
//! read lock. The lock is never held while actions run: execution works on
//! a snapshot of the prepared graph.

use crate::context::{Host, NoProgress, ProgressCallback};
use crate::definition::ResourceDefinition;
use crate::error::{Error, Result};
use crate::executor::{self, ExecutionGraph};
use crate::fqname::FQName;
use crate::query::{AttributeQuery, GraphView, QueryEngine};
use crate::resolver::{BulkDependency, Resolver, Selector, link, promote_to_children};
use crate::resource::{DeclaredDependency, Resource, ResourceHandle};
use crate::sort::{ActionPlan, sort_post_children, sort_resources};
use crate::types::{ExecuteOptions, ExecutionReport, UniqueScope};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Host name resources are bound to unless told otherwise
pub const DEFAULT_HOST: &str = "localhost";

/// Source of definitions that are not registered yet
///
/// Consulted when a resource of an unknown type is created. For a qualified
/// name `load` is called once; for an unqualified one, once per package of
/// the import scope.
pub trait DefinitionLoader: Send + Sync {
    fn load(&self, fqname: &FQName) -> anyhow::Result<Vec<ResourceDefinition>>;
}

/// Options for [`ResourceManager::create_resource`]
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Id among siblings; generated from the type name when absent
    pub id: Option<String>,
    pub parent: Option<ResourceHandle>,
    /// Packages searched for unqualified type names (empty = all)
    pub import_scope: Vec<String>,
    /// Host name; inherited from the parent, else the manager default
    pub host: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn parent(mut self, parent: ResourceHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn import(mut self, package: impl Into<String>) -> Self {
        self.import_scope.push(package.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Graph state fixed by `prepare_for_execution`
#[derive(Debug)]
struct Prepared {
    order: Vec<ResourceHandle>,
    post_order: Vec<ResourceHandle>,
    plans: Vec<ActionPlan>,
    children: HashMap<ResourceHandle, Vec<ResourceHandle>>,
}

#[derive(Debug)]
struct Registry {
    resources: Vec<Arc<Resource>>,
    uids: HashMap<String, ResourceHandle>,
    definitions: Vec<Arc<ResourceDefinition>>,
    by_fqname: HashMap<FQName, usize>,
    bulk: Vec<BulkDependency>,
    /// (type, host) pairs taken by unique resources; host is `None` for
    /// globally unique types
    unique_created: HashSet<(FQName, Option<String>)>,
    create_allowed: bool,
    prepared: Option<Prepared>,
    executed: bool,
    closed: bool,
}

impl Registry {
    fn new() -> Self {
        Self {
            resources: Vec::new(),
            uids: HashMap::new(),
            definitions: Vec::new(),
            by_fqname: HashMap::new(),
            bulk: Vec::new(),
            unique_created: HashSet::new(),
            create_allowed: true,
            prepared: None,
            executed: false,
            closed: false,
        }
    }

    fn graph(&self) -> GraphView<'_> {
        GraphView::new(&self.resources, &self.uids)
    }

    fn get(&self, handle: ResourceHandle) -> Result<&Arc<Resource>> {
        self.resources
            .get(handle.0)
            .ok_or_else(|| Error::Lifecycle(format!("unknown resource handle {handle}")))
    }

    fn frozen_check(&self, what: &str) -> Result<()> {
        if self.prepared.is_some() {
            return Err(Error::Lifecycle(format!(
                "cannot {what} after prepare_for_execution"
            )));
        }
        Ok(())
    }

    /// Register or merge a validated definition
    fn register(&mut self, definition: ResourceDefinition) -> Result<()> {
        let fqname = definition.fqname().clone();
        match self.by_fqname.get(&fqname) {
            Some(&index) => {
                let mut merged = (*self.definitions[index]).clone();
                merged.merge(definition)?;
                let merged = Arc::new(merged);
                for resource in &self.resources {
                    let mut data = resource.write();
                    if data.definition.fqname() == &fqname {
                        data.definition = Arc::clone(&merged);
                    }
                }
                self.definitions[index] = merged;
                log::debug!("Merged definition {fqname}");
            }
            None => {
                self.by_fqname.insert(fqname.clone(), self.definitions.len());
                self.definitions.push(Arc::new(definition));
                log::debug!("Registered definition {fqname}");
            }
        }
        Ok(())
    }

    /// Exact match for qualified names, import-scope search otherwise
    fn find_definition(
        &self,
        name: &FQName,
        import_scope: &[String],
    ) -> Result<Option<Arc<ResourceDefinition>>> {
        if name.is_qualified() {
            return Ok(self
                .by_fqname
                .get(name)
                .map(|i| Arc::clone(&self.definitions[*i])));
        }

        let mut found: Option<&Arc<ResourceDefinition>> = None;
        for definition in &self.definitions {
            let fqname = definition.fqname();
            if fqname.name() != name.name() || !fqname.in_scope(import_scope) {
                continue;
            }
            if let Some(first) = found {
                return Err(Error::MultipleResourceMatch {
                    name: name.name().to_string(),
                    first: first.fqname().to_string(),
                    second: fqname.to_string(),
                });
            }
            found = Some(definition);
        }
        Ok(found.cloned())
    }

    /// Every unique type has at most one resource per scope
    fn validate_uniqueness(&self) -> Result<()> {
        let mut seen: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for resource in &self.resources {
            let definition = resource.definition();
            let scope = match definition.unique() {
                UniqueScope::None => continue,
                UniqueScope::Global => "global".to_string(),
                UniqueScope::Host => format!("host {}", resource.host()),
            };
            seen.entry((definition.fqname().to_string(), scope))
                .or_default()
                .push(resource.uid().to_string());
        }
        match seen.into_iter().find(|(_, uids)| uids.len() > 1) {
            Some(((fqname, scope), uids)) => Err(Error::MultipleUniqueResourcesFound {
                fqname,
                scope,
                uids,
            }),
            None => Ok(()),
        }
    }

    fn execution_graph(&self) -> Result<ExecutionGraph> {
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| Error::Lifecycle("graph has not been prepared".into()))?;
        Ok(ExecutionGraph::new(
            self.resources.clone(),
            prepared.order.clone(),
            prepared.post_order.clone(),
            prepared.plans.clone(),
        ))
    }
}

/// Owns resources, definitions and the dependency graph
pub struct ResourceManager {
    registry: RwLock<Registry>,
    query: Box<dyn QueryEngine>,
    loader: Option<Box<dyn DefinitionLoader>>,
    default_host: String,
    /// Held while allocating ids for root resources
    root_scope: Mutex<()>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::new()),
            query: Box::new(AttributeQuery),
            loader: None,
            default_host: DEFAULT_HOST.to_string(),
            root_scope: Mutex::new(()),
        }
    }

    /// Replace the built-in query language
    pub fn with_query_engine(mut self, engine: impl QueryEngine + 'static) -> Self {
        self.query = Box::new(engine);
        self
    }

    /// Load unknown definitions on demand
    pub fn with_loader(mut self, loader: impl DefinitionLoader + 'static) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    pub fn with_default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = host.into();
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Registry>> {
        let guard = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        if guard.closed {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Registry>> {
        let guard = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if guard.closed {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    // -------------------------
    // Definitions
    // -------------------------

    /// Register a definition; a second one with the same type is merged
    pub fn register_definition(&self, definition: ResourceDefinition) -> Result<()> {
        let mut reg = self.write()?;
        reg.frozen_check("register definitions")?;
        definition.validate()?;
        reg.register(definition)
    }

    /// Registered definitions in registration order
    pub fn definitions(&self) -> Result<Vec<Arc<ResourceDefinition>>> {
        Ok(self.read()?.definitions.clone())
    }

    /// Look a definition up, without dynamic loading
    pub fn find_definition(
        &self,
        name: impl Into<FQName>,
        import_scope: &[String],
    ) -> Result<Option<Arc<ResourceDefinition>>> {
        self.read()?.find_definition(&name.into(), import_scope)
    }

    fn load_definitions(
        &self,
        reg: &mut Registry,
        name: &FQName,
        import_scope: &[String],
    ) -> Result<()> {
        let Some(loader) = &self.loader else {
            return Ok(());
        };
        let candidates: Vec<FQName> = if name.is_qualified() {
            vec![name.clone()]
        } else {
            import_scope
                .iter()
                .map(|pkg| FQName::new(pkg.as_str(), name.name()))
                .collect()
        };

        for candidate in candidates {
            log::debug!("Loading definition {candidate}");
            let definitions = loader
                .load(&candidate)
                .map_err(|e| Error::creation(format!("failed to load {candidate}: {e:#}")))?;
            for definition in definitions {
                definition.validate()?;
                reg.register(definition)?;
            }
        }
        Ok(())
    }

    // -------------------------
    // Resources
    // -------------------------

    /// Create a resource of type `fqname`
    pub fn create_resource(
        &self,
        fqname: impl Into<FQName>,
        options: CreateOptions,
    ) -> Result<Arc<Resource>> {
        let fqname = fqname.into();
        let mut guard = self.write()?;
        let reg = &mut *guard;
        log::debug!("Creating resource {fqname}");

        if !reg.create_allowed {
            return Err(Error::creation(
                "resources cannot be created after prepare_for_execution",
            ));
        }

        let definition = match reg.find_definition(&fqname, &options.import_scope)? {
            Some(definition) => definition,
            None => {
                self.load_definitions(reg, &fqname, &options.import_scope)?;
                reg.find_definition(&fqname, &options.import_scope)?
                    .ok_or_else(|| Error::creation(format!("unable to find resource type {fqname}")))?
            }
        };

        let parent = match options.parent {
            Some(handle) => Some(Arc::clone(reg.get(handle).map_err(|_| {
                Error::creation(format!("parent {handle} does not exist"))
            })?)),
            None => None,
        };
        let host = options
            .host
            .clone()
            .or_else(|| parent.as_ref().map(|p| p.host().to_string()))
            .unwrap_or_else(|| self.default_host.clone());

        // allocate the id while holding the parent's (or root's) lock
        let _parent_guard = parent.as_ref().map(|p| p.write());
        let _root_guard = parent
            .is_none()
            .then(|| self.root_scope.lock().unwrap_or_else(PoisonError::into_inner));

        let id = match options.id {
            Some(id) if id.is_empty() || id.contains('.') => {
                return Err(Error::creation(format!("invalid resource id '{id}'")));
            }
            Some(id) => id,
            None => generate_id(reg, options.parent, definition.fqname().name()),
        };
        let uid = match &parent {
            Some(p) => format!("{}.{}", p.uid(), id),
            None => id.clone(),
        };
        if reg.uids.contains_key(&uid) {
            return Err(Error::creation(format!("resource {uid} already exists")));
        }

        let unique_key = match definition.unique() {
            UniqueScope::None => None,
            UniqueScope::Global => Some((definition.fqname().clone(), None)),
            UniqueScope::Host => Some((definition.fqname().clone(), Some(host.clone()))),
        };
        if let Some(key) = unique_key
            && !reg.unique_created.insert(key)
        {
            return Err(Error::creation(format!(
                "cannot create more than one instance of {}",
                definition.fqname()
            )));
        }

        let handle = ResourceHandle(reg.resources.len());
        let resource = Arc::new(definition.create(handle, id, uid.clone(), options.parent, host));
        for (name, value) in options.attributes {
            resource.set(&name, value);
        }
        reg.uids.insert(uid, handle);
        reg.resources.push(Arc::clone(&resource));
        log::debug!("Created resource {resource}");
        Ok(resource)
    }

    /// Resources in execution order once prepared, registration order before
    pub fn resources(&self) -> Result<Vec<Arc<Resource>>> {
        let reg = self.read()?;
        Ok(match &reg.prepared {
            Some(prepared) => prepared
                .order
                .iter()
                .map(|h| Arc::clone(&reg.resources[h.0]))
                .collect(),
            None => reg.resources.clone(),
        })
    }

    pub fn resource(&self, uid: &str) -> Result<Option<Arc<Resource>>> {
        Ok(self.read()?.graph().by_uid(uid).cloned())
    }

    pub fn get(&self, handle: ResourceHandle) -> Result<Arc<Resource>> {
        self.read()?.get(handle).cloned()
    }

    /// Direct children of a resource
    pub fn children(&self, parent: ResourceHandle) -> Result<Vec<Arc<Resource>>> {
        let reg = self.read()?;
        Ok(match &reg.prepared {
            Some(prepared) => prepared
                .children
                .get(&parent)
                .into_iter()
                .flatten()
                .map(|h| Arc::clone(&reg.resources[h.0]))
                .collect(),
            None => reg.graph().children(parent).cloned().collect(),
        })
    }

    pub fn has_resources(&self) -> Result<bool> {
        Ok(!self.read()?.resources.is_empty())
    }

    pub fn is_create_allowed(&self) -> Result<bool> {
        Ok(self.read()?.create_allowed)
    }

    /// Resources matching `query`, evaluated in `scope`
    pub fn find_resources(
        &self,
        query: &str,
        scope: Option<ResourceHandle>,
    ) -> Result<Vec<Arc<Resource>>> {
        let reg = self.read()?;
        let scope = match scope {
            Some(handle) => Some(Arc::clone(reg.get(handle)?)),
            None => None,
        };
        let graph = reg.graph();
        let found = self.query.find(query, scope.as_deref(), &graph)?;
        Ok(found
            .into_iter()
            .map(|h| Arc::clone(&reg.resources[h.0]))
            .collect())
    }

    // -------------------------
    // Dependencies
    // -------------------------

    /// `origin` depends on `target`
    pub fn add_dependency(&self, origin: ResourceHandle, target: ResourceHandle) -> Result<()> {
        let reg = self.write()?;
        reg.frozen_check("add dependencies")?;
        let resource = reg.get(origin)?;
        reg.get(target)?;
        if origin == target {
            return Err(Error::dependency(
                resource.uid(),
                "a resource cannot depend on itself",
            ));
        }
        {
            let mut data = resource.write();
            let declared = DeclaredDependency::Direct(target);
            if !data.declared.contains(&declared) {
                data.declared.push(declared);
            }
        }
        link(&reg.resources, origin, target);
        Ok(())
    }

    /// `origin` depends on every resource matching `query` (in origin's scope)
    pub fn add_dependency_query(&self, origin: ResourceHandle, query: &str) -> Result<()> {
        let reg = self.write()?;
        reg.frozen_check("add dependencies")?;
        reg.get(origin)?
            .write()
            .declared
            .push(DeclaredDependency::Query(query.to_string()));
        Ok(())
    }

    /// Every origin depends on every target; expanded at resolution
    pub fn add_bulk_dependency(&self, origins: Selector, targets: Selector) -> Result<()> {
        let mut reg = self.write()?;
        reg.frozen_check("add dependencies")?;
        reg.bulk.push(BulkDependency { origins, targets });
        Ok(())
    }

    /// Rebuild every dependency edge from declared sources
    pub fn resolve_dependencies(&self, strict: bool) -> Result<()> {
        let mut guard = self.write()?;
        guard.frozen_check("resolve dependencies")?;
        let reg = &mut *guard;
        Resolver::new(
            GraphView::new(&reg.resources, &reg.uids),
            self.query.as_ref(),
            strict,
        )
        .resolve(&mut reg.bulk)
    }

    // -------------------------
    // Preparation & execution
    // -------------------------

    /// Freeze the graph: validate, resolve strictly, promote dependencies
    /// to children and sort. Runs once.
    pub fn prepare_for_execution(&self) -> Result<()> {
        let mut reg = self.write()?;
        if reg.prepared.is_some() {
            return Err(Error::Lifecycle("graph is already prepared".into()));
        }
        self.prepare_locked(&mut reg)
    }

    fn prepare_locked(&self, reg: &mut Registry) -> Result<()> {
        reg.create_allowed = false;
        reg.validate_uniqueness()?;

        for resource in &reg.resources {
            if let Some(parent) = resource.parent() {
                let mut data = resource.write();
                let declared = DeclaredDependency::Direct(parent);
                if !data.declared.contains(&declared) {
                    data.declared.push(declared);
                }
            }
        }

        Resolver::new(
            GraphView::new(&reg.resources, &reg.uids),
            self.query.as_ref(),
            true,
        )
        .resolve(&mut reg.bulk)?;

        let mut children: HashMap<ResourceHandle, Vec<ResourceHandle>> = HashMap::new();
        for resource in &reg.resources {
            if let Some(parent) = resource.parent() {
                children.entry(parent).or_default().push(resource.handle());
            }
        }

        promote_to_children(&reg.graph());

        let plans = reg
            .resources
            .iter()
            .map(|r| ActionPlan::new(&r.definition()))
            .collect();
        let order = sort_resources(&reg.resources)?;
        let post_order = sort_post_children(&reg.resources, &order)?;

        log::info!("Prepared {} resources for execution", order.len());
        reg.prepared = Some(Prepared {
            order,
            post_order,
            plans,
            children,
        });
        Ok(())
    }

    /// Resources in execution order
    pub fn execution_order(&self) -> Result<Vec<Arc<Resource>>> {
        let reg = self.read()?;
        let prepared = reg
            .prepared
            .as_ref()
            .ok_or_else(|| Error::Lifecycle("graph has not been prepared".into()))?;
        Ok(prepared
            .order
            .iter()
            .map(|h| Arc::clone(&reg.resources[h.0]))
            .collect())
    }

    /// Run every phase against `host`; prepares the graph if needed.
    ///
    /// `report.is_success()` is true iff no resource ended failed.
    pub fn execute(&self, host: &dyn Host, options: &ExecuteOptions) -> Result<ExecutionReport> {
        self.execute_with(host, options, &mut NoProgress)
    }

    /// Like [`execute`](Self::execute), reporting progress
    pub fn execute_with<P: ProgressCallback + ?Sized>(
        &self,
        host: &dyn Host,
        options: &ExecuteOptions,
        progress: &mut P,
    ) -> Result<ExecutionReport> {
        let graph = {
            let mut reg = self.write()?;
            if reg.executed {
                return Err(Error::Lifecycle("resources have already been executed".into()));
            }
            if reg.prepared.is_none() {
                self.prepare_locked(&mut reg)?;
            }
            reg.executed = true;
            reg.execution_graph()?
        };

        let report = executor::execute(&graph, host, options, progress)?;
        let summary = report.summary();
        log::info!(
            "Executed {} resources: {} ok, {} failed, {} cancelled",
            summary.total(),
            summary.executed,
            summary.failed,
            summary.cancelled
        );
        Ok(report)
    }

    /// Close every definition, then refuse further access
    pub fn close(&self) -> Result<()> {
        let mut reg = self.write()?;
        for definition in &reg.definitions {
            for err in definition.close() {
                log::error!("Failed to close {}: {:#}", definition.fqname(), err);
            }
        }
        reg.closed = true;
        Ok(())
    }
}

/// `basename + n`, smallest `n` free among the parent's children
fn generate_id(reg: &Registry, parent: Option<ResourceHandle>, basename: &str) -> String {
    let taken: HashSet<&str> = reg
        .resources
        .iter()
        .filter(|r| r.parent() == parent)
        .map(|r| r.id())
        .collect();
    (1..)
        .map(|n| format!("{basename}{n}"))
        .find(|id| !taken.contains(id.as_str()))
        .unwrap_or_else(|| basename.to_string())
}
