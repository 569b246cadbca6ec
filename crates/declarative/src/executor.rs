//! Lifecycle executor - drives resources through the global phase passes
//!
//! Passes run in this order, each one a barrier:
//! PREPARE, SYNC, POSTCHILDREN_SYNC, EXECUTE, POSTCHILDREN_EXECUTE, then
//! CLEANUP in reverse execution order for every resource.

use crate::action::ActionOutcome;
use crate::context::{ActionContext, Host, ProgressCallback};
use crate::error::Result;
use crate::notification::Dispatcher;
use crate::resolver::fail_dependents;
use crate::resource::{Resource, ResourceHandle};
use crate::sort::ActionPlan;
use crate::types::{
    CleanupFailure, ExecuteOptions, ExecutionReport, Failure, Phase, ResourceOutcome, State,
};
use rayon::prelude::*;
use std::sync::{Arc, Mutex, PoisonError};

/// Passes before cleanup, in execution order
const PASSES: [Phase; 5] = [
    Phase::Prepare,
    Phase::Sync,
    Phase::PostChildrenSync,
    Phase::Execute,
    Phase::PostChildrenExecute,
];

/// Frozen view of a prepared graph; taken under the manager lock, used
/// without it.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionGraph {
    pub(crate) resources: Vec<Arc<Resource>>,
    pub(crate) order: Vec<ResourceHandle>,
    pub(crate) post_order: Vec<ResourceHandle>,
    pub(crate) plans: Vec<ActionPlan>,
}

impl ExecutionGraph {
    pub(crate) fn new(
        resources: Vec<Arc<Resource>>,
        order: Vec<ResourceHandle>,
        post_order: Vec<ResourceHandle>,
        plans: Vec<ActionPlan>,
    ) -> Self {
        Self {
            resources,
            order,
            post_order,
            plans,
        }
    }
}

/// Result of one resource running one phase
struct PhaseOutcome {
    handle: ResourceHandle,
    started: bool,
    emitted: Vec<String>,
    failure: Option<Failure>,
}

/// Execute a prepared graph
///
/// # Arguments
/// * `graph` - Resources, execution order and action plans
/// * `host` - Host the actions run against
/// * `options` - Execution options (jobs, deadline, cancel flag)
/// * `progress` - Progress callback
///
/// # Returns
/// Per-resource outcomes; action failures never surface as `Err`
pub(crate) fn execute<P: ProgressCallback + ?Sized>(
    graph: &ExecutionGraph,
    host: &dyn Host,
    options: &ExecuteOptions,
    progress: &mut P,
) -> Result<ExecutionReport> {
    let pool = if options.jobs > 1 {
        Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(options.jobs)
                .build()?,
        )
    } else {
        None
    };

    let mut executor = Executor {
        graph,
        host,
        options,
        pool: pool.as_ref(),
        done: vec![false; graph.resources.len()],
    };
    let mut dispatcher = Dispatcher::new(&graph.resources, &graph.order, &graph.plans);
    let mut report = ExecutionReport::default();

    for phase in PASSES {
        let order = if phase.is_post_children() {
            &graph.post_order
        } else {
            &graph.order
        };
        if !executor.run_pass(phase, order, &mut dispatcher, progress) {
            report.cancelled = true;
            break;
        }
        if phase.can_notify() {
            for handle in dispatcher.flush(phase, host) {
                progress.on_resource_complete(
                    graph.resources[handle.0].uid(),
                    phase,
                    &graph.resources[handle.0].state(),
                );
            }
        }
    }

    if report.cancelled {
        log::warn!("Execution cancelled, cleaning up");
        executor.cancel_unfinished();
    }
    report.cleanup_failures = executor.cleanup(progress);

    report.outcomes = graph
        .order
        .iter()
        .map(|handle| {
            let resource = &graph.resources[handle.0];
            let data = resource.read();
            ResourceOutcome {
                uid: resource.uid().to_string(),
                fqname: data.definition.fqname().to_string(),
                state: data.state.clone(),
                actions_run: data.actions_run.clone(),
                cleaned: data.cleaned,
            }
        })
        .collect();
    Ok(report)
}

struct Executor<'a> {
    graph: &'a ExecutionGraph,
    host: &'a dyn Host,
    options: &'a ExecuteOptions,
    pool: Option<&'a rayon::ThreadPool>,
    /// Resources that completed every pass before cleanup
    done: Vec<bool>,
}

impl Executor<'_> {
    /// Run one pass; returns false when the run was stopped part way
    fn run_pass<P: ProgressCallback + ?Sized>(
        &mut self,
        phase: Phase,
        order: &[ResourceHandle],
        dispatcher: &mut Dispatcher<'_>,
        progress: &mut P,
    ) -> bool {
        if self.options.should_stop() {
            return false;
        }
        log::info!("Running {} pass over {} resources", phase, order.len());
        progress.on_phase_start(phase, order.len());

        let completed = match self.pool {
            // post-children passes walk their own descendants-first order,
            // not dependency waves, so they always run sequentially
            Some(pool) if !phase.is_post_children() => {
                self.run_parallel(pool, phase, order, dispatcher, progress)
            }
            _ => self.run_sequential(phase, order, dispatcher, progress),
        };

        progress.on_phase_complete(phase);
        completed
    }

    fn run_sequential<P: ProgressCallback + ?Sized>(
        &mut self,
        phase: Phase,
        order: &[ResourceHandle],
        dispatcher: &mut Dispatcher<'_>,
        progress: &mut P,
    ) -> bool {
        let graph = self.graph;
        for &handle in order {
            let resource = &graph.resources[handle.0];
            if resource.is_failed() {
                continue;
            }
            if self.options.should_stop() {
                return false;
            }
            progress.on_resource_start(resource.uid(), phase);
            let outcome = run_phase(resource, &graph.plans[handle.0], phase, self.host);
            self.apply(phase, outcome, dispatcher);
            progress.on_resource_complete(resource.uid(), phase, &resource.state());
        }
        true
    }

    /// Run a pass in dependency waves on the worker pool.
    ///
    /// A resource only starts once every resource it depends on finished
    /// this phase. Results are applied in execution order after each wave.
    fn run_parallel<P: ProgressCallback + ?Sized>(
        &mut self,
        pool: &rayon::ThreadPool,
        phase: Phase,
        order: &[ResourceHandle],
        dispatcher: &mut Dispatcher<'_>,
        progress: &mut P,
    ) -> bool {
        let graph = self.graph;
        let host = self.host;
        let options = self.options;

        for wave in waves(graph, order) {
            let runnable: Vec<ResourceHandle> = wave
                .into_iter()
                .filter(|h| !graph.resources[h.0].is_failed())
                .collect();
            if runnable.is_empty() {
                continue;
            }
            if options.should_stop() {
                return false;
            }
            for handle in &runnable {
                progress.on_resource_start(graph.resources[handle.0].uid(), phase);
            }

            let results: Arc<Mutex<Vec<PhaseOutcome>>> = Arc::new(Mutex::new(Vec::new()));
            pool.install(|| {
                runnable.par_iter().for_each(|handle| {
                    let outcome = if options.should_stop() {
                        PhaseOutcome::not_started(*handle)
                    } else {
                        run_phase(&graph.resources[handle.0], &graph.plans[handle.0], phase, host)
                    };
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(outcome);
                });
            });

            let mut results = std::mem::take(
                &mut *results.lock().unwrap_or_else(PoisonError::into_inner),
            );
            let position = |h: ResourceHandle| runnable.iter().position(|r| *r == h);
            results.sort_by_key(|o| position(o.handle));

            let mut stopped = false;
            for outcome in results {
                let resource = &graph.resources[outcome.handle.0];
                stopped |= !outcome.started;
                self.apply(phase, outcome, dispatcher);
                progress.on_resource_complete(resource.uid(), phase, &resource.state());
            }
            if stopped {
                return false;
            }
        }
        true
    }

    /// Record the outcome of one resource's phase
    fn apply(&mut self, phase: Phase, outcome: PhaseOutcome, dispatcher: &mut Dispatcher<'_>) {
        if !outcome.started {
            return;
        }
        let graph = self.graph;
        let resources = &graph.resources;
        let resource = &resources[outcome.handle.0];
        dispatcher.raise(resource, phase, outcome.emitted);

        if let Some(failure) = outcome.failure {
            log::error!("{}: {}", resource.uid(), failure);
            resource.write().fail(failure);
            let dependents = fail_dependents(resources, outcome.handle);
            if !dependents.is_empty() {
                log::warn!(
                    "{} dependent resource(s) of {} will not run",
                    dependents.len(),
                    resource.uid()
                );
            }
            return;
        }

        let mut data = resource.write();
        match phase {
            Phase::Prepare => data.state = State::Prepared,
            Phase::Sync => data.state = State::Synced,
            Phase::Execute => data.state = State::Executed,
            Phase::PostChildrenExecute => self.done[outcome.handle.0] = true,
            Phase::PostChildrenSync | Phase::Cleanup => {}
        }
    }

    /// Fail every resource that had not finished when the run stopped
    fn cancel_unfinished(&self) {
        for handle in &self.graph.order {
            if !self.done[handle.0] {
                self.graph.resources[handle.0]
                    .write()
                    .fail(Failure::cancelled());
            }
        }
    }

    /// Run CLEANUP for every resource in reverse execution order.
    ///
    /// Best effort: failures are logged and returned, never change state.
    fn cleanup<P: ProgressCallback + ?Sized>(&self, progress: &mut P) -> Vec<CleanupFailure> {
        let phase = Phase::Cleanup;
        let mut failures = Vec::new();
        progress.on_phase_start(phase, self.graph.order.len());

        for handle in self.graph.order.iter().rev() {
            let resource = &self.graph.resources[handle.0];
            progress.on_resource_start(resource.uid(), phase);
            for action in self.graph.plans[handle.0].actions(phase) {
                if let Some(missing) = missing_requirement(resource, action.required_actions()) {
                    log::debug!(
                        "{}: skipping cleanup '{}', '{}' has not run",
                        resource.uid(),
                        action.name(),
                        missing
                    );
                    continue;
                }
                let mut ctx = ActionContext::new(resource, self.host, phase);
                match action.run(&mut ctx) {
                    Ok(_) => resource
                        .write()
                        .actions_run
                        .push(action.name().to_string()),
                    Err(err) => {
                        log::error!(
                            "{}: cleanup '{}' failed: {:#}",
                            resource.uid(),
                            action.name(),
                            err
                        );
                        failures.push(CleanupFailure {
                            uid: resource.uid().to_string(),
                            action: action.name().to_string(),
                            message: format!("{err:#}"),
                        });
                    }
                }
            }
            resource.write().cleaned = true;
            progress.on_resource_complete(resource.uid(), phase, &resource.state());
        }

        progress.on_phase_complete(phase);
        failures
    }
}

impl PhaseOutcome {
    fn not_started(handle: ResourceHandle) -> Self {
        Self {
            handle,
            started: false,
            emitted: Vec::new(),
            failure: None,
        }
    }
}

fn missing_requirement<'a>(resource: &Resource, required: &'a [String]) -> Option<&'a str> {
    let data = resource.read();
    required
        .iter()
        .find(|name| !data.actions_run.contains(name))
        .map(String::as_str)
}

/// Run the actions of one phase for one resource, stopping at the first
/// failure.
fn run_phase(
    resource: &Resource,
    plan: &ActionPlan,
    phase: Phase,
    host: &dyn Host,
) -> PhaseOutcome {
    let mut outcome = PhaseOutcome {
        handle: resource.handle(),
        started: true,
        emitted: Vec::new(),
        failure: None,
    };

    for action in plan.actions(phase) {
        if let Some(missing) = missing_requirement(resource, action.required_actions()) {
            log::debug!(
                "{}: skipping '{}', '{}' has not run",
                resource.uid(),
                action.name(),
                missing
            );
            continue;
        }

        let mut ctx = ActionContext::new(resource, host, phase);
        let result = action.run(&mut ctx);
        outcome.emitted.extend(ctx.into_emitted());
        match result {
            Ok(ActionOutcome::Applied) => {
                log::debug!("{}: ran {} '{}'", resource.uid(), phase, action.name());
                resource
                    .write()
                    .actions_run
                    .push(action.name().to_string());
            }
            Ok(ActionOutcome::InSync) => {
                log::debug!("{}: '{}' already in sync", resource.uid(), action.name());
            }
            Err(err) => {
                outcome.failure = Some(Failure::action(phase, action.name(), &err));
                break;
            }
        }
    }
    outcome
}

/// Group `order` into waves; every resource lands in a later wave than all
/// of its dependencies.
fn waves(graph: &ExecutionGraph, order: &[ResourceHandle]) -> Vec<Vec<ResourceHandle>> {
    let mut level = vec![0usize; graph.resources.len()];
    let mut waves: Vec<Vec<ResourceHandle>> = Vec::new();
    for &handle in order {
        let wave = graph.resources[handle.0]
            .dependencies()
            .iter()
            .map(|d| level[d.0] + 1)
            .max()
            .unwrap_or(0);
        level[handle.0] = wave;
        if waves.len() <= wave {
            waves.resize_with(wave + 1, Vec::new);
        }
        waves[wave].push(handle);
    }
    waves
}
