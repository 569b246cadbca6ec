//! Notification dispatch
//!
//! Actions raise notifications through [`ActionContext::notify`]. They are
//! queued with their source and delivered once the emitting pass has
//! completed, to every other resource whose definition has a handler for
//! the name. Handlers may raise notifications themselves; those are
//! delivered in a follow-up round of the same flush.

use crate::context::{ActionContext, Host};
use crate::resolver::fail_dependents;
use crate::resource::{Resource, ResourceHandle};
use crate::sort::ActionPlan;
use crate::types::{Failure, Phase};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Follow-up rounds allowed per flush before handler chains are cut off
const MAX_ROUNDS: usize = 16;

/// One raised notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    name: String,
    source: String,
    phase: Phase,
    #[serde(skip)]
    pub(crate) source_handle: ResourceHandle,
    #[serde(skip)]
    pub(crate) seq: usize,
}

impl Notification {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Uid of the resource that raised it
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Phase during which it was raised
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

pub(crate) struct Dispatcher<'a> {
    resources: &'a [Arc<Resource>],
    order: &'a [ResourceHandle],
    /// Execution position per handle
    positions: Vec<usize>,
    /// Last phase with an action declared to emit each name
    emitters: HashMap<String, Phase>,
    pending: Vec<Notification>,
    /// (notification seq, target, handler index)
    delivered: HashSet<(usize, ResourceHandle, usize)>,
    next_seq: usize,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(
        resources: &'a [Arc<Resource>],
        order: &'a [ResourceHandle],
        plans: &[ActionPlan],
    ) -> Self {
        let mut positions = vec![usize::MAX; resources.len()];
        for (position, handle) in order.iter().enumerate() {
            positions[handle.0] = position;
        }

        let mut emitters: HashMap<String, Phase> = HashMap::new();
        for plan in plans {
            for phase in Phase::ALL {
                for action in plan.actions(phase) {
                    for name in action.emitted() {
                        let last = emitters.entry(name.clone()).or_insert(phase);
                        *last = (*last).max(phase);
                    }
                }
            }
        }

        Self {
            resources,
            order,
            positions,
            emitters,
            pending: Vec::new(),
            delivered: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Queue notifications raised by `source` during `phase`
    pub(crate) fn raise(&mut self, source: &Resource, phase: Phase, names: Vec<String>) {
        for name in names {
            log::debug!("{} raised notification '{}'", source.uid(), name);
            self.pending.push(Notification {
                name,
                source: source.uid().to_string(),
                phase,
                source_handle: source.handle(),
                seq: self.next_seq,
            });
            self.next_seq += 1;
        }
    }

    /// Deliver everything due at the end of `phase`.
    ///
    /// Returns the resources failed by handler errors, dependents included.
    pub(crate) fn flush(&mut self, phase: Phase, host: &dyn Host) -> Vec<ResourceHandle> {
        let mut failed = Vec::new();
        for round in 1..=MAX_ROUNDS {
            let raised = self.next_seq;
            self.deliver(phase, host, &mut failed);
            if self.next_seq == raised {
                return failed;
            }
            if round == MAX_ROUNDS {
                log::warn!(
                    "Notification handlers still raising after {MAX_ROUNDS} rounds in {phase}, giving up"
                );
            }
        }
        failed
    }

    fn is_due(&self, notification: &Notification, reorder: bool, phase: Phase) -> bool {
        if !reorder {
            return notification.phase <= phase;
        }
        let last_emitter = self
            .emitters
            .get(&notification.name)
            .copied()
            .unwrap_or(notification.phase);
        notification.phase.max(last_emitter) <= phase
    }

    fn deliver(&mut self, phase: Phase, host: &dyn Host, failed: &mut Vec<ResourceHandle>) {
        let resources = self.resources;
        for &target in self.order {
            let resource = &resources[target.0];
            if resource.is_failed() {
                continue;
            }
            let definition = resource.definition();
            for (index, handler) in definition.handlers().iter().enumerate() {
                let due: Vec<Notification> = self
                    .pending
                    .iter()
                    .filter(|n| {
                        n.name == handler.notification()
                            && n.source_handle != target
                            && self.is_due(n, handler.reorder(), phase)
                            && (!handler.only_if_after()
                                || self.positions[n.source_handle.0] < self.positions[target.0])
                            && !self.delivered.contains(&(n.seq, target, index))
                    })
                    .cloned()
                    .collect();
                if due.is_empty() {
                    continue;
                }
                for n in &due {
                    self.delivered.insert((n.seq, target, index));
                }

                let batches = if handler.aggregate() {
                    vec![due]
                } else {
                    due.into_iter().map(|n| vec![n]).collect()
                };
                for batch in batches {
                    if resource.is_failed() {
                        break;
                    }
                    log::debug!(
                        "Delivering {} x '{}' to {}",
                        batch.len(),
                        handler.notification(),
                        resource.uid()
                    );
                    let mut ctx = ActionContext::new(resource, host, phase);
                    let result = handler.invoke(&mut ctx, &batch);
                    let emitted = ctx.into_emitted();
                    match result {
                        Ok(()) => self.raise(resource, phase, emitted),
                        Err(err) => {
                            log::error!(
                                "{}: handler for '{}' failed: {:#}",
                                resource.uid(),
                                handler.notification(),
                                err
                            );
                            resource
                                .write()
                                .fail(Failure::handler(handler.notification(), &err));
                            failed.push(target);
                            failed.extend(fail_dependents(resources, target));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::action::{Action, NotificationHandler};
    use crate::context::NoHost;
    use crate::definition::ResourceDefinition;
    use crate::manager::{CreateOptions, ResourceManager};
    use crate::types::{ExecuteOptions, FailureKind, Phase};
    use std::sync::{Arc, Mutex};

    /// (phase, batch size) per handler call
    type Calls = Arc<Mutex<Vec<(Phase, usize)>>>;

    fn config_file() -> ResourceDefinition {
        ResourceDefinition::builder("core.config")
            .action(
                Action::execute("write", |ctx| {
                    ctx.notify("restart");
                    Ok(())
                })
                .emits("restart"),
            )
            .build()
            .unwrap()
    }

    fn service(
        calls: &Calls,
        handler: impl Fn(NotificationHandler) -> NotificationHandler,
    ) -> ResourceDefinition {
        let calls = Arc::clone(calls);
        ResourceDefinition::builder("core.service")
            .execute("start", |_| Ok(()))
            .handler(handler(NotificationHandler::new("restart", move |ctx, batch| {
                calls.lock().unwrap().push((ctx.phase(), batch.len()));
                Ok(())
            })))
            .build()
            .unwrap()
    }

    fn run(manager: &ResourceManager) {
        let report = manager.execute(&NoHost, &ExecuteOptions::default()).unwrap();
        assert!(report.is_success(), "{:?}", report.failures().collect::<Vec<_>>());
    }

    #[test]
    fn test_aggregated_notifications_are_batched() {
        let calls = Calls::default();
        let manager = ResourceManager::new();
        manager.register_definition(config_file()).unwrap();
        manager.register_definition(service(&calls, |h| h)).unwrap();
        for _ in 0..3 {
            manager.create_resource("core.config", CreateOptions::new()).unwrap();
        }
        manager.create_resource("core.service", CreateOptions::new()).unwrap();

        run(&manager);
        assert_eq!(*calls.lock().unwrap(), vec![(Phase::Execute, 3)]);
    }

    #[test]
    fn test_unaggregated_notifications_are_delivered_one_by_one() {
        let calls = Calls::default();
        let manager = ResourceManager::new();
        manager.register_definition(config_file()).unwrap();
        manager
            .register_definition(service(&calls, |h| h.with_aggregate(false)))
            .unwrap();
        for _ in 0..3 {
            manager.create_resource("core.config", CreateOptions::new()).unwrap();
        }
        manager.create_resource("core.service", CreateOptions::new()).unwrap();

        run(&manager);
        assert_eq!(calls.lock().unwrap().len(), 3);
        assert!(calls.lock().unwrap().iter().all(|(_, n)| *n == 1));
    }

    #[test]
    fn test_repeated_emissions_from_one_action() {
        let chatty = ResourceDefinition::builder("core.config")
            .action(
                Action::execute("write", |ctx| {
                    for _ in 0..3 {
                        ctx.notify("restart");
                    }
                    Ok(())
                })
                .emits("restart"),
            )
            .build()
            .unwrap();

        for (aggregate, expected) in [(true, 1), (false, 3)] {
            let calls = Calls::default();
            let manager = ResourceManager::new();
            manager.register_definition(chatty.clone()).unwrap();
            manager
                .register_definition(service(&calls, |h| h.with_aggregate(aggregate)))
                .unwrap();
            manager.create_resource("core.config", CreateOptions::new()).unwrap();
            manager.create_resource("core.service", CreateOptions::new()).unwrap();

            run(&manager);
            assert_eq!(calls.lock().unwrap().len(), expected, "aggregate={aggregate}");
        }
    }

    #[test]
    fn test_reorder_defers_to_last_emitting_phase() {
        let emitter = ResourceDefinition::builder("core.package")
            .verify("installed", |_| Ok(false))
            .sync(
                Action::sync("installed", |ctx| {
                    ctx.notify("restart");
                    Ok(())
                })
                .emits("restart"),
            )
            .action(
                Action::execute("configure", |ctx| {
                    ctx.notify("restart");
                    Ok(())
                })
                .emits("restart"),
            )
            .build()
            .unwrap();

        for (reorder, expected) in [
            (true, vec![(Phase::Execute, 2)]),
            (false, vec![(Phase::Sync, 1), (Phase::Execute, 1)]),
        ] {
            let calls = Calls::default();
            let manager = ResourceManager::new();
            manager.register_definition(emitter.clone()).unwrap();
            manager
                .register_definition(service(&calls, |h| h.with_reorder(reorder)))
                .unwrap();
            manager.create_resource("core.package", CreateOptions::new()).unwrap();
            manager.create_resource("core.service", CreateOptions::new()).unwrap();

            run(&manager);
            assert_eq!(*calls.lock().unwrap(), expected, "reorder = {reorder}");
        }
    }

    #[test]
    fn test_only_if_after_ignores_earlier_targets() {
        let calls = Calls::default();
        let manager = ResourceManager::new();
        manager.register_definition(config_file()).unwrap();
        manager
            .register_definition(service(&calls, |h| h.with_only_if_after(true)))
            .unwrap();
        // the service runs before the config file, so it is not notified
        manager.create_resource("core.service", CreateOptions::new()).unwrap();
        manager.create_resource("core.config", CreateOptions::new()).unwrap();

        run(&manager);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_failure_fails_target_and_dependents() {
        let failing = ResourceDefinition::builder("core.service")
            .handler(NotificationHandler::new("restart", |_, _| {
                anyhow::bail!("unit not found")
            }))
            .build()
            .unwrap();
        let manager = ResourceManager::new();
        manager.register_definition(config_file()).unwrap();
        manager.register_definition(failing).unwrap();
        manager
            .register_definition(ResourceDefinition::builder("core.check").build().unwrap())
            .unwrap();

        manager.create_resource("core.config", CreateOptions::new()).unwrap();
        let svc = manager
            .create_resource("core.service", CreateOptions::new().id("svc"))
            .unwrap();
        let check = manager
            .create_resource("core.check", CreateOptions::new().attr("after", "id=svc"))
            .unwrap();

        let report = manager.execute(&NoHost, &ExecuteOptions::default()).unwrap();
        assert!(!report.is_success());
        assert_eq!(
            svc.failure().unwrap().kind,
            FailureKind::Handler {
                notification: "restart".into()
            }
        );
        // the dependent already executed before handlers were flushed
        assert_eq!(
            check.failure().unwrap().kind,
            FailureKind::DependencyAfterRun { uid: "svc".into() }
        );
        let outcome = report.outcome(check.uid()).unwrap();
        assert!(outcome.state.to_string().contains("after this resource had executed"));
    }
}
