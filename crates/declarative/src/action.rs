//! Actions and notification handlers bound to a resource definition

use crate::context::ActionContext;
use crate::notification::Notification;
use crate::types::Phase;
use anyhow::Result;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Body of an action
pub type ActionFn = Arc<dyn Fn(&mut ActionContext<'_>) -> Result<()> + Send + Sync>;

/// Verify predicate paired with a sync body; `true` means already in sync
pub type VerifyFn = Arc<dyn Fn(&mut ActionContext<'_>) -> Result<bool> + Send + Sync>;

/// Body of a notification handler
pub type HandlerFn =
    Arc<dyn Fn(&mut ActionContext<'_>, &[Notification]) -> Result<()> + Send + Sync>;

/// What running an action did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The body ran
    Applied,
    /// Verify reported the resource already in the desired state
    InSync,
}

/// A unit of behavior bound to one lifecycle phase
#[derive(Clone)]
pub struct Action {
    name: String,
    phase: Phase,
    order: i32,
    /// Declaration index, the tie-break for equal order keys
    pub(crate) seq: usize,
    body: ActionFn,
    verify: Option<VerifyFn>,
    only_if_after: Vec<String>,
    emits: BTreeSet<String>,
}

impl Action {
    pub fn new<F>(phase: Phase, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            phase,
            order: 0,
            seq: 0,
            body: Arc::new(body),
            verify: None,
            only_if_after: Vec::new(),
            emits: BTreeSet::new(),
        }
    }

    pub fn prepare<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(Phase::Prepare, name, body)
    }

    pub fn execute<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(Phase::Execute, name, body)
    }

    /// Sync body; must be paired with a verify of the same name when
    /// registered through the definition builder.
    pub fn sync<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(Phase::Sync, name, body)
    }

    pub fn cleanup<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(Phase::Cleanup, name, body)
    }

    /// Set the ordering key (lower runs first)
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Move a sync or execute action to its post-children phase
    pub fn post_children(mut self) -> Self {
        self.phase = self.phase.post_children();
        self
    }

    /// Run only if the named action already ran on this resource
    pub fn only_if_after(mut self, action: impl Into<String>) -> Self {
        self.only_if_after.push(action.into());
        self
    }

    /// Declare a notification this action may emit
    pub fn emits(mut self, notification: impl Into<String>) -> Self {
        self.emits.insert(notification.into());
        self
    }

    pub(crate) fn with_verify(mut self, verify: VerifyFn) -> Self {
        self.verify = Some(verify);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn has_verify(&self) -> bool {
        self.verify.is_some()
    }

    /// Actions that must have run before this one
    pub fn required_actions(&self) -> &[String] {
        &self.only_if_after
    }

    /// Notifications this action may emit
    pub fn emitted(&self) -> &BTreeSet<String> {
        &self.emits
    }

    /// Run verify (if any), then the body when verify did not report in sync
    pub(crate) fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        if let Some(verify) = &self.verify
            && verify(ctx)?
        {
            return Ok(ActionOutcome::InSync);
        }
        (self.body)(ctx)?;
        Ok(ActionOutcome::Applied)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("order", &self.order)
            .field("verify", &self.verify.is_some())
            .field("only_if_after", &self.only_if_after)
            .field("emits", &self.emits)
            .finish_non_exhaustive()
    }
}

/// Handler subscribed to a notification name
#[derive(Clone)]
pub struct NotificationHandler {
    notification: String,
    reorder: bool,
    aggregate: bool,
    only_if_after: bool,
    body: HandlerFn,
}

impl NotificationHandler {
    /// Handler with the default flags: reorder and aggregate on,
    /// only-if-after off.
    pub fn new<F>(notification: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>, &[Notification]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            notification: notification.into(),
            reorder: true,
            aggregate: true,
            only_if_after: false,
            body: Arc::new(body),
        }
    }

    pub fn with_reorder(mut self, reorder: bool) -> Self {
        self.reorder = reorder;
        self
    }

    pub fn with_aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;
        self
    }

    pub fn with_only_if_after(mut self, only_if_after: bool) -> Self {
        self.only_if_after = only_if_after;
        self
    }

    pub fn notification(&self) -> &str {
        &self.notification
    }

    pub fn reorder(&self) -> bool {
        self.reorder
    }

    pub fn aggregate(&self) -> bool {
        self.aggregate
    }

    pub fn only_if_after(&self) -> bool {
        self.only_if_after
    }

    pub(crate) fn invoke(
        &self,
        ctx: &mut ActionContext<'_>,
        notifications: &[Notification],
    ) -> Result<()> {
        (self.body)(ctx, notifications)
    }
}

impl fmt::Debug for NotificationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationHandler")
            .field("notification", &self.notification)
            .field("reorder", &self.reorder)
            .field("aggregate", &self.aggregate)
            .field("only_if_after", &self.only_if_after)
            .finish_non_exhaustive()
    }
}
