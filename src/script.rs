//! Script-backed definitions: actions are shell command templates
//!
//! Templates reference attributes as `{{name}}`. `{{id}}`, `{{uid}}` and
//! `{{host}}` are always available; handlers also see `{{sources}}`, the
//! comma-separated uids of the notifying resources.

use crate::manifest::{ActionSpec, DefinitionSpec, HandlerSpec};
use anyhow::{Result, bail};
use declarative::{Action, ActionContext, NotificationHandler, Resource, ResourceDefinition};
use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Substitute `{{name}}` placeholders; `extra` is consulted first.
pub fn expand(template: &str, resource: &Resource, extra: &[(&str, &str)]) -> Result<String> {
    let mut missing = Vec::new();
    let expanded = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        if let Some((_, value)) = extra.iter().find(|(key, _)| *key == name) {
            return (*value).to_string();
        }
        let builtin = match name {
            "id" => Some(resource.id().to_string()),
            "uid" => Some(resource.uid().to_string()),
            "host" => Some(resource.host().to_string()),
            _ => None,
        };
        match resource.get(name).or(builtin) {
            Some(value) => value,
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        bail!(
            "{}: template references unknown attribute(s): {}",
            resource.uid(),
            missing.join(", ")
        );
    }
    Ok(expanded.into_owned())
}

/// Build a definition from its manifest form
pub fn definition(spec: &DefinitionSpec) -> declarative::Result<ResourceDefinition> {
    let mut builder = ResourceDefinition::builder(spec.fqname.as_str()).unique(spec.unique);
    for (name, value) in &spec.defaults {
        builder = builder.default_attr(name, value);
    }
    for action in &spec.actions {
        if let Some(verify) = &action.verify {
            builder = builder.verify(&action.name, verify_body(verify.clone()));
        }
        builder = builder.action(script_action(action));
    }
    for handler in &spec.handlers {
        builder = builder.handler(script_handler(handler));
    }
    builder.build()
}

fn script_action(spec: &ActionSpec) -> Action {
    let mut action = Action::new(
        spec.phase,
        &spec.name,
        run_body(spec.run.clone(), spec.notify.clone()),
    )
    .with_order(spec.order);
    for required in &spec.only_if_after {
        action = action.only_if_after(required);
    }
    for name in &spec.notify {
        action = action.emits(name);
    }
    action
}

fn script_handler(spec: &HandlerSpec) -> NotificationHandler {
    let template = spec.run.clone();
    NotificationHandler::new(&spec.notification, move |ctx, batch| {
        let sources: Vec<&str> = batch.iter().map(|n| n.source()).collect();
        let sources = sources.join(",");
        let command = expand(&template, ctx.resource(), &[("sources", sources.as_str())])?;
        run_checked(ctx, &command)
    })
    .with_reorder(spec.reorder)
    .with_aggregate(spec.aggregate)
    .with_only_if_after(spec.only_if_after)
}

fn run_body(
    template: String,
    notify: Vec<String>,
) -> impl Fn(&mut ActionContext<'_>) -> Result<()> + Send + Sync + 'static {
    move |ctx| {
        let command = expand(&template, ctx.resource(), &[])?;
        run_checked(ctx, &command)?;
        for name in &notify {
            ctx.notify(name.as_str());
        }
        Ok(())
    }
}

fn verify_body(
    template: String,
) -> impl Fn(&mut ActionContext<'_>) -> Result<bool> + Send + Sync + 'static {
    move |ctx| {
        let command = expand(&template, ctx.resource(), &[])?;
        ctx.host().exec_status(&command)
    }
}

fn run_checked(ctx: &ActionContext<'_>, command: &str) -> Result<()> {
    let output = ctx.exec(command)?;
    if !output.success() {
        bail!(
            "`{}` exited with {}: {}",
            command,
            output.exit_code,
            output.output.trim()
        );
    }
    Ok(())
}
