//! # Declarative
//!
//! An engine for declarative configuration management.
//!
//! Resource types are described by a [`ResourceDefinition`]: the actions it
//! runs in each lifecycle phase and the notifications it reacts to. A
//! [`ResourceManager`] instantiates resources, resolves the dependency graph
//! between them, orders it and drives every resource through the phases.
//!
//! ## Core Concepts
//!
//! - **Resource**: An instance of a definition, identified by a dotted uid
//!   (`web.nginx`) and carrying string attributes
//! - **Dependency**: An edge `a -> b` meaning `a` runs after `b`; declared
//!   directly, by query, by the `after`/`before` attributes or in bulk
//! - **Phase**: PREPARE, SYNC, POSTCHILDREN_SYNC, EXECUTE,
//!   POSTCHILDREN_EXECUTE and CLEANUP, run as global passes
//! - **Notification**: A named signal raised by an action and delivered to
//!   handlers once the emitting pass has completed
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     Action, CreateOptions, ExecuteOptions, ResourceDefinition, ResourceManager,
//! };
//!
//! let file = ResourceDefinition::builder("core.file")
//!     .verify("content", |ctx| {
//!         let path = ctx.require("path")?;
//!         Ok(std::fs::read_to_string(path).ok() == ctx.get("content"))
//!     })
//!     .sync(Action::sync("content", |ctx| {
//!         std::fs::write(ctx.require("path")?, ctx.require("content")?)?;
//!         Ok(())
//!     }))
//!     .build()?;
//!
//! let manager = ResourceManager::new();
//! manager.register_definition(file)?;
//! manager.create_resource(
//!     "core.file",
//!     CreateOptions::new()
//!         .id("motd")
//!         .attr("path", "/etc/motd")
//!         .attr("content", "hello"),
//! )?;
//!
//! let report = manager.execute(&host, &ExecuteOptions::default())?;
//! assert!(report.is_success());
//! ```
//!
//! ## Provider Traits
//!
//! The engine reaches the outside world through traits:
//!
//! - [`Host`]: Runs commands for actions
//! - [`QueryEngine`]: Evaluates dependency queries
//! - [`DefinitionLoader`]: Supplies definitions for unknown types
//! - [`ProgressCallback`]: Receives progress updates
//!
//! This allows the engine to be used without hard dependencies on a
//! particular transport, query language or UI.

pub mod action;
pub mod context;
pub mod definition;
pub mod error;
mod executor;
pub mod fqname;
pub mod manager;
pub mod notification;
pub mod query;
mod resolver;
pub mod resource;
pub mod sort;
pub mod types;

// Re-export main types at crate root
pub use action::{Action, ActionOutcome, NotificationHandler};
pub use context::{ActionContext, Host, NoHost, NoProgress, ProgressCallback};
pub use definition::{ResourceDefinition, ResourceDefinitionBuilder};
pub use error::{Error, ErrorCategory, Result};
pub use fqname::FQName;
pub use manager::{CreateOptions, DEFAULT_HOST, DefinitionLoader, ResourceManager};
pub use notification::Notification;
pub use query::{AttributeQuery, GraphView, QueryEngine};
pub use resolver::{AFTER_ATTR, BEFORE_ATTR, Selector};
pub use resource::{Resource, ResourceHandle};
pub use sort::topological_order;
pub use types::{
    CancelFlag, CleanupFailure, CommandOutput, ExecuteOptions, ExecuteSummary, ExecutionReport,
    Failure, FailureKind, LogPolicy, Phase, ResourceOutcome, State, UniqueScope,
};
