//! FlowRunner - Concurrent Workflow Execution Engine
//!
//! A library for running dependency-ordered workflows: named steps form a
//! DAG, every step runs on its own thread as soon as its dependencies
//! finish, and per-category resource registries track which steps create,
//! use, and delete shared named resources so unsafe orderings are rejected
//! before anything executes. Runs support cooperative cancellation and
//! per-step timeouts.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: The workflow aggregate, dependency-graph validation,
//!   nested include/sub workflows, cancellation, and graph-document loading
//! - [`execution`]: Step lifecycle and the thread-per-step scheduler
//! - [`resource`]: Resource registries and attachment/connection tracking
//! - [`error`]: Kind-tagged errors shared by every module
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrunner::{Step, StepAction, Workflow, WorkflowError};
//!
//! struct Announce(&'static str);
//!
//! impl StepAction for Announce {
//!     fn populate(&self, _w: &Arc<Workflow>, _s: &Arc<Step>) -> Result<(), WorkflowError> {
//!         Ok(())
//!     }
//!     fn validate(&self, _w: &Arc<Workflow>, _s: &Arc<Step>) -> Result<(), WorkflowError> {
//!         Ok(())
//!     }
//!     fn run(&self, _w: &Arc<Workflow>, _s: &Arc<Step>) -> Result<(), WorkflowError> {
//!         println!("{}", self.0);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), WorkflowError> {
//!     let workflow = Workflow::new("build-image");
//!     workflow.add_step(Step::new("fetch").with_action(Box::new(Announce("fetching"))))?;
//!     workflow.add_step(
//!         Step::new("bake")
//!             .with_action(Box::new(Announce("baking")))
//!             .depends_on("fetch"),
//!     )?;
//!     workflow.run()
//! }
//! ```

pub mod error;
pub mod execution;
pub mod resource;
pub mod workflow;

// Re-export commonly used types
pub use error::{ErrorKind, MultiError, WorkflowError};
pub use execution::{Step, StepAction, StepBody};
pub use resource::{AttachMode, AttachmentTracker, ConnectionTracker};
pub use resource::{NoopHandler, Resource, ResourceHandler, ResourceRegistry};
pub use workflow::{CancelSignal, GraphDoc, Workflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
