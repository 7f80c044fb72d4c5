//! Workflow Definition Module
//!
//! The workflow aggregate and everything that describes one run before it
//! executes.
//!
//! # Structure
//!
//! - [`model`]: The [`Workflow`] aggregate owning steps, dependencies,
//!   registries, and the cancellation signal
//! - [`cancel`]: One-shot cancellation signal
//! - [`chain`]: Dependency resolution across nested include/sub workflows
//! - [`validator`]: Identifier patterns and DAG validation
//! - [`loader`]: Graph-document (YAML/JSON) loading

pub mod cancel;
pub mod chain;
pub mod loader;
pub mod model;
pub mod validator;

pub use cancel::CancelSignal;
pub use loader::{GraphDoc, StepDoc};
pub use model::Workflow;
