//! Error Types
//!
//! Every fallible operation in the engine reports a [`WorkflowError`]: a
//! human-readable message carrying a machine-readable [`ErrorKind`] tag.
//! Sweep operations that keep going after individual failures collect them
//! in a [`MultiError`], which renders as a bulleted list and collapses to
//! `Ok(())` when empty.

use std::fmt;

use thiserror::Error;

/// Machine-readable classification of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A resource with this name (or external identity) was already created.
    DuplicateCreation,
    /// A resource name resolved neither locally nor as an external identifier.
    MissingReference,
    /// A step tried to use a resource already registered for deletion.
    UseAfterDelete,
    /// A resource was registered for deletion twice.
    DoubleDelete,
    /// The underlying resource was already deleted.
    AlreadyDeleted,
    /// Two live attachments of one disk would be concurrently writable.
    ConcurrentRwConflict,
    /// No live attachment exists for the disk/instance pair.
    NotAttached,
    /// No live connection exists for the network/instance pair.
    NotConnected,
    /// The instance already has a live connection to the network.
    AlreadyConnected,
    /// A step carries no operation body.
    NoStepType,
    /// A step carries more than one operation body.
    AmbiguousStepType,
    /// A step or workflow name violates the identifier pattern.
    BadStepName,
    /// A step timeout could not be parsed.
    BadTimeout,
    /// The dependency graph contains a cycle.
    CycleDetected,
    /// A dependency entry names a step that does not exist.
    MissingDependencyNode,
    /// A step acts on a resource without transitively depending on the
    /// steps that created, use, attached, or detached it.
    MissingDependency,
    /// A step with this name already exists in the workflow.
    DuplicateStep,
    /// A step did not finish within its configured timeout.
    Timeout,
    /// The workflow run was canceled.
    Canceled,
    /// Anything else, including wrapped collaborator errors.
    Other,
}

/// An engine error: a message tagged with an [`ErrorKind`].
///
/// Errors crossing the step boundary are wrapped with the acting step's
/// name and phase via [`WorkflowError::wrap`], which preserves the kind.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WorkflowError {
    kind: ErrorKind,
    message: String,
}

impl WorkflowError {
    /// Creates an error with an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates an error with the generic [`ErrorKind::Other`] kind.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    /// Returns the machine-readable kind tag.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message without any formatting applied.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the error carries the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Prefixes the message with additional context, keeping the kind.
    pub fn wrap(self, context: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{}: {}", context, self.message),
        }
    }
}

/// An aggregate of zero or more [`WorkflowError`]s.
///
/// Used by sweep operations (detach-all, disconnect-all) that keep
/// processing after individual failures. An empty aggregate is equivalent
/// to no error at all.
#[derive(Debug, Clone, Default)]
pub struct MultiError {
    errors: Vec<WorkflowError>,
}

impl MultiError {
    /// Creates an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an error to the aggregate.
    pub fn push(&mut self, err: WorkflowError) {
        self.errors.push(err);
    }

    /// Returns true if no errors were collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of collected errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns the collected errors in insertion order.
    pub fn errors(&self) -> &[WorkflowError] {
        &self.errors
    }

    /// Collapses the aggregate into a single result.
    ///
    /// An empty aggregate becomes `Ok(())`. A single error is returned
    /// unchanged, keeping its kind. Multiple errors are flattened into one
    /// [`ErrorKind::Other`] error with a bulleted message.
    pub fn into_result(mut self) -> Result<(), WorkflowError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(WorkflowError::other(self.to_string())),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no errors");
        }
        writeln!(f, "{} error(s):", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i + 1 < self.errors.len() {
                writeln!(f, "* {}", err)?;
            } else {
                write!(f, "* {}", err)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl From<WorkflowError> for MultiError {
    fn from(err: WorkflowError) -> Self {
        Self { errors: vec![err] }
    }
}
