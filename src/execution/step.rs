//! Step Definition and Lifecycle
//!
//! A step is one schedulable unit of work: a name, a timeout, and exactly
//! one operation body. Bodies come from a closed set of variants (an
//! opaque [`StepAction`] supplied by a collaborator, an included nested
//! workflow, or a sub-workflow), and a single discriminator resolves
//! which one is active at populate time.
//!
//! The populate/validate/run phases are driven externally by the workflow
//! and the scheduler; the step itself never advances its own lifecycle.

use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use log::debug;

use crate::error::{ErrorKind, WorkflowError};
use crate::execution::engine;
use crate::workflow::validator;
use crate::workflow::Workflow;

/// Timeout applied when a step does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Contract implemented by concrete step operation bodies.
///
/// The engine knows nothing else about a body: `populate` fills defaults
/// and resolves identifiers, `validate` registers resource intents against
/// the workflow's registries, and `run` performs the operation. Long
/// running bodies should observe the workflow's cancellation signal on
/// every poll tick and return `Ok(())` when it fires.
pub trait StepAction: Send + Sync {
    /// Fills defaults and resolves identifiers.
    fn populate(&self, workflow: &Arc<Workflow>, step: &Arc<Step>) -> Result<(), WorkflowError>;

    /// Registers resource creation/use/deletion intents.
    fn validate(&self, workflow: &Arc<Workflow>, step: &Arc<Step>) -> Result<(), WorkflowError>;

    /// Performs the operation.
    fn run(&self, workflow: &Arc<Workflow>, step: &Arc<Step>) -> Result<(), WorkflowError>;
}

/// The closed set of operation-body variants a step can carry.
pub enum StepBody {
    /// An opaque operation supplied by a collaborator.
    Action(Box<dyn StepAction>),
    /// A nested workflow sharing the enclosing workflow's registries.
    Include(Arc<Workflow>),
    /// A nested workflow with registries of its own.
    Sub(Arc<Workflow>),
}

impl fmt::Debug for StepBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepBody::Action(_) => write!(f, "Action"),
            StepBody::Include(w) => write!(f, "Include({})", w.name()),
            StepBody::Sub(w) => write!(f, "Sub({})", w.name()),
        }
    }
}

/// A single unit of work within a workflow.
///
/// Steps are built with the builder methods below and handed to
/// [`Workflow::add_step`], which fixes the owning-workflow back reference.
/// After insertion a step is shared behind an `Arc` and only its parsed
/// timeout changes (during populate).
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::{Step, Workflow};
///
/// let workflow = Workflow::new("build");
/// workflow
///     .add_step(Step::new("fetch-sources").with_timeout("5m"))
///     .unwrap();
/// workflow
///     .add_step(Step::new("compile").depends_on("fetch-sources"))
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct Step {
    name: String,
    timeout_spec: Option<String>,
    timeout: RwLock<Duration>,
    bodies: Vec<StepBody>,
    deps: Vec<String>,
    me: OnceLock<Weak<Step>>,
    workflow: OnceLock<Weak<Workflow>>,
}

impl Step {
    /// Creates a step with the default timeout and no operation body.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_spec: None,
            timeout: RwLock::new(DEFAULT_TIMEOUT),
            bodies: Vec::new(),
            deps: Vec::new(),
            me: OnceLock::new(),
            workflow: OnceLock::new(),
        }
    }

    /// Sets the timeout from a duration string such as "90s" or "10m".
    ///
    /// The string is parsed during populate; a malformed value fails the
    /// workflow with [`ErrorKind::BadTimeout`].
    pub fn with_timeout(mut self, spec: impl Into<String>) -> Self {
        self.timeout_spec = Some(spec.into());
        self
    }

    /// Attaches an opaque operation body.
    pub fn with_action(mut self, action: Box<dyn StepAction>) -> Self {
        self.bodies.push(StepBody::Action(action));
        self
    }

    /// Attaches an included nested workflow.
    ///
    /// The child must have been created via
    /// [`Workflow::new_include_child`] of the workflow this step will be
    /// added to, so that it shares the parent's registries.
    pub fn with_include(mut self, child: Arc<Workflow>) -> Self {
        self.bodies.push(StepBody::Include(child));
        self
    }

    /// Attaches a sub-workflow with registries of its own.
    ///
    /// The child must have been created via [`Workflow::new_sub_child`] of
    /// the workflow this step will be added to.
    pub fn with_subworkflow(mut self, child: Arc<Workflow>) -> Self {
        self.bodies.push(StepBody::Sub(child));
        self
    }

    /// Declares a dependency on another step.
    pub fn depends_on(mut self, step_name: impl Into<String>) -> Self {
        self.deps.push(step_name.into());
        self
    }

    /// Returns the step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the effective timeout (parsed during populate).
    pub fn timeout(&self) -> Duration {
        *self.timeout.read().unwrap()
    }

    /// Returns the owning workflow, if the step has been added to one.
    pub fn workflow(&self) -> Option<Arc<Workflow>> {
        self.workflow.get().and_then(|w| w.upgrade())
    }

    /// Returns the nested workflow embedded by this step, if any.
    pub fn embedded_workflow(&self) -> Option<&Arc<Workflow>> {
        self.bodies.iter().find_map(|body| match body {
            StepBody::Include(w) | StepBody::Sub(w) => Some(w),
            StepBody::Action(_) => None,
        })
    }

    /// Returns true if this step embeds exactly the given workflow.
    pub(crate) fn embeds(&self, workflow: &Arc<Workflow>) -> bool {
        self.bodies.iter().any(
            |body| matches!(body, StepBody::Include(w) | StepBody::Sub(w) if Arc::ptr_eq(w, workflow)),
        )
    }

    /// Returns every nested workflow attached to this step.
    pub(crate) fn embedded_workflows(&self) -> Vec<&Arc<Workflow>> {
        self.bodies
            .iter()
            .filter_map(|body| match body {
                StepBody::Include(w) | StepBody::Sub(w) => Some(w),
                StepBody::Action(_) => None,
            })
            .collect()
    }

    pub(crate) fn take_deps(&mut self) -> Vec<String> {
        std::mem::take(&mut self.deps)
    }

    /// Fixes the step's back references when it is added to a workflow.
    pub(crate) fn bind(step: &Arc<Step>, workflow: Weak<Workflow>) {
        let _ = step.workflow.set(workflow);
        let _ = step.me.set(Arc::downgrade(step));
    }

    /// An owning handle to this step; errors for a step that was never
    /// added to a workflow.
    fn handle(&self) -> Result<Arc<Step>, WorkflowError> {
        self.me.get().and_then(|w| w.upgrade()).ok_or_else(|| {
            WorkflowError::other(format!(
                "step '{}' is not attached to a workflow",
                self.name
            ))
        })
    }

    /// Resolves the single active operation body.
    fn resolve_body(&self) -> Result<&StepBody, WorkflowError> {
        match self.bodies.len() {
            0 => Err(WorkflowError::new(
                ErrorKind::NoStepType,
                format!("step '{}' has no operation body", self.name),
            )),
            1 => Ok(&self.bodies[0]),
            n => Err(WorkflowError::new(
                ErrorKind::AmbiguousStepType,
                format!(
                    "step '{}' has {} operation bodies; exactly one is allowed",
                    self.name, n
                ),
            )),
        }
    }

    /// Populate phase: parses the timeout, resolves the operation body,
    /// and delegates to it.
    pub(crate) fn populate(&self, workflow: &Arc<Workflow>) -> Result<(), WorkflowError> {
        let context = format!("step '{}' populate error", self.name);
        if let Some(spec) = &self.timeout_spec {
            let timeout = parse_duration(spec).map_err(|e| e.wrap(&context))?;
            *self.timeout.write().unwrap() = timeout;
        }
        let result = match self.resolve_body()? {
            StepBody::Action(action) => action.populate(workflow, &self.handle()?),
            StepBody::Include(child) | StepBody::Sub(child) => child.populate_steps(),
        };
        result.map_err(|e| e.wrap(&context))
    }

    /// Validate phase: checks the step name, then delegates to the body,
    /// which is where registry intents are recorded.
    pub(crate) fn validate(&self, workflow: &Arc<Workflow>) -> Result<(), WorkflowError> {
        validator::validate_name(&self.name, "step")?;
        let result = match self.resolve_body()? {
            StepBody::Action(action) => action.validate(workflow, &self.handle()?),
            StepBody::Include(child) | StepBody::Sub(child) => child.validate_nested(),
        };
        result.map_err(|e| e.wrap(format!("step '{}' validate error", self.name)))
    }

    /// Run phase: delegates to the body. Sub-workflows clean up their own
    /// registries once their steps finish; included workflows share the
    /// parent's registries, which the root cleans up.
    pub(crate) fn run(&self, workflow: &Arc<Workflow>) -> Result<(), WorkflowError> {
        debug!("step '{}' starting", self.name);
        let result = match self.resolve_body()? {
            StepBody::Action(action) => action.run(workflow, &self.handle()?),
            StepBody::Include(child) => engine::run_steps(child),
            StepBody::Sub(child) => {
                let result = engine::run_steps(child);
                child.cleanup();
                result
            }
        };
        result.map_err(|e| e.wrap(format!("step '{}' run error", self.name)))
    }
}

/// Parses a compound duration string such as "90s", "10m", or "1h30m".
///
/// Supported units are `ms`, `s`, `m`, and `h`; components add up.
pub fn parse_duration(spec: &str) -> Result<Duration, WorkflowError> {
    let bad = |detail: &str| {
        WorkflowError::new(
            ErrorKind::BadTimeout,
            format!("invalid timeout '{}': {}", spec, detail),
        )
    };

    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(bad("empty duration"));
    }

    let mut total = Duration::ZERO;
    let mut chars = trimmed.chars().peekable();
    while chars.peek().is_some() {
        let mut value: u64 = 0;
        let mut digits = 0;
        while let Some(c) = chars.peek().copied() {
            let Some(digit) = c.to_digit(10) else { break };
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(digit)))
                .ok_or_else(|| bad("value out of range"))?;
            chars.next();
            digits += 1;
        }
        if digits == 0 {
            return Err(bad("expected a number"));
        }

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied() {
            if !c.is_ascii_alphabetic() {
                break;
            }
            unit.push(c);
            chars.next();
        }
        let scaled = |factor: u64| {
            value
                .checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(|| bad("value out of range"))
        };
        total += match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => scaled(60)?,
            "h" => scaled(3600)?,
            "" => return Err(bad("missing unit (use ms, s, m, or h)")),
            other => return Err(bad(&format!("unknown unit '{}'", other))),
        };
    }
    Ok(total)
}
