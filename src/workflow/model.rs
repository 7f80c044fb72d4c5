//! Workflow Data Model
//!
//! The workflow is the owning aggregate: it holds the step table, the
//! dependency adjacency list, the cancellation signal, and one resource
//! registry per category, plus the attachment and connection trackers
//! layered on top of them.
//!
//! Nested workflows form an explicit tree. An *include* child shares the
//! parent's registry instances (handed over at construction, never looked
//! up globally); a *sub* child gets registries of its own. Both carry an
//! immutable parent reference used only for dependency-chain walking.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use log::{debug, info};

use crate::error::{ErrorKind, MultiError, WorkflowError};
use crate::execution::engine;
use crate::execution::step::Step;
use crate::resource::attachment::AttachmentTracker;
use crate::resource::connection::ConnectionTracker;
use crate::resource::registry::ResourceRegistry;
use crate::workflow::cancel::CancelSignal;
use crate::workflow::validator;

/// The owning aggregate for one workflow execution.
///
/// A workflow is always handled behind an `Arc`; steps keep a weak back
/// reference to it for dependency resolution. All state lives in memory
/// for the lifetime of one run.
pub struct Workflow {
    me: Weak<Workflow>,
    name: String,
    parent: OnceLock<Weak<Workflow>>,
    steps: RwLock<HashMap<String, Arc<Step>>>,
    deps: RwLock<HashMap<String, Vec<String>>>,
    cancel: CancelSignal,
    disks: Arc<ResourceRegistry>,
    images: Arc<ResourceRegistry>,
    instances: Arc<ResourceRegistry>,
    networks: Arc<ResourceRegistry>,
    subnetworks: Arc<ResourceRegistry>,
    attachments: Arc<AttachmentTracker>,
    network_connections: Arc<ConnectionTracker>,
    subnetwork_connections: Arc<ConnectionTracker>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("steps", &self.steps.read().unwrap().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Workflow {
    /// Creates a new root workflow with fresh registries.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), CancelSignal::new())
    }

    fn build(name: String, cancel: CancelSignal) -> Arc<Self> {
        let disks = Arc::new(ResourceRegistry::new("disk"));
        let images = Arc::new(ResourceRegistry::new("image"));
        let instances = Arc::new(ResourceRegistry::new("instance"));
        let networks = Arc::new(ResourceRegistry::new("network"));
        let subnetworks = Arc::new(ResourceRegistry::new("subnetwork"));
        let attachments = Arc::new(AttachmentTracker::new(disks.clone(), instances.clone()));
        let network_connections =
            Arc::new(ConnectionTracker::new(networks.clone(), instances.clone()));
        let subnetwork_connections = Arc::new(ConnectionTracker::new(
            subnetworks.clone(),
            instances.clone(),
        ));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name,
            parent: OnceLock::new(),
            steps: RwLock::new(HashMap::new()),
            deps: RwLock::new(HashMap::new()),
            cancel,
            disks,
            images,
            instances,
            networks,
            subnetworks,
            attachments,
            network_connections,
            subnetwork_connections,
        })
    }

    /// Creates a nested workflow that shares this workflow's registries,
    /// trackers, and cancellation signal (include semantics).
    pub fn new_include_child(&self, name: impl Into<String>) -> Arc<Self> {
        let child = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.into(),
            parent: OnceLock::new(),
            steps: RwLock::new(HashMap::new()),
            deps: RwLock::new(HashMap::new()),
            cancel: self.cancel.clone(),
            disks: self.disks.clone(),
            images: self.images.clone(),
            instances: self.instances.clone(),
            networks: self.networks.clone(),
            subnetworks: self.subnetworks.clone(),
            attachments: self.attachments.clone(),
            network_connections: self.network_connections.clone(),
            subnetwork_connections: self.subnetwork_connections.clone(),
        });
        let _ = child.parent.set(self.me.clone());
        child
    }

    /// Creates a nested workflow with registries of its own but the same
    /// cancellation signal (sub-workflow semantics).
    pub fn new_sub_child(&self, name: impl Into<String>) -> Arc<Self> {
        let child = Self::build(name.into(), self.cancel.clone());
        let _ = child.parent.set(self.me.clone());
        child
    }

    /// An owning handle to this workflow. The caller reached `self`
    /// through an `Arc`, so the upgrade cannot fail.
    fn handle(&self) -> Arc<Workflow> {
        self.me.upgrade().expect("workflow outlived its Arc")
    }

    /// Returns the workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the enclosing workflow for a nested workflow.
    pub fn parent(&self) -> Option<Arc<Workflow>> {
        self.parent.get().and_then(|w| w.upgrade())
    }

    /// Returns the workflow's cancellation signal.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Triggers workflow-wide cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancellation has been triggered.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// The disk registry.
    pub fn disks(&self) -> &Arc<ResourceRegistry> {
        &self.disks
    }

    /// The image registry.
    pub fn images(&self) -> &Arc<ResourceRegistry> {
        &self.images
    }

    /// The instance registry.
    pub fn instances(&self) -> &Arc<ResourceRegistry> {
        &self.instances
    }

    /// The network registry.
    pub fn networks(&self) -> &Arc<ResourceRegistry> {
        &self.networks
    }

    /// The subnetwork registry.
    pub fn subnetworks(&self) -> &Arc<ResourceRegistry> {
        &self.subnetworks
    }

    /// The disk↔instance attachment tracker.
    pub fn attachments(&self) -> &Arc<AttachmentTracker> {
        &self.attachments
    }

    /// The network↔instance connection tracker.
    pub fn network_connections(&self) -> &Arc<ConnectionTracker> {
        &self.network_connections
    }

    /// The subnetwork↔instance connection tracker.
    pub fn subnetwork_connections(&self) -> &Arc<ConnectionTracker> {
        &self.subnetwork_connections
    }

    /// Looks up a step by name.
    pub fn step(&self, name: &str) -> Option<Arc<Step>> {
        self.steps.read().unwrap().get(name).cloned()
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.read().unwrap().len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.read().unwrap().is_empty()
    }

    pub(crate) fn steps_snapshot(&self) -> HashMap<String, Arc<Step>> {
        self.steps.read().unwrap().clone()
    }

    pub(crate) fn deps_snapshot(&self) -> HashMap<String, Vec<String>> {
        self.deps.read().unwrap().clone()
    }

    /// Removes duplicate entries from every dependency list in place and
    /// returns the cleaned adjacency map.
    pub(crate) fn dedup_dependencies(&self) -> HashMap<String, Vec<String>> {
        let mut deps = self.deps.write().unwrap();
        for list in deps.values_mut() {
            let mut seen = HashSet::new();
            list.retain(|d| seen.insert(d.clone()));
        }
        deps.clone()
    }

    /// Adds a step to the workflow.
    ///
    /// Dependencies declared on the builder are merged into the
    /// workflow's adjacency list. Nested workflows attached to the step
    /// must have been created through [`Workflow::new_include_child`] or
    /// [`Workflow::new_sub_child`] of this workflow.
    pub fn add_step(&self, mut step: Step) -> Result<Arc<Step>, WorkflowError> {
        let declared_deps = step.take_deps();
        let step = Arc::new(step);

        for child in step.embedded_workflows() {
            let attached_here = child
                .parent
                .get()
                .map(|w| w.ptr_eq(&self.me))
                .unwrap_or(false);
            if !attached_here {
                return Err(WorkflowError::other(format!(
                    "nested workflow '{}' on step '{}' must be created via new_include_child or new_sub_child of workflow '{}'",
                    child.name(),
                    step.name(),
                    self.name
                )));
            }
        }

        {
            let mut steps = self.steps.write().unwrap();
            if steps.contains_key(step.name()) {
                return Err(WorkflowError::new(
                    ErrorKind::DuplicateStep,
                    format!(
                        "step '{}' already exists in workflow '{}'",
                        step.name(),
                        self.name
                    ),
                ));
            }
            Step::bind(&step, self.me.clone());
            steps.insert(step.name().to_string(), step.clone());
        }

        if !declared_deps.is_empty() {
            self.deps
                .write()
                .unwrap()
                .entry(step.name().to_string())
                .or_default()
                .extend(declared_deps);
        }

        debug!("workflow '{}': added step '{}'", self.name, step.name());
        Ok(step)
    }

    /// Declares that `step` depends on `on`.
    ///
    /// Both names must already refer to steps of this workflow.
    pub fn add_dependency(&self, step: &str, on: &str) -> Result<(), WorkflowError> {
        {
            let steps = self.steps.read().unwrap();
            for name in [step, on] {
                if !steps.contains_key(name) {
                    return Err(WorkflowError::new(
                        ErrorKind::MissingDependencyNode,
                        format!("workflow '{}' has no step '{}'", self.name, name),
                    ));
                }
            }
        }
        self.deps
            .write()
            .unwrap()
            .entry(step.to_string())
            .or_default()
            .push(on.to_string());
        Ok(())
    }

    /// Runs every step's populate phase.
    pub(crate) fn populate_steps(&self) -> Result<(), WorkflowError> {
        let this = self.handle();
        for (_, step) in self.sorted_steps() {
            step.populate(&this)?;
        }
        Ok(())
    }

    /// Validates the workflow: populates steps, checks the dependency
    /// graph (duplicates removed, references resolved, no cycles), then
    /// runs each step's validate in topological order so that resource
    /// intents are registered creator-first.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        info!(
            "validating workflow '{}' ({} steps)",
            self.name,
            self.len()
        );
        validator::validate_name(&self.name, "workflow")?;
        self.populate_steps()?;
        let order = validator::validate_dag(&self.handle())?;
        self.validate_steps(&order)
    }

    /// Validation entry for a nested workflow: the enclosing step's
    /// populate already ran this workflow's populate phase.
    pub(crate) fn validate_nested(&self) -> Result<(), WorkflowError> {
        validator::validate_name(&self.name, "workflow")?;
        let order = validator::validate_dag(&self.handle())?;
        self.validate_steps(&order)
    }

    fn validate_steps(&self, order: &[String]) -> Result<(), WorkflowError> {
        let this = self.handle();
        for name in order {
            if let Some(step) = self.step(name) {
                step.validate(&this)?;
            }
        }
        Ok(())
    }

    /// Executes the workflow: validate, run all steps honoring the
    /// dependency graph, then best-effort cleanup of tracked resources.
    ///
    /// Returns `Ok(())` on success or the first failing step's wrapped
    /// error. Steps already running when a failure or cancellation occurs
    /// are allowed to finish before this returns.
    pub fn run(&self) -> Result<(), WorkflowError> {
        self.validate()?;
        info!("running workflow '{}'", self.name);
        let result = engine::run_steps(&self.handle());
        self.cleanup();
        match &result {
            Ok(()) => info!("workflow '{}' completed", self.name),
            Err(e) => info!("workflow '{}' failed: {}", self.name, e),
        }
        result
    }

    /// Best-effort deletion of every tracked resource not flagged
    /// no-cleanup. Instances go first so their disks and networks are
    /// released before those categories are swept. Never fails.
    pub fn cleanup(&self) {
        self.instances.cleanup();
        self.disks.cleanup();
        self.images.cleanup();
        self.subnetworks.cleanup();
        self.networks.cleanup();
    }

    /// Registers `step` as the deleter of instance `name`, then sweeps
    /// detachments and disconnections for the instance so its disks and
    /// networks become releasable by later steps.
    ///
    /// Sweep failures are aggregated; the sweep keeps going past
    /// individual records that cannot be detached.
    pub fn register_instance_deletion(
        &self,
        name: &str,
        step: &Arc<Step>,
    ) -> Result<(), WorkflowError> {
        self.instances.reg_delete(name, step)?;
        let mut errs = MultiError::new();
        if let Err(e) = self.attachments.register_all_detachments(name, step) {
            errs.push(e);
        }
        if let Err(e) = self.network_connections.reg_disconnect_all(name, step) {
            errs.push(e);
        }
        if let Err(e) = self.subnetwork_connections.reg_disconnect_all(name, step) {
            errs.push(e);
        }
        errs.into_result()
    }

    fn sorted_steps(&self) -> Vec<(String, Arc<Step>)> {
        let mut steps: Vec<(String, Arc<Step>)> = self
            .steps
            .read()
            .unwrap()
            .iter()
            .map(|(n, s)| (n.clone(), s.clone()))
            .collect();
        steps.sort_by(|a, b| a.0.cmp(&b.0));
        steps
    }
}
