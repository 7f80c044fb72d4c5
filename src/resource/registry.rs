//! Generic Resource Registry
//!
//! One registry instance tracks the named resources of a single category
//! (disks, images, instances, ...) within one workflow. It enforces the
//! ordering invariants between creation, use, and deletion, lazily
//! registers placeholders for pre-existing resources referenced by
//! fully qualified identifier, and sweeps leftover resources on cleanup.
//!
//! Registries never talk to anything external themselves: the existence
//! check and the actual delete are injected through [`ResourceHandler`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ErrorKind, WorkflowError};
use crate::execution::step::Step;
use crate::workflow::chain;

/// Default pattern for fully qualified external identifiers: at least one
/// `/`-separated path component. Bare names are workflow-internal.
static EXTERNAL_RGX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(/[A-Za-z0-9][A-Za-z0-9._-]*)+$").unwrap()
});

/// A named, registry-tracked entity.
///
/// The registry key (the workflow-internal name) lives in the registry
/// table; the resource itself carries the generated or user-supplied real
/// name and the opaque resolved identifier.
#[derive(Debug, Clone)]
pub struct Resource {
    real_name: String,
    link: String,
    no_cleanup: bool,
    deleted: bool,
    creator: Option<Arc<Step>>,
    deleter: Option<Arc<Step>>,
    users: Vec<Arc<Step>>,
}

impl Resource {
    /// Creates a resource with the given real name and resolved
    /// identifier.
    pub fn new(real_name: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            real_name: real_name.into(),
            link: link.into(),
            no_cleanup: false,
            deleted: false,
            creator: None,
            deleter: None,
            users: Vec::new(),
        }
    }

    /// Excludes the resource from cleanup sweeps.
    pub fn with_no_cleanup(mut self) -> Self {
        self.no_cleanup = true;
        self
    }

    /// The generated or user-supplied name of the underlying resource.
    pub fn real_name(&self) -> &str {
        &self.real_name
    }

    /// The opaque resolved identifier.
    pub fn link(&self) -> &str {
        &self.link
    }

    /// True if cleanup sweeps skip this resource.
    pub fn no_cleanup(&self) -> bool {
        self.no_cleanup
    }

    /// True once the underlying resource has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// The step that creates this resource; `None` for a pre-existing
    /// external resource.
    pub fn creator(&self) -> Option<&Arc<Step>> {
        self.creator.as_ref()
    }

    /// The step registered to delete this resource, if any.
    pub fn deleter(&self) -> Option<&Arc<Step>> {
        self.deleter.as_ref()
    }

    /// The steps registered as users, in registration order.
    pub fn users(&self) -> &[Arc<Step>] {
        &self.users
    }
}

/// Hooks a registry needs from its (excluded) resource-category
/// collaborator. The registry itself never talks to an external API.
pub trait ResourceHandler: Send + Sync {
    /// Whether a resource with this external identity already exists
    /// outside the workflow.
    fn exists_remotely(&self, identity: &str) -> Result<bool, WorkflowError>;

    /// Deletes the underlying resource.
    fn delete_remotely(&self, resource: &Resource) -> Result<(), WorkflowError>;
}

/// Default handler: nothing exists remotely and deletion succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ResourceHandler for NoopHandler {
    fn exists_remotely(&self, _identity: &str) -> Result<bool, WorkflowError> {
        Ok(false)
    }

    fn delete_remotely(&self, _resource: &Resource) -> Result<(), WorkflowError> {
        Ok(())
    }
}

type Entry = Arc<Mutex<Resource>>;

/// Per-category resource table enforcing creation/use/deletion ordering.
///
/// The registry-wide lock guards the table itself; every resource carries
/// its own lock so a slow external delete call never serializes unrelated
/// registrations behind it.
pub struct ResourceRegistry {
    category: String,
    external_rgx: Regex,
    handler: RwLock<Arc<dyn ResourceHandler>>,
    table: Mutex<HashMap<String, Entry>>,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl ResourceRegistry {
    /// Creates a registry for one resource category with the default
    /// external-identifier pattern and a no-op handler.
    pub fn new(category: impl Into<String>) -> Self {
        Self::with_external_pattern(category, EXTERNAL_RGX.clone())
    }

    /// Creates a registry with a custom external-identifier pattern.
    pub fn with_external_pattern(category: impl Into<String>, external_rgx: Regex) -> Self {
        Self {
            category: category.into(),
            external_rgx,
            handler: RwLock::new(Arc::new(NoopHandler)),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the injected resource-category hooks.
    pub fn set_handler(&self, handler: Arc<dyn ResourceHandler>) {
        *self.handler.write().unwrap() = handler;
    }

    /// The resource category this registry tracks.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Runs `f` against the resource registered under `name`, if any.
    pub fn with_resource<R>(&self, name: &str, f: impl FnOnce(&Resource) -> R) -> Option<R> {
        let entry = self.table.lock().unwrap().get(name).cloned()?;
        let resource = entry.lock().unwrap();
        Some(f(&resource))
    }

    /// Registers `resource` under `name` as created by `creator`.
    ///
    /// Fails with [`ErrorKind::DuplicateCreation`] if the name is already
    /// registered with a creator. A creator-less entry (a lazily
    /// registered external placeholder) is taken over instead. When
    /// `allow_overwrite` is false, the injected existence check must also
    /// report the resource's identity as absent.
    pub fn reg_create(
        &self,
        name: &str,
        resource: Resource,
        creator: &Arc<Step>,
        allow_overwrite: bool,
    ) -> Result<(), WorkflowError> {
        self.check_duplicate(name)?;

        if !allow_overwrite {
            let handler = self.handler.read().unwrap().clone();
            if handler.exists_remotely(&resource.link)? {
                return Err(WorkflowError::new(
                    ErrorKind::DuplicateCreation,
                    format!(
                        "cannot create {} '{}': a resource with identity '{}' already exists",
                        self.category, name, resource.link
                    ),
                ));
            }
        }

        let mut table = self.table.lock().unwrap();
        match table.get(name) {
            Some(existing) => {
                let mut current = existing.lock().unwrap();
                if let Some(prev) = &current.creator {
                    return Err(self.duplicate_creation(name, prev));
                }
                // Take over the external placeholder, keeping any users
                // already registered against it.
                current.real_name = resource.real_name;
                current.link = resource.link;
                current.no_cleanup = resource.no_cleanup;
                current.creator = Some(creator.clone());
            }
            None => {
                let mut resource = resource;
                resource.creator = Some(creator.clone());
                table.insert(name.to_string(), Arc::new(Mutex::new(resource)));
            }
        }
        debug!(
            "registered {} '{}' (creator '{}')",
            self.category,
            name,
            creator.name()
        );
        Ok(())
    }

    /// Registers `step` as a user of `name` and returns a snapshot of the
    /// resource.
    ///
    /// Resolution falls back to lazily registering an external
    /// placeholder when `name` matches the category's external
    /// identifier pattern. The step must transitively depend on the
    /// resource's creator, and no deleter may be registered yet.
    pub fn reg_use(&self, name: &str, step: &Arc<Step>) -> Result<Resource, WorkflowError> {
        let entry = self.resolve(name)?;
        let mut resource = entry.lock().unwrap();
        if let Some(deleter) = &resource.deleter {
            return Err(WorkflowError::new(
                ErrorKind::UseAfterDelete,
                format!(
                    "cannot use {} '{}': already registered for deletion by step '{}'",
                    self.category,
                    name,
                    deleter.name()
                ),
            ));
        }
        if let Some(creator) = &resource.creator {
            if !chain::nested_depends(step, creator) {
                return Err(WorkflowError::new(
                    ErrorKind::MissingDependency,
                    format!(
                        "step '{}' uses {} '{}' but does not depend on its creator step '{}'",
                        step.name(),
                        self.category,
                        name,
                        creator.name()
                    ),
                ));
            }
        }
        resource.users.push(step.clone());
        Ok(resource.clone())
    }

    /// Registers `step` as the deleter of `name`.
    ///
    /// The step must transitively depend on the resource's creator and on
    /// every registered user; at most one deleter may ever be registered.
    pub fn reg_delete(&self, name: &str, step: &Arc<Step>) -> Result<(), WorkflowError> {
        let entry = self.resolve(name)?;
        let mut resource = entry.lock().unwrap();
        if let Some(deleter) = &resource.deleter {
            return Err(WorkflowError::new(
                ErrorKind::DoubleDelete,
                format!(
                    "cannot delete {} '{}': already registered for deletion by step '{}'",
                    self.category,
                    name,
                    deleter.name()
                ),
            ));
        }
        if let Some(creator) = &resource.creator {
            if !chain::nested_depends(step, creator) {
                return Err(WorkflowError::new(
                    ErrorKind::MissingDependency,
                    format!(
                        "step '{}' deletes {} '{}' but does not depend on its creator step '{}'",
                        step.name(),
                        self.category,
                        name,
                        creator.name()
                    ),
                ));
            }
        }
        for user in &resource.users {
            if !chain::nested_depends(step, user) {
                return Err(WorkflowError::new(
                    ErrorKind::MissingDependency,
                    format!(
                        "step '{}' deletes {} '{}' but does not depend on its user step '{}'",
                        step.name(),
                        self.category,
                        name,
                        user.name()
                    ),
                ));
            }
        }
        resource.deleter = Some(step.clone());
        Ok(())
    }

    /// Deletes the underlying resource through the injected handler.
    ///
    /// The registry lock is held only for the table lookup; the external
    /// call happens under the resource's own lock.
    pub fn delete(&self, name: &str) -> Result<(), WorkflowError> {
        let entry = self
            .table
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| self.missing_reference(name))?;
        let handler = self.handler.read().unwrap().clone();
        let mut resource = entry.lock().unwrap();
        if resource.deleted {
            return Err(WorkflowError::new(
                ErrorKind::AlreadyDeleted,
                format!("{} '{}' is already deleted", self.category, name),
            ));
        }
        handler.delete_remotely(&resource)?;
        resource.deleted = true;
        debug!("deleted {} '{}'", self.category, name);
        Ok(())
    }

    /// Best-effort concurrent deletion of every tracked resource not
    /// flagged no-cleanup and not already deleted.
    ///
    /// "Already gone" failures are expected (the resource outlived the
    /// workflow's bookkeeping) and logged at debug level; anything else
    /// is logged as a warning. Never fails the caller.
    pub fn cleanup(&self) {
        let names: Vec<String> = {
            let table = self.table.lock().unwrap();
            table
                .iter()
                .filter(|(_, entry)| {
                    let resource = entry.lock().unwrap();
                    !resource.no_cleanup && !resource.deleted
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        if names.is_empty() {
            return;
        }
        debug!("cleaning up {} {} resource(s)", names.len(), self.category);

        let workers = num_cpus::get().min(names.len());
        let queue = Mutex::new(names);
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = queue.lock().unwrap().pop();
                    let Some(name) = next else { break };
                    match self.delete(&name) {
                        Ok(()) => debug!("cleaned up {} '{}'", self.category, name),
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::AlreadyDeleted | ErrorKind::MissingReference
                            ) =>
                        {
                            debug!("{} '{}' was already gone: {}", self.category, name, e);
                        }
                        Err(e) => {
                            warn!("failed to clean up {} '{}': {}", self.category, name, e);
                        }
                    }
                });
            }
        });
    }

    /// Resolves `name` from the table, lazily registering a no-cleanup
    /// placeholder when it matches the external identifier pattern.
    pub(crate) fn resolve(&self, name: &str) -> Result<Entry, WorkflowError> {
        let mut table = self.table.lock().unwrap();
        if let Some(entry) = table.get(name) {
            return Ok(entry.clone());
        }
        if self.external_rgx.is_match(name) {
            let real_name = name.rsplit('/').next().unwrap_or(name).to_string();
            let placeholder = Resource {
                real_name,
                link: name.to_string(),
                no_cleanup: true,
                deleted: false,
                creator: None,
                deleter: None,
                users: Vec::new(),
            };
            let entry = Arc::new(Mutex::new(placeholder));
            table.insert(name.to_string(), entry.clone());
            debug!("registered external {} reference '{}'", self.category, name);
            return Ok(entry);
        }
        Err(self.missing_reference(name))
    }

    fn check_duplicate(&self, name: &str) -> Result<(), WorkflowError> {
        let table = self.table.lock().unwrap();
        if let Some(existing) = table.get(name) {
            let resource = existing.lock().unwrap();
            if let Some(prev) = &resource.creator {
                return Err(self.duplicate_creation(name, prev));
            }
        }
        Ok(())
    }

    fn duplicate_creation(&self, name: &str, prev: &Arc<Step>) -> WorkflowError {
        WorkflowError::new(
            ErrorKind::DuplicateCreation,
            format!(
                "cannot create {} '{}': already created by step '{}'",
                self.category,
                name,
                prev.name()
            ),
        )
    }

    fn missing_reference(&self, name: &str) -> WorkflowError {
        WorkflowError::new(
            ErrorKind::MissingReference,
            format!("unresolved {} reference '{}'", self.category, name),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Step, Workflow};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture() -> (Arc<Workflow>, Arc<Step>, Arc<Step>, Arc<Step>) {
        let workflow = Workflow::new("wf");
        let a = workflow.add_step(Step::new("a")).unwrap();
        let b = workflow.add_step(Step::new("b").depends_on("a")).unwrap();
        let c = workflow.add_step(Step::new("c").depends_on("b")).unwrap();
        (workflow, a, b, c)
    }

    #[test]
    fn test_reg_create_rejects_duplicate() {
        let (workflow, a, b, _) = fixture();
        let disks = workflow.disks();
        disks
            .reg_create("d", Resource::new("d", "d"), &a, true)
            .unwrap();
        let err = disks
            .reg_create("d", Resource::new("d", "d"), &b, true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateCreation);
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn test_reg_create_checks_remote_existence() {
        struct AlwaysExists;
        impl ResourceHandler for AlwaysExists {
            fn exists_remotely(&self, _identity: &str) -> Result<bool, WorkflowError> {
                Ok(true)
            }
            fn delete_remotely(&self, _resource: &Resource) -> Result<(), WorkflowError> {
                Ok(())
            }
        }

        let (workflow, a, _, _) = fixture();
        let disks = workflow.disks();
        disks.set_handler(Arc::new(AlwaysExists));

        let err = disks
            .reg_create("d", Resource::new("d", "projects/p/disks/d"), &a, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateCreation);

        // Overwriting skips the existence check.
        disks
            .reg_create("d", Resource::new("d", "projects/p/disks/d"), &a, true)
            .unwrap();
    }

    #[test]
    fn test_reg_use_requires_creator_dependency() {
        let (workflow, a, b, _) = fixture();
        let disks = workflow.disks();
        disks
            .reg_create("d", Resource::new("d", "d"), &b, true)
            .unwrap();

        // a does not depend on b.
        let err = disks.reg_use("d", &a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingDependency);
    }

    #[test]
    fn test_reg_use_appends_users() {
        let (workflow, a, b, c) = fixture();
        let disks = workflow.disks();
        disks
            .reg_create("d", Resource::new("d", "d"), &a, true)
            .unwrap();
        disks.reg_use("d", &b).unwrap();
        let snapshot = disks.reg_use("d", &c).unwrap();
        assert_eq!(snapshot.users().len(), 2);
        assert_eq!(snapshot.users()[0].name(), "b");
        assert_eq!(snapshot.users()[1].name(), "c");
    }

    #[test]
    fn test_reg_use_after_delete() {
        let (workflow, a, b, c) = fixture();
        let disks = workflow.disks();
        disks
            .reg_create("d", Resource::new("d", "d"), &a, true)
            .unwrap();
        disks.reg_delete("d", &b).unwrap();
        let err = disks.reg_use("d", &c).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseAfterDelete);
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_reg_delete_twice() {
        let (workflow, a, b, c) = fixture();
        let disks = workflow.disks();
        disks
            .reg_create("d", Resource::new("d", "d"), &a, true)
            .unwrap();
        disks.reg_delete("d", &b).unwrap();
        let err = disks.reg_delete("d", &c).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DoubleDelete);
    }

    #[test]
    fn test_reg_delete_requires_user_closure() {
        let workflow = Workflow::new("wf");
        let a = workflow.add_step(Step::new("a")).unwrap();
        let b = workflow.add_step(Step::new("b").depends_on("a")).unwrap();
        // c depends only on a, not on the user b.
        let c = workflow.add_step(Step::new("c").depends_on("a")).unwrap();

        let disks = workflow.disks();
        disks
            .reg_create("d", Resource::new("d", "d"), &a, true)
            .unwrap();
        disks.reg_use("d", &b).unwrap();

        let err = disks.reg_delete("d", &c).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingDependency);
        assert!(err.to_string().contains("'b'"));

        // Once the dependency exists, deletion registers.
        workflow.add_dependency("c", "b").unwrap();
        disks.reg_delete("d", &c).unwrap();
    }

    #[test]
    fn test_reg_delete_closure_through_nested_workflow() {
        let workflow = Workflow::new("wf");
        let maker = workflow.add_step(Step::new("maker")).unwrap();

        // A user inside an included workflow; the deleter depends on the
        // include step, which is enough to cover the nested user.
        let child = workflow.new_include_child("inner");
        let consumer = child.add_step(Step::new("consumer")).unwrap();
        workflow
            .add_step(Step::new("stage").with_include(child).depends_on("maker"))
            .unwrap();
        let cleaner = workflow
            .add_step(Step::new("cleaner").depends_on("stage"))
            .unwrap();

        let disks = workflow.disks();
        disks
            .reg_create("d", Resource::new("d", "d"), &maker, true)
            .unwrap();
        disks.reg_use("d", &consumer).unwrap();
        disks.reg_delete("d", &cleaner).unwrap();

        disks
            .with_resource("d", |res| {
                assert!(Arc::ptr_eq(res.deleter().unwrap(), &cleaner));
            })
            .unwrap();
    }

    #[test]
    fn test_lazy_external_placeholder() {
        let (workflow, a, b, _) = fixture();
        let disks = workflow.disks();

        let first = disks.reg_use("shared/images/base-os", &a).unwrap();
        assert!(first.no_cleanup());
        assert!(first.creator().is_none());
        assert_eq!(first.real_name(), "base-os");

        // The second lookup hits the cached placeholder.
        let second = disks.reg_use("shared/images/base-os", &b).unwrap();
        assert_eq!(second.users().len(), 2);
    }

    #[test]
    fn test_unresolved_bare_name() {
        let (workflow, a, _, _) = fixture();
        let err = workflow.disks().reg_use("ghost", &a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingReference);
    }

    #[test]
    fn test_create_takes_over_placeholder() {
        let (workflow, a, b, _) = fixture();
        let disks = workflow.disks();
        disks.reg_use("proj/disks/seed", &a).unwrap();
        disks
            .reg_create("proj/disks/seed", Resource::new("seed", "proj/disks/seed"), &b, true)
            .unwrap();
        disks
            .with_resource("proj/disks/seed", |res| {
                assert!(Arc::ptr_eq(res.creator().unwrap(), &b));
                assert_eq!(res.users().len(), 1);
            })
            .unwrap();
    }

    #[test]
    fn test_delete_marks_deleted_once() {
        let (workflow, a, _, _) = fixture();
        let disks = workflow.disks();
        disks
            .reg_create("d", Resource::new("d", "d"), &a, true)
            .unwrap();

        disks.delete("d").unwrap();
        assert!(disks.with_resource("d", |r| r.is_deleted()).unwrap());

        let err = disks.delete("d").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyDeleted);
    }

    #[test]
    fn test_delete_unknown_resource() {
        let (workflow, _, _, _) = fixture();
        let err = workflow.disks().delete("ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingReference);
    }

    #[test]
    fn test_cleanup_sweeps_remaining_resources() {
        #[derive(Default)]
        struct Counting(AtomicUsize);
        impl ResourceHandler for Counting {
            fn exists_remotely(&self, _identity: &str) -> Result<bool, WorkflowError> {
                Ok(false)
            }
            fn delete_remotely(&self, _resource: &Resource) -> Result<(), WorkflowError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let (workflow, a, _, _) = fixture();
        let disks = workflow.disks();
        let handler = Arc::new(Counting::default());
        disks.set_handler(handler.clone());

        disks
            .reg_create("keep", Resource::new("keep", "keep").with_no_cleanup(), &a, true)
            .unwrap();
        disks
            .reg_create("sweep", Resource::new("sweep", "sweep"), &a, true)
            .unwrap();
        disks
            .reg_create("gone", Resource::new("gone", "gone"), &a, true)
            .unwrap();
        disks.delete("gone").unwrap();

        let before = handler.0.load(Ordering::SeqCst);
        disks.cleanup();
        // Only "sweep" is deleted by the sweep.
        assert_eq!(handler.0.load(Ordering::SeqCst), before + 1);
        assert!(disks.with_resource("sweep", |r| r.is_deleted()).unwrap());
        assert!(!disks.with_resource("keep", |r| r.is_deleted()).unwrap());
    }

    #[test]
    fn test_cleanup_swallows_handler_failures() {
        struct Failing;
        impl ResourceHandler for Failing {
            fn exists_remotely(&self, _identity: &str) -> Result<bool, WorkflowError> {
                Ok(false)
            }
            fn delete_remotely(&self, _resource: &Resource) -> Result<(), WorkflowError> {
                Err(WorkflowError::other("backend unavailable"))
            }
        }

        let (workflow, a, _, _) = fixture();
        let disks = workflow.disks();
        disks
            .reg_create("d", Resource::new("d", "d"), &a, true)
            .unwrap();
        disks.set_handler(Arc::new(Failing));

        // Must not panic or propagate.
        disks.cleanup();
        assert!(!disks.with_resource("d", |r| r.is_deleted()).unwrap());
    }
}
