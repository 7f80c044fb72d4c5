//! Disk Attachment Tracking
//!
//! Layered on the disk and instance registries, this tracker records
//! pairwise attachment state and rejects unsafe concurrency: a disk may
//! be attached read-write to at most one instance at a time, and two
//! attachments are only considered sequenced (not concurrent) when the
//! later attacher transitively depends on the earlier detacher.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{ErrorKind, MultiError, WorkflowError};
use crate::execution::step::Step;
use crate::resource::registry::ResourceRegistry;
use crate::workflow::chain;

/// Mode of a disk attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachMode::ReadOnly => write!(f, "read-only"),
            AttachMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// One attachment of a disk to an instance.
#[derive(Debug, Clone)]
struct Attachment {
    mode: AttachMode,
    attacher: Arc<Step>,
    detacher: Option<Arc<Step>>,
}

/// Tracks disk↔instance attachments for one workflow.
pub struct AttachmentTracker {
    disks: Arc<ResourceRegistry>,
    instances: Arc<ResourceRegistry>,
    /// Disk name → instance name → attachment record.
    records: Mutex<HashMap<String, HashMap<String, Attachment>>>,
}

impl fmt::Debug for AttachmentTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentTracker")
            .field("records", &self.records.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl AttachmentTracker {
    /// Creates a tracker layered on the given registries.
    pub fn new(disks: Arc<ResourceRegistry>, instances: Arc<ResourceRegistry>) -> Self {
        Self {
            disks,
            instances,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an attachment of `disk` to `instance` by `step`.
    ///
    /// Every existing record of the disk is checked for concurrency: a
    /// record is concurrent unless it has a detacher that `step`
    /// transitively depends on. A concurrent record on the same instance
    /// makes this a no-op (idempotent repeat-attach); on a different
    /// instance, both modes must be read-only or the registration fails
    /// with [`ErrorKind::ConcurrentRwConflict`].
    pub fn register_attachment(
        &self,
        disk: &str,
        instance: &str,
        mode: AttachMode,
        step: &Arc<Step>,
    ) -> Result<(), WorkflowError> {
        self.disks.resolve(disk)?;
        self.instances.resolve(instance)?;

        let mut records = self.records.lock().unwrap();
        let disk_records = records.entry(disk.to_string()).or_default();
        for (attached_instance, record) in disk_records.iter() {
            let concurrent = match &record.detacher {
                Some(detacher) => !chain::nested_depends(step, detacher),
                None => true,
            };
            if !concurrent {
                continue;
            }
            if attached_instance == instance {
                debug!(
                    "disk '{}' already attached to instance '{}'; repeat attach is a no-op",
                    disk, instance
                );
                return Ok(());
            }
            if mode == AttachMode::ReadWrite || record.mode == AttachMode::ReadWrite {
                return Err(WorkflowError::new(
                    ErrorKind::ConcurrentRwConflict,
                    format!(
                        "cannot attach disk '{}' to instance '{}' in {} mode: concurrently attached to instance '{}' in {} mode",
                        disk, instance, mode, attached_instance, record.mode
                    ),
                ));
            }
        }

        disk_records.insert(
            instance.to_string(),
            Attachment {
                mode,
                attacher: step.clone(),
                detacher: None,
            },
        );
        debug!(
            "registered {} attachment of disk '{}' to instance '{}' by step '{}'",
            mode,
            disk,
            instance,
            step.name()
        );
        Ok(())
    }

    /// Registers a detachment of `disk` from `instance` by `step`.
    pub fn register_detachment(
        &self,
        disk: &str,
        instance: &str,
        step: &Arc<Step>,
    ) -> Result<(), WorkflowError> {
        self.disks
            .resolve(disk)
            .map_err(|e| e.wrap(format!("cannot detach disk '{}'", disk)))?;
        self.instances
            .resolve(instance)
            .map_err(|e| e.wrap(format!("cannot detach from instance '{}'", instance)))?;

        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(disk)
            .and_then(|instances| instances.get_mut(instance));
        match record {
            Some(record) if record.detacher.is_none() => detach(record, disk, instance, step),
            Some(record) => Err(WorkflowError::new(
                ErrorKind::NotAttached,
                format!(
                    "disk '{}' is already detached from instance '{}' by step '{}'",
                    disk,
                    instance,
                    record.detacher.as_ref().map(|s| s.name()).unwrap_or("?")
                ),
            )),
            None => Err(WorkflowError::new(
                ErrorKind::NotAttached,
                format!("disk '{}' is not attached to instance '{}'", disk, instance),
            )),
        }
    }

    /// Detaches every disk with a live attachment to `instance`.
    ///
    /// Invoked automatically when an instance is registered for deletion
    /// so its disks become detachable. Individual failures are collected;
    /// the sweep keeps going.
    pub fn register_all_detachments(
        &self,
        instance: &str,
        step: &Arc<Step>,
    ) -> Result<(), WorkflowError> {
        self.instances.resolve(instance)?;

        let mut errs = MultiError::new();
        let mut records = self.records.lock().unwrap();
        for (disk, disk_records) in records.iter_mut() {
            if let Some(record) = disk_records.get_mut(instance) {
                if record.detacher.is_some() {
                    continue;
                }
                if let Err(e) = detach(record, disk, instance, step) {
                    errs.push(e);
                }
            }
        }
        drop(records);
        errs.into_result()
    }

    /// Returns the live (undetached) attachment count for a disk.
    pub fn live_attachments(&self, disk: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .get(disk)
            .map(|instances| {
                instances
                    .values()
                    .filter(|record| record.detacher.is_none())
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Marks a record detached by `step`, requiring the dependency on the
/// attacher. The caller holds the records lock.
fn detach(
    record: &mut Attachment,
    disk: &str,
    instance: &str,
    step: &Arc<Step>,
) -> Result<(), WorkflowError> {
    if !chain::nested_depends(step, &record.attacher) {
        return Err(WorkflowError::new(
            ErrorKind::MissingDependency,
            format!(
            "step '{}' detaches disk '{}' from instance '{}' but does not depend on its attacher step '{}'",
            step.name(),
            disk,
            instance,
            record.attacher.name()
        ),
        ));
    }
    record.detacher = Some(step.clone());
    debug!(
        "registered detachment of disk '{}' from instance '{}' by step '{}'",
        disk,
        instance,
        step.name()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::registry::Resource;
    use crate::{Step, Workflow};

    /// Workflow with a linear chain attach → detach → reattach plus an
    /// unrelated step, and registered disk/instance resources.
    fn fixture() -> (Arc<Workflow>, Arc<Step>, Arc<Step>, Arc<Step>, Arc<Step>) {
        let workflow = Workflow::new("wf");
        let attach = workflow.add_step(Step::new("attach")).unwrap();
        let detach = workflow
            .add_step(Step::new("detach").depends_on("attach"))
            .unwrap();
        let reattach = workflow
            .add_step(Step::new("reattach").depends_on("detach"))
            .unwrap();
        let unrelated = workflow.add_step(Step::new("unrelated")).unwrap();

        for disk in ["d1", "d2"] {
            workflow
                .disks()
                .reg_create(disk, Resource::new(disk, disk), &attach, true)
                .unwrap();
        }
        for vm in ["i1", "i2"] {
            workflow
                .instances()
                .reg_create(vm, Resource::new(vm, vm), &attach, true)
                .unwrap();
        }
        (workflow, attach, detach, reattach, unrelated)
    }

    #[test]
    fn test_attach_unknown_disk() {
        let (workflow, attach, ..) = fixture();
        let err = workflow
            .attachments()
            .register_attachment("ghost", "i1", AttachMode::ReadWrite, &attach)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingReference);
    }

    #[test]
    fn test_repeat_attach_is_idempotent() {
        let (workflow, attach, _, _, unrelated) = fixture();
        let tracker = workflow.attachments();
        tracker
            .register_attachment("d1", "i1", AttachMode::ReadWrite, &attach)
            .unwrap();
        // Same pair, any mode, even from an unordered step: no-op.
        tracker
            .register_attachment("d1", "i1", AttachMode::ReadOnly, &unrelated)
            .unwrap();
        assert_eq!(tracker.live_attachments("d1"), 1);
    }

    #[test]
    fn test_concurrent_rw_conflict() {
        let (workflow, attach, _, _, unrelated) = fixture();
        let tracker = workflow.attachments();
        tracker
            .register_attachment("d1", "i1", AttachMode::ReadWrite, &attach)
            .unwrap();

        let err = tracker
            .register_attachment("d1", "i2", AttachMode::ReadOnly, &unrelated)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentRwConflict);
    }

    #[test]
    fn test_concurrent_read_only_is_permitted() {
        let (workflow, attach, _, _, unrelated) = fixture();
        let tracker = workflow.attachments();
        tracker
            .register_attachment("d1", "i1", AttachMode::ReadOnly, &attach)
            .unwrap();
        tracker
            .register_attachment("d1", "i2", AttachMode::ReadOnly, &unrelated)
            .unwrap();
        assert_eq!(tracker.live_attachments("d1"), 2);
    }

    #[test]
    fn test_sequenced_reattach_after_detach() {
        let (workflow, attach, detach, reattach, _) = fixture();
        let tracker = workflow.attachments();
        tracker
            .register_attachment("d1", "i1", AttachMode::ReadWrite, &attach)
            .unwrap();
        tracker
            .register_detachment("d1", "i1", &detach)
            .unwrap();
        // The reattach step depends on the detacher, so the old record is
        // not concurrent with the new one.
        tracker
            .register_attachment("d1", "i2", AttachMode::ReadWrite, &reattach)
            .unwrap();
        assert_eq!(tracker.live_attachments("d1"), 1);
    }

    #[test]
    fn test_detach_requires_attacher_dependency() {
        let (workflow, attach, _, _, unrelated) = fixture();
        let tracker = workflow.attachments();
        tracker
            .register_attachment("d1", "i1", AttachMode::ReadWrite, &attach)
            .unwrap();
        let err = tracker
            .register_detachment("d1", "i1", &unrelated)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingDependency);
    }

    #[test]
    fn test_detach_without_attachment() {
        let (workflow, _, detach, _, _) = fixture();
        let err = workflow
            .attachments()
            .register_detachment("d1", "i1", &detach)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAttached);
    }

    #[test]
    fn test_double_detach() {
        let (workflow, attach, detach, reattach, _) = fixture();
        let tracker = workflow.attachments();
        tracker
            .register_attachment("d1", "i1", AttachMode::ReadWrite, &attach)
            .unwrap();
        tracker.register_detachment("d1", "i1", &detach).unwrap();
        let err = tracker
            .register_detachment("d1", "i1", &reattach)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAttached);
    }

    #[test]
    fn test_detach_all_sweeps_live_records() {
        let (workflow, attach, detach, _, _) = fixture();
        let tracker = workflow.attachments();
        tracker
            .register_attachment("d1", "i1", AttachMode::ReadWrite, &attach)
            .unwrap();
        tracker
            .register_attachment("d2", "i1", AttachMode::ReadOnly, &attach)
            .unwrap();

        tracker.register_all_detachments("i1", &detach).unwrap();
        assert_eq!(tracker.live_attachments("d1"), 0);
        assert_eq!(tracker.live_attachments("d2"), 0);

        // A fresh sweep finds nothing live and succeeds.
        tracker.register_all_detachments("i1", &detach).unwrap();
    }

    #[test]
    fn test_detach_all_aggregates_failures_but_continues() {
        let workflow = Workflow::new("wf");
        let early = workflow.add_step(Step::new("early")).unwrap();
        let late = workflow.add_step(Step::new("late")).unwrap();
        // The sweeper depends only on early.
        let sweeper = workflow
            .add_step(Step::new("sweeper").depends_on("early"))
            .unwrap();

        workflow
            .disks()
            .reg_create("d1", Resource::new("d1", "d1"), &early, true)
            .unwrap();
        workflow
            .disks()
            .reg_create("d2", Resource::new("d2", "d2"), &early, true)
            .unwrap();
        workflow
            .instances()
            .reg_create("i1", Resource::new("i1", "i1"), &early, true)
            .unwrap();

        let tracker = workflow.attachments();
        tracker
            .register_attachment("d1", "i1", AttachMode::ReadOnly, &early)
            .unwrap();
        tracker
            .register_attachment("d2", "i1", AttachMode::ReadOnly, &late)
            .unwrap();

        let err = tracker
            .register_all_detachments("i1", &sweeper)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingDependency);
        assert!(err.to_string().contains("'late'"));

        // The record the sweeper could detach was detached anyway.
        assert_eq!(tracker.live_attachments("d1"), 0);
        assert_eq!(tracker.live_attachments("d2"), 1);
    }
}
