//! Workflow Execution Engine
//!
//! Thread-per-step scheduling: every step gets a worker thread up front,
//! blocked on its own start channel. Completions are multiplexed onto one
//! shared channel carrying `(step name, result)` tuples, so the driver
//! loop is a single blocking receive instead of a dynamic select over all
//! running steps.
//!
//! On the first step failure, and likewise when the cancellation signal
//! fires, the driver stops promoting waiting steps, lets everything
//! already running finish, and only then returns. Dropping a
//! never-started step's start sender is what tells its worker to exit
//! without running.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};

use crate::error::{ErrorKind, WorkflowError};
use crate::execution::step::Step;
use crate::workflow::Workflow;

/// Executes all steps of `workflow`, honoring the dependency graph.
///
/// Assumes the workflow has been validated: the graph is acyclic, every
/// dependency names a known step, and dependency lists are deduplicated.
pub(crate) fn run_steps(workflow: &Arc<Workflow>) -> Result<(), WorkflowError> {
    let steps = workflow.steps_snapshot();
    let deps = workflow.deps_snapshot();

    // Waiting maps each step to its not-yet-satisfied dependencies.
    let mut waiting: HashMap<String, Vec<String>> = steps
        .keys()
        .map(|name| (name.clone(), deps.get(name).cloned().unwrap_or_default()))
        .collect();
    let mut running: HashSet<String> = HashSet::new();

    let (done_tx, done_rx) = mpsc::channel::<(String, Result<(), WorkflowError>)>();
    let mut starts: HashMap<String, mpsc::Sender<()>> = HashMap::new();
    let mut handles = Vec::with_capacity(steps.len());

    for (name, step) in &steps {
        let (start_tx, start_rx) = mpsc::channel::<()>();
        starts.insert(name.clone(), start_tx);

        let done = done_tx.clone();
        let step = step.clone();
        let workflow = workflow.clone();
        let step_name = name.clone();
        handles.push(thread::spawn(move || {
            // A dropped sender means the step was never promoted
            // (cancellation or an earlier failure); exit without running.
            if start_rx.recv().is_err() {
                return;
            }
            let result = run_with_timeout(&workflow, &step);
            let _ = done.send((step_name, result));
        }));
    }
    drop(done_tx);

    let mut first_err: Option<WorkflowError> = None;

    while !waiting.is_empty() || !running.is_empty() {
        // Stop promoting once canceled or failing; running steps finish.
        if (workflow.is_canceled() || first_err.is_some()) && !waiting.is_empty() {
            debug!(
                "workflow '{}': discarding {} unstarted step(s)",
                workflow.name(),
                waiting.len()
            );
            for name in waiting.keys() {
                starts.remove(name);
            }
            waiting.clear();
        }

        // Promote every waiting step whose dependencies are satisfied.
        let ready: Vec<String> = waiting
            .iter()
            .filter(|(_, pending)| pending.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in ready {
            waiting.remove(&name);
            if let Some(start) = starts.remove(&name) {
                info!("step '{}' ready, starting", name);
                if start.send(()).is_ok() {
                    running.insert(name);
                }
            }
        }

        if running.is_empty() {
            if waiting.is_empty() {
                break;
            }
            // A validated graph always yields a ready step when nothing
            // is running; loop again rather than block forever.
            continue;
        }

        // Block until the first running step reports in.
        let (finished, result) = match done_rx.recv() {
            Ok(message) => message,
            Err(_) => break,
        };
        running.remove(&finished);
        match result {
            Ok(()) => {
                info!("step '{}' completed", finished);
                for pending in waiting.values_mut() {
                    pending.retain(|dep| dep != &finished);
                }
            }
            Err(err) => {
                if first_err.is_none() {
                    error!("step '{}' failed: {}", finished, err);
                    first_err = Some(err);
                } else {
                    warn!(
                        "step '{}' failed while the run was already failing: {}",
                        finished, err
                    );
                }
            }
        }
    }

    for handle in handles {
        let _ = handle.join();
    }

    if let Some(err) = first_err {
        return Err(err);
    }
    if workflow.is_canceled() {
        return Err(WorkflowError::new(
            ErrorKind::Canceled,
            format!("workflow '{}' was canceled", workflow.name()),
        ));
    }
    Ok(())
}

/// Races a step's run phase against its configured timeout.
///
/// The operation runs on its own thread; if the timer wins, the step is
/// reported as timed out and the operation thread is left to finish
/// detached rather than being forcibly terminated.
fn run_with_timeout(workflow: &Arc<Workflow>, step: &Arc<Step>) -> Result<(), WorkflowError> {
    let timeout = step.timeout();
    let (tx, rx) = mpsc::channel();
    let w = workflow.clone();
    let s = step.clone();
    thread::spawn(move || {
        let _ = tx.send(s.run(&w));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(WorkflowError::new(
            ErrorKind::Timeout,
            format!(
                "step '{}' did not complete within {:?}",
                step.name(),
                timeout
            ),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(WorkflowError::other(format!(
            "step '{}' terminated without reporting a result",
            step.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::step::StepAction;
    use crate::{Step, Workflow};
    use std::sync::Mutex;
    use std::time::Duration;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Appends its step name to a shared log when run.
    struct Record {
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl Record {
        fn new(log: &Arc<Mutex<Vec<String>>>) -> Box<dyn StepAction> {
            Box::new(Self {
                log: log.clone(),
                delay: Duration::ZERO,
            })
        }

        fn slow(log: &Arc<Mutex<Vec<String>>>, delay: Duration) -> Box<dyn StepAction> {
            Box::new(Self {
                log: log.clone(),
                delay,
            })
        }
    }

    impl StepAction for Record {
        fn populate(&self, _w: &Arc<Workflow>, _s: &Arc<Step>) -> Result<(), WorkflowError> {
            Ok(())
        }
        fn validate(&self, _w: &Arc<Workflow>, _s: &Arc<Step>) -> Result<(), WorkflowError> {
            Ok(())
        }
        fn run(&self, _w: &Arc<Workflow>, step: &Arc<Step>) -> Result<(), WorkflowError> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.log.lock().unwrap().push(step.name().to_string());
            Ok(())
        }
    }

    /// Fails after an optional delay.
    struct FailAfter(Duration);

    impl StepAction for FailAfter {
        fn populate(&self, _w: &Arc<Workflow>, _s: &Arc<Step>) -> Result<(), WorkflowError> {
            Ok(())
        }
        fn validate(&self, _w: &Arc<Workflow>, _s: &Arc<Step>) -> Result<(), WorkflowError> {
            Ok(())
        }
        fn run(&self, _w: &Arc<Workflow>, step: &Arc<Step>) -> Result<(), WorkflowError> {
            if !self.0.is_zero() {
                thread::sleep(self.0);
            }
            Err(WorkflowError::other(format!("{} blew up", step.name())))
        }
    }

    /// Cancels its own workflow, then finishes after a delay.
    struct CancelAndLinger {
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl StepAction for CancelAndLinger {
        fn populate(&self, _w: &Arc<Workflow>, _s: &Arc<Step>) -> Result<(), WorkflowError> {
            Ok(())
        }
        fn validate(&self, _w: &Arc<Workflow>, _s: &Arc<Step>) -> Result<(), WorkflowError> {
            Ok(())
        }
        fn run(&self, w: &Arc<Workflow>, step: &Arc<Step>) -> Result<(), WorkflowError> {
            w.cancel();
            thread::sleep(self.delay);
            self.log.lock().unwrap().push(step.name().to_string());
            Ok(())
        }
    }

    #[test]
    fn test_dependent_steps_run_in_order() {
        init_logging();
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new("wf");
        workflow
            .add_step(Step::new("first").with_action(Record::slow(&log, Duration::from_millis(30))))
            .unwrap();
        workflow
            .add_step(
                Step::new("second")
                    .with_action(Record::new(&log))
                    .depends_on("first"),
            )
            .unwrap();
        workflow
            .add_step(
                Step::new("third")
                    .with_action(Record::new(&log))
                    .depends_on("second"),
            )
            .unwrap();

        workflow.run().unwrap();
        let order = log.lock().unwrap().clone();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_independent_steps_all_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new("wf");
        for name in ["a", "b", "c", "d"] {
            workflow
                .add_step(Step::new(name).with_action(Record::new(&log)))
                .unwrap();
        }
        workflow.run().unwrap();
        let mut ran = log.lock().unwrap().clone();
        ran.sort();
        assert_eq!(ran, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_first_error_reported_and_siblings_drain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new("wf");
        workflow
            .add_step(
                Step::new("bad").with_action(Box::new(FailAfter(Duration::from_millis(20)))),
            )
            .unwrap();
        workflow
            .add_step(
                Step::new("slow").with_action(Record::slow(&log, Duration::from_millis(80))),
            )
            .unwrap();
        workflow
            .add_step(
                Step::new("never")
                    .with_action(Record::new(&log))
                    .depends_on("bad"),
            )
            .unwrap();

        let err = workflow.run().unwrap_err();
        assert_eq!(err.to_string(), "step 'bad' run error: bad blew up");

        // The already-running sibling was allowed to finish; the
        // dependent of the failed step never started.
        let ran = log.lock().unwrap().clone();
        assert_eq!(ran, vec!["slow"]);
    }

    #[test]
    fn test_cancellation_drains_in_flight_and_skips_waiting() {
        init_logging();
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new("wf");
        workflow
            .add_step(Step::new("d").with_action(Box::new(CancelAndLinger {
                log: log.clone(),
                delay: Duration::from_millis(60),
            })))
            .unwrap();
        workflow
            .add_step(
                Step::new("e")
                    .with_action(Record::new(&log))
                    .depends_on("d"),
            )
            .unwrap();

        let err = workflow.run().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);

        // d finished despite the cancellation; e never started.
        let ran = log.lock().unwrap().clone();
        assert_eq!(ran, vec!["d"]);
    }

    #[test]
    fn test_step_timeout_fires() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new("wf");
        workflow
            .add_step(
                Step::new("stuck")
                    .with_timeout("50ms")
                    .with_action(Record::slow(&log, Duration::from_secs(5))),
            )
            .unwrap();

        let err = workflow.run().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("stuck"));
    }

    #[test]
    fn test_run_rejects_cyclic_graph_before_starting() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new("wf");
        workflow
            .add_step(
                Step::new("a")
                    .with_action(Record::new(&log))
                    .depends_on("b"),
            )
            .unwrap();
        workflow
            .add_step(
                Step::new("b")
                    .with_action(Record::new(&log))
                    .depends_on("a"),
            )
            .unwrap();

        let err = workflow.run().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CycleDetected);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_empty_workflow_runs() {
        let workflow = Workflow::new("wf");
        workflow.run().unwrap();
    }
}
