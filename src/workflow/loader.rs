//! Graph Document Loading
//!
//! Loads a workflow skeleton (the workflow name plus each step's timeout
//! and dependency list) from a YAML or JSON document. The dependency
//! structure is the only externally authored input the engine consumes;
//! operation bodies are attached programmatically by the caller, since
//! concrete step types belong to collaborators.
//!
//! # Example document
//!
//! ```yaml
//! name: build-image
//! steps:
//!   fetch-sources:
//!     timeout: 5m
//!   compile:
//!     deps: [fetch-sources]
//!   package:
//!     deps: [compile]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::info;
use serde::Deserialize;

use crate::error::WorkflowError;
use crate::execution::step::{Step, StepBody};
use crate::workflow::Workflow;

/// One step entry in a graph document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDoc {
    /// Timeout such as "90s" or "10m"; the engine default applies when
    /// omitted.
    #[serde(default)]
    pub timeout: Option<String>,
    /// Names of steps this step depends on.
    #[serde(default)]
    pub deps: Vec<String>,
}

/// A minimal workflow document: name, steps, and dependencies.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDoc {
    pub name: String,
    #[serde(default)]
    pub steps: HashMap<String, StepDoc>,
}

impl GraphDoc {
    /// Parses a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self, WorkflowError> {
        serde_yaml::from_str(content)
            .map_err(|e| WorkflowError::other(format!("failed to parse graph document YAML: {}", e)))
    }

    /// Parses a JSON document.
    pub fn from_json_str(content: &str) -> Result<Self, WorkflowError> {
        serde_json::from_str(content)
            .map_err(|e| WorkflowError::other(format!("failed to parse graph document JSON: {}", e)))
    }

    /// Loads a document from a file, choosing the format by extension
    /// (`.json` is JSON, anything else YAML).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            WorkflowError::other(format!(
                "failed to read graph document '{}': {}",
                path.display(),
                e
            ))
        })?;
        let doc = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        info!(
            "loaded graph document '{}' ({} steps) from {}",
            doc.name,
            doc.steps.len(),
            path.display()
        );
        Ok(doc)
    }

    /// Builds a workflow from the document, attaching operation bodies by
    /// step name.
    ///
    /// Steps without an entry in `bodies` are created bodiless and will
    /// fail populate; leftover bodies for unknown steps are an error.
    pub fn into_workflow(
        self,
        mut bodies: HashMap<String, StepBody>,
    ) -> Result<Arc<Workflow>, WorkflowError> {
        let workflow = Workflow::new(self.name);

        let mut entries: Vec<(String, StepDoc)> = self.steps.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, doc) in entries {
            let mut step = Step::new(&name);
            if let Some(timeout) = doc.timeout {
                step = step.with_timeout(timeout);
            }
            for dep in doc.deps {
                step = step.depends_on(dep);
            }
            if let Some(body) = bodies.remove(&name) {
                step = match body {
                    StepBody::Action(action) => step.with_action(action),
                    StepBody::Include(child) => step.with_include(child),
                    StepBody::Sub(child) => step.with_subworkflow(child),
                };
            }
            workflow.add_step(step)?;
        }

        if let Some(unknown) = bodies.keys().next() {
            return Err(WorkflowError::other(format!(
                "operation body supplied for unknown step '{}'",
                unknown
            )));
        }
        Ok(workflow)
    }
}
