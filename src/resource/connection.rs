//! Network Connection Tracking
//!
//! The binary analogue of the attachment tracker: an instance is either
//! connected to a network (or subnetwork) or it is not, so records carry
//! no mode. A live connection blocks re-connecting unless the new
//! connector transitively depends on the previous disconnector.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{ErrorKind, MultiError, WorkflowError};
use crate::execution::step::Step;
use crate::resource::registry::ResourceRegistry;
use crate::workflow::chain;

/// One connection of an instance to a network.
#[derive(Debug, Clone)]
struct Connection {
    connector: Arc<Step>,
    disconnector: Option<Arc<Step>>,
}

/// Tracks network↔instance connections for one workflow.
///
/// The same type covers networks and subnetworks; the registry passed at
/// construction decides which category the tracker resolves against.
pub struct ConnectionTracker {
    networks: Arc<ResourceRegistry>,
    instances: Arc<ResourceRegistry>,
    /// Network name → instance name → connection record.
    records: Mutex<HashMap<String, HashMap<String, Connection>>>,
}

impl fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("records", &self.records.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl ConnectionTracker {
    /// Creates a tracker layered on the given registries.
    pub fn new(networks: Arc<ResourceRegistry>, instances: Arc<ResourceRegistry>) -> Self {
        Self {
            networks,
            instances,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn category(&self) -> &str {
        self.networks.category()
    }

    /// Registers a connection of `instance` to `network` by `step`.
    ///
    /// Fails with [`ErrorKind::AlreadyConnected`] while a live record
    /// exists: one with no disconnector, or whose disconnector `step`
    /// does not transitively depend on.
    pub fn reg_connect(
        &self,
        network: &str,
        instance: &str,
        step: &Arc<Step>,
    ) -> Result<(), WorkflowError> {
        self.networks.resolve(network)?;
        self.instances.resolve(instance)?;

        let mut records = self.records.lock().unwrap();
        let network_records = records.entry(network.to_string()).or_default();
        if let Some(existing) = network_records.get(instance) {
            let live = match &existing.disconnector {
                Some(disconnector) => !chain::nested_depends(step, disconnector),
                None => true,
            };
            if live {
                return Err(WorkflowError::new(
                    ErrorKind::AlreadyConnected,
                    format!(
                        "instance '{}' is already connected to {} '{}' by step '{}'",
                        instance,
                        self.category(),
                        network,
                        existing.connector.name()
                    ),
                ));
            }
        }
        network_records.insert(
            instance.to_string(),
            Connection {
                connector: step.clone(),
                disconnector: None,
            },
        );
        debug!(
            "registered connection of instance '{}' to {} '{}' by step '{}'",
            instance,
            self.category(),
            network,
            step.name()
        );
        Ok(())
    }

    /// Registers a disconnection of `instance` from `network` by `step`.
    pub fn reg_disconnect(
        &self,
        network: &str,
        instance: &str,
        step: &Arc<Step>,
    ) -> Result<(), WorkflowError> {
        self.networks.resolve(network)?;
        self.instances.resolve(instance)?;

        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(network)
            .and_then(|instances| instances.get_mut(instance));
        match record {
            Some(record) if record.disconnector.is_none() => {
                self.disconnect(record, network, instance, step)
            }
            Some(_) => Err(WorkflowError::new(
                ErrorKind::NotConnected,
                format!(
                    "instance '{}' is already disconnected from {} '{}'",
                    instance,
                    self.category(),
                    network
                ),
            )),
            None => Err(WorkflowError::new(
                ErrorKind::NotConnected,
                format!(
                    "instance '{}' is not connected to {} '{}'",
                    instance,
                    self.category(),
                    network
                ),
            )),
        }
    }

    /// Disconnects `instance` from every network with a live record.
    ///
    /// Individual failures are collected; the sweep keeps going.
    pub fn reg_disconnect_all(
        &self,
        instance: &str,
        step: &Arc<Step>,
    ) -> Result<(), WorkflowError> {
        self.instances.resolve(instance)?;

        let mut errs = MultiError::new();
        let mut records = self.records.lock().unwrap();
        for (network, network_records) in records.iter_mut() {
            if let Some(record) = network_records.get_mut(instance) {
                if record.disconnector.is_some() {
                    continue;
                }
                if let Err(e) = self.disconnect(record, network, instance, step) {
                    errs.push(e);
                }
            }
        }
        drop(records);
        errs.into_result()
    }

    /// Returns the number of live connections for an instance.
    pub fn live_connections(&self, instance: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter(|instances| {
                instances
                    .get(instance)
                    .map(|record| record.disconnector.is_none())
                    .unwrap_or(false)
            })
            .count()
    }

    fn disconnect(
        &self,
        record: &mut Connection,
        network: &str,
        instance: &str,
        step: &Arc<Step>,
    ) -> Result<(), WorkflowError> {
        if !chain::nested_depends(step, &record.connector) {
            return Err(WorkflowError::new(
                ErrorKind::MissingDependency,
                format!(
                    "step '{}' disconnects instance '{}' from {} '{}' but does not depend on its connector step '{}'",
                    step.name(),
                    instance,
                    self.category(),
                    network,
                    record.connector.name()
                ),
            ));
        }
        record.disconnector = Some(step.clone());
        debug!(
            "registered disconnection of instance '{}' from {} '{}' by step '{}'",
            instance,
            self.category(),
            network,
            step.name()
        );
        Ok(())
    }
}
