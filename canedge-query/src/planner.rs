//! Query planner
//!
//! Groups signal queries so each log file is loaded once per device and each
//! (interface, channel, database) partition of it is decoded once, however
//! many signals are requested from it.

use crate::signals::SignalDatabase;
use crate::types::{Interface, QueryError, SignalQuery};
use std::collections::HashSet;
use std::sync::Arc;

/// Output position of one input query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSlot {
    pub ref_id: String,
    pub target: String,
}

/// Query left out of processing; its result stays empty
#[derive(Debug)]
pub struct RejectedQuery {
    /// Position in the input
    pub index: usize,
    pub target: String,
    pub error: QueryError,
}

/// Identity of one decode partition within a device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecodeKey {
    pub interface: Interface,
    pub channel: u8,
    /// Database name
    pub database: String,
}

/// A query together with its output slot
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub slot: usize,
    pub query: SignalQuery,
}

/// Queries decoded together from one (interface, channel, database) partition
#[derive(Debug, Clone)]
pub struct DecodeGroup {
    pub key: DecodeKey,
    pub database: Arc<SignalDatabase>,
    pub queries: Vec<PlannedQuery>,
}

impl DecodeGroup {
    /// Distinct requested signal names, in first-appearance order
    pub fn signal_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.queries
            .iter()
            .map(|q| q.query.signal.as_str())
            .filter(|name| seen.insert(*name))
            .collect()
    }
}

/// All decode groups of one device
#[derive(Debug, Clone)]
pub struct DeviceGroup {
    pub device: String,
    pub decode_groups: Vec<DecodeGroup>,
}

impl DeviceGroup {
    /// Interfaces used by this device's queries
    pub fn interfaces(&self) -> Vec<Interface> {
        Interface::ALL
            .into_iter()
            .filter(|itf| self.decode_groups.iter().any(|g| g.key.interface == *itf))
            .collect()
    }

    /// Output slots served by this device
    pub fn slots(&self) -> Vec<usize> {
        self.decode_groups
            .iter()
            .flat_map(|g| g.queries.iter().map(|q| q.slot))
            .collect()
    }
}

/// Grouped signal queries, ready to run
#[derive(Debug)]
pub struct QueryPlan {
    /// One slot per input query, in input order
    pub targets: Vec<TargetSlot>,
    /// Devices in first-appearance order
    pub devices: Vec<DeviceGroup>,
    pub rejected: Vec<RejectedQuery>,
}

impl QueryPlan {
    /// Number of queries that will be processed
    pub fn planned_count(&self) -> usize {
        self.devices.iter().map(|d| d.slots().len()).sum()
    }
}

/// Group `queries` by device, then by (interface, channel, database)
///
/// Invalid queries, queries naming an unknown database and queries repeating
/// an earlier target label are rejected; they keep an (empty) output slot.
pub fn plan(queries: &[SignalQuery]) -> QueryPlan {
    let mut targets = Vec::with_capacity(queries.len());
    let mut devices: Vec<DeviceGroup> = Vec::new();
    let mut rejected = Vec::new();
    let mut labels = HashSet::new();

    for (slot, query) in queries.iter().enumerate() {
        targets.push(TargetSlot {
            ref_id: query.ref_id.clone(),
            target: query.target.clone(),
        });

        if !labels.insert(query.target.as_str()) {
            reject(&mut rejected, slot, query, QueryError::DuplicateTarget(query.target.clone()));
            continue;
        }
        if let Err(error) = query.validate() {
            reject(&mut rejected, slot, query, error);
            continue;
        }
        let Some(database) = query.database.database() else {
            reject(&mut rejected, slot, query, QueryError::UnknownDatabase(query.database.name().to_string()));
            continue;
        };

        let device = match devices.iter().position(|d| d.device == query.device) {
            Some(index) => &mut devices[index],
            None => {
                devices.push(DeviceGroup {
                    device: query.device.clone(),
                    decode_groups: Vec::new(),
                });
                let last = devices.len() - 1;
                &mut devices[last]
            }
        };

        let key = DecodeKey {
            interface: query.interface,
            channel: query.channel,
            database: query.database.name().to_string(),
        };
        let planned = PlannedQuery {
            slot,
            query: query.clone(),
        };
        match device.decode_groups.iter_mut().find(|g| g.key == key) {
            Some(group) => group.queries.push(planned),
            None => device.decode_groups.push(DecodeGroup {
                key,
                database: Arc::clone(database),
                queries: vec![planned],
            }),
        }
    }

    log::debug!(
        "Planned {} queries over {} devices, {} rejected",
        queries.len() - rejected.len(),
        devices.len(),
        rejected.len()
    );

    QueryPlan {
        targets,
        devices,
        rejected,
    }
}

fn reject(rejected: &mut Vec<RejectedQuery>, index: usize, query: &SignalQuery, error: QueryError) {
    log::warn!("Ignoring target {:?}: {}", query.target, error);
    rejected.push(RejectedQuery {
        index,
        target: query.target.clone(),
        error,
    });
}
