//! In-process backend that records every call, with scripted failures.
//! Only compiled for tests and the `test-support` feature.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::backend::{
    ComputeBackend, FirewallSpec, InstancePage, InstanceRecord, Operation, OperationError,
    OperationErrorItem,
};
use crate::error::BackendError;

const ZONE_URL_PREFIX: &str = "https://www.googleapis.com/compute/v1/projects";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    ListInstances {
        project: String,
        zone: String,
        page_token: Option<String>,
    },
    Stop {
        project: String,
        zone: String,
        name: String,
    },
    Start {
        project: String,
        zone: String,
        name: String,
    },
    Delete {
        project: String,
        zone: String,
        name: String,
    },
    SetLabels {
        project: String,
        zone: String,
        name: String,
        labels: BTreeMap<String, String>,
    },
    ListZones {
        project: String,
    },
    ListRegions {
        project: String,
    },
    InsertFirewall {
        project: String,
        firewall: FirewallSpec,
    },
    DeleteFirewall {
        project: String,
        name: String,
    },
}

impl BackendCall {
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            BackendCall::ListInstances { .. }
                | BackendCall::ListZones { .. }
                | BackendCall::ListRegions { .. }
        )
    }
}

/// How an injected failure surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The call itself errors.
    Transport,
    /// The call succeeds but the returned operation carries an error.
    Embedded,
}

#[derive(Debug, Clone)]
struct StoredInstance {
    project: String,
    zone: String,
    record: InstanceRecord,
}

#[derive(Debug)]
struct MemoryState {
    zones: BTreeMap<String, Vec<String>>,
    instances: Vec<StoredInstance>,
    firewalls: BTreeMap<String, BTreeMap<String, FirewallSpec>>,
    failures: HashMap<String, Failure>,
    listing_failures: HashSet<(String, String)>,
    calls: Vec<BackendCall>,
    page_size: usize,
    mutation_delay: Option<Duration>,
    next_id: u64,
    next_operation: u64,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            zones: BTreeMap::new(),
            instances: Vec::new(),
            firewalls: BTreeMap::new(),
            failures: HashMap::new(),
            listing_failures: HashSet::new(),
            calls: Vec::new(),
            page_size: 50,
            mutation_delay: None,
            next_id: 1000,
            next_operation: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_zones(&self, project: &str, zones: &[&str]) {
        let mut state = self.state();
        let entry = state.zones.entry(project.to_string()).or_default();
        for zone in zones {
            if !entry.iter().any(|existing| existing == zone) {
                entry.push((*zone).to_string());
            }
        }
    }

    /// Adds a running instance and returns its id.
    pub fn add_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        labels: &[(&str, &str)],
    ) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.instances.push(StoredInstance {
            project: project.to_string(),
            zone: zone.to_string(),
            record: InstanceRecord {
                id: id.clone(),
                name: name.to_string(),
                zone: format!("{ZONE_URL_PREFIX}/{project}/zones/{zone}"),
                status: "RUNNING".to_string(),
                labels: labels
                    .iter()
                    .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                    .collect(),
            },
        });
        drop(state);
        self.add_zones(project, &[zone]);
        id
    }

    /// Every mutation naming `target` (instance or firewall) fails.
    pub fn fail_on(&self, target: &str, failure: Failure) {
        self.state().failures.insert(target.to_string(), failure);
    }

    pub fn fail_listing(&self, project: &str, zone: &str) {
        self.state()
            .listing_failures
            .insert((project.to_string(), zone.to_string()));
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.state().page_size = page_size.max(1);
    }

    /// Stall each instance mutation, outside the state lock.
    pub fn set_mutation_delay(&self, delay: Duration) {
        self.state().mutation_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn mutation_calls(&self) -> Vec<BackendCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    pub fn status_of(&self, project: &str, name: &str) -> Option<String> {
        self.find(project, name).map(|stored| stored.record.status)
    }

    /// Change an instance's status without recording a call.
    pub fn set_status(&self, project: &str, name: &str, status: &str) {
        let mut state = self.state();
        if let Some(stored) = state
            .instances
            .iter_mut()
            .find(|stored| stored.project == project && stored.record.name == name)
        {
            stored.record.status = status.to_string();
        }
    }

    pub fn labels_of(&self, project: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.find(project, name).map(|stored| stored.record.labels)
    }

    pub fn firewalls(&self, project: &str) -> Vec<FirewallSpec> {
        self.state()
            .firewalls
            .get(project)
            .map(|rules| rules.values().cloned().collect())
            .unwrap_or_default()
    }

    fn find(&self, project: &str, name: &str) -> Option<StoredInstance> {
        self.state()
            .instances
            .iter()
            .find(|stored| stored.project == project && stored.record.name == name)
            .cloned()
    }

    fn pause(&self) {
        let delay = self.state().mutation_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
    }

    /// Applies `change` to the named instance unless a failure is injected.
    fn mutate_instance(
        &self,
        call: BackendCall,
        project: &str,
        zone: &str,
        name: &str,
        change: impl FnOnce(&mut Vec<StoredInstance>, usize),
    ) -> Result<Operation, BackendError> {
        self.pause();
        let mut state = self.state();
        state.calls.push(call);
        if let Some(failure) = state.failures.get(name).copied() {
            return state.fail(failure, &format!("{project}/{zone}/{name}"));
        }
        let Some(index) = state.instances.iter().position(|stored| {
            stored.project == project && stored.zone == zone && stored.record.name == name
        }) else {
            return Err(BackendError::Status {
                target: format!("{project}/{zone}/{name}"),
                status: 404,
            });
        };
        change(&mut state.instances, index);
        Ok(state.done())
    }
}

impl MemoryState {
    fn done(&mut self) -> Operation {
        let name = format!("operation-{}", self.next_operation);
        self.next_operation += 1;
        Operation {
            name,
            status: "DONE".to_string(),
            error: None,
        }
    }

    fn fail(&mut self, failure: Failure, target: &str) -> Result<Operation, BackendError> {
        match failure {
            Failure::Transport => Err(BackendError::Transport {
                target: target.to_string(),
                message: "injected transport failure".to_string(),
            }),
            Failure::Embedded => {
                let mut operation = self.done();
                operation.error = Some(OperationError {
                    errors: vec![OperationErrorItem {
                        code: "INJECTED".to_string(),
                        message: format!("injected failure for {target}"),
                    }],
                });
                Ok(operation)
            }
        }
    }
}

impl ComputeBackend for MemoryBackend {
    fn list_instances(
        &self,
        project: &str,
        zone: &str,
        page_token: Option<&str>,
    ) -> Result<InstancePage, BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::ListInstances {
            project: project.to_string(),
            zone: zone.to_string(),
            page_token: page_token.map(str::to_string),
        });
        if state
            .listing_failures
            .contains(&(project.to_string(), zone.to_string()))
        {
            return Err(BackendError::Transport {
                target: format!("{project}/{zone}"),
                message: "injected listing failure".to_string(),
            });
        }

        let start = match page_token {
            Some(token) => token.parse::<usize>().map_err(|err| BackendError::Decode {
                target: format!("{project}/{zone}"),
                message: format!("bad page token '{token}': {err}"),
            })?,
            None => 0,
        };
        let matching: Vec<InstanceRecord> = state
            .instances
            .iter()
            .filter(|stored| stored.project == project && stored.zone == zone)
            .map(|stored| stored.record.clone())
            .collect();
        let end = (start + state.page_size).min(matching.len());
        let items = matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page_token = (end < matching.len()).then(|| end.to_string());
        Ok(InstancePage {
            items,
            next_page_token,
        })
    }

    fn stop_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, BackendError> {
        let call = BackendCall::Stop {
            project: project.to_string(),
            zone: zone.to_string(),
            name: name.to_string(),
        };
        self.mutate_instance(call, project, zone, name, |instances, index| {
            instances[index].record.status = "TERMINATED".to_string();
        })
    }

    fn start_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, BackendError> {
        let call = BackendCall::Start {
            project: project.to_string(),
            zone: zone.to_string(),
            name: name.to_string(),
        };
        self.mutate_instance(call, project, zone, name, |instances, index| {
            instances[index].record.status = "RUNNING".to_string();
        })
    }

    fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, BackendError> {
        let call = BackendCall::Delete {
            project: project.to_string(),
            zone: zone.to_string(),
            name: name.to_string(),
        };
        self.mutate_instance(call, project, zone, name, |instances, index| {
            instances.remove(index);
        })
    }

    fn set_labels(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Operation, BackendError> {
        let call = BackendCall::SetLabels {
            project: project.to_string(),
            zone: zone.to_string(),
            name: name.to_string(),
            labels: labels.clone(),
        };
        let replacement = labels.clone();
        self.mutate_instance(call, project, zone, name, move |instances, index| {
            instances[index].record.labels = replacement;
        })
    }

    fn list_zones(&self, project: &str) -> Result<Vec<String>, BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::ListZones {
            project: project.to_string(),
        });
        Ok(state.zones.get(project).cloned().unwrap_or_default())
    }

    fn list_regions(&self, project: &str) -> Result<Vec<String>, BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::ListRegions {
            project: project.to_string(),
        });
        let mut regions: Vec<String> = state
            .zones
            .get(project)
            .map(|zones| {
                zones
                    .iter()
                    .map(|zone| crate::filter::region_of(zone).to_string())
                    .collect()
            })
            .unwrap_or_default();
        regions.sort();
        regions.dedup();
        Ok(regions)
    }

    fn insert_firewall(
        &self,
        project: &str,
        firewall: &FirewallSpec,
    ) -> Result<Operation, BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::InsertFirewall {
            project: project.to_string(),
            firewall: firewall.clone(),
        });
        if let Some(failure) = state.failures.get(&firewall.name).copied() {
            return state.fail(failure, &format!("{project}/firewalls/{}", firewall.name));
        }
        state
            .firewalls
            .entry(project.to_string())
            .or_default()
            .insert(firewall.name.clone(), firewall.clone());
        Ok(state.done())
    }

    fn delete_firewall(&self, project: &str, name: &str) -> Result<Operation, BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::DeleteFirewall {
            project: project.to_string(),
            name: name.to_string(),
        });
        if let Some(failure) = state.failures.get(name).copied() {
            return state.fail(failure, &format!("{project}/firewalls/{name}"));
        }
        let removed = state
            .firewalls
            .get_mut(project)
            .and_then(|rules| rules.remove(name));
        match removed {
            Some(_) => Ok(state.done()),
            None => Err(BackendError::Status {
                target: format!("{project}/firewalls/{name}"),
                status: 404,
            }),
        }
    }
}
