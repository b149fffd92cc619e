//! The narrow interface every compute backend implements.

use serde::{Deserialize, Serialize};
use skirmish_core::{ActionOutcome, DenyRule};
use std::collections::BTreeMap;

use crate::error::BackendError;

/// Firewall traffic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Flow {
    Ingress,
    Egress,
}

impl Flow {
    pub fn as_str(self) -> &'static str {
        match self {
            Flow::Ingress => "INGRESS",
            Flow::Egress => "EGRESS",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Flow::Ingress => "ingress",
            Flow::Egress => "egress",
        }
    }
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance as the backend lists it. `zone` may be a full resource URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub zone: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancePage {
    pub items: Vec<InstanceRecord>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationErrorItem {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

/// Result of a mutating call. A transport success can still carry an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<OperationError>,
}

impl Operation {
    pub fn failure_message(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        if error.errors.is_empty() {
            return Some(format!("operation {} reported an error", self.name));
        }
        Some(
            error
                .errors
                .iter()
                .map(|item| format!("{}: {}", item.code, item.message))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Both failure channels of a mutating call collapse into one outcome.
pub fn outcome_of(result: Result<Operation, BackendError>) -> ActionOutcome {
    match result {
        Ok(operation) => match operation.failure_message() {
            Some(message) => ActionOutcome::Failed { message },
            None => ActionOutcome::Applied,
        },
        Err(err) => ActionOutcome::Failed {
            message: err.to_string(),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSpec {
    pub name: String,
    pub network: String,
    pub direction: Flow,
    pub priority: u32,
    pub target_tags: Vec<String>,
    pub source_ranges: Vec<String>,
    pub destination_ranges: Vec<String>,
    pub denied: Vec<DenyRule>,
}

impl FirewallSpec {
    /// Highest-priority deny rule aimed at everything tagged with `tag`.
    ///
    /// Compute Engine matches `targetTags` against network tags, not labels.
    /// The network minion passes its isolation label key here and only sets
    /// that label, so against the real API the rule matches no instance
    /// until the same key is also added as a network tag.
    pub fn isolating(name: String, network: &str, flow: Flow, tag: &str, deny: &[DenyRule]) -> Self {
        let everywhere = vec!["0.0.0.0/0".to_string()];
        let (source_ranges, destination_ranges) = match flow {
            Flow::Ingress => (everywhere, Vec::new()),
            Flow::Egress => (Vec::new(), everywhere),
        };
        Self {
            name,
            network: network.to_string(),
            direction: flow,
            priority: 1,
            target_tags: vec![tag.to_string()],
            source_ranges,
            destination_ranges,
            denied: deny.to_vec(),
        }
    }
}

pub trait ComputeBackend: Send + Sync {
    /// Establish credentials. Called once per provider initialisation.
    fn connect(&self) -> Result<(), BackendError> {
        Ok(())
    }
    fn list_instances(
        &self,
        project: &str,
        zone: &str,
        page_token: Option<&str>,
    ) -> Result<InstancePage, BackendError>;
    fn stop_instance(&self, project: &str, zone: &str, name: &str)
        -> Result<Operation, BackendError>;
    fn start_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, BackendError>;
    fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, BackendError>;
    /// Replace the full label set of an instance.
    fn set_labels(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Operation, BackendError>;
    fn list_zones(&self, project: &str) -> Result<Vec<String>, BackendError>;
    fn list_regions(&self, project: &str) -> Result<Vec<String>, BackendError>;
    fn insert_firewall(
        &self,
        project: &str,
        firewall: &FirewallSpec,
    ) -> Result<Operation, BackendError>;
    fn delete_firewall(&self, project: &str, name: &str) -> Result<Operation, BackendError>;
}
