//! Core types shared by every skirmish crate.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

static EVENT_NONCE: AtomicU64 = AtomicU64::new(1);

/// How aggressively a plan is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Simulate only; no backend mutation is issued.
    #[serde(alias = "dryrun", alias = "dry_run")]
    DryRun,
    /// Mutate and guarantee the undo.
    Repairable,
    /// Mutate without any promise of bringing things back.
    #[serde(alias = "destruction")]
    Destructive,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::DryRun => "dry-run",
            Mode::Repairable => "repairable",
            Mode::Destructive => "destructive",
        }
    }

    pub fn is_dry_run(self) -> bool {
        matches!(self, Mode::DryRun)
    }

    /// Whether resources touched in this mode are put back afterwards.
    pub fn restores(self) -> bool {
        matches!(self, Mode::Repairable)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "dry-run" | "dryrun" | "dry_run" => Ok(Mode::DryRun),
            "repairable" => Ok(Mode::Repairable),
            "destructive" | "destruction" => Ok(Mode::Destructive),
            other => Err(format!(
                "invalid mode '{other}'. valid values: dry-run, repairable, destructive"
            )),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live compute resource as observed at filter time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    /// Short zone name, e.g. `us-east1-b`.
    pub zone: String,
    pub region: String,
    pub project: String,
    /// Lifecycle status as listed, e.g. `RUNNING` or `TERMINATED`.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

pub const RUNNING_STATUS: &str = "RUNNING";

impl Resource {
    pub fn is_running(&self) -> bool {
        self.status == RUNNING_STATUS
    }

    /// `project/zone/name`, used in log lines and journal records.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}/{}", self.project, self.zone, self.name)
    }
}

/// Everything a provider needs to know at initialisation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// Allocate a process-unique event id.
    pub fn next() -> Self {
        let nonce = EVENT_NONCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("E{}-{nonce}", Utc::now().timestamp_millis()))
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
