//! Plan documents: the declarative description of a chaos run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{Mode, ProviderConfig};
use crate::validation::{Validate, ValidationIssue, ValidationLevel};

pub const DEFAULT_PROVIDER: &str = "google";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read plan file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse plan at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse plan at {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("plan at {path} is invalid: {summary}")]
    Invalid {
        path: PathBuf,
        summary: String,
        issues: Vec<ValidationIssue>,
    },
}

/// The full declarative chaos run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub mode: Mode,
    /// Every project any step is allowed to touch.
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            projects: self.projects.clone(),
        }
    }
}

/// One named unit of concurrent operations against a resource scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub exclude: Exclude,
    #[serde(default)]
    pub settings: Settings,
    /// Settle time in seconds after the step's operations are launched.
    #[serde(default, alias = "wait_secs")]
    pub wait: u64,
    /// Percentage of in-scope resources to affect, 0 to 100.
    #[serde(default = "default_sample")]
    pub sample: f64,
}

impl Step {
    /// Sampling rate normalised to `[0.0, 1.0]`.
    pub fn sample_rate(&self) -> f64 {
        if self.sample.is_nan() {
            return 1.0;
        }
        (self.sample / 100.0).clamp(0.0, 1.0)
    }

    pub fn wait_duration(&self) -> Duration {
        Duration::from_secs(self.wait)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclude {
    /// Exact `key = value` label matches.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Zone name prefixes.
    #[serde(default)]
    pub zones: Vec<String>,
    /// Region name prefixes.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Regular expressions over the resource name.
    #[serde(default)]
    pub wildcards: Vec<String>,
}

impl Exclude {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
            && self.zones.is_empty()
            && self.regions.is_empty()
            && self.wildcards.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub network: Vec<NetworkSetting>,
}

/// Firewall deny rules applied to a network by the isolation operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSetting {
    pub project: String,
    pub network: String,
    #[serde(default)]
    pub deny: Vec<DenyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub protocol: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

fn default_providers() -> Vec<String> {
    vec![DEFAULT_PROVIDER.to_string()]
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_sample() -> f64 {
    100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    Toml,
    Yaml,
}

impl PlanFormat {
    /// `.yaml`/`.yml` files are YAML, everything else is TOML.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("yaml") | Some("yml") => PlanFormat::Yaml,
            _ => PlanFormat::Toml,
        }
    }
}

pub fn parse_plan_toml(contents: &str) -> Result<Plan, toml::de::Error> {
    toml::from_str(contents)
}

pub fn parse_plan_yaml(contents: &str) -> Result<Plan, serde_yaml::Error> {
    serde_yaml::from_str(contents)
}

/// Read, parse and validate a plan. Warnings are returned alongside the plan;
/// any error-level issue fails the load.
pub fn load_plan(path: impl AsRef<Path>) -> Result<(Plan, Vec<ValidationIssue>), ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    let plan = match PlanFormat::from_path(path_ref) {
        PlanFormat::Toml => parse_plan_toml(&body).map_err(|source| ConfigError::ParseToml {
            path: path_ref.to_path_buf(),
            source,
        })?,
        PlanFormat::Yaml => parse_plan_yaml(&body).map_err(|source| ConfigError::ParseYaml {
            path: path_ref.to_path_buf(),
            source,
        })?,
    };

    let issues = plan.validate();
    let errors: Vec<&ValidationIssue> = issues
        .iter()
        .filter(|issue| issue.level == ValidationLevel::Error)
        .collect();
    if !errors.is_empty() {
        let summary = errors
            .iter()
            .map(|issue| format!("{}: {}", issue.code, issue.message))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ConfigError::Invalid {
            path: path_ref.to_path_buf(),
            summary,
            issues,
        });
    }

    Ok((plan, issues))
}
