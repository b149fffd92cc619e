//! Validation for plan documents.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::plan::{Plan, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

impl ValidationIssue {
    fn error(code: &'static str, message: String) -> Self {
        Self {
            level: ValidationLevel::Error,
            code,
            message,
        }
    }

    fn warning(code: &'static str, message: String) -> Self {
        Self {
            level: ValidationLevel::Warning,
            code,
            message,
        }
    }
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for Plan {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.projects.is_empty() {
            issues.push(ValidationIssue::error(
                "plan.projects.empty",
                "no projects declared, there is nothing in scope".to_string(),
            ));
        }

        if self.providers.is_empty() {
            issues.push(ValidationIssue::error(
                "plan.providers.empty",
                "no providers declared".to_string(),
            ));
        }

        if self.steps.is_empty() {
            issues.push(ValidationIssue::warning(
                "plan.steps.empty",
                "plan has no steps; the run will do nothing".to_string(),
            ));
        }

        let mut seen_names = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if !step.name.trim().is_empty() && !seen_names.insert(step.name.as_str()) {
                issues.push(ValidationIssue::warning(
                    "step.name.duplicate",
                    format!("step name '{}' is used more than once", step.name),
                ));
            }
            validate_step(self, index, step, &mut issues);
        }

        issues
    }
}

fn validate_step(plan: &Plan, index: usize, step: &Step, issues: &mut Vec<ValidationIssue>) {
    let label = if step.name.trim().is_empty() {
        format!("step #{}", index + 1)
    } else {
        format!("step '{}'", step.name)
    };

    if step.name.trim().is_empty() {
        issues.push(ValidationIssue::error(
            "step.name.empty",
            format!("{label} must have a name"),
        ));
    }

    if step.operations.is_empty() {
        issues.push(ValidationIssue::error(
            "step.operations.empty",
            format!("{label} declares no operations"),
        ));
    }

    if step.projects.is_empty() {
        issues.push(ValidationIssue::error(
            "step.projects.empty",
            format!("{label} declares no projects"),
        ));
    }

    for project in &step.projects {
        if !plan.projects.contains(project) {
            issues.push(ValidationIssue::error(
                "step.project.unknown",
                format!("{label} targets project '{project}' which the plan does not declare"),
            ));
        }
    }

    if !plan.providers.contains(&step.provider) {
        issues.push(ValidationIssue::error(
            "step.provider.undeclared",
            format!(
                "{label} targets provider '{}' which the plan does not declare",
                step.provider
            ),
        ));
    }

    if !(0.0..=100.0).contains(&step.sample) {
        issues.push(ValidationIssue::error(
            "step.sample.range",
            format!(
                "{label} sample {} is outside 0..=100 percent",
                step.sample
            ),
        ));
    }

    for pattern in &step.exclude.wildcards {
        if let Err(err) = Regex::new(pattern) {
            issues.push(ValidationIssue::error(
                "step.exclude.wildcard.invalid",
                format!("{label} wildcard '{pattern}' does not compile: {err}"),
            ));
        }
    }

    for setting in &step.settings.network {
        if !step.projects.contains(&setting.project) {
            issues.push(ValidationIssue::warning(
                "step.network.project_out_of_scope",
                format!(
                    "{label} configures network '{}' in project '{}' outside the step's projects",
                    setting.network, setting.project
                ),
            ));
        }
    }
}
