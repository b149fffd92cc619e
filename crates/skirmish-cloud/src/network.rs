//! Network isolation: tag selected instances with a run-unique label, then
//! deny their traffic in one direction with a top-priority firewall rule.

use log::{debug, info};
use skirmish_core::{ActionOutcome, CancelToken, Mode, Resource, ResourceAction, Step};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::backend::{outcome_of, FirewallSpec, Flow};
use crate::error::CloudError;
use crate::filter::filter_resources;
use crate::minion::{Minion, MinionContext, MinionKind, MinionReport, Notice, RecoveryLock, RestoreReport};
use crate::sampler::sample;

pub const ISOLATION_LABEL_VALUE: &str = "isolated";

static FIREWALL_SEQUENCE: AtomicU64 = AtomicU64::new(0);
static PROCESS_TOKEN: OnceLock<String> = OnceLock::new();

fn process_token() -> &'static str {
    PROCESS_TOKEN.get_or_init(|| Uuid::new_v4().simple().to_string()[..8].to_string())
}

/// `skirmish-<flow>-<process token>-<n>`, unique across the process.
pub fn next_firewall_name(flow: Flow) -> String {
    let sequence = FIREWALL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("skirmish-{}-{}-{sequence}", flow.slug(), process_token())
}

/// What has to be put back in one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallRecord {
    pub label: String,
    /// Isolated instances with their labels as they were before.
    pub resources: Vec<Resource>,
    pub firewall_names: Vec<String>,
}

#[derive(Debug, Default)]
struct NetworkState {
    step: String,
    records: BTreeMap<String, FirewallRecord>,
}

pub struct NetworkMinion {
    context: MinionContext,
    flow: Flow,
    state: RecoveryLock<NetworkState>,
}

impl NetworkMinion {
    pub fn new(context: MinionContext, flow: Flow) -> Self {
        Self {
            context,
            flow,
            state: RecoveryLock::new(NetworkState::default()),
        }
    }

    fn operation(&self) -> MinionKind {
        match self.flow {
            Flow::Ingress => MinionKind::Ingress,
            Flow::Egress => MinionKind::Egress,
        }
    }
}

impl Minion for NetworkMinion {
    fn kind(&self) -> MinionKind {
        self.operation()
    }

    fn arm(&self) {
        self.state.reserve();
    }

    fn disarm(&self) {
        self.state.cancel_reservation();
    }

    fn execute(
        &self,
        cancel: &CancelToken,
        step: &Step,
        mode: Mode,
    ) -> Result<MinionReport, CloudError> {
        let mut state = self.state.lock_for_execute();
        state.step = step.name.clone();

        let resources = filter_resources(
            self.context.backend.as_ref(),
            &self.context.catalog,
            &step.projects,
            &step.exclude,
            cancel,
        )?;
        let sampled = sample(resources, step.sample_rate());
        for resource in &sampled.skipped {
            debug!("[{}] sampled out {}", step.name, resource.qualified_name());
        }

        let label = format!("skirmish-{}", Uuid::new_v4().simple());
        let notice = Notice {
            context: &self.context,
            step: &step.name,
            operation: self.operation(),
            mode,
        };
        let mut report = MinionReport {
            selected: sampled.selected.len(),
            sampled_out: sampled.skipped.len(),
            ..MinionReport::default()
        };
        let backend = self.context.backend.as_ref();
        let mut isolated_projects = BTreeSet::new();

        for resource in sampled.selected {
            if cancel.is_cancelled() {
                info!("[{}] run cancelled, leaving remaining instances alone", step.name);
                report.cancelled = true;
                break;
            }
            if mode.is_dry_run() {
                isolated_projects.insert(resource.project.clone());
                notice.resource(ResourceAction::Isolate, &resource, ActionOutcome::Intended);
                continue;
            }

            let mut labels = resource.labels.clone();
            labels.insert(label.clone(), ISOLATION_LABEL_VALUE.to_string());
            let outcome = outcome_of(backend.set_labels(
                &resource.project,
                &resource.zone,
                &resource.name,
                &labels,
            ));
            let applied = outcome.is_applied();
            notice.resource(ResourceAction::Isolate, &resource, outcome);
            if !applied {
                report.failed += 1;
                continue;
            }

            report.affected += 1;
            isolated_projects.insert(resource.project.clone());
            if mode.restores() {
                let record = state
                    .records
                    .entry(resource.project.clone())
                    .or_insert_with(|| FirewallRecord {
                        label: label.clone(),
                        ..FirewallRecord::default()
                    });
                record.resources.push(resource);
            }
        }

        for setting in &step.settings.network {
            if report.cancelled {
                break;
            }
            if !isolated_projects.contains(&setting.project) {
                debug!(
                    "[{}] no isolated instances in {}, skipping firewall on {}",
                    step.name, setting.project, setting.network
                );
                continue;
            }
            let name = next_firewall_name(self.flow);
            if mode.is_dry_run() {
                notice.firewall(
                    ResourceAction::CreateFirewall,
                    &setting.project,
                    &name,
                    ActionOutcome::Intended,
                );
                continue;
            }

            let firewall =
                FirewallSpec::isolating(name, &setting.network, self.flow, &label, &setting.deny);
            let outcome = outcome_of(backend.insert_firewall(&setting.project, &firewall));
            let applied = outcome.is_applied();
            notice.firewall(
                ResourceAction::CreateFirewall,
                &setting.project,
                &firewall.name,
                outcome,
            );
            if !applied {
                report.failed += 1;
                continue;
            }
            if mode.restores() {
                if let Some(record) = state.records.get_mut(&setting.project) {
                    record.firewall_names.push(firewall.name);
                }
            }
        }

        Ok(report)
    }

    fn restore(&self) -> RestoreReport {
        let mut state = self.state.lock_for_restore();
        let records = std::mem::take(&mut state.records);
        let mut report = RestoreReport::default();
        if records.is_empty() {
            return report;
        }

        let notice = Notice {
            context: &self.context,
            step: &state.step,
            operation: self.operation(),
            mode: Mode::Repairable,
        };
        let backend = self.context.backend.as_ref();
        for (project, record) in records {
            for resource in &record.resources {
                report.attempted += 1;
                let outcome = outcome_of(backend.set_labels(
                    &resource.project,
                    &resource.zone,
                    &resource.name,
                    &resource.labels,
                ));
                if outcome.is_applied() {
                    report.restored += 1;
                } else {
                    report.failed += 1;
                }
                notice.resource(ResourceAction::Release, resource, outcome);
            }
            for name in &record.firewall_names {
                report.attempted += 1;
                let outcome = outcome_of(backend.delete_firewall(&project, name));
                if outcome.is_applied() {
                    report.restored += 1;
                } else {
                    report.failed += 1;
                }
                notice.firewall(ResourceAction::DeleteFirewall, &project, name, outcome);
            }
        }
        report
    }
}
