//! Instance lifecycle chaos: stop (undone by start) or delete.

use log::{debug, info};
use skirmish_core::{ActionOutcome, CancelToken, Mode, Resource, ResourceAction, Step};

use crate::backend::outcome_of;
use crate::error::CloudError;
use crate::filter::filter_resources;
use crate::minion::{Minion, MinionContext, MinionKind, MinionReport, Notice, RecoveryLock, RestoreReport};
use crate::sampler::sample;

#[derive(Debug, Default)]
struct InstanceState {
    step: String,
    stopped: Vec<Resource>,
}

pub struct InstanceMinion {
    context: MinionContext,
    state: RecoveryLock<InstanceState>,
}

impl InstanceMinion {
    pub fn new(context: MinionContext) -> Self {
        Self {
            context,
            state: RecoveryLock::new(InstanceState::default()),
        }
    }
}

impl Minion for InstanceMinion {
    fn kind(&self) -> MinionKind {
        MinionKind::Instance
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

        let notice = Notice {
            context: &self.context,
            step: &step.name,
            operation: MinionKind::Instance,
            mode,
        };
        let mut report = MinionReport {
            selected: sampled.selected.len(),
            sampled_out: sampled.skipped.len(),
            ..MinionReport::default()
        };
        let backend = self.context.backend.as_ref();

        for resource in sampled.selected {
            if cancel.is_cancelled() {
                info!("[{}] run cancelled, leaving remaining instances alone", step.name);
                report.cancelled = true;
                break;
            }
            if mode != Mode::Destructive && !resource.is_running() {
                notice.resource(
                    ResourceAction::Stop,
                    &resource,
                    ActionOutcome::Skipped {
                        reason: format!("instance is {}, not running", status_label(&resource)),
                    },
                );
                continue;
            }
            let (action, outcome) = match mode {
                Mode::DryRun => (ResourceAction::Stop, ActionOutcome::Intended),
                Mode::Repairable => (
                    ResourceAction::Stop,
                    outcome_of(backend.stop_instance(&resource.project, &resource.zone, &resource.name)),
                ),
                Mode::Destructive => (
                    ResourceAction::Delete,
                    outcome_of(backend.delete_instance(&resource.project, &resource.zone, &resource.name)),
                ),
            };
            let applied = outcome.is_applied();
            let failed = matches!(outcome, ActionOutcome::Failed { .. });
            notice.resource(action, &resource, outcome);

            if applied {
                report.affected += 1;
                if mode.restores() {
                    state.stopped.push(resource);
                }
            } else if failed {
                report.failed += 1;
            }
        }

        Ok(report)
    }

    fn restore(&self) -> RestoreReport {
        let mut state = self.state.lock_for_restore();
        let stopped = std::mem::take(&mut state.stopped);
        let mut report = RestoreReport::default();
        if stopped.is_empty() {
            return report;
        }

        let notice = Notice {
            context: &self.context,
            step: &state.step,
            operation: MinionKind::Instance,
            mode: Mode::Repairable,
        };
        for resource in stopped {
            report.attempted += 1;
            let outcome = outcome_of(self.context.backend.start_instance(
                &resource.project,
                &resource.zone,
                &resource.name,
            ));
            if outcome.is_applied() {
                report.restored += 1;
            } else {
                report.failed += 1;
            }
            notice.resource(ResourceAction::Start, &resource, outcome);
        }
        report
    }
}

fn status_label(resource: &Resource) -> &str {
    if resource.status.is_empty() {
        "in an unknown state"
    } else {
        &resource.status
    }
}
