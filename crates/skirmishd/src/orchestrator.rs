//! Drives a plan step by step: one coordinator per step, one thread per
//! operation.

use log::{debug, error, info};
use serde::Serialize;
use skirmish_cloud::{CloudError, Minion, Provider, ProviderRegistry};
use skirmish_core::{CancelToken, Event, EventKind, EventSink, Mode, Plan, Step};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::coordinator::{panic_message, Coordinator, TriggerReason};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown provider '{name}'; known providers: {}", .known.join(", "))]
    UnknownProvider { name: String, known: Vec<String> },
    #[error("provider '{name}' was not initialised for this plan")]
    ProviderNotInitialised { name: String },
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("failed to launch operation {operation}: {source}")]
    Spawn {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub steps_started: usize,
    pub minions_launched: usize,
    pub cancelled: bool,
}

pub struct Orchestrator {
    registry: ProviderRegistry,
    providers: HashMap<String, Arc<dyn Provider>>,
    cancel: CancelToken,
    active: Mutex<Option<Arc<Coordinator>>>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(registry: ProviderRegistry, events: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            providers: HashMap::new(),
            cancel: CancelToken::new(),
            active: Mutex::new(None),
            events,
        }
    }

    /// Resolve and initialise every provider the plan declares.
    pub fn initialise(&mut self, plan: &Plan) -> Result<(), OrchestratorError> {
        let config = plan.provider_config();
        for name in &plan.providers {
            if self.providers.contains_key(name) {
                continue;
            }
            let provider =
                self.registry
                    .get(name)
                    .ok_or_else(|| OrchestratorError::UnknownProvider {
                        name: name.clone(),
                        known: self.registry.names(),
                    })?;
            if provider.is_initialised() {
                debug!("provider {name} already initialised");
            } else {
                provider.initialise(&config)?;
                info!("provider {name} initialised for {} project(s)", config.projects.len());
            }
            self.providers.insert(name.clone(), provider);
        }
        Ok(())
    }

    pub fn execute(&self, plan: &Plan) -> Result<ExecutionSummary, OrchestratorError> {
        info!("running {} step(s) in {} mode", plan.steps.len(), plan.mode);
        self.events.record(Event::now(
            None,
            EventKind::RunStarted {
                mode: plan.mode,
                steps: plan.steps.len(),
            },
        ));

        let mut summary = ExecutionSummary::default();
        let result = self.run_steps(plan, &mut summary);
        self.retire_active();

        summary.cancelled |= self.cancel.is_cancelled();
        self.events.record(Event::now(
            None,
            EventKind::RunFinished {
                steps: summary.steps_started,
                cancelled: summary.cancelled,
            },
        ));
        result.map(|()| summary)
    }

    fn run_steps(
        &self,
        plan: &Plan,
        summary: &mut ExecutionSummary,
    ) -> Result<(), OrchestratorError> {
        for step in &plan.steps {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }

            self.retire_active();
            let coordinator = Arc::new(Coordinator::new(step.name.clone(), Arc::clone(&self.events)));
            *self.active.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(Arc::clone(&coordinator));
            // A shutdown racing the swap above may have missed this coordinator.
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }

            info!("step {}: {}", step.name, step.description);
            self.events.record(Event::now(
                Some(&step.name),
                EventKind::StepStarted {
                    description: step.description.clone(),
                    operations: step.operations.clone(),
                },
            ));
            summary.steps_started += 1;

            let provider = self.providers.get(&step.provider).ok_or_else(|| {
                OrchestratorError::ProviderNotInitialised {
                    name: step.provider.clone(),
                }
            })?;
            let factory = provider.minion_factory()?;
            let minions = step
                .operations
                .iter()
                .map(|operation| factory.create(operation))
                .collect::<Result<Vec<_>, _>>()?;

            for minion in minions {
                self.launch(&coordinator, step, plan.mode, minion)?;
                summary.minions_launched += 1;
            }

            if !plan.mode.is_dry_run() && step.wait > 0 {
                info!("step {} settling for {}s", step.name, step.wait);
                if self.cancel.wait_timeout(step.wait_duration()) {
                    summary.cancelled = true;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn launch(
        &self,
        coordinator: &Arc<Coordinator>,
        step: &Step,
        mode: Mode,
        minion: Arc<dyn Minion>,
    ) -> Result<(), OrchestratorError> {
        let operation = minion.kind().as_str();
        minion.arm();

        let worker = Arc::clone(&minion);
        let cancel = self.cancel.clone();
        let step_for_worker = step.clone();
        let events = Arc::clone(&self.events);
        let supervisor = Arc::clone(coordinator);
        let spawned = thread::Builder::new()
            .name(format!("skirmish-{operation}"))
            .spawn(move || {
                run_minion(
                    worker.as_ref(),
                    &cancel,
                    &step_for_worker,
                    mode,
                    events.as_ref(),
                    &supervisor,
                )
            });
        if let Err(source) = spawned {
            minion.disarm();
            return Err(OrchestratorError::Spawn {
                operation: operation.to_string(),
                source,
            });
        }

        debug!("step {} launched {operation}", step.name);
        self.events.record(Event::now(
            Some(&step.name),
            EventKind::OperationLaunched {
                operation: operation.to_string(),
            },
        ));

        let restorer = minion;
        let step_name = step.name.clone();
        coordinator.register(move || {
            let report = restorer.restore();
            if report.attempted > 0 {
                info!(
                    "step {step_name} {}: restored {}/{} ({} failed)",
                    restorer.kind(),
                    report.restored,
                    report.attempted,
                    report.failed
                );
            }
        });
        Ok(())
    }

    /// Cancel the run and finalise the active step. Safe to call repeatedly;
    /// every caller returns only once the step's restores have run.
    pub fn shutdown(&self) {
        if self.cancel.cancel() {
            info!("shutdown requested, restoring active step");
        }
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(coordinator) = active {
            coordinator.trigger(TriggerReason::Cancelled);
            coordinator.finalize();
        }
    }

    /// Finalise the active step, then clear the slot. The coordinator stays
    /// visible until its restores are done so a concurrent `shutdown` waits
    /// on it instead of finding nothing.
    fn retire_active(&self) {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(coordinator) = previous {
            debug!("retiring coordinator for step {}", coordinator.label());
            coordinator.finalize();
            self.active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
    }
}

fn run_minion(
    minion: &dyn Minion,
    cancel: &CancelToken,
    step: &Step,
    mode: Mode,
    events: &dyn EventSink,
    coordinator: &Coordinator,
) {
    let kind = minion.kind();
    match panic::catch_unwind(AssertUnwindSafe(|| minion.execute(cancel, step, mode))) {
        Ok(Ok(report)) => {
            info!(
                "step {} {kind}: {} selected, {} affected, {} failed, {} sampled out",
                step.name, report.selected, report.affected, report.failed, report.sampled_out
            );
            events.record(Event::now(
                Some(&step.name),
                EventKind::OperationFinished {
                    operation: kind.as_str().to_string(),
                    selected: report.selected,
                    affected: report.affected,
                    failed: report.failed,
                },
            ));
        }
        Ok(Err(CloudError::Cancelled)) => {
            info!("step {} {kind}: cancelled before any change", step.name);
        }
        Ok(Err(err)) => {
            error!("step {} {kind} failed: {err}", step.name);
            events.record(Event::now(
                Some(&step.name),
                EventKind::Error {
                    code: "operation.failed".to_string(),
                    message: err.to_string(),
                },
            ));
        }
        Err(payload) => {
            minion.disarm();
            coordinator.fault(format!("{kind} panicked: {}", panic_message(payload.as_ref())));
            coordinator.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skirmish_cloud::{
        BackendCall, ComputeProvider, MemoryBackend, MinionFactory, MinionKind, MinionReport,
        RestoreReport, GOOGLE_PROVIDER,
    };
    use skirmish_core::{parse_plan_toml, ActionOutcome, MemorySink, ProviderConfig, ResourceAction};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn mk_backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_instance("prod", "us-east1-b", "web-1", &[("tier", "web")]);
        backend.add_instance("prod", "us-west1-b", "web-2", &[]);
        backend
    }

    fn mk_orchestrator(
        backend: &Arc<MemoryBackend>,
        plan: &Plan,
    ) -> (Orchestrator, Arc<MemorySink>) {
        let events = Arc::new(MemorySink::new());
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ComputeProvider::new(
            GOOGLE_PROVIDER,
            backend.clone(),
            events.clone(),
        )));
        let mut orchestrator = Orchestrator::new(registry, events.clone());
        orchestrator.initialise(plan).expect("initialise");
        (orchestrator, events)
    }

    fn mk_plan(body: &str) -> Plan {
        parse_plan_toml(body).expect("parse plan")
    }

    fn count(backend: &MemoryBackend, pick: fn(&BackendCall) -> bool) -> usize {
        backend.calls().iter().filter(|call| pick(call)).count()
    }

    fn stopped_names(backend: &MemoryBackend) -> Vec<String> {
        backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Stop { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    fn started_names(backend: &MemoryBackend) -> Vec<String> {
        backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Start { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn unknown_provider_lists_known_set() {
        let plan = mk_plan(
            r#"
mode = "dry-run"
projects = ["prod"]
providers = ["aws"]
"#,
        );
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ComputeProvider::new(
            GOOGLE_PROVIDER,
            mk_backend(),
            Arc::new(MemorySink::new()),
        )));
        let mut orchestrator = Orchestrator::new(registry, Arc::new(MemorySink::new()));

        let err = orchestrator.initialise(&plan).expect_err("unknown provider");
        let text = err.to_string();
        assert!(text.contains("aws"));
        assert!(text.contains("google"));
    }

    #[test]
    fn initialise_skips_already_initialised_providers() {
        let backend = mk_backend();
        let plan = mk_plan(
            r#"
mode = "dry-run"
projects = ["prod"]
"#,
        );
        let provider = Arc::new(ComputeProvider::new(
            GOOGLE_PROVIDER,
            backend.clone(),
            Arc::new(MemorySink::new()),
        ));
        provider
            .initialise(&ProviderConfig {
                projects: vec!["prod".to_string()],
            })
            .expect("first initialise");
        let listings = count(&backend, |call| matches!(call, BackendCall::ListZones { .. }));

        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        let mut orchestrator = Orchestrator::new(registry, Arc::new(MemorySink::new()));
        orchestrator.initialise(&plan).expect("initialise");
        orchestrator.initialise(&plan).expect("initialise again");
        assert_eq!(
            count(&backend, |call| matches!(call, BackendCall::ListZones { .. })),
            listings
        );
    }

    #[test]
    fn zone_prefix_exclusion_keeps_only_other_zones() {
        let backend = mk_backend();
        let plan = mk_plan(
            r#"
mode = "repairable"
projects = ["prod"]

[[steps]]
name = "stop-west"
operations = ["instance"]
projects = ["prod"]

[steps.exclude]
zones = ["us-east"]
"#,
        );
        let (orchestrator, _) = mk_orchestrator(&backend, &plan);

        let summary = orchestrator.execute(&plan).expect("execute");
        assert_eq!(summary.steps_started, 1);
        assert_eq!(summary.minions_launched, 1);
        assert_eq!(stopped_names(&backend), vec!["web-2".to_string()]);
        assert_eq!(started_names(&backend), vec!["web-2".to_string()]);
    }

    #[test]
    fn unknown_operation_fails_before_anything_is_dispatched() {
        let backend = mk_backend();
        let plan = mk_plan(
            r#"
mode = "repairable"
projects = ["prod"]

[[steps]]
name = "bad"
operations = ["instance", "reboot"]
projects = ["prod"]
"#,
        );
        let (orchestrator, events) = mk_orchestrator(&backend, &plan);

        let err = orchestrator.execute(&plan).expect_err("unknown operation");
        assert!(err.to_string().contains("reboot"));
        assert!(backend.mutation_calls().is_empty());
        assert!(!events
            .events()
            .iter()
            .any(|event| matches!(event.kind, EventKind::OperationLaunched { .. })));
    }

    #[test]
    fn sampled_repairable_run_restarts_every_stopped_instance() {
        let plan = mk_plan(
            r#"
mode = "repairable"
projects = ["prod"]

[[steps]]
name = "half"
operations = ["instance"]
projects = ["prod"]
sample = 50
"#,
        );

        let mut runs_with_stops = 0;
        for _ in 0..40 {
            let backend = mk_backend();
            let (orchestrator, _) = mk_orchestrator(&backend, &plan);
            orchestrator.execute(&plan).expect("execute");

            let mut stopped = stopped_names(&backend);
            let mut started = started_names(&backend);
            stopped.sort();
            started.sort();
            assert_eq!(stopped, started);
            assert_eq!(backend.status_of("prod", "web-1").as_deref(), Some("RUNNING"));
            assert_eq!(backend.status_of("prod", "web-2").as_deref(), Some("RUNNING"));
            if !stopped.is_empty() {
                runs_with_stops += 1;
            }
        }
        assert!(runs_with_stops > 0, "half sampling never stopped anything in 40 runs");
    }

    #[test]
    fn dry_run_never_mutates_or_waits() {
        let backend = mk_backend();
        let plan = mk_plan(
            r#"
mode = "dry-run"
projects = ["prod"]

[[steps]]
name = "rehearsal"
operations = ["instance", "ingress", "egress"]
projects = ["prod"]
wait = 3600

[[steps.settings.network]]
project = "prod"
network = "default"
"#,
        );
        let (orchestrator, events) = mk_orchestrator(&backend, &plan);

        let started = Instant::now();
        let summary = orchestrator.execute(&plan).expect("execute");
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(summary.minions_launched, 3);
        assert!(backend.mutation_calls().is_empty());
        assert!(events
            .resource_records()
            .iter()
            .all(|(_, _, outcome)| *outcome == ActionOutcome::Intended));
    }

    #[test]
    fn destructive_run_never_restores() {
        let backend = mk_backend();
        let plan = mk_plan(
            r#"
mode = "destructive"
projects = ["prod"]

[[steps]]
name = "delete"
operations = ["instance"]
projects = ["prod"]
"#,
        );
        let (orchestrator, events) = mk_orchestrator(&backend, &plan);

        orchestrator.execute(&plan).expect("execute");
        assert_eq!(
            count(&backend, |call| matches!(call, BackendCall::Delete { .. })),
            2
        );
        assert_eq!(
            count(&backend, |call| matches!(call, BackendCall::Start { .. })),
            0
        );
        assert!(!events
            .resource_records()
            .iter()
            .any(|(action, _, _)| *action == ResourceAction::Start));
    }

    #[test]
    fn each_step_is_restored_before_the_next_dispatches() {
        let backend = mk_backend();
        let plan = mk_plan(
            r#"
mode = "repairable"
projects = ["prod"]

[[steps]]
name = "first"
operations = ["instance"]
projects = ["prod"]

[[steps]]
name = "second"
operations = ["instance"]
projects = ["prod"]
"#,
        );
        let (orchestrator, _) = mk_orchestrator(&backend, &plan);

        let summary = orchestrator.execute(&plan).expect("execute");
        assert_eq!(summary.steps_started, 2);
        let sequence: Vec<&'static str> = backend
            .mutation_calls()
            .iter()
            .map(|call| match call {
                BackendCall::Stop { .. } => "stop",
                BackendCall::Start { .. } => "start",
                _ => "other",
            })
            .collect();
        assert_eq!(
            sequence,
            vec!["stop", "stop", "start", "start", "stop", "stop", "start", "start"]
        );
    }

    #[test]
    fn shutdown_interrupts_the_settle_wait_and_restores() {
        let backend = mk_backend();
        let plan = mk_plan(
            r#"
mode = "repairable"
projects = ["prod"]

[[steps]]
name = "long"
operations = ["instance"]
projects = ["prod"]
wait = 3600

[[steps]]
name = "never"
operations = ["instance"]
projects = ["prod"]
"#,
        );
        let (orchestrator, _) = mk_orchestrator(&backend, &plan);
        let orchestrator = Arc::new(orchestrator);

        let stopper = {
            let orchestrator = Arc::clone(&orchestrator);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                orchestrator.shutdown();
                orchestrator.shutdown();
            })
        };
        let summary = orchestrator.execute(&plan).expect("execute");
        stopper.join().expect("stopper thread");

        assert!(summary.cancelled);
        assert_eq!(summary.steps_started, 1);
        let mut stopped = stopped_names(&backend);
        let mut started = started_names(&backend);
        stopped.sort();
        started.sort();
        assert_eq!(stopped, started);
        orchestrator.shutdown();
    }

    #[test]
    fn execute_and_shutdown_return_only_after_restores_finish() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_instance("prod", "us-east1-b", "web-1", &[]);
        backend.set_mutation_delay(Duration::from_millis(100));
        let plan = mk_plan(
            r#"
mode = "repairable"
projects = ["prod"]

[[steps]]
name = "slow-stop"
operations = ["instance"]
projects = ["prod"]
wait = 3600
"#,
        );
        let (orchestrator, events) = mk_orchestrator(&backend, &plan);
        let orchestrator = Arc::new(orchestrator);

        let stopper = {
            let orchestrator = Arc::clone(&orchestrator);
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                orchestrator.shutdown();
                started_names(&backend).len()
            })
        };
        let summary = orchestrator.execute(&plan).expect("execute");
        assert!(summary.cancelled);
        assert_eq!(stopped_names(&backend).len(), 1);
        assert_eq!(started_names(&backend).len(), 1);

        orchestrator.shutdown();
        assert_eq!(started_names(&backend).len(), 1);
        assert_eq!(stopper.join().expect("stopper thread"), 1);

        let kinds: Vec<EventKind> = events.events().into_iter().map(|event| event.kind).collect();
        let run_finished = kinds
            .iter()
            .position(|kind| matches!(kind, EventKind::RunFinished { .. }))
            .expect("run finished event");
        let start_record = kinds
            .iter()
            .position(|kind| {
                matches!(
                    kind,
                    EventKind::Resource {
                        action: ResourceAction::Start,
                        ..
                    }
                )
            })
            .expect("start record");
        assert!(start_record < run_finished);
    }

    struct PanickingMinion {
        restored: Arc<AtomicUsize>,
    }

    impl Minion for PanickingMinion {
        fn kind(&self) -> MinionKind {
            MinionKind::Instance
        }

        fn arm(&self) {}

        fn disarm(&self) {}

        fn execute(
            &self,
            _cancel: &CancelToken,
            _step: &Step,
            _mode: Mode,
        ) -> Result<MinionReport, CloudError> {
            panic!("backend client exploded");
        }

        fn restore(&self) -> RestoreReport {
            self.restored.fetch_add(1, Ordering::SeqCst);
            RestoreReport::default()
        }
    }

    #[test]
    fn panicking_minion_faults_the_step_and_still_restores() {
        let events = Arc::new(MemorySink::new());
        let coordinator = Arc::new(Coordinator::new("boom", events.clone()));
        let restored = Arc::new(AtomicUsize::new(0));
        let minion = Arc::new(PanickingMinion {
            restored: Arc::clone(&restored),
        });
        {
            let minion = Arc::clone(&minion);
            coordinator.register(move || {
                minion.restore();
            });
        }

        let step = mk_plan(
            r#"
mode = "repairable"
projects = ["prod"]

[[steps]]
name = "boom"
operations = ["instance"]
projects = ["prod"]
"#,
        )
        .steps
        .remove(0);
        run_minion(
            minion.as_ref(),
            &CancelToken::new(),
            &step,
            Mode::Repairable,
            events.as_ref(),
            &coordinator,
        );

        assert!(matches!(
            coordinator.trigger_reason(),
            Some(TriggerReason::Fault { .. })
        ));
        assert_eq!(restored.load(Ordering::SeqCst), 1);
        assert!(events.events().iter().any(|event| matches!(
            &event.kind,
            EventKind::Error { code, .. } if code == "coordinator.fault"
        )));
    }

    #[test]
    fn restore_registered_before_execute_starts_still_waits_for_it() {
        let backend = mk_backend();
        backend.set_mutation_delay(Duration::from_millis(30));
        let events = Arc::new(MemorySink::new());
        let provider = ComputeProvider::new(GOOGLE_PROVIDER, backend.clone(), events.clone());
        provider
            .initialise(&ProviderConfig {
                projects: vec!["prod".to_string()],
            })
            .expect("initialise");
        let factory: MinionFactory = provider.minion_factory().expect("factory");
        let minion = factory.create("instance").expect("minion");
        minion.arm();

        let coordinator = Arc::new(Coordinator::new("race", events.clone()));
        {
            let minion = Arc::clone(&minion);
            coordinator.register(move || {
                minion.restore();
            });
        }

        let step = mk_plan(
            r#"
mode = "repairable"
projects = ["prod"]

[[steps]]
name = "race"
operations = ["instance"]
projects = ["prod"]
"#,
        )
        .steps
        .remove(0);

        let finished = Arc::new(AtomicBool::new(false));
        let finaliser = {
            let coordinator = Arc::clone(&coordinator);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                coordinator.finalize();
                finished.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!finished.load(Ordering::SeqCst));

        minion
            .execute(&CancelToken::new(), &step, Mode::Repairable)
            .expect("execute");
        finaliser.join().expect("finaliser thread");

        assert_eq!(stopped_names(&backend).len(), 2);
        assert_eq!(started_names(&backend).len(), 2);
    }
}
