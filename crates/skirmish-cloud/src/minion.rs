use log::{info, warn};
use skirmish_core::{ActionOutcome, CancelToken, Event, EventKind, EventSink, Mode, Resource, ResourceAction, Step};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::backend::{ComputeBackend, Flow};
use crate::catalog::Catalog;
use crate::error::CloudError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MinionKind {
    Instance,
    Ingress,
    Egress,
}

impl MinionKind {
    pub const ALL: [MinionKind; 3] = [MinionKind::Instance, MinionKind::Ingress, MinionKind::Egress];

    pub fn as_str(self) -> &'static str {
        match self {
            MinionKind::Instance => "instance",
            MinionKind::Ingress => "ingress",
            MinionKind::Egress => "egress",
        }
    }

    pub fn flow(self) -> Option<Flow> {
        match self {
            MinionKind::Instance => None,
            MinionKind::Ingress => Some(Flow::Ingress),
            MinionKind::Egress => Some(Flow::Egress),
        }
    }
}

impl std::str::FromStr for MinionKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "instance" => Ok(MinionKind::Instance),
            "ingress" => Ok(MinionKind::Ingress),
            "egress" => Ok(MinionKind::Egress),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

impl std::fmt::Display for MinionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinionReport {
    /// Resources kept by sampling.
    pub selected: usize,
    pub sampled_out: usize,
    pub affected: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub attempted: usize,
    pub restored: usize,
    pub failed: usize,
}

/// One operation bound to one step. `execute` and `restore` never interleave.
pub trait Minion: Send + Sync {
    fn kind(&self) -> MinionKind;
    /// Called before `execute` is handed to another thread; a `restore`
    /// arriving in between waits for `execute` to take the lock.
    fn arm(&self);
    /// Undo `arm` when `execute` will never run.
    fn disarm(&self);
    fn execute(&self, cancel: &CancelToken, step: &Step, mode: Mode)
        -> Result<MinionReport, CloudError>;
    fn restore(&self) -> RestoreReport;
}

/// Everything a minion borrows from its provider.
#[derive(Clone)]
pub struct MinionContext {
    pub provider: String,
    pub backend: Arc<dyn ComputeBackend>,
    pub catalog: Arc<Catalog>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug)]
struct Reserved<T> {
    value: T,
    reserved: bool,
}

/// Mutex around a minion's recovery state that can be reserved for a pending
/// `execute`, so a `restore` issued first still runs after it.
#[derive(Debug)]
pub struct RecoveryLock<T> {
    state: Mutex<Reserved<T>>,
    released: Condvar,
}

pub struct RecoveryGuard<'a, T> {
    guard: MutexGuard<'a, Reserved<T>>,
}

impl<T> Deref for RecoveryGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.value
    }
}

impl<T> DerefMut for RecoveryGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard.value
    }
}

impl<T> RecoveryLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(Reserved {
                value,
                reserved: false,
            }),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Reserved<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reserve(&self) {
        self.lock().reserved = true;
    }

    pub fn cancel_reservation(&self) {
        let mut guard = self.lock();
        guard.reserved = false;
        self.released.notify_all();
    }

    /// Takes the lock and clears any reservation.
    pub fn lock_for_execute(&self) -> RecoveryGuard<'_, T> {
        let mut guard = self.lock();
        guard.reserved = false;
        self.released.notify_all();
        RecoveryGuard { guard }
    }

    /// Takes the lock once no `execute` is reserved or running.
    pub fn lock_for_restore(&self) -> RecoveryGuard<'_, T> {
        let guard = self
            .released
            .wait_while(self.lock(), |state| state.reserved)
            .unwrap_or_else(PoisonError::into_inner);
        RecoveryGuard { guard }
    }
}

/// The one reporting path every minion uses, whatever the mode.
pub(crate) struct Notice<'a> {
    pub context: &'a MinionContext,
    pub step: &'a str,
    pub operation: MinionKind,
    pub mode: Mode,
}

impl Notice<'_> {
    pub fn resource(&self, action: ResourceAction, resource: &Resource, outcome: ActionOutcome) {
        self.emit(
            action,
            resource.name.clone(),
            &resource.project,
            Some(resource.zone.clone()),
            outcome,
        );
    }

    pub fn firewall(&self, action: ResourceAction, project: &str, name: &str, outcome: ActionOutcome) {
        self.emit(action, name.to_string(), project, None, outcome);
    }

    fn emit(
        &self,
        action: ResourceAction,
        target: String,
        project: &str,
        zone: Option<String>,
        outcome: ActionOutcome,
    ) {
        let place = match &zone {
            Some(zone) => format!("{project}/{zone}/{target}"),
            None => format!("{project}/{target}"),
        };
        match &outcome {
            ActionOutcome::Intended => {
                info!("[{}] {} would {action} {place} ({})", self.step, self.operation, self.mode)
            }
            ActionOutcome::Applied => {
                info!("[{}] {} {action} {place} ({})", self.step, self.operation, self.mode)
            }
            ActionOutcome::Skipped { reason } => {
                info!("[{}] {} skipped {action} on {place}: {reason}", self.step, self.operation)
            }
            ActionOutcome::Failed { message } => warn!(
                "[{}] {} failed to {action} {place}: {message}",
                self.step, self.operation
            ),
        }
        self.context.events.record(Event::now(
            Some(self.step),
            EventKind::Resource {
                operation: self.operation.as_str().to_string(),
                action,
                target,
                project: project.to_string(),
                zone,
                mode: self.mode,
                outcome,
            },
        ));
    }
}
