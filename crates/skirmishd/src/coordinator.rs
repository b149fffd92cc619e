//! Restore coordinator: collects undo callbacks for one unit of work and runs
//! them exactly once after the first trigger.

use log::{error, info, warn};
use skirmish_core::{Event, EventKind, EventSink};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type RestoreFn = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Armed,
    Triggered,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerReason {
    Completed,
    Interrupted { signal: String },
    Cancelled,
    Fault { message: String },
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerReason::Completed => f.write_str("completed"),
            TriggerReason::Interrupted { signal } => write!(f, "interrupted by {signal}"),
            TriggerReason::Cancelled => f.write_str("cancelled"),
            TriggerReason::Fault { message } => write!(f, "fault: {message}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("supervised work panicked: {message}")]
    Fault { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    pub ran: usize,
    pub panicked: usize,
}

#[derive(Default)]
struct Registry {
    callbacks: Vec<RestoreFn>,
    finalized: bool,
}

pub struct Coordinator {
    label: String,
    registry: Mutex<Registry>,
    done: AtomicBool,
    reason: Mutex<Option<TriggerReason>>,
    finalizing: Mutex<()>,
    events: Arc<dyn EventSink>,
}

impl Coordinator {
    pub fn new(label: impl Into<String>, events: Arc<dyn EventSink>) -> Self {
        Self {
            label: label.into(),
            registry: Mutex::new(Registry::default()),
            done: AtomicBool::new(false),
            reason: Mutex::new(None),
            finalizing: Mutex::new(()),
            events,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `restore` for finalisation. Once finalised, runs it right away.
    pub fn register(&self, restore: impl FnOnce() + Send + 'static) {
        let mut registry = self.registry();
        if !registry.finalized {
            registry.callbacks.push(Box::new(restore));
            return;
        }
        drop(registry);
        warn!(
            "coordinator {} already finalised, running late restore now",
            self.label
        );
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(restore)) {
            error!(
                "late restore on {} panicked: {}",
                self.label,
                panic_message(payload.as_ref())
            );
        }
    }

    /// First caller wins; later triggers are no-ops and return false.
    pub fn trigger(&self, reason: TriggerReason) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        info!("coordinator {} triggered: {reason}", self.label);
        self.events.record(Event::now(
            Some(&self.label),
            EventKind::CoordinatorTriggered {
                reason: reason.to_string(),
            },
        ));
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        true
    }

    pub fn complete(&self) -> bool {
        self.trigger(TriggerReason::Completed)
    }

    /// Record an unrecovered failure of the supervised work.
    pub fn fault(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        error!("coordinator {} caught a fault: {message}", self.label);
        self.events.record(Event::now(
            Some(&self.label),
            EventKind::Error {
                code: "coordinator.fault".to_string(),
                message: message.clone(),
            },
        ));
        self.trigger(TriggerReason::Fault { message })
    }

    pub fn trigger_reason(&self) -> Option<TriggerReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> CoordinatorState {
        if self.registry().finalized {
            CoordinatorState::Finalized
        } else if self.done.load(Ordering::Acquire) {
            CoordinatorState::Triggered
        } else {
            CoordinatorState::Armed
        }
    }

    /// Trigger (as completed, unless already triggered) and run every
    /// registered callback in order. Only the first call does any work; a
    /// concurrent caller returns once that work is finished.
    pub fn finalize(&self) -> FinalizeReport {
        self.complete();
        let _serial = self
            .finalizing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let callbacks = {
            let mut registry = self.registry();
            if registry.finalized {
                return FinalizeReport::default();
            }
            registry.finalized = true;
            std::mem::take(&mut registry.callbacks)
        };

        let mut report = FinalizeReport::default();
        for callback in callbacks {
            report.ran += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                report.panicked += 1;
                error!(
                    "restore callback on {} panicked: {}",
                    self.label,
                    panic_message(payload.as_ref())
                );
            }
        }

        if report.ran > 0 {
            info!(
                "coordinator {} ran {} restore callback(s)",
                self.label, report.ran
            );
        }
        self.events.record(Event::now(
            Some(&self.label),
            EventKind::RestoresCompleted {
                callbacks: report.ran,
                panicked: report.panicked,
            },
        ));
        report
    }

    /// Run `work`, recover a panic from it as a fault, then finalise.
    pub fn supervise<T>(&self, work: impl FnOnce() -> T) -> Result<T, CoordinatorError> {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(value) => {
                self.complete();
                Ok(value)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.fault(message.clone());
                Err(CoordinatorError::Fault { message })
            }
        };
        self.finalize();
        outcome
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.finalize();
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
