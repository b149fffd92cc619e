use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

use crate::types::{EventId, Mode};

/// What a minion did, or meant to do, to one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Stop,
    Start,
    Delete,
    Isolate,
    Release,
    CreateFirewall,
    DeleteFirewall,
}

impl ResourceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceAction::Stop => "stop",
            ResourceAction::Start => "start",
            ResourceAction::Delete => "delete",
            ResourceAction::Isolate => "isolate",
            ResourceAction::Release => "release",
            ResourceAction::CreateFirewall => "create_firewall",
            ResourceAction::DeleteFirewall => "delete_firewall",
        }
    }
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ActionOutcome {
    /// Dry-run: the action that would have been taken.
    Intended,
    Applied,
    /// Left alone because acting on it could not be undone faithfully.
    Skipped { reason: String },
    Failed { message: String },
}

impl ActionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ActionOutcome::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        mode: Mode,
        steps: usize,
    },
    StepStarted {
        description: String,
        operations: Vec<String>,
    },
    OperationLaunched {
        operation: String,
    },
    OperationFinished {
        operation: String,
        selected: usize,
        affected: usize,
        failed: usize,
    },
    Resource {
        operation: String,
        action: ResourceAction,
        target: String,
        project: String,
        zone: Option<String>,
        mode: Mode,
        outcome: ActionOutcome,
    },
    CoordinatorTriggered {
        reason: String,
    },
    RestoresCompleted {
        callbacks: usize,
        panicked: usize,
    },
    RunFinished {
        steps: usize,
        cancelled: bool,
    },
    Error {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub step: Option<String>,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn now(step: Option<&str>, kind: EventKind) -> Self {
        Self {
            id: EventId::next(),
            step: step.map(str::to_string),
            at: Utc::now(),
            kind,
        }
    }
}

/// Destination for run records. Implementations must not fail the caller;
/// a sink that cannot write reports it on its own.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: Event) {}
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resource records only, flattened for assertions.
    pub fn resource_records(&self) -> Vec<(ResourceAction, String, ActionOutcome)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event.kind {
                EventKind::Resource {
                    action,
                    target,
                    outcome,
                    ..
                } => Some((action, target, outcome)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
