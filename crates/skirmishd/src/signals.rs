use log::warn;
use signal_hook::consts::signal::{SIGABRT, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::coordinator::{Coordinator, TriggerReason};
use crate::orchestrator::Orchestrator;

pub const HANDLED_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGABRT];

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGABRT => "SIGABRT",
        _ => "signal",
    }
}

/// Turns the first termination signal into an orchestrator shutdown.
pub struct SignalBridge {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalBridge {
    pub fn install(
        orchestrator: Arc<Orchestrator>,
        root: Arc<Coordinator>,
    ) -> Result<Self, std::io::Error> {
        let mut signals = Signals::new(HANDLED_SIGNALS)?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("skirmish-signals".to_string())
            .spawn(move || {
                let mut interrupted = false;
                for signal in signals.forever() {
                    let name = signal_name(signal);
                    if interrupted {
                        warn!("received {name} again, restore already in progress");
                        continue;
                    }
                    interrupted = true;
                    warn!("received {name}, restoring and shutting down");
                    root.trigger(TriggerReason::Interrupted {
                        signal: name.to_string(),
                    });
                    orchestrator.shutdown();
                }
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn close(mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("signal thread panicked");
            }
        }
    }
}
