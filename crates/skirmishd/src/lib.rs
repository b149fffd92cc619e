//! skirmish daemon crate: restore coordination, plan execution, run journal
//! and signal handling.

pub mod coordinator;
pub mod event_log;
pub mod orchestrator;
pub mod signals;

pub use coordinator::*;
pub use event_log::*;
pub use orchestrator::*;
pub use signals::*;
