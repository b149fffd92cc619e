pub mod backend;
pub mod catalog;
pub mod error;
pub mod filter;
pub mod gce;
pub mod instance;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod minion;
pub mod network;
pub mod provider;
pub mod sampler;

pub use backend::{outcome_of, ComputeBackend, FirewallSpec, Flow, InstancePage, InstanceRecord, Operation};
pub use catalog::Catalog;
pub use error::{BackendError, CloudError};
pub use filter::{filter_resources, ExclusionRules};
pub use gce::GceBackend;
pub use instance::InstanceMinion;
#[cfg(any(test, feature = "test-support"))]
pub use memory::{BackendCall, Failure, MemoryBackend};
pub use minion::{Minion, MinionContext, MinionKind, MinionReport, RestoreReport};
pub use network::{FirewallRecord, NetworkMinion};
pub use provider::{ComputeProvider, MinionFactory, Provider, ProviderRegistry, GOOGLE_PROVIDER};
pub use sampler::{sample, Sample};
