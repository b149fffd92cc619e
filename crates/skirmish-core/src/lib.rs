pub mod cancel;
pub mod events;
pub mod plan;
pub mod types;
pub mod validation;

pub use cancel::*;
pub use events::*;
pub use plan::*;
pub use types::*;
pub use validation::*;
