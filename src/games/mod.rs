pub mod multiplier;
pub mod outcome;
pub mod processor;
pub mod types;

pub use outcome::{generate, OUTCOME_ALGORITHM_VERSION};
pub use processor::{StepResult, StepVerdict};
pub use types::*;
