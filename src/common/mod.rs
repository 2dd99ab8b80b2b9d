//! Common types and traits shared across the engine

pub mod traits;
pub mod types;

pub use traits::{KvStore, WriteOp};
pub use types::*;
