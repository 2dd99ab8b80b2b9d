//! Fairplay - provably-fair game sessions over a balance ledger
//!
//! Each bet commits a server seed before play, draws outcomes from
//! `HMAC-SHA256(server_seed, client_seed:nonce:round)`, and settles the
//! balance exactly once in the same atomic write that resolves the session.

pub mod api;
pub mod common;
pub mod config;
pub mod errors;
pub mod events;
pub mod expiry;
pub mod game_store;
pub mod games;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod seeds;
pub mod session;
pub mod storage;

pub use common::types::{
    GameEvent, GameEventType, GameSession, OutcomeRecord, SessionStatus, Transaction, TransactionStatus,
    TransactionType, User,
};
pub use config::{ConfigLoader, EngineConfig, FairplayConfig};
pub use errors::{ConfigurationError, EngineError, EngineResult};
pub use ledger::{Ledger, ReconciliationReport};
pub use session::{CancelReason, GameEngine, PlayResult, Settlement, Verification};
pub use storage::{MemoryStorage, OptimizedStorage};
