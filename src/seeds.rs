//! Seed commitment manager
//!
//! A server seed is drawn from the OS CSPRNG and written durably under its
//! session id before its SHA-256 hash is handed out. The seed itself only
//! leaves the store once the session is terminal.

use crate::common::traits::KvStore;
use crate::common::types::{now, SeedRecord, SessionId, SessionStatus};
use crate::errors::{EngineError, EngineResult};
use crate::game_store;
use crate::games::types::GameType;
use crate::storage::WriteSet;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Bytes of entropy per server seed
pub const SEED_BYTES: usize = 32;

/// Attempts at drawing a seed whose hash is not already bound
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// 32 random bytes, hex-encoded
pub fn generate_seed() -> String {
    let mut bytes = [0u8; SEED_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Published commitment: `SHA-256` over the hex seed string, hex-encoded
pub fn hash_seed(server_seed: &str) -> String {
    hex::encode(Sha256::digest(server_seed.as_bytes()))
}

pub fn verify_commitment(server_seed: &str, server_seed_hash: &str) -> bool {
    hash_seed(server_seed).eq_ignore_ascii_case(server_seed_hash)
}

/// A seed committed for one session
#[derive(Debug, Clone)]
pub struct Commitment {
    pub server_seed: String,
    pub server_seed_hash: String,
}

pub struct SeedCommitments {
    store: Arc<dyn KvStore>,
}

impl SeedCommitments {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Draw, persist and commit a fresh seed for `session_id`
    pub fn commit(&self, session_id: SessionId, game_type: GameType) -> EngineResult<Commitment> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let server_seed = generate_seed();
            let server_seed_hash = hash_seed(&server_seed);

            let bound = game_store::find_seed_hash(self.store.as_ref(), &server_seed_hash)
                .map_err(|e| EngineError::CommitmentFailure(e.to_string()))?;
            if bound.is_some() {
                tracing::warn!(%session_id, attempt, "seed hash already bound, drawing again");
                continue;
            }

            let record = SeedRecord {
                session_id,
                game_type,
                server_seed: server_seed.clone(),
                server_seed_hash: server_seed_hash.clone(),
                created_at: now(),
            };
            let mut ws = WriteSet::new();
            game_store::stage_seed(&mut ws, &record)
                .map_err(|e| EngineError::CommitmentFailure(e.to_string()))?;
            ws.commit(self.store.as_ref()).map_err(|e| {
                tracing::warn!(%session_id, error = %e, "seed commitment write failed");
                EngineError::CommitmentFailure(e.to_string())
            })?;

            tracing::debug!(%session_id, hash = %server_seed_hash, "server seed committed");
            return Ok(Commitment {
                server_seed,
                server_seed_hash,
            });
        }

        Err(EngineError::CommitmentFailure(format!(
            "no unused seed after {} attempts",
            MAX_COMMIT_ATTEMPTS
        )))
    }

    /// Stored seed record, if one was committed
    pub fn load(&self, session_id: &SessionId) -> EngineResult<Option<SeedRecord>> {
        game_store::load_seed(self.store.as_ref(), session_id)
    }

    /// Committed seed, failing with `CommitmentFailure` if it is gone
    pub fn committed_seed(&self, session_id: &SessionId) -> EngineResult<String> {
        self.load(session_id)?
            .map(|record| record.server_seed)
            .ok_or_else(|| EngineError::CommitmentFailure(format!("no committed seed for session {}", session_id)))
    }

    /// The raw seed, only for a `resolved` or `cancelled` session
    pub fn reveal(&self, session_id: &SessionId) -> EngineResult<String> {
        let session = game_store::load_session(self.store.as_ref(), session_id)?
            .ok_or(EngineError::SessionNotFound(*session_id))?;

        if session.status == SessionStatus::Playing {
            return Err(EngineError::InvalidState {
                session_id: *session_id,
                status: session.status,
                operation: "reveal",
            });
        }

        if let Some(seed) = session.server_seed {
            return Ok(seed);
        }
        self.committed_seed(session_id)
    }

    /// Remove a seed whose session was never created
    pub fn discard(&self, session_id: &SessionId) -> EngineResult<()> {
        let Some(record) = self.load(session_id)? else {
            return Ok(());
        };
        if game_store::load_session(self.store.as_ref(), session_id)?.is_some() {
            return Err(EngineError::InvalidAction(format!(
                "seed for session {} is in use and cannot be discarded",
                session_id
            )));
        }

        let mut ws = WriteSet::new();
        game_store::stage_seed_removal(&mut ws, &record);
        ws.commit(self.store.as_ref())?;
        tracing::debug!(%session_id, "discarded uncommitted seed");
        Ok(())
    }
}
