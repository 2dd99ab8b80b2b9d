//! API Request and Response Models

use crate::common::types::{GameEvent, GameSession, SessionStatus, Transaction, User};
use crate::games::processor::StepVerdict;
use crate::games::types::{GameParams, GameType, Outcome, SessionMetadata};
use crate::session::{PlayResult, Settlement};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// POST /sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub game_type: GameType,
    pub bet_amount: u64,
    pub client_seed: String,
    /// Falls back to the game's default parameters
    #[serde(default)]
    pub params: Option<GameParams>,
    /// Repeating a request with the same key returns the first session
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// POST /sessions/:id/play?expected_nonce=
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayQuery {
    /// Nonce this play is meant for; a repeat returns the recorded result
    #[serde(default)]
    pub expected_nonce: Option<u64>,
}

/// Public view of a session. The server seed only appears once the session is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub game_type: GameType,
    pub status: SessionStatus,
    pub bet_amount: u64,
    pub multiplier_bps: u64,
    pub payout: u64,
    pub client_seed: String,
    pub server_seed_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
    pub nonce: u64,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<GameSession> for SessionView {
    fn from(session: GameSession) -> Self {
        let server_seed = if session.status.is_terminal() {
            session.server_seed
        } else {
            None
        };
        Self {
            id: session.id,
            user_id: session.user_id,
            game_type: session.game_type,
            status: session.status,
            bet_amount: session.bet_amount,
            multiplier_bps: session.multiplier_bps,
            payout: session.payout,
            client_seed: session.client_seed,
            server_seed_hash: session.server_seed_hash,
            server_seed,
            nonce: session.nonce,
            metadata: session.metadata,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayResponse {
    pub session: SessionView,
    pub nonce: u64,
    pub outcome: Outcome,
    pub multiplier_bps: u64,
    pub verdict: StepVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout: Option<Transaction>,
}

impl From<PlayResult> for PlayResponse {
    fn from(result: PlayResult) -> Self {
        Self {
            session: result.session.into(),
            nonce: result.nonce,
            outcome: result.outcome,
            multiplier_bps: result.multiplier_bps,
            verdict: result.verdict,
            payout: result.payout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResponse {
    pub session: SessionView,
    pub payout: Transaction,
    pub applied: bool,
}

impl From<Settlement> for SettlementResponse {
    fn from(settlement: Settlement) -> Self {
        Self {
            session: settlement.session.into(),
            payout: settlement.payout,
            applied: settlement.applied,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsResponse {
    pub session_id: Uuid,
    pub events: Vec<GameEvent>,
}

/// POST /verify: recompute one outcome from caller-supplied inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub server_seed: String,
    pub client_seed: String,
    pub nonce: u64,
    pub params: GameParams,
    /// When present, also checked against `sha256(server_seed)`
    #[serde(default)]
    pub server_seed_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub game_type: GameType,
    pub nonce: u64,
    pub outcome: Outcome,
    pub server_seed_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment_valid: Option<bool>,
    pub algorithm_version: u32,
}

/// POST /users
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    #[serde(default)]
    pub auth_ref: Option<String>,
    #[serde(default)]
    pub initial_balance: u64,
}

/// POST /users/{id}/adjust
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustRequest {
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustResponse {
    pub user: User,
    pub transaction: Transaction,
}

/// Cursor pagination query
#[derive(Debug, Clone, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub const MAX_PAGE_LIMIT: usize = 200;

impl PageQuery {
    pub fn limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}
