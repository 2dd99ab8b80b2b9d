//! Shared record types persisted by the engine
//!
//! Every record here is stored as JSON under its own key prefix (see
//! `game_store`). Records carrying a `version` are guarded by optimistic
//! version checks on write.

use crate::games::processor::StepVerdict;
use crate::games::types::{GameAction, GameType, Outcome, SessionMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type UserId = Uuid;
pub type SessionId = Uuid;
pub type TransactionId = Uuid;

/// A player account. Only the ledger changes `balance`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Opaque reference to the external credential record
    pub auth_ref: String,
    pub balance: u64,
    pub initial_balance: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, auth_ref: impl Into<String>, initial_balance: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            auth_ref: auth_ref.into(),
            balance: initial_balance,
            initial_balance,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Net movement since creation; the reconciliation target
    pub fn net_change(&self) -> i128 {
        self.balance as i128 - self.initial_balance as i128
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Playing,
    Resolved,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Playing)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Playing => write!(f, "playing"),
            SessionStatus::Resolved => write!(f, "resolved"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One bet from creation to resolution
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub game_type: GameType,
    pub status: SessionStatus,
    pub bet_amount: u64,
    /// Basis points, 10_000 = 1.00x
    pub multiplier_bps: u64,
    pub payout: u64,
    pub client_seed: String,
    pub server_seed_hash: String,
    /// Only populated once the session is terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
    pub nonce: u64,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl GameSession {
    pub fn is_playing(&self) -> bool {
        self.status == SessionStatus::Playing
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Bet,
    Payout,
    Adjustment,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Bet => write!(f, "BET"),
            TransactionType::Payout => write!(f, "PAYOUT"),
            TransactionType::Adjustment => write!(f, "ADJUSTMENT"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Append-only ledger entry. `amount` is signed: bets are negative.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_session_id: Option<SessionId>,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub amount: i64,
    pub status: TransactionStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        user_id: UserId,
        game_session_id: Option<SessionId>,
        tx_type: TransactionType,
        amount: i64,
        status: TransactionStatus,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            game_session_id,
            tx_type,
            amount,
            status,
            metadata,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameEventType {
    Start,
    Outcome,
    Settle,
    Cancel,
}

impl fmt::Display for GameEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameEventType::Start => write!(f, "START"),
            GameEventType::Outcome => write!(f, "OUTCOME"),
            GameEventType::Settle => write!(f, "SETTLE"),
            GameEventType::Cancel => write!(f, "CANCEL"),
        }
    }
}

/// Audit record of a session lifecycle step
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameEvent {
    pub id: Uuid,
    pub game_session_id: SessionId,
    /// Strictly increasing per session, starting at 0
    pub sequence: u64,
    pub event_type: GameEventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The outcome drawn for one `(session, nonce)` pair
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub session_id: SessionId,
    pub nonce: u64,
    /// `None` for the SEQUENCE opening card drawn at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<GameAction>,
    pub outcome: Outcome,
    pub multiplier_bps: u64,
    /// How the play left the session; `None` for the opening card
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<StepVerdict>,
    pub created_at: DateTime<Utc>,
}

/// Durable committed server seed, written before its hash is published
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedRecord {
    pub session_id: SessionId,
    pub game_type: GameType,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Current UTC time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
