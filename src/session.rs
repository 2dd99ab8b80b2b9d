//! Game session state machine
//!
//! `playing -> resolved | cancelled`. Every transition is one `WriteSet`:
//! session record, ledger entries, outcome record and events commit together
//! or not at all. Locks are taken session first, then user.

use crate::common::traits::KvStore;
use crate::common::types::{
    now, GameEvent, GameEventType, GameSession, OutcomeRecord, SessionId, SessionStatus, Transaction,
    TransactionType, UserId,
};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EventBatch, EventRecorder};
use crate::game_store;
use crate::games::multiplier::{self, BPS_SCALE};
use crate::games::outcome::{self, OUTCOME_ALGORITHM_VERSION};
use crate::games::processor::{self, GameLimits, StepVerdict};
use crate::games::types::{GameAction, GameParams, GameType, Outcome};
use crate::ledger::{Ledger, SettleOutcome};
use crate::locks::{acquire, LockTable};
use crate::metrics::EngineMetrics;
use crate::seeds::{self, SeedCommitments};
use crate::storage::{retry_on_conflict, WriteSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Longest client idempotency key accepted by `create_session_with_key`
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Result of one `play`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayResult {
    pub session: GameSession,
    pub nonce: u64,
    pub outcome: Outcome,
    pub multiplier_bps: u64,
    pub verdict: StepVerdict,
    /// Present when this play resolved the session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout: Option<Transaction>,
}

/// Result of resolving a session, by play, cash-out or repeated settle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub session: GameSession,
    pub payout: Transaction,
    /// False when the session was already settled and nothing changed
    pub applied: bool,
}

/// One recorded outcome checked against a fresh recomputation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifiedOutcome {
    pub nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<GameAction>,
    pub recorded: Outcome,
    pub recomputed: Outcome,
    pub matches: bool,
}

/// Everything a player needs to re-derive a finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub game_type: GameType,
    pub params: GameParams,
    pub client_seed: String,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub nonce: u64,
    pub algorithm_version: u32,
    pub multiplier_bps: u64,
    pub payout: u64,
    pub commitment_valid: bool,
    pub outcomes: Vec<VerifiedOutcome>,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        self.commitment_valid && self.outcomes.iter().all(|o| o.matches)
    }
}

fn validate_idempotency_key(key: &str) -> EngineResult<()> {
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(EngineError::InvalidAction(format!(
            "idempotency key must be 1..={} bytes",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    Ok(())
}

/// Why a session was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Player,
    IdleTimeout,
}

pub struct GameEngine {
    config: EngineConfig,
    store: Arc<dyn KvStore>,
    seeds: SeedCommitments,
    ledger: Ledger,
    events: EventRecorder,
    session_locks: LockTable<SessionId>,
    metrics: Arc<EngineMetrics>,
}

impl GameEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn KvStore>) -> Self {
        Self::with_metrics(config, store, Arc::new(EngineMetrics::new()))
    }

    pub fn with_metrics(config: EngineConfig, store: Arc<dyn KvStore>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            seeds: SeedCommitments::new(store.clone()),
            ledger: Ledger::new(store.clone(), config.ledger_conflict_retries),
            events: EventRecorder::new(store.clone()),
            session_locks: LockTable::new(),
            config,
            store,
            metrics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn seeds(&self) -> &SeedCommitments {
        &self.seeds
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    fn limits(&self) -> GameLimits {
        GameLimits {
            sequence_max_steps: self.config.sequence_max_steps,
        }
    }

    fn load_session(&self, session_id: &SessionId) -> EngineResult<GameSession> {
        game_store::load_session(self.store.as_ref(), session_id)?.ok_or(EngineError::SessionNotFound(*session_id))
    }

    /// Open a session: commit a seed, reserve the bet, persist `playing` and
    /// record START, the last three in one write
    pub fn create_session(
        &self,
        user_id: UserId,
        game_type: GameType,
        bet_amount: u64,
        client_seed: &str,
        params: Option<GameParams>,
    ) -> EngineResult<GameSession> {
        self.create_session_with_key(user_id, game_type, bet_amount, client_seed, params, None)
    }

    /// `create_session` that is safe to repeat. A second request carrying the
    /// same `idempotency_key` returns the session the first one opened and
    /// reserves nothing.
    pub fn create_session_with_key(
        &self,
        user_id: UserId,
        game_type: GameType,
        bet_amount: u64,
        client_seed: &str,
        params: Option<GameParams>,
        idempotency_key: Option<&str>,
    ) -> EngineResult<GameSession> {
        let params = params.unwrap_or_else(|| GameParams::default_for(game_type));
        self.validate_create(game_type, bet_amount, client_seed, &params)?;
        if let Some(key) = idempotency_key {
            validate_idempotency_key(key)?;
        }

        let lock = self.ledger.user_lock(&user_id);
        let _user_guard = acquire(&lock);

        if let Some(key) = idempotency_key {
            if let Some(existing) = game_store::find_session_by_create_key(self.store.as_ref(), &user_id, key)? {
                if existing.game_type != game_type
                    || existing.bet_amount != bet_amount
                    || existing.client_seed != client_seed
                    || existing.metadata.params() != params
                {
                    return Err(EngineError::InvalidAction(format!(
                        "idempotency key {} was already used for a different session",
                        key
                    )));
                }
                tracing::info!(session_id = %existing.id, %user_id, key, "repeated create returned existing session");
                return Ok(existing);
            }
        }

        let user = self.ledger.get_user(&user_id)?;
        if user.balance < bet_amount {
            return Err(EngineError::InsufficientBalance {
                requested: bet_amount,
                available: user.balance,
            });
        }

        let session_id = Uuid::new_v4();
        let commitment = self.seeds.commit(session_id, game_type)?;

        let created = retry_on_conflict(self.config.ledger_conflict_retries, "create_session", || {
            self.stage_and_commit_create(
                session_id,
                user_id,
                game_type,
                bet_amount,
                client_seed,
                &params,
                &commitment,
                idempotency_key,
            )
        });

        match created {
            Ok(session) => {
                self.metrics.record_created(bet_amount);
                tracing::info!(
                    session_id = %session.id,
                    user_id = %user_id,
                    game_type = %game_type,
                    bet_amount,
                    server_seed_hash = %session.server_seed_hash,
                    "session created"
                );
                Ok(session)
            }
            Err(e) => {
                if let Err(discard_err) = self.seeds.discard(&session_id) {
                    tracing::warn!(%session_id, error = %discard_err, "failed to discard seed after aborted create");
                }
                tracing::warn!(%session_id, user_id = %user_id, error = %e, "session creation aborted");
                Err(e)
            }
        }
    }

    fn validate_create(
        &self,
        game_type: GameType,
        bet_amount: u64,
        client_seed: &str,
        params: &GameParams,
    ) -> EngineResult<()> {
        if bet_amount == 0 {
            return Err(EngineError::InvalidBet("bet amount must be positive".to_string()));
        }
        if bet_amount > self.config.max_bet {
            return Err(EngineError::InvalidBet(format!(
                "bet amount {} exceeds maximum {}",
                bet_amount, self.config.max_bet
            )));
        }
        if client_seed.is_empty() {
            return Err(EngineError::InvalidBet("client seed cannot be empty".to_string()));
        }
        if client_seed.chars().count() > self.config.max_client_seed_len {
            return Err(EngineError::InvalidBet(format!(
                "client seed longer than {} characters",
                self.config.max_client_seed_len
            )));
        }
        if params.game_type() != game_type {
            return Err(EngineError::InvalidBet(format!(
                "parameters for {} do not match game {}",
                params.game_type(),
                game_type
            )));
        }
        processor::validate_params(params)
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_and_commit_create(
        &self,
        session_id: SessionId,
        user_id: UserId,
        game_type: GameType,
        bet_amount: u64,
        client_seed: &str,
        params: &GameParams,
        commitment: &seeds::Commitment,
        idempotency_key: Option<&str>,
    ) -> EngineResult<GameSession> {
        let user = self.ledger.get_user(&user_id)?;
        let mut ws = WriteSet::new();
        if let Some(key) = idempotency_key {
            game_store::stage_create_key(&mut ws, &user_id, key, &session_id)?;
        }

        self.ledger.stage_reserve(
            &mut ws,
            &user,
            session_id,
            bet_amount,
            serde_json::json!({ "game_type": game_type, "bet_amount": bet_amount }),
        )?;

        let created_at = now();
        let opening = match params {
            GameParams::Sequence => {
                let (drawn, card) = processor::opening_card(&commitment.server_seed, client_seed);
                game_store::stage_outcome(
                    &mut ws,
                    &OutcomeRecord {
                        session_id,
                        nonce: 0,
                        action: None,
                        outcome: drawn,
                        multiplier_bps: BPS_SCALE,
                        verdict: None,
                        created_at,
                    },
                )?;
                Some(card)
            }
            _ => None,
        };

        let session = GameSession {
            id: session_id,
            user_id,
            game_type,
            status: SessionStatus::Playing,
            bet_amount,
            multiplier_bps: BPS_SCALE,
            payout: 0,
            client_seed: client_seed.to_string(),
            server_seed_hash: commitment.server_seed_hash.clone(),
            server_seed: None,
            nonce: 0,
            metadata: crate::games::types::SessionMetadata::initial(params, opening),
            created_at,
            updated_at: created_at,
            version: 0,
        };
        game_store::stage_session(&mut ws, &session, None)?;

        let mut events = self.events.batch(session_id)?;
        events.stage(
            &mut ws,
            GameEventType::Start,
            serde_json::json!({
                "user_id": user_id,
                "game_type": game_type,
                "bet_amount": bet_amount,
                "client_seed": client_seed,
                "server_seed_hash": commitment.server_seed_hash,
                "params": params,
                "opening_card": opening,
            }),
        )?;

        ws.commit(self.store.as_ref())?;
        Ok(session)
    }

    /// Apply one action at the next nonce
    pub fn play(&self, session_id: SessionId, action: GameAction) -> EngineResult<PlayResult> {
        self.play_at(session_id, action, None)
    }

    /// `play` that is safe to repeat. `expected_nonce` is the nonce the caller
    /// means to play; if it was already applied, the recorded result comes
    /// back and the session does not advance.
    pub fn play_at(
        &self,
        session_id: SessionId,
        action: GameAction,
        expected_nonce: Option<u64>,
    ) -> EngineResult<PlayResult> {
        let lock = self.session_locks.handle(&session_id);
        let _session_guard = acquire(&lock);

        if let Some(nonce) = expected_nonce {
            if let Some(recorded) = self.recorded_play(session_id, &action, nonce)? {
                tracing::info!(%session_id, nonce, "repeated play returned recorded result");
                return Ok(recorded);
            }
        }

        let result = retry_on_conflict(self.config.ledger_conflict_retries, "play", || {
            self.play_locked(session_id, &action)
        })?;

        self.metrics.record_play();
        tracing::info!(
            %session_id,
            nonce = result.nonce,
            multiplier_bps = result.multiplier_bps,
            verdict = ?result.verdict,
            "play applied"
        );
        Ok(result)
    }

    /// Result already recorded at `nonce`, or `None` when `nonce` is the next one
    fn recorded_play(&self, session_id: SessionId, action: &GameAction, nonce: u64) -> EngineResult<Option<PlayResult>> {
        let session = self.load_session(&session_id)?;
        let next = session.nonce + 1;
        if nonce == 0 || nonce > next {
            return Err(EngineError::InvalidAction(format!(
                "expected nonce {} does not match next nonce {}",
                nonce, next
            )));
        }
        if nonce == next {
            return Ok(None);
        }

        let record = game_store::load_outcome(self.store.as_ref(), &session_id, nonce)?.ok_or_else(|| {
            EngineError::PersistenceFailure(format!("session {} has no outcome for nonce {}", session_id, nonce))
        })?;
        if record.action != Some(*action) {
            return Err(EngineError::InvalidAction(format!(
                "nonce {} was played with a different action",
                nonce
            )));
        }

        let verdict = record.verdict.unwrap_or(StepVerdict::Continue);
        let payout = if verdict.is_terminal() {
            game_store::load_session_transaction(self.store.as_ref(), &session_id, TransactionType::Payout)?
        } else {
            None
        };
        Ok(Some(PlayResult {
            session,
            nonce,
            outcome: record.outcome,
            multiplier_bps: record.multiplier_bps,
            verdict,
            payout,
        }))
    }

    fn play_locked(&self, session_id: SessionId, action: &GameAction) -> EngineResult<PlayResult> {
        let session = self.load_session(&session_id)?;
        if !session.is_playing() {
            return Err(EngineError::InvalidState {
                session_id,
                status: session.status,
                operation: "play",
            });
        }

        let server_seed = self.seeds.committed_seed(&session_id)?;
        let nonce = session.nonce + 1;
        let step = processor::play_step(
            &server_seed,
            &session.client_seed,
            nonce,
            &session.metadata,
            session.multiplier_bps,
            action,
            &self.limits(),
        )?;

        let mut ws = WriteSet::new();
        game_store::stage_outcome(
            &mut ws,
            &OutcomeRecord {
                session_id,
                nonce,
                action: Some(*action),
                outcome: step.outcome.clone(),
                multiplier_bps: step.multiplier_bps,
                verdict: Some(step.verdict),
                created_at: now(),
            },
        )?;

        let mut events = self.events.batch(session_id)?;
        events.stage(
            &mut ws,
            GameEventType::Outcome,
            serde_json::json!({
                "nonce": nonce,
                "action": action,
                "outcome": step.outcome,
                "multiplier_bps": step.multiplier_bps,
                "verdict": step.verdict,
            }),
        )?;

        let read_version = session.version;
        let mut updated = session;
        updated.nonce = nonce;
        updated.metadata = step.metadata;
        updated.multiplier_bps = step.multiplier_bps;
        updated.updated_at = now();
        updated.version += 1;

        if step.verdict.is_terminal() {
            let settlement = self.resolve_and_commit(ws, events, updated, read_version, server_seed, "play")?;
            return Ok(PlayResult {
                session: settlement.session,
                nonce,
                outcome: step.outcome,
                multiplier_bps: step.multiplier_bps,
                verdict: step.verdict,
                payout: Some(settlement.payout),
            });
        }

        game_store::stage_session(&mut ws, &updated, Some(read_version))?;
        ws.commit(self.store.as_ref())?;
        Ok(PlayResult {
            session: updated,
            nonce,
            outcome: step.outcome,
            multiplier_bps: step.multiplier_bps,
            verdict: step.verdict,
            payout: None,
        })
    }

    /// Stage settlement, SETTLE and the `resolved` session on top of `ws`,
    /// then commit. Takes the user lock; the caller holds the session lock.
    fn resolve_and_commit(
        &self,
        mut ws: WriteSet,
        mut events: EventBatch,
        mut session: GameSession,
        read_version: u64,
        server_seed: String,
        trigger: &str,
    ) -> EngineResult<Settlement> {
        let lock = self.ledger.user_lock(&session.user_id);
        let _user_guard = acquire(&lock);

        let user = self.ledger.get_user(&session.user_id)?;
        let payout = multiplier::payout(session.bet_amount, session.multiplier_bps);
        let settled = self.ledger.stage_settle(
            &mut ws,
            &user,
            session.id,
            payout,
            serde_json::json!({
                "multiplier_bps": session.multiplier_bps,
                "nonce": session.nonce,
                "trigger": trigger,
            }),
        )?;
        let payout_tx = match settled {
            SettleOutcome::Applied { payout, .. } => payout,
            SettleOutcome::AlreadySettled(existing) => {
                return Err(EngineError::PersistenceFailure(format!(
                    "session {} is playing but already has payout {}",
                    session.id, existing.id
                )))
            }
        };

        session.status = SessionStatus::Resolved;
        session.payout = payout;
        session.server_seed = Some(server_seed.clone());

        events.stage(
            &mut ws,
            GameEventType::Settle,
            serde_json::json!({
                "trigger": trigger,
                "nonce": session.nonce,
                "multiplier_bps": session.multiplier_bps,
                "payout": payout,
                "server_seed": server_seed,
            }),
        )?;
        game_store::stage_session(&mut ws, &session, Some(read_version))?;
        ws.commit(self.store.as_ref())?;

        self.metrics.record_resolved(payout);
        tracing::info!(
            session_id = %session.id,
            user_id = %session.user_id,
            multiplier_bps = session.multiplier_bps,
            payout,
            trigger,
            "session resolved"
        );
        Ok(Settlement {
            session,
            payout: payout_tx,
            applied: true,
        })
    }

    /// Resolve a multi-play session at its current multiplier
    pub fn cash_out(&self, session_id: SessionId) -> EngineResult<Settlement> {
        let lock = self.session_locks.handle(&session_id);
        let _session_guard = acquire(&lock);

        retry_on_conflict(self.config.ledger_conflict_retries, "cash_out", || {
            let session = self.load_session(&session_id)?;
            if !session.is_playing() {
                return Err(EngineError::InvalidState {
                    session_id,
                    status: session.status,
                    operation: "cash out",
                });
            }
            processor::check_cash_out(&session.metadata)?;

            let server_seed = self.seeds.committed_seed(&session_id)?;
            let events = self.events.batch(session_id)?;
            let read_version = session.version;
            let mut updated = session;
            updated.updated_at = now();
            updated.version += 1;

            self.resolve_and_commit(WriteSet::new(), events, updated, read_version, server_seed, "cash_out")
        })
    }

    /// Idempotent settle: returns the existing PAYOUT of a resolved session
    /// and changes nothing
    pub fn settle(&self, session_id: SessionId) -> EngineResult<Settlement> {
        let lock = self.session_locks.handle(&session_id);
        let _session_guard = acquire(&lock);

        let session = self.load_session(&session_id)?;
        if session.status != SessionStatus::Resolved {
            return Err(EngineError::InvalidState {
                session_id,
                status: session.status,
                operation: "settle",
            });
        }
        let payout = game_store::load_session_transaction(self.store.as_ref(), &session_id, TransactionType::Payout)?
            .ok_or_else(|| {
                EngineError::PersistenceFailure(format!("resolved session {} has no payout", session_id))
            })?;
        Ok(Settlement {
            session,
            payout,
            applied: false,
        })
    }

    pub fn cancel(&self, session_id: SessionId) -> EngineResult<GameSession> {
        self.cancel_with_reason(session_id, CancelReason::Player)
    }

    /// Refund the bet, mark the session `cancelled` and record CANCEL
    pub fn cancel_with_reason(&self, session_id: SessionId, reason: CancelReason) -> EngineResult<GameSession> {
        self.cancel_guarded(session_id, reason, None)
    }

    /// Idle-timeout cancel that only applies if the session has not been
    /// touched after `cutoff`. Checked under the session lock.
    pub fn expire_if_idle(&self, session_id: SessionId, cutoff: DateTime<Utc>) -> EngineResult<GameSession> {
        self.cancel_guarded(session_id, CancelReason::IdleTimeout, Some(cutoff))
    }

    fn cancel_guarded(
        &self,
        session_id: SessionId,
        reason: CancelReason,
        idle_cutoff: Option<DateTime<Utc>>,
    ) -> EngineResult<GameSession> {
        let lock = self.session_locks.handle(&session_id);
        let _session_guard = acquire(&lock);

        let session = retry_on_conflict(self.config.ledger_conflict_retries, "cancel", || {
            self.cancel_locked(session_id, reason, idle_cutoff)
        })?;

        self.metrics.record_cancelled(reason == CancelReason::IdleTimeout);
        tracing::info!(%session_id, user_id = %session.user_id, ?reason, "session cancelled");
        Ok(session)
    }

    fn cancel_locked(
        &self,
        session_id: SessionId,
        reason: CancelReason,
        idle_cutoff: Option<DateTime<Utc>>,
    ) -> EngineResult<GameSession> {
        let session = self.load_session(&session_id)?;
        if !session.is_playing() {
            return Err(EngineError::InvalidState {
                session_id,
                status: session.status,
                operation: "cancel",
            });
        }
        if idle_cutoff.is_some_and(|cutoff| session.updated_at > cutoff) {
            return Err(EngineError::InvalidState {
                session_id,
                status: session.status,
                operation: "expire",
            });
        }
        let server_seed = self.seeds.committed_seed(&session_id)?;

        let lock = self.ledger.user_lock(&session.user_id);
        let _user_guard = acquire(&lock);

        let user = self.ledger.get_user(&session.user_id)?;
        let mut ws = WriteSet::new();
        let refund = match self.ledger.stage_reverse(&mut ws, &user, session_id)? {
            Some(_) => session.bet_amount,
            None => 0,
        };

        let mut events = self.events.batch(session_id)?;
        events.stage(
            &mut ws,
            GameEventType::Cancel,
            serde_json::json!({
                "reason": reason,
                "nonce": session.nonce,
                "refund": refund,
                "server_seed": server_seed,
            }),
        )?;

        let read_version = session.version;
        let mut updated = session;
        updated.status = SessionStatus::Cancelled;
        updated.payout = 0;
        updated.server_seed = Some(server_seed);
        updated.updated_at = now();
        updated.version += 1;

        game_store::stage_session(&mut ws, &updated, Some(read_version))?;
        ws.commit(self.store.as_ref())?;
        Ok(updated)
    }

    /// Server seed of a terminal session
    pub fn reveal(&self, session_id: SessionId) -> EngineResult<String> {
        self.seeds.reveal(&session_id)
    }

    /// Recompute every recorded outcome of a terminal session from the revealed seed
    pub fn verify(&self, session_id: SessionId) -> EngineResult<Verification> {
        let session = self.load_session(&session_id)?;
        if !session.status.is_terminal() {
            return Err(EngineError::InvalidState {
                session_id,
                status: session.status,
                operation: "verify",
            });
        }
        let server_seed = self.seeds.reveal(&session_id)?;
        let params = session.metadata.params();

        let outcomes = game_store::load_outcomes(self.store.as_ref(), &session_id)?
            .into_iter()
            .map(|record| {
                let recomputed = outcome::generate(&server_seed, &session.client_seed, record.nonce, &params);
                VerifiedOutcome {
                    nonce: record.nonce,
                    action: record.action,
                    matches: recomputed == record.outcome,
                    recorded: record.outcome,
                    recomputed,
                }
            })
            .collect();

        Ok(Verification {
            session_id,
            status: session.status,
            game_type: session.game_type,
            params,
            commitment_valid: seeds::verify_commitment(&server_seed, &session.server_seed_hash),
            client_seed: session.client_seed,
            server_seed,
            server_seed_hash: session.server_seed_hash,
            nonce: session.nonce,
            algorithm_version: OUTCOME_ALGORITHM_VERSION,
            multiplier_bps: session.multiplier_bps,
            payout: session.payout,
            outcomes,
        })
    }

    pub fn session(&self, session_id: SessionId) -> EngineResult<GameSession> {
        self.load_session(&session_id)
    }

    pub fn user_sessions(
        &self,
        user_id: UserId,
        cursor: Option<&str>,
        limit: usize,
    ) -> EngineResult<(Vec<GameSession>, Option<String>)> {
        self.ledger.get_user(&user_id)?;
        game_store::load_user_sessions(self.store.as_ref(), &user_id, cursor, limit)
    }

    pub fn events(&self, session_id: SessionId) -> EngineResult<Vec<GameEvent>> {
        self.load_session(&session_id)?;
        self.events.list(&session_id)
    }

    pub fn outcomes(&self, session_id: SessionId) -> EngineResult<Vec<OutcomeRecord>> {
        self.load_session(&session_id)?;
        game_store::load_outcomes(self.store.as_ref(), &session_id)
    }

    pub fn session_transactions(&self, session_id: SessionId) -> EngineResult<Vec<Transaction>> {
        self.load_session(&session_id)?;
        self.ledger.session_transactions(&session_id)
    }

    /// Cancel every `playing` session untouched since before `now - idle_timeout`
    pub fn expire_idle(&self, now: DateTime<Utc>) -> EngineResult<Vec<SessionId>> {
        let timeout = chrono::Duration::seconds(self.config.session_idle_timeout_secs as i64);
        let cutoff = now - timeout;
        let mut expired = Vec::new();

        for session_id in game_store::playing_session_ids(self.store.as_ref())? {
            let Some(session) = game_store::load_session(self.store.as_ref(), &session_id)? else {
                continue;
            };
            if !session.is_playing() || session.updated_at > cutoff {
                continue;
            }
            match self.expire_if_idle(session_id, cutoff) {
                Ok(_) => expired.push(session_id),
                // Played or finished between the scan and the lock
                Err(EngineError::InvalidState { .. }) => {}
                Err(e) => tracing::warn!(%session_id, error = %e, "failed to expire idle session"),
            }
        }

        let pruned = self.session_locks.prune() + self.ledger.prune_locks();
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), pruned, "expired idle sessions");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::TransactionStatus;
    use crate::games::types::{DiceDirection, Guess, SessionMetadata};
    use crate::storage::MemoryStorage;

    fn engine() -> (Arc<MemoryStorage>, GameEngine) {
        let store = Arc::new(MemoryStorage::new());
        (store.clone(), GameEngine::new(EngineConfig::default(), store))
    }

    fn dice_params() -> Option<GameParams> {
        Some(GameParams::Dice {
            target: 5_000,
            direction: DiceDirection::Under,
        })
    }

    #[test]
    fn test_create_reserves_and_commits() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("alice", "ext:alice", 1_000).unwrap();
        let session = engine
            .create_session(user.id, GameType::Dice, 100, "abc", dice_params())
            .unwrap();

        assert_eq!(session.status, SessionStatus::Playing);
        assert_eq!(session.nonce, 0);
        assert!(session.server_seed.is_none());
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 900);

        let seed = engine.seeds().load(&session.id).unwrap().unwrap();
        assert_eq!(seeds::hash_seed(&seed.server_seed), session.server_seed_hash);

        let events = engine.events(session.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, GameEventType::Start);

        let txs = engine.session_transactions(session.id).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].status, TransactionStatus::Pending);
        assert_eq!(txs[0].amount, -100);
    }

    #[test]
    fn test_create_validation() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("bob", "ext:bob", 1_000).unwrap();

        let zero = engine.create_session(user.id, GameType::Dice, 0, "abc", None);
        assert!(matches!(zero, Err(EngineError::InvalidBet(_))));

        let long_seed = "x".repeat(65);
        let long = engine.create_session(user.id, GameType::Dice, 10, &long_seed, None);
        assert!(matches!(long, Err(EngineError::InvalidBet(_))));

        let empty = engine.create_session(user.id, GameType::Dice, 10, "", None);
        assert!(matches!(empty, Err(EngineError::InvalidBet(_))));

        let mismatched = engine.create_session(user.id, GameType::Tiles, 10, "abc", dice_params());
        assert!(matches!(mismatched, Err(EngineError::InvalidBet(_))));

        let too_much = engine.create_session(user.id, GameType::Dice, 1_001, "abc", None);
        assert!(matches!(too_much, Err(EngineError::InsufficientBalance { .. })));

        let nobody = engine.create_session(Uuid::new_v4(), GameType::Dice, 10, "abc", None);
        assert!(matches!(nobody, Err(EngineError::UserNotFound(_))));

        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 1_000);
    }

    #[test]
    fn test_failed_create_discards_seed() {
        let (store, engine) = engine();
        let user = engine.ledger().create_user("carol", "ext:carol", 1_000).unwrap();

        // Seed write succeeds, the session batch touching `session:` fails
        store.fail_writes_with_prefix(Some("session:"));
        let err = engine
            .create_session(user.id, GameType::Dice, 100, "abc", None)
            .unwrap_err();
        assert!(matches!(err, EngineError::PersistenceFailure(_)));
        store.fail_writes_with_prefix(None);

        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 1_000);
        assert!(engine.ledger().transactions(&user.id).unwrap().is_empty());
        let (sessions, _) = engine.user_sessions(user.id, None, 10).unwrap();
        assert!(sessions.is_empty());
        assert!(store
            .scan_prefix(b"seed:", None, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dice_play_resolves_and_reveals() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("dave", "ext:dave", 1_000).unwrap();
        let session = engine
            .create_session(user.id, GameType::Dice, 100, "abc", dice_params())
            .unwrap();

        let result = engine.play(session.id, GameAction::Roll).unwrap();
        assert_eq!(result.nonce, 1);
        assert!(result.verdict.is_terminal());
        assert_eq!(result.session.status, SessionStatus::Resolved);
        let seed = result.session.server_seed.clone().unwrap();
        assert!(seeds::verify_commitment(&seed, &session.server_seed_hash));

        let expected_payout = multiplier::payout(100, result.multiplier_bps);
        assert_eq!(result.payout.as_ref().map(|t| t.amount), Some(expected_payout as i64));
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 900 + expected_payout);

        let types: Vec<GameEventType> = engine.events(session.id).unwrap().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![GameEventType::Start, GameEventType::Outcome, GameEventType::Settle]
        );

        let again = engine.play(session.id, GameAction::Roll).unwrap_err();
        assert!(matches!(again, EngineError::InvalidState { status: SessionStatus::Resolved, .. }));
    }

    #[test]
    fn test_reveal_before_terminal_fails() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("erin", "ext:erin", 1_000).unwrap();
        let session = engine
            .create_session(user.id, GameType::Minesweeper, 10, "abc", None)
            .unwrap();
        assert!(matches!(
            engine.reveal(session.id),
            Err(EngineError::InvalidState { status: SessionStatus::Playing, .. })
        ));
        assert!(matches!(engine.verify(session.id), Err(EngineError::InvalidState { .. })));
    }

    #[test]
    fn test_cancel_refunds_and_blocks_play() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("frank", "ext:frank", 1_000).unwrap();
        let session = engine
            .create_session(user.id, GameType::Tiles, 250, "abc", None)
            .unwrap();
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 750);

        let cancelled = engine.cancel(session.id).unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 1_000);
        assert!(engine.reveal(session.id).is_ok());

        assert!(matches!(
            engine.play(session.id, GameAction::Pick { column: 0 }),
            Err(EngineError::InvalidState { .. })
        ));
        assert!(matches!(engine.cancel(session.id), Err(EngineError::InvalidState { .. })));

        let report = engine.ledger().reconcile(&user.id).unwrap();
        assert!(report.strict && report.inclusive);
    }

    #[test]
    fn test_cash_out_requires_progress() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("gina", "ext:gina", 1_000).unwrap();
        let session = engine
            .create_session(
                user.id,
                GameType::Tiles2,
                100,
                "abc",
                Some(GameParams::Tiles2 { columns: 2, rows: 10 }),
            )
            .unwrap();
        assert!(matches!(engine.cash_out(session.id), Err(EngineError::InvalidAction(_))));

        // Pick the safe tile using the committed seed, then cash out
        let seed = engine.seeds().committed_seed(&session.id).unwrap();
        let params = GameParams::Tiles2 { columns: 2, rows: 10 };
        let Outcome::Tiles2 { index } = outcome::generate(&seed, "abc", 1, &params) else {
            panic!("tiles2 outcome");
        };
        let step = engine.play(session.id, GameAction::Pick { column: index }).unwrap();
        assert_eq!(step.verdict, StepVerdict::Continue);
        assert_eq!(step.multiplier_bps, 19_800);

        let settlement = engine.cash_out(session.id).unwrap();
        assert_eq!(settlement.session.status, SessionStatus::Resolved);
        assert_eq!(settlement.payout.amount, 198);
        assert_eq!(settlement.session.nonce, 1);
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 1_098);

        let repeat = engine.settle(session.id).unwrap();
        assert!(!repeat.applied);
        assert_eq!(repeat.payout.id, settlement.payout.id);
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 1_098);
    }

    #[test]
    fn test_sequence_opening_card_recorded() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("hank", "ext:hank", 1_000).unwrap();
        let session = engine
            .create_session(user.id, GameType::Sequence, 10, "abc", None)
            .unwrap();
        let SessionMetadata::Sequence(state) = &session.metadata else {
            panic!("sequence metadata");
        };
        let outcomes = engine.outcomes(session.id).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].nonce, 0);
        assert_eq!(outcomes[0].outcome, Outcome::Sequence { card: state.current_card });

        let guess = if state.current_card <= 7 { Guess::Higher } else { Guess::Lower };
        let result = engine.play(session.id, GameAction::Guess { guess }).unwrap();
        assert_eq!(result.nonce, 1);
        if result.session.is_playing() {
            engine.cancel(session.id).unwrap();
        }

        let verification = engine.verify(session.id).unwrap();
        assert!(verification.is_valid());
        assert_eq!(verification.outcomes.len(), 2);
    }

    #[test]
    fn test_expire_idle_sessions() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("iris", "ext:iris", 1_000).unwrap();
        let stale = engine
            .create_session(user.id, GameType::Minesweeper, 100, "abc", None)
            .unwrap();

        assert!(engine.expire_idle(Utc::now()).unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(engine.config().session_idle_timeout_secs as i64 + 1);
        let expired = engine.expire_idle(later).unwrap();
        assert_eq!(expired, vec![stale.id]);
        assert_eq!(engine.session(stale.id).unwrap().status, SessionStatus::Cancelled);
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 1_000);

        let cancel_event = engine.events(stale.id).unwrap().pop().unwrap();
        assert_eq!(cancel_event.event_type, GameEventType::Cancel);
        assert_eq!(cancel_event.payload["reason"], "idle_timeout");
    }

    #[test]
    fn test_external_user_write_is_respected() {
        let (store, engine) = engine();
        let user = engine.ledger().create_user("jack", "ext:jack", 1_000).unwrap();

        // Another writer bumped the user record; the reservation builds on it
        let mut bumped = engine.ledger().get_user(&user.id).unwrap();
        bumped.version += 5;
        store.put_raw(&game_store::user_key(&user.id), &serde_json::to_vec(&bumped).unwrap());

        let session = engine
            .create_session(user.id, GameType::Dice, 100, "abc", None)
            .unwrap();
        assert_eq!(engine.session(session.id).unwrap().status, SessionStatus::Playing);
        assert_eq!(engine.ledger().get_user(&user.id).unwrap().version, bumped.version + 1);
    }

    fn tiles2_params() -> Option<GameParams> {
        Some(GameParams::Tiles2 { columns: 3, rows: 4 })
    }

    /// The one safe column of the row played at `nonce`
    fn safe_tiles2_column(engine: &GameEngine, session: &GameSession, nonce: u64) -> u8 {
        let seed = engine.seeds().committed_seed(&session.id).unwrap();
        match outcome::generate(&seed, &session.client_seed, nonce, &session.metadata.params()) {
            Outcome::Tiles2 { index } => index,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_repeated_create_with_key_reserves_once() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("kate", "ext:kate", 1_000).unwrap();

        let first = engine
            .create_session_with_key(user.id, GameType::Dice, 100, "abc", None, Some("req-1"))
            .unwrap();
        let second = engine
            .create_session_with_key(user.id, GameType::Dice, 100, "abc", None, Some("req-1"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 900);
        assert_eq!(engine.ledger().transactions(&user.id).unwrap().len(), 1);
        assert!(engine.metrics().render_prometheus().contains("fairplay_sessions_created_total 1"));

        // A new key is a new session
        let third = engine
            .create_session_with_key(user.id, GameType::Dice, 100, "abc", None, Some("req-2"))
            .unwrap();
        assert_ne!(third.id, first.id);
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 800);
    }

    #[test]
    fn test_create_key_bound_to_its_request() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("liam", "ext:liam", 1_000).unwrap();
        engine
            .create_session_with_key(user.id, GameType::Dice, 100, "abc", None, Some("req-1"))
            .unwrap();

        assert!(matches!(
            engine.create_session_with_key(user.id, GameType::Dice, 200, "abc", None, Some("req-1")),
            Err(EngineError::InvalidAction(_))
        ));
        assert!(matches!(
            engine.create_session_with_key(user.id, GameType::Dice, 100, "abc", None, Some("")),
            Err(EngineError::InvalidAction(_))
        ));
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 900);

        // Keys are per user
        let other = engine.ledger().create_user("mia", "ext:mia", 1_000).unwrap();
        engine
            .create_session_with_key(other.id, GameType::Dice, 100, "abc", None, Some("req-1"))
            .unwrap();
        assert_eq!(engine.ledger().balance(&other.id).unwrap(), 900);
    }

    #[test]
    fn test_repeated_play_returns_recorded_step() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("nora", "ext:nora", 1_000).unwrap();
        let session = engine
            .create_session(user.id, GameType::Tiles2, 100, "abc", tiles2_params())
            .unwrap();

        let column = safe_tiles2_column(&engine, &session, 1);
        let action = GameAction::Pick { column };
        let first = engine.play_at(session.id, action, Some(1)).unwrap();
        assert_eq!(first.verdict, StepVerdict::Continue);

        let repeated = engine.play_at(session.id, action, Some(1)).unwrap();
        assert_eq!(repeated.nonce, 1);
        assert_eq!(repeated.outcome, first.outcome);
        assert_eq!(repeated.multiplier_bps, first.multiplier_bps);
        assert_eq!(repeated.verdict, StepVerdict::Continue);
        assert!(repeated.payout.is_none());

        let current = engine.session(session.id).unwrap();
        assert_eq!(current.nonce, 1);
        assert_eq!(current.multiplier_bps, first.multiplier_bps);
        assert_eq!(engine.events(session.id).unwrap().len(), 2);

        assert!(matches!(
            engine.play_at(session.id, GameAction::Pick { column: (column + 1) % 3 }, Some(1)),
            Err(EngineError::InvalidAction(_))
        ));
        assert!(matches!(
            engine.play_at(session.id, action, Some(3)),
            Err(EngineError::InvalidAction(_))
        ));

        // The next nonce still plays normally
        let next_column = safe_tiles2_column(&engine, &session, 2);
        let second = engine
            .play_at(session.id, GameAction::Pick { column: next_column }, Some(2))
            .unwrap();
        assert_eq!(second.nonce, 2);
    }

    #[test]
    fn test_repeated_resolving_play_pays_once() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("owen", "ext:owen", 1_000).unwrap();
        let session = engine
            .create_session(user.id, GameType::Dice, 100, "abc", dice_params())
            .unwrap();

        let first = engine.play_at(session.id, GameAction::Roll, Some(1)).unwrap();
        let balance = engine.ledger().balance(&user.id).unwrap();

        let repeated = engine.play_at(session.id, GameAction::Roll, Some(1)).unwrap();
        assert_eq!(repeated.session.status, SessionStatus::Resolved);
        assert_eq!(repeated.outcome, first.outcome);
        assert_eq!(repeated.verdict, first.verdict);
        assert_eq!(
            repeated.payout.map(|tx| tx.id),
            first.payout.as_ref().map(|tx| tx.id)
        );
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), balance);

        // Without an expected nonce a second play is refused
        assert!(matches!(
            engine.play(session.id, GameAction::Roll),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_expire_skips_session_played_after_scan() {
        let (_store, engine) = engine();
        let user = engine.ledger().create_user("piper", "ext:piper", 1_000).unwrap();
        let session = engine
            .create_session(user.id, GameType::Tiles2, 100, "abc", tiles2_params())
            .unwrap();

        // The sweeper saw the session idle at this cutoff, then the player moved
        std::thread::sleep(std::time::Duration::from_millis(2));
        let cutoff = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let column = safe_tiles2_column(&engine, &session, 1);
        let played = engine.play(session.id, GameAction::Pick { column }).unwrap();
        assert_eq!(played.verdict, StepVerdict::Continue);

        assert!(matches!(
            engine.expire_if_idle(session.id, cutoff),
            Err(EngineError::InvalidState { operation: "expire", .. })
        ));
        let current = engine.session(session.id).unwrap();
        assert_eq!(current.status, SessionStatus::Playing);
        assert_eq!(current.multiplier_bps, played.multiplier_bps);
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 900);

        let cancelled = engine.expire_if_idle(session.id, Utc::now()).unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(engine.ledger().balance(&user.id).unwrap(), 1_000);
    }
}
