//! Request Handlers
//!
//! The engine is synchronous and touches RocksDB, so every engine call runs on
//! the blocking pool.

use super::{
    errors::ApiError,
    middleware::{AuthenticatedUser, RequestId},
    models::*,
};
use crate::common::types::{GameSession, SessionId, Transaction, User, UserId};
use crate::errors::{EngineError, EngineResult};
use crate::games::{outcome, processor, OUTCOME_ALGORITHM_VERSION};
use crate::ledger::ReconciliationReport;
use crate::seeds;
use crate::session::{GameEngine, Verification};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state
pub struct AppState {
    pub engine: Arc<GameEngine>,
    pub version: String,
    pub metrics_enabled: bool,
}

impl AppState {
    /// Run an engine operation on the blocking pool, counting the request
    /// and any engine error
    async fn run<T, F>(&self, request_id: &RequestId, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&GameEngine) -> EngineResult<T> + Send + 'static,
    {
        let metrics = self.engine.metrics().clone();
        metrics.record_request();

        let engine = self.engine.clone();
        let result = tokio::task::spawn_blocking(move || op(engine.as_ref()))
            .await
            .map_err(|e| ApiError::internal_error(request_id.0.clone(), format!("engine task failed: {}", e)))?;

        result.map_err(|e| {
            metrics.record_error(&e);
            ApiError::from_engine(request_id.0.clone(), e)
        })
    }
}

fn parse_id(request_id: &RequestId, raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(request_id.0.clone(), format!("invalid {} id: {}", what, raw)))
}

/// Sessions belonging to someone else are reported as missing
fn owned_session(engine: &GameEngine, session_id: SessionId, caller: UserId) -> EngineResult<GameSession> {
    let session = engine.session(session_id)?;
    if session.user_id != caller {
        return Err(EngineError::SessionNotFound(session_id));
    }
    Ok(session)
}

fn ensure_self(caller: UserId, user_id: UserId) -> EngineResult<()> {
    if caller != user_id {
        return Err(EngineError::UserNotFound(user_id));
    }
    Ok(())
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
        uptime_secs: state.engine.metrics().uptime().as_secs(),
    })
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.metrics_enabled {
        return (StatusCode::NOT_FOUND, [(header::CONTENT_TYPE, "text/plain")], String::new());
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics().render_prometheus(),
    )
}

// ============================================================================
// Sessions
// ============================================================================

/// POST /sessions
pub async fn create_session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let session = state
        .run(&request_id, move |engine| {
            engine.create_session_with_key(
                caller,
                req.game_type,
                req.bet_amount,
                &req.client_seed,
                req.params,
                req.idempotency_key.as_deref(),
            )
        })
        .await?;

    tracing::info!(request_id = %request_id.0, session_id = %session.id, user_id = %caller, "session opened via api");
    Ok((StatusCode::CREATED, Json(session.into())))
}

/// GET /sessions/:id
pub async fn get_session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session_id = parse_id(&request_id, &id, "session")?;
    let session = state
        .run(&request_id, move |engine| owned_session(engine, session_id, caller))
        .await?;
    Ok(Json(session.into()))
}

/// POST /sessions/:id/play
pub async fn play_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<PlayQuery>,
    Json(action): Json<crate::games::types::GameAction>,
) -> Result<Json<PlayResponse>, ApiError> {
    let session_id = parse_id(&request_id, &id, "session")?;
    let result = state
        .run(&request_id, move |engine| {
            owned_session(engine, session_id, caller)?;
            engine.play_at(session_id, action, query.expected_nonce)
        })
        .await?;
    Ok(Json(result.into()))
}

/// POST /sessions/:id/cashout
pub async fn cash_out_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<SettlementResponse>, ApiError> {
    let session_id = parse_id(&request_id, &id, "session")?;
    let settlement = state
        .run(&request_id, move |engine| {
            owned_session(engine, session_id, caller)?;
            engine.cash_out(session_id)
        })
        .await?;
    Ok(Json(settlement.into()))
}

/// POST /sessions/:id/settle
pub async fn settle_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<SettlementResponse>, ApiError> {
    let session_id = parse_id(&request_id, &id, "session")?;
    let settlement = state
        .run(&request_id, move |engine| {
            owned_session(engine, session_id, caller)?;
            engine.settle(session_id)
        })
        .await?;
    Ok(Json(settlement.into()))
}

/// POST /sessions/:id/cancel
pub async fn cancel_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session_id = parse_id(&request_id, &id, "session")?;
    let session = state
        .run(&request_id, move |engine| {
            owned_session(engine, session_id, caller)?;
            engine.cancel(session_id)
        })
        .await?;
    Ok(Json(session.into()))
}

/// GET /sessions/:id/verify
pub async fn verify_session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<Verification>, ApiError> {
    let session_id = parse_id(&request_id, &id, "session")?;
    let verification = state
        .run(&request_id, move |engine| {
            owned_session(engine, session_id, caller)?;
            engine.verify(session_id)
        })
        .await?;
    Ok(Json(verification))
}

/// GET /sessions/:id/events
pub async fn session_events_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<EventsResponse>, ApiError> {
    let session_id = parse_id(&request_id, &id, "session")?;
    let events = state
        .run(&request_id, move |engine| {
            owned_session(engine, session_id, caller)?;
            engine.events(session_id)
        })
        .await?;
    Ok(Json(EventsResponse { session_id, events }))
}

/// GET /sessions/:id/transactions
pub async fn session_transactions_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let session_id = parse_id(&request_id, &id, "session")?;
    let txs = state
        .run(&request_id, move |engine| {
            owned_session(engine, session_id, caller)?;
            engine.session_transactions(session_id)
        })
        .await?;
    Ok(Json(txs))
}

/// POST /verify
///
/// Stateless: nothing is read from storage.
pub async fn verify_outcome_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    state.engine.metrics().record_request();
    processor::validate_params(&req.params).map_err(|e| ApiError::from_engine(request_id.0.clone(), e))?;

    let outcome = outcome::generate(&req.server_seed, &req.client_seed, req.nonce, &req.params);
    let commitment_valid = req
        .server_seed_hash
        .as_deref()
        .map(|hash| seeds::verify_commitment(&req.server_seed, hash));

    Ok(Json(VerifyResponse {
        game_type: req.params.game_type(),
        nonce: req.nonce,
        outcome,
        server_seed_hash: seeds::hash_seed(&req.server_seed),
        commitment_valid,
        algorithm_version: OUTCOME_ALGORITHM_VERSION,
    }))
}

// ============================================================================
// Users
// ============================================================================

/// POST /admin/users
pub async fn create_user_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = state
        .run(&request_id, move |engine| {
            let auth_ref = req.auth_ref.unwrap_or_else(|| format!("local:{}", req.username));
            engine.ledger().create_user(&req.username, &auth_ref, req.initial_balance)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /users/:id
pub async fn get_user_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError> {
    let user_id = parse_id(&request_id, &id, "user")?;
    let user = state
        .run(&request_id, move |engine| {
            ensure_self(caller, user_id)?;
            engine.ledger().get_user(&user_id)
        })
        .await?;
    Ok(Json(user))
}

/// POST /admin/users/:id/adjust
pub async fn adjust_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AdjustRequest>,
) -> Result<Json<AdjustResponse>, ApiError> {
    let user_id = parse_id(&request_id, &id, "user")?;
    let (user, transaction) = state
        .run(&request_id, move |engine| engine.ledger().adjust(&user_id, req.amount, &req.reason))
        .await?;
    Ok(Json(AdjustResponse { user, transaction }))
}

/// GET /users/:id/transactions?cursor=&limit=
pub async fn user_transactions_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Transaction>>, ApiError> {
    let user_id = parse_id(&request_id, &id, "user")?;
    let limit = query.limit();
    let (items, next_cursor) = state
        .run(&request_id, move |engine| {
            ensure_self(caller, user_id)?;
            engine
                .ledger()
                .transactions_page(&user_id, query.cursor.as_deref(), limit)
        })
        .await?;
    Ok(Json(Page { items, next_cursor }))
}

/// GET /users/:id/sessions?cursor=&limit=
pub async fn user_sessions_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<SessionView>>, ApiError> {
    let user_id = parse_id(&request_id, &id, "user")?;
    let limit = query.limit();
    let (sessions, next_cursor) = state
        .run(&request_id, move |engine| {
            ensure_self(caller, user_id)?;
            engine.user_sessions(user_id, query.cursor.as_deref(), limit)
        })
        .await?;
    Ok(Json(Page {
        items: sessions.into_iter().map(SessionView::from).collect(),
        next_cursor,
    }))
}

/// GET /users/:id/reconcile
pub async fn reconcile_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    let user_id = parse_id(&request_id, &id, "user")?;
    let report = state
        .run(&request_id, move |engine| {
            ensure_self(caller, user_id)?;
            engine.ledger().reconcile(&user_id)
        })
        .await?;
    if !report.is_consistent() {
        tracing::warn!(request_id = %request_id.0, %user_id, "ledger reconciliation mismatch");
    }
    Ok(Json(report))
}
