//! Route Definitions
//!
//! Maps URLs to handlers with type-safe routing.

use super::handlers::*;
use super::middleware::require_admin;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router. The `/admin` routes are only mounted when an admin
/// token is configured.
pub fn create_router(state: Arc<AppState>, admin_token: Option<&str>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Game sessions, scoped to the caller
        .route("/sessions", post(create_session_handler))
        .route("/sessions/:id", get(get_session_handler))
        .route("/sessions/:id/play", post(play_handler))
        .route("/sessions/:id/cashout", post(cash_out_handler))
        .route("/sessions/:id/settle", post(settle_handler))
        .route("/sessions/:id/cancel", post(cancel_handler))
        .route("/sessions/:id/verify", get(verify_session_handler))
        .route("/sessions/:id/events", get(session_events_handler))
        .route("/sessions/:id/transactions", get(session_transactions_handler))
        // Stateless outcome check
        .route("/verify", post(verify_outcome_handler))
        // Accounts and ledger, scoped to the caller
        .route("/users/:id", get(get_user_handler))
        .route("/users/:id/transactions", get(user_transactions_handler))
        .route("/users/:id/sessions", get(user_sessions_handler))
        .route("/users/:id/reconcile", get(reconcile_handler));

    if let Some(token) = admin_token {
        router = router.nest("/admin", admin_router(token));
    }

    router.with_state(state)
}

/// Operator routes that mint or move balance
fn admin_router(token: &str) -> Router<Arc<AppState>> {
    let token: Arc<str> = Arc::from(token);
    Router::new()
        .route("/users", post(create_user_handler))
        .route("/users/:id/adjust", post(adjust_handler))
        .route_layer(axum::middleware::from_fn_with_state(token, require_admin))
}
