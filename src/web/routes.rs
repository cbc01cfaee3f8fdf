//! API route definitions

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers;
use super::AppState;

/// Create all API routes
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(handlers::health_check))

        // Markets
        .route("/api/markets", post(handlers::create_market))
        .route("/api/markets/:uuid", get(handlers::get_market))
        .route("/api/markets/:uuid/quote", get(handlers::get_quote))
        .route("/api/markets/:uuid/stats", get(handlers::get_stats))
        .route("/api/markets/:uuid/portfolio/:holder", get(handlers::get_portfolio))
        .route("/api/markets/:uuid/freebie", get(handlers::get_freebie))

        // Trades
        .route("/api/markets/:uuid/buy", post(handlers::buy))
        .route("/api/markets/:uuid/sell", post(handlers::sell))
        .route("/api/markets/:uuid/claim", post(handlers::claim_freebie))
        .route("/api/markets/:uuid/distribute-fees", post(handlers::distribute_fees))
        .route("/api/markets/:uuid/transactions", get(handlers::get_transactions))
        .route("/api/transactions/:signature/status", get(handlers::transaction_status))

        // Access tokens
        .route("/api/markets/:uuid/access-tokens", post(handlers::issue_access_token))
        .route("/api/access-tokens/:code", get(handlers::validate_access_token))

        // Add state to all routes
        .with_state(state)
}
