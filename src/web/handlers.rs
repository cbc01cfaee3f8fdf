//! Request handlers for all API endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use tracing::{error, info, warn};

use super::models::*;
use super::AppState;
use crate::error::MarketError;
use crate::market::orchestrator::{ActionReport, CreatedMarket, FeeDistribution, MarketQuote, StatusReport};
use crate::models::{AccessToken, Portfolio, TokenMetadata};

type ApiError = (StatusCode, Json<ErrorResponse>);

const DEFAULT_TRANSACTIONS_LIMIT: usize = 50;
const MAX_TRANSACTIONS_LIMIT: usize = 500;

/// Maps the error taxonomy onto HTTP. An unknown outcome is 202: the request
/// was accepted and the caller must recheck, not resubmit.
pub fn api_error(err: MarketError) -> ApiError {
    let status = match &err {
        MarketError::NotFound(_) => StatusCode::NOT_FOUND,
        MarketError::InsufficientBalance(_)
        | MarketError::InsufficientAllowance(_)
        | MarketError::TransactionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MarketError::AlreadyClaimed(_)
        | MarketError::QuotaExhausted(_)
        | MarketError::AccessTokenUsed(_)
        | MarketError::MarketAlreadyExists(_)
        | MarketError::AlreadyInFlight(_) => StatusCode::CONFLICT,
        MarketError::Paused(_) => StatusCode::LOCKED,
        MarketError::TransientTransport(_) => StatusCode::SERVICE_UNAVAILABLE,
        MarketError::UnknownOutcome { .. } => StatusCode::ACCEPTED,
        MarketError::InvalidAmount(_) | MarketError::InvalidAccessToken(_) | MarketError::WrongMarket(_) => {
            StatusCode::BAD_REQUEST
        }
        MarketError::InvalidState(_)
        | MarketError::Decode(_)
        | MarketError::Index(_)
        | MarketError::Wallet(_)
        | MarketError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }

    let recheck_status = match &err {
        MarketError::UnknownOutcome { signature, .. } => Some(format!("/api/transactions/{}/status", signature)),
        _ => None,
    };
    (
        status,
        Json(ErrorResponse {
            error: match &err {
                MarketError::UnknownOutcome { .. } => "Transaction outcome unknown, recheck its status".to_string(),
                _ => err.to_string(),
            },
            details: recheck_status.is_some().then(|| err.to_string()),
            kind: err.kind().to_string(),
            retriable: err.is_retriable_read(),
            recheck_status,
        }),
    )
}

fn parse_address(address: &str) -> Result<Pubkey, ApiError> {
    Pubkey::from_str(address).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Invalid holder address".to_string(),
                details: Some(e.to_string()),
                kind: "invalid_address".to_string(),
                retriable: false,
                recheck_status: None,
            }),
        )
    })
}

// ============================================================================
// Health Check
// ============================================================================

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        signer: state.orchestrator.signer().to_string(),
        backfill_running: state.reconciler.is_running().await,
    })
}

// ============================================================================
// Markets
// ============================================================================

pub async fn get_market(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<MarketResponse>, ApiError> {
    let reader = &state.reader;
    let exists = reader.exists(&uuid).await.map_err(api_error)?;
    let token = match state.index.get_token(&uuid).await {
        Ok(token) => token,
        Err(e) => {
            warn!("Index lookup of {} failed: {}", uuid, e);
            None
        }
    };

    Ok(Json(MarketResponse {
        exists,
        current_price: reader.current_price(&uuid).await.map_err(api_error)?,
        actual_price: reader.actual_price(&uuid).await.map_err(api_error)?,
        buy_price: reader.buy_price(&uuid).await.map_err(api_error)?,
        sell_price: reader.sell_price(&uuid).await.map_err(api_error)?,
        freebie_sell_price: reader.freebie_sell_price(&uuid).await.map_err(api_error)?,
        remaining_freebies: reader.remaining_freebies(&uuid).await.map_err(api_error)?,
        token,
        uuid,
    }))
}

pub async fn create_market(
    State(state): State<AppState>,
    Json(request): Json<CreateMarketRequest>,
) -> Result<(StatusCode, Json<CreatedMarket>), ApiError> {
    info!("Create market request: {} ({})", request.uuid, request.kind);
    let metadata = TokenMetadata {
        name: request.name,
        image_url: request.image_url,
        description: request.description,
    };
    let created = state
        .orchestrator
        .create_market(&request.uuid, request.kind, metadata, request.quadratic_divisor.unwrap_or(1))
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_quote(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<QuoteQuery>,
) -> Result<Json<MarketQuote>, ApiError> {
    state
        .orchestrator
        .get_quote(&uuid, query.side, query.amount.unwrap_or(1))
        .await
        .map(Json)
        .map_err(api_error)
}

/// Ledger stats, falling back to the index's cached copy when the ledger
/// cannot be read.
pub async fn get_stats(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<StatsResponse>, ApiError> {
    match state.reader.market_stats(&uuid).await {
        Ok(stats) => Ok(Json(StatsResponse {
            uuid,
            source: StatsSource::Ledger,
            stats,
            cached_at: None,
        })),
        Err(e) => {
            warn!("Ledger stats read for {} failed, trying cache: {}", uuid, e);
            match state.index.cached_stats(&uuid).await {
                Ok(Some(cached)) => Ok(Json(StatsResponse {
                    uuid,
                    source: StatsSource::Cache,
                    stats: Some(cached.stats),
                    cached_at: Some(cached.cached_at),
                })),
                Ok(None) => Err(api_error(e)),
                Err(index_err) => {
                    warn!("Cached stats read for {} failed: {}", uuid, index_err);
                    Err(api_error(e))
                }
            }
        }
    }
}

pub async fn get_portfolio(
    State(state): State<AppState>,
    Path((uuid, holder)): Path<(String, String)>,
) -> Result<Json<Portfolio>, ApiError> {
    let address = parse_address(&holder)?;
    let mirror = state.orchestrator.mirror();
    match state.reader.portfolio(&uuid, &address).await {
        Ok(portfolio) => {
            mirror.observe(portfolio.clone()).await;
            Ok(Json(portfolio))
        }
        Err(e) => match mirror.view(&uuid, &holder).await {
            Some(cached) => {
                warn!("Serving mirrored portfolio of {} in {}: {}", holder, uuid, e);
                Ok(Json(cached))
            }
            None => Err(api_error(e)),
        },
    }
}

pub async fn get_freebie(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<FreebieQuery>,
) -> Result<Json<FreebieResponse>, ApiError> {
    let holder = match query.holder {
        Some(holder) => parse_address(&holder)?,
        None => state.orchestrator.signer(),
    };
    Ok(Json(FreebieResponse {
        can_claim: state
            .freebies
            .can_claim_freebie(&uuid, &holder)
            .await
            .map_err(api_error)?,
        remaining_freebies: state.freebies.remaining_freebies(&uuid).await.map_err(api_error)?,
        holder: holder.to_string(),
        uuid,
    }))
}

// ============================================================================
// Trades
// ============================================================================

pub async fn buy(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(request): Json<TradeRequest>,
) -> Result<Json<ActionReport>, ApiError> {
    info!("Buy request: {} x{}", uuid, request.amount);
    state
        .orchestrator
        .buy(&uuid, request.amount, request.user_id.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn sell(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(request): Json<TradeRequest>,
) -> Result<Json<ActionReport>, ApiError> {
    info!("Sell request: {} x{}", uuid, request.amount);
    state
        .orchestrator
        .sell(&uuid, request.amount, request.user_id.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn claim_freebie(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    request: Option<Json<ClaimRequest>>,
) -> Result<Json<ActionReport>, ApiError> {
    let Json(request) = request.unwrap_or_default();
    let user_id = request.user_id.as_deref();
    let report = match &request.access_token {
        Some(code) => state.freebies.claim_with_access_token(code, &uuid, user_id).await,
        None => state.orchestrator.claim_freebie(&uuid, user_id).await,
    };
    report.map(Json).map_err(api_error)
}

pub async fn distribute_fees(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<FeeDistribution>, ApiError> {
    state
        .orchestrator
        .distribute_fees(&uuid)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn get_transactions(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionsListResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRANSACTIONS_LIMIT)
        .min(MAX_TRANSACTIONS_LIMIT);
    let transactions = state
        .index
        .transactions_for_token(&uuid, limit)
        .await
        .map_err(api_error)?;
    Ok(Json(TransactionsListResponse {
        total: transactions.len(),
        transactions,
        uuid,
    }))
}

pub async fn transaction_status(
    State(state): State<AppState>,
    Path(signature): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
    state
        .orchestrator
        .recheck_status(&signature)
        .await
        .map(Json)
        .map_err(api_error)
}

// ============================================================================
// Access Tokens
// ============================================================================

pub async fn issue_access_token(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<(StatusCode, Json<AccessToken>), ApiError> {
    let token = state.freebies.issue(&uuid).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(token)))
}

pub async fn validate_access_token(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<AccessTokenQuery>,
) -> Result<Json<AccessToken>, ApiError> {
    state
        .freebies
        .validate(&code, &query.uuid)
        .await
        .map(Json)
        .map_err(api_error)
}
