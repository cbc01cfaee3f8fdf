use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::{OffchainIndex, RecordOutcome};
use crate::error::MarketError;
use crate::models::{AccessToken, CachedStats, MarketStats, Token, TransactionRecord};

/// Index hosted by a remote application backend, spoken to over JSON.
#[derive(Debug, Clone)]
pub struct BackendIndexClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl BackendIndexClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, MarketError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| MarketError::Config(format!("Failed to create HTTP client for index backend: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("X-API-KEY", key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response, MarketError> {
        builder
            .send()
            .await
            .map_err(|e| MarketError::Index(format!("Index backend request ({}) failed: {}", what, e)))
    }

    async fn error_from(response: Response, what: &str) -> MarketError {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        warn!("Index backend error during {}: {} - {}", what, status, error_text);
        MarketError::Index(format!("{}: {} - {}", what, status, error_text))
    }

    async fn json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, MarketError> {
        response
            .json()
            .await
            .map_err(|e| MarketError::Index(format!("Failed to parse index backend response ({}): {}", what, e)))
    }

    /// `GET` returning `None` on 404.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<Option<T>, MarketError> {
        debug!("Fetching {} from index backend", path);
        let response = self.send(self.request(Method::GET, path), what).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Self::json(response, what).await.map(Some),
            _ => Err(Self::error_from(response, what).await),
        }
    }

    async fn expect_success(response: Response, what: &str) -> Result<Response, MarketError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::error_from(response, what).await)
        }
    }
}

#[async_trait]
impl OffchainIndex for BackendIndexClient {
    async fn upsert_token(&self, token: &Token) -> Result<(), MarketError> {
        let response = self
            .send(self.request(Method::POST, "/tokens").json(token), "upsert_token")
            .await?;
        Self::expect_success(response, "upsert_token").await.map(|_| ())
    }

    async fn get_token(&self, uuid: &str) -> Result<Option<Token>, MarketError> {
        self.get_optional(&format!("/tokens/{}", uuid), "get_token").await
    }

    async fn list_tokens(&self) -> Result<Vec<Token>, MarketError> {
        let response = self.send(self.request(Method::GET, "/tokens"), "list_tokens").await?;
        let response = Self::expect_success(response, "list_tokens").await?;
        Self::json(response, "list_tokens").await
    }

    async fn record_transaction(&self, record: &TransactionRecord) -> Result<RecordOutcome, MarketError> {
        let response = self
            .send(self.request(Method::POST, "/transactions").json(record), "record_transaction")
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(RecordOutcome::Duplicate),
            status if status.is_success() => Ok(RecordOutcome::Inserted),
            _ => Err(Self::error_from(response, "record_transaction").await),
        }
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionRecord>, MarketError> {
        self.get_optional(&format!("/transactions/{}", signature), "get_transaction")
            .await
    }

    async fn transactions_for_token(&self, uuid: &str, limit: usize) -> Result<Vec<TransactionRecord>, MarketError> {
        let builder = self
            .request(Method::GET, &format!("/tokens/{}/transactions", uuid))
            .query(&[("limit", limit)]);
        let response = self.send(builder, "transactions_for_token").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = Self::expect_success(response, "transactions_for_token").await?;
        Self::json(response, "transactions_for_token").await
    }

    async fn put_access_token(&self, token: &AccessToken) -> Result<(), MarketError> {
        let builder = self
            .request(Method::PUT, &format!("/access-tokens/{}", token.code))
            .json(token);
        let response = self.send(builder, "put_access_token").await?;
        Self::expect_success(response, "put_access_token").await.map(|_| ())
    }

    async fn get_access_token(&self, code: &str) -> Result<Option<AccessToken>, MarketError> {
        self.get_optional(&format!("/access-tokens/{}", code), "get_access_token")
            .await
    }

    async fn consume_access_token(
        &self,
        code: &str,
        holder: &str,
        user_id: Option<&str>,
    ) -> Result<AccessToken, MarketError> {
        let builder = self
            .request(Method::POST, &format!("/access-tokens/{}/consume", code))
            .json(&json!({ "holder_address": holder, "user_id": user_id }));
        let response = self.send(builder, "consume_access_token").await?;
        match response.status() {
            StatusCode::CONFLICT => Err(MarketError::AccessTokenUsed(code.to_string())),
            StatusCode::NOT_FOUND => Err(MarketError::InvalidAccessToken(code.to_string())),
            status if status.is_success() => Self::json(response, "consume_access_token").await,
            _ => Err(Self::error_from(response, "consume_access_token").await),
        }
    }

    async fn release_access_token(&self, code: &str) -> Result<AccessToken, MarketError> {
        let builder = self.request(Method::POST, &format!("/access-tokens/{}/release", code));
        let response = self.send(builder, "release_access_token").await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(MarketError::InvalidAccessToken(code.to_string())),
            status if status.is_success() => Self::json(response, "release_access_token").await,
            _ => Err(Self::error_from(response, "release_access_token").await),
        }
    }

    async fn cache_stats(&self, stats: &MarketStats) -> Result<(), MarketError> {
        let builder = self
            .request(Method::PUT, &format!("/tokens/{}/stats", stats.token_uuid))
            .json(stats);
        let response = self.send(builder, "cache_stats").await?;
        Self::expect_success(response, "cache_stats").await.map(|_| ())
    }

    async fn cached_stats(&self, uuid: &str) -> Result<Option<CachedStats>, MarketError> {
        self.get_optional(&format!("/tokens/{}/stats", uuid), "cached_stats").await
    }
}
