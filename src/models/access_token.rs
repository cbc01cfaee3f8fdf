use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

const ACCESS_TOKEN_LEN: usize = 24;

/// Single-use freebie coupon for one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub code: String,       // Opaque secret
    pub token_uuid: String, // Market it unlocks
    pub is_used: bool,
    pub used_by_address: Option<String>,
    pub used_by_user_id: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn issue(token_uuid: &str) -> Self {
        let code: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ACCESS_TOKEN_LEN)
            .map(char::from)
            .collect();
        Self {
            code,
            token_uuid: token_uuid.to_string(),
            is_used: false,
            used_by_address: None,
            used_by_user_id: None,
            used_at: None,
            issued_at: Utc::now(),
        }
    }

    pub fn consumed_by(&self, address: &str, user_id: Option<&str>) -> Self {
        Self {
            is_used: true,
            used_by_address: Some(address.to_string()),
            used_by_user_id: user_id.map(str::to_string),
            used_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub fn released(&self) -> Self {
        Self {
            is_used: false,
            used_by_address: None,
            used_by_user_id: None,
            used_at: None,
            ..self.clone()
        }
    }
}
