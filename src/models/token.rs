use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free allocation every creator token starts with.
pub const CREATOR_FREEBIE_QUOTA: u32 = 50;

/// Post tokens have no free allocation.
pub const POST_FREEBIE_QUOTA: u32 = 0;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Creator,
    Post,
}

impl TokenKind {
    pub fn freebie_quota(&self) -> u32 {
        match self {
            Self::Creator => CREATOR_FREEBIE_QUOTA,
            Self::Post => POST_FREEBIE_QUOTA,
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creator => write!(f, "creator"),
            Self::Post => write!(f, "post"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct TokenMetadata {
    pub name: String,                // Creator name or post content
    pub image_url: Option<String>,   // Image URL
    pub description: Option<String>, // Free-form description
}

/// A creator-token or post-token market as known to the off-chain index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub uuid: String,                 // Stable external id, caller-supplied at creation
    pub internal_id: Option<u64>,     // Ledger-assigned sequential id, resolved lazily
    pub kind: TokenKind,
    pub owner_address: String,        // Creator wallet
    pub metadata: TokenMetadata,
    pub quadratic_divisor: u64,       // Curve steepness, >= 1
    pub freebie_quota: u32,           // Fixed at creation
    pub created_at: DateTime<Utc>,
}

impl Token {
    pub fn new(
        uuid: &str,
        kind: TokenKind,
        owner_address: &str,
        metadata: TokenMetadata,
        quadratic_divisor: u64,
    ) -> Self {
        Self {
            uuid: uuid.to_string(),
            internal_id: None,
            kind,
            owner_address: owner_address.to_string(),
            metadata,
            quadratic_divisor: quadratic_divisor.max(1),
            freebie_quota: kind.freebie_quota(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_fixed_by_kind() {
        let meta = TokenMetadata {
            name: "alice".into(),
            image_url: None,
            description: None,
        };
        let creator = Token::new("c-1", TokenKind::Creator, "owner", meta.clone(), 1);
        let post = Token::new("p-1", TokenKind::Post, "owner", meta, 0);
        assert_eq!(creator.freebie_quota, 50);
        assert_eq!(post.freebie_quota, 0);
        // divisor is clamped to the curve's minimum
        assert_eq!(post.quadratic_divisor, 1);
    }
}
