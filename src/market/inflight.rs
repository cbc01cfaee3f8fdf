use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::MarketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Buy,
    Sell,
    ClaimFreebie,
    DistributeFees,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::ClaimFreebie => "claim_freebie",
            Self::DistributeFees => "distribute_fees",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionKey {
    pub token_uuid: String,
    pub holder: String,
    pub action: ActionKind,
}

impl ActionKey {
    pub fn new(token_uuid: &str, holder: &str, action: ActionKind) -> Self {
        Self {
            token_uuid: token_uuid.to_string(),
            holder: holder.to_string(),
            action,
        }
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} by {}", self.action, self.token_uuid, self.holder)
    }
}

/// At most one action per key between quote and settlement.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    active: Arc<Mutex<HashSet<ActionKey>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: ActionKey) -> Result<InFlightGuard, MarketError> {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(key.clone()) {
            warn!("Rejecting duplicate action: {}", key);
            return Err(MarketError::AlreadyInFlight(key.to_string()));
        }
        debug!("Action in flight: {}", key);
        Ok(InFlightGuard {
            key,
            active: self.active.clone(),
        })
    }

    pub fn is_active(&self, key: &ActionKey) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }
}

/// Releases its key when dropped, however the action ends.
pub struct InFlightGuard {
    key: ActionKey,
    active: Arc<Mutex<HashSet<ActionKey>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected_until_release() {
        let registry = InFlightRegistry::new();
        let key = ActionKey::new("creator-1", "holder", ActionKind::Buy);

        let guard = registry.try_acquire(key.clone()).unwrap();
        assert!(matches!(registry.try_acquire(key.clone()), Err(MarketError::AlreadyInFlight(_))));
        assert!(registry.is_active(&key));

        drop(guard);
        assert!(!registry.is_active(&key));
        assert!(registry.try_acquire(key).is_ok());
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = InFlightRegistry::new();
        let _buy = registry
            .try_acquire(ActionKey::new("creator-1", "holder", ActionKind::Buy))
            .unwrap();
        assert!(registry
            .try_acquire(ActionKey::new("creator-1", "holder", ActionKind::Sell))
            .is_ok());
        assert!(registry
            .try_acquire(ActionKey::new("creator-2", "holder", ActionKind::Buy))
            .is_ok());
    }
}
