use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::MarketError;

/// States a market action passes through, from quote to settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Quoting,
    Approving,
    Submitting,
    Confirming,
    Reconciling,
    Done,
    Failed,
    /// Submitted, but finalization was never observed.
    Unknown,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quoting => "quoting",
            Self::Approving => "approving",
            Self::Submitting => "submitting",
            Self::Confirming => "confirming",
            Self::Reconciling => "reconciling",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Unknown)
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionEvent {
    /// Quote ready, no approval step
    Quoted,
    /// Quote ready, the spend needs an allowance check first
    ApprovalRequired,
    Approved,
    Submitted,
    Finalized,
    Reconciled,
    Fail,
    Timeout,
}

/// Per-action state machine. Records the path taken so callers can see
/// where an action stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLifecycle {
    state: ActionState,
    trail: Vec<ActionState>,
}

impl ActionLifecycle {
    pub fn new() -> Self {
        Self {
            state: ActionState::Quoting,
            trail: vec![ActionState::Quoting],
        }
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn trail(&self) -> &[ActionState] {
        &self.trail
    }

    /// Consumes an event and transitions the state.
    /// Returns the previous state, or `InvalidState` for an illegal transition.
    pub fn consume(&mut self, event: ActionEvent) -> Result<ActionState, MarketError> {
        use ActionEvent as E;
        use ActionState as S;

        let prev_state = self.state;
        let new_state = match (prev_state, event) {
            (S::Quoting, E::Quoted) => S::Submitting,
            (S::Quoting, E::ApprovalRequired) => S::Approving,
            (S::Approving, E::Approved) => S::Submitting,
            (S::Submitting, E::Submitted) => S::Confirming,
            (S::Confirming, E::Finalized) => S::Reconciling,
            (S::Reconciling, E::Reconciled) => S::Done,

            (S::Quoting | S::Approving | S::Submitting | S::Confirming, E::Fail) => S::Failed,
            (S::Approving | S::Submitting | S::Confirming, E::Timeout) => S::Unknown,

            (terminal, _) if terminal.is_terminal() => {
                return Err(MarketError::InvalidState(format!(
                    "Cannot transition from terminal state {} with event {:?}",
                    terminal, event
                )))
            }
            _ => {
                return Err(MarketError::InvalidState(format!(
                    "Invalid transition from {} with event {:?}",
                    prev_state, event
                )))
            }
        };

        self.state = new_state;
        self.trail.push(new_state);
        Ok(prev_state)
    }

    /// Moves to `Unknown` or `Failed` depending on what `err` says about the
    /// ledger. A timeout the current state cannot take is recorded as a
    /// failure. Never errors: an action already terminal stays where it is.
    pub fn abort(&mut self, err: &MarketError) {
        if self.is_terminal() {
            debug!("Abort of terminal action ignored ({}): {}", self.state, err);
            return;
        }
        if err.is_ledger_effect_unknown() {
            match self.consume(ActionEvent::Timeout) {
                Ok(_) => return,
                Err(rejected) => debug!("{}; recording as failed", rejected),
            }
        }
        if let Err(rejected) = self.consume(ActionEvent::Fail) {
            debug!("Abort left action in {}: {}", self.state, rejected);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl Default for ActionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)
    }
}
