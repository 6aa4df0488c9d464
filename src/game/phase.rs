//! Match phase values and the pure transition function

use serde::{Deserialize, Serialize};

/// Match phase, replicated across every peer of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    /// Waiting for fighters
    #[default]
    Waiting,
    /// Countdown before the match
    Starting,
    /// Match in progress
    Running,
    /// Match ended, presentation transition pending
    GameOver,
}

impl GamePhase {
    /// Stable wire code
    pub fn code(self) -> u8 {
        match self {
            GamePhase::Waiting => 0,
            GamePhase::Starting => 1,
            GamePhase::Running => 2,
            GamePhase::GameOver => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GamePhase::Waiting => "waiting",
            GamePhase::Starting => "starting",
            GamePhase::Running => "running",
            GamePhase::GameOver => "game_over",
        }
    }
}

impl TryFrom<u8> for GamePhase {
    type Error = PhaseError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(GamePhase::Waiting),
            1 => Ok(GamePhase::Starting),
            2 => Ok(GamePhase::Running),
            3 => Ok(GamePhase::GameOver),
            other => Err(PhaseError::UnknownPhase(other)),
        }
    }
}

impl std::fmt::Display for GamePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    /// A peer observed a phase constant this build does not know.
    /// Replicas cannot stay consistent past this point.
    #[error("Unknown phase code: {0}")]
    UnknownPhase(u8),
}

/// Replicated request to move the match into `target_phase`.
/// Every peer applies the same ordered stream of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRequest {
    pub target_phase: GamePhase,
}

impl PhaseRequest {
    pub fn new(target_phase: GamePhase) -> Self {
        Self { target_phase }
    }

    /// Decode a request from its raw wire code
    pub fn from_code(code: u8) -> Result<Self, PhaseError> {
        GamePhase::try_from(code).map(Self::new)
    }
}

/// Outcome of applying a request to the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    /// Target equals the current phase; nothing happens
    Unchanged,
    /// Phase changed and entry effects must run once
    Entered { from: GamePhase, to: GamePhase },
}

/// Pure transition function. Only guards idempotence, not ordering.
pub fn transition(current: GamePhase, request: PhaseRequest) -> PhaseTransition {
    if current == request.target_phase {
        PhaseTransition::Unchanged
    } else {
        PhaseTransition::Entered {
            from: current,
            to: request.target_phase,
        }
    }
}
