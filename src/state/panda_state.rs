//! The five operating states of the Panda assistant.

use serde::{Deserialize, Serialize};

/// The five possible states of the assistant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PandaState {
    /// Nothing in flight, waiting to be woken up
    Idle,
    /// Speech recognition is capturing audio
    Listening,
    /// A request is being worked on
    Processing,
    /// Text-to-speech is producing audio
    Speaking,
    /// A recent failure is being surfaced
    Error,
}

impl PandaState {
    /// Every state, in declaration order
    pub const ALL: [PandaState; 5] = [
        PandaState::Idle,
        PandaState::Listening,
        PandaState::Processing,
        PandaState::Speaking,
        PandaState::Error,
    ];

    /// Display priority, higher wins when several conditions hold at once
    pub fn priority(self) -> u8 {
        match self {
            PandaState::Error => 5,
            PandaState::Speaking => 4,
            PandaState::Listening => 3,
            PandaState::Processing => 2,
            PandaState::Idle => 1,
        }
    }

    /// Whether the assistant is actively doing something
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PandaState::Listening | PandaState::Processing | PandaState::Speaking
        )
    }

    /// Whether the state surfaces a failure
    pub fn is_error(self) -> bool {
        matches!(self, PandaState::Error)
    }
}

impl Default for PandaState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for PandaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PandaState::Idle => write!(f, "Idle"),
            PandaState::Listening => write!(f, "Listening"),
            PandaState::Processing => write!(f, "Processing"),
            PandaState::Speaking => write!(f, "Speaking"),
            PandaState::Error => write!(f, "Error"),
        }
    }
}
