//! Delta symbol presentation mapping.
//!
//! UI clients render the assistant's state as the delta glyph with a
//! status line and a tint. Colors are ARGB words from the app palette;
//! every state maps to a distinct color so the glyph alone is enough to
//! read the state.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::PandaState;

/// White, the resting tint
pub const IDLE_COLOR: u32 = 0xFFFF_FFFF;
/// Orange while capturing speech
pub const LISTENING_COLOR: u32 = 0xFFFF_9800;
/// Blue while a request is in flight
pub const PROCESSING_COLOR: u32 = 0xFF21_96F3;
/// Green while speaking
pub const SPEAKING_COLOR: u32 = 0xFF4C_AF50;
/// Red while surfacing an error
pub const ERROR_COLOR: u32 = 0xFFF4_4336;

/// Visual attributes of one state, ready for presentation layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaVisualState {
    pub state: PandaState,
    pub color: u32,
    pub status_text: String,
    pub color_hex: String,
}

/// Indicator tint for a state
pub fn color(state: PandaState) -> u32 {
    match state {
        PandaState::Idle => IDLE_COLOR,
        PandaState::Listening => LISTENING_COLOR,
        PandaState::Processing => PROCESSING_COLOR,
        PandaState::Speaking => SPEAKING_COLOR,
        PandaState::Error => ERROR_COLOR,
    }
}

/// Status line for a state
pub fn status_text(state: PandaState) -> &'static str {
    match state {
        PandaState::Idle => "Ready, tap delta to wake me up!",
        PandaState::Listening => "Listening...",
        PandaState::Processing => "Processing...",
        PandaState::Speaking => "Speaking...",
        PandaState::Error => "Error",
    }
}

/// Indicator tint rendered as `#AARRGGBB`
pub fn color_hex(state: PandaState) -> String {
    format!("#{:08X}", color(state))
}

/// Bundle the visual attributes of one state
pub fn visual_state(state: PandaState) -> DeltaVisualState {
    DeltaVisualState {
        state,
        color: color(state),
        status_text: status_text(state).to_string(),
        color_hex: color_hex(state),
    }
}

/// Visual attributes of every state, for legend-style UIs
pub fn all_states() -> Vec<DeltaVisualState> {
    PandaState::ALL.iter().copied().map(visual_state).collect()
}

/// Log the full mapping table, a startup debugging aid
pub fn log_state_mappings() {
    for visual in all_states() {
        debug!(
            state = %visual.state,
            status = %visual.status_text,
            color = %visual.color_hex,
            priority = visual.state.priority(),
            "delta mapping"
        );
    }
}
