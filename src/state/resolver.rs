//! Pure state resolution from sampled service conditions.
//!
//! First match wins. The order encodes display priority: an error always
//! dominates, service liveness gates everything finer-grained, speech
//! output pre-empts speech input, and the thinking indicator is the
//! catch-all before falling back to idle.

use super::PandaState;

/// One tick's worth of sampled assistant-service conditions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceConditions {
    /// A failure was surfaced within the error window
    pub recent_error: bool,
    /// The conversational agent service is alive
    pub agent_running: bool,
    /// Text-to-speech is currently producing audio
    pub speaking: bool,
    /// Speech recognition is currently capturing
    pub listening: bool,
    /// The thinking indicator is currently shown
    pub thinking_visible: bool,
}

/// Resolve the single state implied by the sampled conditions
pub fn resolve_state(conditions: &ServiceConditions) -> PandaState {
    if conditions.recent_error {
        PandaState::Error
    } else if !conditions.agent_running {
        PandaState::Idle
    } else if conditions.speaking {
        PandaState::Speaking
    } else if conditions.listening {
        PandaState::Listening
    } else if conditions.thinking_visible {
        PandaState::Processing
    } else {
        PandaState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build conditions from five bits in field declaration order
    fn conditions_from_bits(bits: u8) -> ServiceConditions {
        ServiceConditions {
            recent_error: bits & 0b10000 != 0,
            agent_running: bits & 0b01000 != 0,
            speaking: bits & 0b00100 != 0,
            listening: bits & 0b00010 != 0,
            thinking_visible: bits & 0b00001 != 0,
        }
    }

    #[test]
    fn test_default_conditions_resolve_idle() {
        assert_eq!(resolve_state(&ServiceConditions::default()), PandaState::Idle);
    }

    #[test]
    fn test_error_dominates_every_combination() {
        for bits in 0..16 {
            let mut conditions = conditions_from_bits(bits);
            conditions.recent_error = true;
            assert_eq!(resolve_state(&conditions), PandaState::Error);
        }
    }

    #[test]
    fn test_agent_down_resolves_idle_for_every_combination() {
        for bits in 0..8 {
            let mut conditions = conditions_from_bits(bits);
            conditions.recent_error = false;
            conditions.agent_running = false;
            assert_eq!(resolve_state(&conditions), PandaState::Idle);
        }
    }

    #[test]
    fn test_speaking_preempts_listening() {
        let conditions = ServiceConditions {
            agent_running: true,
            speaking: true,
            listening: true,
            ..Default::default()
        };
        assert_eq!(resolve_state(&conditions), PandaState::Speaking);
    }

    #[test]
    fn test_listening_preempts_thinking() {
        let conditions = ServiceConditions {
            agent_running: true,
            listening: true,
            thinking_visible: true,
            ..Default::default()
        };
        assert_eq!(resolve_state(&conditions), PandaState::Listening);
    }

    #[test]
    fn test_thinking_alone_resolves_processing() {
        let conditions = ServiceConditions {
            agent_running: true,
            thinking_visible: true,
            ..Default::default()
        };
        assert_eq!(resolve_state(&conditions), PandaState::Processing);
    }

    #[test]
    fn test_agent_up_but_quiet_resolves_idle() {
        let conditions = ServiceConditions {
            agent_running: true,
            ..Default::default()
        };
        assert_eq!(resolve_state(&conditions), PandaState::Idle);
    }

    #[test]
    fn test_resolution_is_total() {
        // Every input combination lands on one of the five states
        for bits in 0..32 {
            let resolved = resolve_state(&conditions_from_bits(bits));
            assert!(PandaState::ALL.contains(&resolved));
        }
    }
}
