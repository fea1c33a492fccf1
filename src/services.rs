//! Read-only probes into the assistant services the monitor observes.
//!
//! The monitor never owns or mutates these services; it samples their
//! live condition once per poll tick. The flag types here are the shared
//! handles the assistant runtime toggles from its own tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::state::ServiceConditions;

/// Live condition of the speech pipeline
pub trait SpeechActivity: Send + Sync {
    /// Is text-to-speech currently producing audio
    fn is_speaking(&self) -> bool;
    /// Is speech recognition currently capturing
    fn is_listening(&self) -> bool;
}

/// Live condition of the visual feedback layer
pub trait VisualFeedback: Send + Sync {
    /// Is the thinking indicator currently shown
    fn is_thinking_visible(&self) -> bool;
}

/// Liveness of the conversational agent service
pub trait AgentService: Send + Sync {
    fn is_running(&self) -> bool;
}

/// The set of services sampled on every poll tick
///
/// Absent services read as inactive, so a partially wired set degrades
/// to the idle state instead of failing.
#[derive(Clone, Default)]
pub struct Services {
    speech: Option<Arc<dyn SpeechActivity>>,
    feedback: Option<Arc<dyn VisualFeedback>>,
    agent: Option<Arc<dyn AgentService>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_speech(mut self, speech: Arc<dyn SpeechActivity>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_feedback(mut self, feedback: Arc<dyn VisualFeedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn AgentService>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Sample every service into one snapshot of conditions
    pub fn conditions(&self, recent_error: bool) -> ServiceConditions {
        ServiceConditions {
            recent_error,
            agent_running: self
                .agent
                .as_ref()
                .map(|agent| probe("agent", || agent.is_running()))
                .unwrap_or(false),
            speaking: self
                .speech
                .as_ref()
                .map(|speech| probe("speech", || speech.is_speaking()))
                .unwrap_or(false),
            listening: self
                .speech
                .as_ref()
                .map(|speech| probe("speech", || speech.is_listening()))
                .unwrap_or(false),
            thinking_visible: self
                .feedback
                .as_ref()
                .map(|feedback| probe("feedback", || feedback.is_thinking_visible()))
                .unwrap_or(false),
        }
    }
}

/// Run one probe query; a panicking probe reads as inactive
fn probe(service: &str, query: impl FnOnce() -> bool) -> bool {
    match catch_unwind(AssertUnwindSafe(query)) {
        Ok(active) => active,
        Err(_) => {
            warn!(service, "service probe panicked, reading as inactive");
            false
        }
    }
}

/// Speech pipeline activity flags shared with the speech tasks
#[derive(Clone, Default)]
pub struct SpeechFlags {
    speaking: Arc<AtomicBool>,
    listening: Arc<AtomicBool>,
}

impl SpeechFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_speaking(&self, active: bool) {
        self.speaking.store(active, Ordering::SeqCst);
    }

    pub fn set_listening(&self, active: bool) {
        self.listening.store(active, Ordering::SeqCst);
    }
}

impl SpeechActivity for SpeechFlags {
    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

/// Thinking-indicator visibility flag shared with the feedback layer
#[derive(Clone, Default)]
pub struct FeedbackFlag {
    visible: Arc<AtomicBool>,
}

impl FeedbackFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_thinking_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }
}

impl VisualFeedback for FeedbackFlag {
    fn is_thinking_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }
}

/// Agent service liveness flag shared with the agent supervisor
#[derive(Clone, Default)]
pub struct AgentFlag {
    running: Arc<AtomicBool>,
}

impl AgentFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl AgentService for AgentFlag {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
