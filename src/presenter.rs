//! Presentation seam
//!
//! The call session never renders anything itself. It emits
//! [`Notification`]s and whatever sits in front of the user (terminal, GUI,
//! web view) implements [`Presenter`].

use crate::protocol::AgentInfo;
use crate::session::CallState;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Lifecycle state changed
    State(CallState),
    /// Human-readable status line
    Status(String),
    /// Latest decision metadata from the backend
    Decision {
        decision: Option<String>,
        confidence: Option<f64>,
        clarification_count: u32,
    },
    /// End-of-call summary
    Summary(Option<String>),
    /// Call handed off to a human agent
    Escalated {
        agent: AgentInfo,
        session_id: Option<String>,
        summary: Option<String>,
    },
    /// The call is over. `keep_escalation_ui` asks the presenter to leave the
    /// escalation screen up.
    CallEnded { keep_escalation_ui: bool },
    Error(String),
}

pub trait Presenter: Send {
    fn render(&mut self, notification: &Notification);
}

/// Renders everything to the log.
#[derive(Debug, Default)]
pub struct TracingPresenter;

impl Presenter for TracingPresenter {
    fn render(&mut self, notification: &Notification) {
        match notification {
            Notification::State(state) => info!("📟 Call state: {:?}", state),
            Notification::Status(text) => info!("💬 {}", text),
            Notification::Decision { decision, confidence, clarification_count } => {
                info!(
                    "🧭 Decision: {} | Confidence: {} | Clarifications: {}",
                    decision.as_deref().unwrap_or("-"),
                    confidence.map(|c| format!("{:.2}", c)).unwrap_or_else(|| "-".to_string()),
                    clarification_count
                );
            }
            Notification::Summary(summary) => {
                info!("📝 Summary: {}", summary.as_deref().unwrap_or("(none)"));
            }
            Notification::Escalated { agent, session_id, .. } => {
                info!(
                    "🙋 Transferred to {} (call {})",
                    agent.display_name(),
                    session_id.as_deref().unwrap_or("N/A")
                );
            }
            Notification::CallEnded { keep_escalation_ui } => {
                info!("📴 Call ended{}", if *keep_escalation_ui { " (escalated)" } else { "" });
            }
            Notification::Error(message) => warn!("⚠️ {}", message),
        }
    }
}
