//! Status view rendered from the session phase.

use crate::session::{Phase, Session};
use serde::Serialize;

pub const SEARCHING: &str = "Searching for Employee...";
pub const LOADING: &str = "Loading models...";
pub const START_LABEL: &str = "Start Recognition";
pub const BUSY_LABEL: &str = "Recognition in Progress...";

pub fn detected_message(label: &str) -> String {
    format!("{label} detected!")
}

/// Everything a front end needs to draw the recognition screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub phase: String,
    pub models_loaded: bool,
    pub recognition_active: bool,
    /// "<name> detected!" while an employee is recognised.
    pub detected_label: Option<String>,
    /// Line shown under the preview; empty when there is nothing to say.
    pub status_line: String,
    pub control_label: &'static str,
    pub control_enabled: bool,
    pub session: Option<u64>,
    pub alert_count: usize,
    pub last_alert: Option<String>,
}

impl StatusView {
    pub fn render(session: &Session) -> Self {
        let phase = session.phase();
        let (active, detected, session_id) = match phase {
            Phase::Running { session, label, .. } => {
                (true, label.as_deref().map(detected_message), Some(*session))
            }
            Phase::Matched { session, label } => (false, Some(detected_message(label)), Some(*session)),
            Phase::TimedOut { session } | Phase::Stopped { session } => (false, None, Some(*session)),
            _ => (false, None, None),
        };

        let status_line = match (phase, &detected) {
            (_, Some(msg)) => msg.clone(),
            (Phase::Loading, _) => LOADING.to_string(),
            (Phase::Unavailable { reason }, _) => format!("Models unavailable: {reason}"),
            (Phase::Running { .. }, None) => SEARCHING.to_string(),
            _ => String::new(),
        };

        let models_loaded = session.is_ready();
        Self {
            phase: phase.to_string(),
            models_loaded,
            recognition_active: active,
            detected_label: detected,
            status_line,
            control_label: if active { BUSY_LABEL } else { START_LABEL },
            control_enabled: models_loaded && !active,
            session: session_id,
            alert_count: session.alert_count(),
            last_alert: session.last_alert().map(|a| a.message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchPolicy;
    use crate::session::{Event, FrameOutcome};
    use std::time::Duration;

    fn session(policy: MatchPolicy) -> Session {
        Session::new(policy, Duration::from_secs(40))
    }

    #[test]
    fn test_loading_shows_indicator_and_disables_control() {
        let view = StatusView::render(&session(MatchPolicy::Stop));
        assert_eq!(view.status_line, LOADING);
        assert!(!view.models_loaded);
        assert!(!view.control_enabled);
    }

    #[test]
    fn test_idle_is_blank_and_startable() {
        let mut s = session(MatchPolicy::Stop);
        s.apply(Event::ModelsLoaded);
        let view = StatusView::render(&s);
        assert_eq!(view.status_line, "");
        assert_eq!(view.control_label, START_LABEL);
        assert!(view.control_enabled);
    }

    #[test]
    fn test_running_shows_searching() {
        let mut s = session(MatchPolicy::Stop);
        s.apply(Event::ModelsLoaded);
        s.apply(Event::Start);
        let view = StatusView::render(&s);
        assert_eq!(view.status_line, SEARCHING);
        assert_eq!(view.control_label, BUSY_LABEL);
        assert!(!view.control_enabled);
        assert!(view.recognition_active);
    }

    #[test]
    fn test_match_shows_employee_message() {
        let mut s = session(MatchPolicy::Stop);
        s.apply(Event::ModelsLoaded);
        s.apply(Event::Start);
        s.apply(Event::Frame {
            session: 1,
            outcome: FrameOutcome::Matched("Aditi Kotecha".into()),
        });
        let view = StatusView::render(&s);
        assert_eq!(view.detected_label.as_deref(), Some("Aditi Kotecha detected!"));
        assert_eq!(view.status_line, "Aditi Kotecha detected!");
        assert!(view.control_enabled);
    }

    #[test]
    fn test_timeout_reports_alert() {
        let mut s = session(MatchPolicy::Stop);
        s.apply(Event::ModelsLoaded);
        s.apply(Event::Start);
        s.apply(Event::Timeout { session: 1 });
        let view = StatusView::render(&s);
        assert!(!view.recognition_active);
        assert_eq!(view.status_line, "");
        assert_eq!(view.alert_count, 1);
        assert_eq!(
            view.last_alert.as_deref(),
            Some("Failed to detect the employee within 40 seconds.")
        );
    }
}
