//! Recognition session state machine.
//!
//! All state changes go through [`Session::apply`]. Frame and timeout events
//! carry the id of the session that produced them, so events from a
//! superseded session are ignored instead of leaking into the next one.

use crate::config::MatchPolicy;
use std::fmt;
use std::time::Duration;

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// Model bundles are still loading.
    Loading,
    /// Model loading failed; recognition cannot start.
    Unavailable { reason: String },
    /// Ready, no session has run yet.
    Idle,
    Running {
        session: SessionId,
        /// Employee recognised in the latest frame, if any.
        label: Option<String>,
        /// Set on the first match; disarms the timeout.
        matched_once: bool,
    },
    Matched { session: SessionId, label: String },
    TimedOut { session: SessionId },
    Stopped { session: SessionId },
}

impl Phase {
    /// Session the phase belongs to, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Phase::Running { session, .. }
            | Phase::Matched { session, .. }
            | Phase::TimedOut { session }
            | Phase::Stopped { session } => Some(*session),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Phase::Loading => "loading",
            Phase::Unavailable { .. } => "unavailable",
            Phase::Idle => "idle",
            Phase::Running { .. } => "running",
            Phase::Matched { .. } => "matched",
            Phase::TimedOut { .. } => "timed_out",
            Phase::Stopped { .. } => "stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What one detection iteration saw.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// No face in the frame (or no frame at all).
    NoFaces,
    /// Faces, but none close enough to a reference.
    Unmatched,
    Matched(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ModelsLoaded,
    ModelsFailed(String),
    Start,
    Frame {
        session: SessionId,
        outcome: FrameOutcome,
    },
    Timeout { session: SessionId },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRejection {
    AlreadyRunning,
    ModelsNotLoaded,
}

impl fmt::Display for StartRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartRejection::AlreadyRunning => f.write_str("recognition is already running"),
            StartRejection::ModelsNotLoaded => {
                f.write_str("Models are not loaded yet. Please wait.")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Started(SessionId),
    Changed,
    Ignored,
    Rejected(StartRejection),
}

/// A user-facing alert raised by a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub session: SessionId,
    pub message: String,
}

pub struct Session {
    phase: Phase,
    policy: MatchPolicy,
    timeout: Duration,
    last_id: SessionId,
    alert_count: usize,
    last_alert: Option<Alert>,
}

impl Session {
    pub fn new(policy: MatchPolicy, timeout: Duration) -> Self {
        Self {
            phase: Phase::Loading,
            policy,
            timeout,
            last_id: 0,
            alert_count: 0,
            last_alert: None,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Alerts raised since the daemon started.
    pub fn alert_count(&self) -> usize {
        self.alert_count
    }

    pub fn last_alert(&self) -> Option<&Alert> {
        self.last_alert.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        !matches!(self.phase, Phase::Loading | Phase::Unavailable { .. })
    }

    /// True while `session` is the running session.
    pub fn is_running(&self, session: SessionId) -> bool {
        matches!(self.phase, Phase::Running { session: s, .. } if s == session)
    }

    pub fn timeout_message(&self) -> String {
        format!(
            "Failed to detect the employee within {} seconds.",
            self.timeout.as_secs()
        )
    }

    pub fn apply(&mut self, event: Event) -> Outcome {
        let from = self.phase.name();
        let (next, outcome) = self.transition(event);
        if let Some(next) = next {
            tracing::info!(
                from,
                to = next.name(),
                session = next.session(),
                ?outcome,
                "session transition"
            );
            self.phase = next;
        }
        outcome
    }

    fn transition(&mut self, event: Event) -> (Option<Phase>, Outcome) {
        use Outcome::*;

        match (&self.phase, event) {
            (Phase::Loading, Event::ModelsLoaded) => (Some(Phase::Idle), Changed),
            (Phase::Loading, Event::ModelsFailed(reason)) => {
                (Some(Phase::Unavailable { reason }), Changed)
            }

            (Phase::Loading | Phase::Unavailable { .. }, Event::Start) => {
                (None, Rejected(StartRejection::ModelsNotLoaded))
            }
            (Phase::Running { .. }, Event::Start) => {
                (None, Rejected(StartRejection::AlreadyRunning))
            }
            (_, Event::Start) => {
                self.last_id += 1;
                let session = self.last_id;
                let running = Phase::Running {
                    session,
                    label: None,
                    matched_once: false,
                };
                (Some(running), Started(session))
            }

            (
                Phase::Running {
                    session,
                    label,
                    matched_once,
                },
                Event::Frame {
                    session: from,
                    outcome,
                },
            ) if *session == from => {
                let session = *session;
                match (outcome, self.policy) {
                    (FrameOutcome::NoFaces, _) => (None, Ignored),
                    (FrameOutcome::Unmatched, _) if label.is_none() => (None, Ignored),
                    (FrameOutcome::Unmatched, _) => (
                        Some(Phase::Running {
                            session,
                            label: None,
                            matched_once: *matched_once,
                        }),
                        Changed,
                    ),
                    (FrameOutcome::Matched(name), MatchPolicy::Stop) => {
                        (Some(Phase::Matched { session, label: name }), Changed)
                    }
                    (FrameOutcome::Matched(name), MatchPolicy::Continuous) => {
                        if label.as_deref() == Some(name.as_str()) {
                            (None, Ignored)
                        } else {
                            (
                                Some(Phase::Running {
                                    session,
                                    label: Some(name),
                                    matched_once: true,
                                }),
                                Changed,
                            )
                        }
                    }
                }
            }

            (
                Phase::Running {
                    session,
                    matched_once: false,
                    ..
                },
                Event::Timeout { session: from },
            ) if *session == from => {
                let session = *session;
                let message = self.timeout_message();
                tracing::warn!(session, alert = %message, "recognition timed out");
                self.alert_count += 1;
                self.last_alert = Some(Alert { session, message });
                (Some(Phase::TimedOut { session }), Changed)
            }

            (Phase::Running { session, .. }, Event::Stop) => {
                (Some(Phase::Stopped { session: *session }), Changed)
            }

            _ => (None, Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(policy: MatchPolicy) -> Session {
        let mut s = Session::new(policy, Duration::from_secs(40));
        assert_eq!(s.apply(Event::ModelsLoaded), Outcome::Changed);
        s
    }

    fn started(s: &mut Session) -> SessionId {
        match s.apply(Event::Start) {
            Outcome::Started(id) => id,
            other => panic!("expected start, got {other:?}"),
        }
    }

    fn frame(session: SessionId, outcome: FrameOutcome) -> Event {
        Event::Frame { session, outcome }
    }

    #[test]
    fn test_start_rejected_until_models_loaded() {
        let mut s = Session::new(MatchPolicy::Stop, Duration::from_secs(40));
        assert_eq!(
            s.apply(Event::Start),
            Outcome::Rejected(StartRejection::ModelsNotLoaded)
        );
        s.apply(Event::ModelsFailed("det_10g.onnx missing".into()));
        assert!(!s.is_ready());
        assert_eq!(
            s.apply(Event::Start),
            Outcome::Rejected(StartRejection::ModelsNotLoaded)
        );
    }

    #[test]
    fn test_start_while_running_is_rejected() {
        let mut s = ready(MatchPolicy::Stop);
        let id = started(&mut s);
        assert_eq!(
            s.apply(Event::Start),
            Outcome::Rejected(StartRejection::AlreadyRunning)
        );
        assert!(s.is_running(id));
    }

    #[test]
    fn test_stop_policy_ends_session_on_match() {
        let mut s = ready(MatchPolicy::Stop);
        let id = started(&mut s);
        s.apply(frame(id, FrameOutcome::Matched("B".into())));
        assert_eq!(
            s.phase(),
            &Phase::Matched {
                session: id,
                label: "B".into()
            }
        );
        // The timer may still fire; it must not alert after a match.
        assert_eq!(s.apply(Event::Timeout { session: id }), Outcome::Ignored);
        assert_eq!(s.alert_count(), 0);
    }

    #[test]
    fn test_unmatched_frame_clears_label() {
        let mut s = ready(MatchPolicy::Continuous);
        let id = started(&mut s);
        s.apply(frame(id, FrameOutcome::Matched("B".into())));
        s.apply(frame(id, FrameOutcome::Unmatched));
        assert_eq!(
            s.phase(),
            &Phase::Running {
                session: id,
                label: None,
                matched_once: true
            }
        );
    }

    #[test]
    fn test_no_faces_keeps_label() {
        let mut s = ready(MatchPolicy::Continuous);
        let id = started(&mut s);
        s.apply(frame(id, FrameOutcome::Matched("A".into())));
        assert_eq!(s.apply(frame(id, FrameOutcome::NoFaces)), Outcome::Ignored);
        assert!(matches!(s.phase(), Phase::Running { label: Some(l), .. } if l == "A"));
    }

    #[test]
    fn test_timeout_alerts_once() {
        let mut s = ready(MatchPolicy::Stop);
        let id = started(&mut s);
        s.apply(Event::Timeout { session: id });
        s.apply(Event::Timeout { session: id });
        assert_eq!(s.phase(), &Phase::TimedOut { session: id });
        assert_eq!(s.alert_count(), 1);
        let alert = s.last_alert().unwrap();
        assert_eq!(alert.session, id);
        assert_eq!(alert.message, "Failed to detect the employee within 40 seconds.");
    }

    #[test]
    fn test_continuous_match_disarms_timeout() {
        let mut s = ready(MatchPolicy::Continuous);
        let id = started(&mut s);
        s.apply(frame(id, FrameOutcome::Matched("A".into())));
        s.apply(frame(id, FrameOutcome::Unmatched));
        assert_eq!(s.apply(Event::Timeout { session: id }), Outcome::Ignored);
        assert!(s.is_running(id));
        assert_eq!(s.alert_count(), 0);
    }

    #[test]
    fn test_stale_session_events_are_ignored() {
        let mut s = ready(MatchPolicy::Stop);
        let old = started(&mut s);
        s.apply(Event::Stop);
        let new = started(&mut s);
        assert_ne!(old, new);

        assert_eq!(
            s.apply(frame(old, FrameOutcome::Matched("A".into()))),
            Outcome::Ignored
        );
        assert_eq!(s.apply(Event::Timeout { session: old }), Outcome::Ignored);
        assert!(s.is_running(new));
        assert_eq!(s.alert_count(), 0);
    }

    #[test]
    fn test_alert_count_spans_sessions_and_keeps_latest() {
        let mut s = ready(MatchPolicy::Stop);
        let first = started(&mut s);
        s.apply(Event::Timeout { session: first });
        let second = started(&mut s);
        s.apply(Event::Timeout { session: second });
        assert_eq!(s.alert_count(), 2);
        assert_eq!(s.last_alert().map(|a| a.session), Some(second));
    }

    #[test]
    fn test_phase_reports_its_session() {
        let mut s = ready(MatchPolicy::Stop);
        assert_eq!(s.phase().session(), None);
        let id = started(&mut s);
        assert_eq!(s.phase().session(), Some(id));
        s.apply(Event::Stop);
        assert_eq!(s.phase().session(), Some(id));
    }

    #[test]
    fn test_restart_after_each_terminal_phase() {
        let mut s = ready(MatchPolicy::Stop);
        let a = started(&mut s);
        s.apply(Event::Timeout { session: a });
        let b = started(&mut s);
        s.apply(frame(b, FrameOutcome::Matched("A".into())));
        let c = started(&mut s);
        s.apply(Event::Stop);
        assert_eq!(s.phase(), &Phase::Stopped { session: c });
        assert_eq!(s.apply(Event::Stop), Outcome::Ignored);
    }
}
