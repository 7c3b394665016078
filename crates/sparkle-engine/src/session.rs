use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use sparkle_core::Action;

use crate::error::EngineError;

/// Per-session state machine. Terminal states reject further chat turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingInfo,
    ReadyToBook,
    Booked,
    Escalated,
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Booked | SessionState::Escalated | SessionState::Abandoned
        )
    }

    /// Advance on the assistant's action for this turn.
    pub fn advance(self, action: Action) -> SessionState {
        if self.is_terminal() {
            return self;
        }
        match action {
            Action::CollectInfo => SessionState::AwaitingInfo,
            Action::CheckAvailability | Action::Confirm => SessionState::ReadyToBook,
            Action::BookAppointment => SessionState::Booked,
            Action::Escalate => SessionState::Escalated,
            Action::Continue => self,
        }
    }
}

/// Live session entry. The tokio mutex serializes chat turns; `try_lock`
/// failure maps to `session_busy`.
pub struct SessionHandle {
    pub conversation_id: String,
    pub variant: String,
    pub prompt_version: i64,
    pub state: std::sync::Mutex<SessionState>,
    pub turn_lock: tokio::sync::Mutex<()>,
}

impl SessionHandle {
    pub fn new(conversation_id: String, variant: String, prompt_version: i64) -> Arc<Self> {
        Arc::new(Self {
            conversation_id,
            variant,
            prompt_version,
            state: std::sync::Mutex::new(SessionState::Idle),
            turn_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn advance(&self, action: Action) -> SessionState {
        let mut state = self.state.lock().unwrap();
        *state = state.advance(action);
        *state
    }
}

/// Bounded registry of live sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    pub fn insert(&self, session_id: &str, handle: Arc<SessionHandle>) -> Result<(), EngineError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(EngineError::Capacity {
                max: self.max_sessions,
            });
        }
        self.sessions.insert(session_id.to_string(), handle);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_follows_actions() {
        let s = SessionState::Idle;
        let s = s.advance(Action::CollectInfo);
        assert_eq!(s, SessionState::AwaitingInfo);
        let s = s.advance(Action::CheckAvailability);
        assert_eq!(s, SessionState::ReadyToBook);
        let s = s.advance(Action::BookAppointment);
        assert_eq!(s, SessionState::Booked);
        assert!(s.is_terminal());
        // Terminal states don't move.
        assert_eq!(s.advance(Action::CollectInfo), SessionState::Booked);
    }

    #[test]
    fn continue_preserves_state() {
        let s = SessionState::AwaitingInfo;
        assert_eq!(s.advance(Action::Continue), SessionState::AwaitingInfo);
    }

    #[test]
    fn escalate_is_terminal() {
        let s = SessionState::ReadyToBook.advance(Action::Escalate);
        assert_eq!(s, SessionState::Escalated);
        assert!(s.is_terminal());
    }

    #[test]
    fn registry_enforces_capacity() {
        let reg = SessionRegistry::new(2);
        reg.insert("a", SessionHandle::new("c1".into(), "baseline".into(), 1))
            .unwrap();
        reg.insert("b", SessionHandle::new("c2".into(), "baseline".into(), 1))
            .unwrap();
        let err = reg
            .insert("c", SessionHandle::new("c3".into(), "baseline".into(), 1))
            .unwrap_err();
        assert!(matches!(err, EngineError::Capacity { max: 2 }));
        reg.remove("a");
        assert!(reg
            .insert("c", SessionHandle::new("c3".into(), "baseline".into(), 1))
            .is_ok());
    }
}
