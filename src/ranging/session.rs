//! Per-peer ranging session state machine
//!
//! ```text
//! Idle ──configure──▶ Configuring ──first sample──▶ Active
//!  ▲                      ▲  │                        │ │
//!  │ resume               │  └──────suspend───────────┼─┤
//!  │                      └──new peer token───────────┘ ▼
//! Suspended ◀──────────────────────────────────────── suspend
//!
//! any ──engine error──▶ Invalidated ──recreate──▶ Idle
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{NearbyError, Result};
use crate::identity::PeerId;
use crate::ranging::engine::{EngineHandle, RangingToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Configuring,
    Active,
    Suspended,
    Invalidated,
}

/// What happened to a peer token handed to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenDisposition {
    /// Same token already applied to a live session
    Duplicate,
    /// Kept for later (session suspended or awaiting recreation)
    Stored,
    /// Session should be (re)configured with it
    NeedsConfigure,
}

/// One peer's exclusive engine session
#[derive(Debug)]
pub struct RangingSession {
    peer: PeerId,
    handle: Option<EngineHandle>,
    state: SessionState,
    peer_token: Option<RangingToken>,
}

impl RangingSession {
    pub fn new(peer: PeerId, handle: EngineHandle) -> Self {
        Self {
            peer,
            handle: Some(handle),
            state: SessionState::Idle,
            peer_token: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn handle(&self) -> Option<EngineHandle> {
        self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_peer_token(&self) -> bool {
        self.peer_token.is_some()
    }

    /// Record the peer's latest token
    pub fn set_peer_token(&mut self, token: RangingToken) -> TokenDisposition {
        let same = self.peer_token.as_ref() == Some(&token);
        if same && matches!(self.state, SessionState::Configuring | SessionState::Active) {
            return TokenDisposition::Duplicate;
        }

        self.peer_token = Some(token);
        match self.state {
            SessionState::Suspended | SessionState::Invalidated => TokenDisposition::Stored,
            SessionState::Idle | SessionState::Configuring | SessionState::Active => {
                TokenDisposition::NeedsConfigure
            }
        }
    }

    /// Move to Configuring and hand back what the engine call needs
    pub fn begin_configure(&mut self) -> Result<(EngineHandle, RangingToken)> {
        let ready = matches!(
            self.state,
            SessionState::Idle | SessionState::Configuring | SessionState::Active
        );
        match (ready, self.handle, self.peer_token.clone()) {
            (true, Some(handle), Some(token)) => {
                self.state = SessionState::Configuring;
                Ok((handle, token))
            }
            _ => Err(self.invalid("configure")),
        }
    }

    /// A sample arrived; returns true when this activated the session
    pub fn on_sample(&mut self) -> Result<bool> {
        match self.state {
            SessionState::Configuring => {
                self.state = SessionState::Active;
                Ok(true)
            }
            SessionState::Active => Ok(false),
            _ => Err(self.invalid("sample")),
        }
    }

    pub fn suspend(&mut self) -> Result<()> {
        match self.state {
            SessionState::Invalidated => Err(self.invalid("suspend")),
            _ => {
                self.state = SessionState::Suspended;
                Ok(())
            }
        }
    }

    /// Leave Suspended; returns true when a known peer token should be re-applied
    pub fn resume(&mut self) -> bool {
        if self.state != SessionState::Suspended {
            return false;
        }
        self.state = SessionState::Idle;
        self.peer_token.is_some()
    }

    /// Mark invalidated and give up the engine handle
    pub fn invalidate(&mut self) -> Option<EngineHandle> {
        self.state = SessionState::Invalidated;
        self.handle.take()
    }

    /// Attach a freshly created engine session after invalidation
    pub fn recreate(&mut self, handle: EngineHandle) -> Result<()> {
        if self.state != SessionState::Invalidated {
            return Err(self.invalid("recreate"));
        }
        self.handle = Some(handle);
        self.state = SessionState::Idle;
        Ok(())
    }

    fn invalid(&self, event: &'static str) -> NearbyError {
        NearbyError::InvalidTransition {
            from: self.state,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> RangingToken {
        RangingToken::new(s.as_bytes().to_vec())
    }

    fn session() -> RangingSession {
        RangingSession::new(PeerId::from("peer"), EngineHandle(1))
    }

    #[test]
    fn test_happy_path() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.begin_configure().is_err(), "no token yet");

        assert_eq!(s.set_peer_token(token("t1")), TokenDisposition::NeedsConfigure);
        let (handle, applied) = s.begin_configure().unwrap();
        assert_eq!(handle, EngineHandle(1));
        assert_eq!(applied, token("t1"));
        assert_eq!(s.state(), SessionState::Configuring);

        assert!(s.on_sample().unwrap());
        assert!(!s.on_sample().unwrap());
        assert_eq!(s.state(), SessionState::Active);
    }

    #[test]
    fn test_duplicate_token_is_ignored() {
        let mut s = session();
        s.set_peer_token(token("t1"));
        s.begin_configure().unwrap();
        assert_eq!(s.set_peer_token(token("t1")), TokenDisposition::Duplicate);

        s.on_sample().unwrap();
        assert_eq!(s.set_peer_token(token("t1")), TokenDisposition::Duplicate);
        assert_eq!(s.set_peer_token(token("t2")), TokenDisposition::NeedsConfigure);
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut s = session();
        s.set_peer_token(token("t1"));
        s.begin_configure().unwrap();
        s.on_sample().unwrap();

        s.suspend().unwrap();
        assert_eq!(s.state(), SessionState::Suspended);
        assert!(s.on_sample().is_err());
        assert!(s.begin_configure().is_err());
        assert_eq!(s.set_peer_token(token("t2")), TokenDisposition::Stored);

        assert!(s.resume());
        assert_eq!(s.state(), SessionState::Idle);
        let (_, applied) = s.begin_configure().unwrap();
        assert_eq!(applied, token("t2"));
    }

    #[test]
    fn test_resume_without_token() {
        let mut s = session();
        s.suspend().unwrap();
        assert!(!s.resume());
        assert!(!s.resume(), "second resume is a no-op");
    }

    #[test]
    fn test_invalidate_and_recreate() {
        let mut s = session();
        s.set_peer_token(token("t1"));
        s.begin_configure().unwrap();

        assert_eq!(s.invalidate(), Some(EngineHandle(1)));
        assert_eq!(s.state(), SessionState::Invalidated);
        assert_eq!(s.handle(), None);
        assert!(s.suspend().is_err());
        assert!(s.begin_configure().is_err());
        assert_eq!(s.set_peer_token(token("t1")), TokenDisposition::Stored);

        s.recreate(EngineHandle(2)).unwrap();
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.handle(), Some(EngineHandle(2)));
        assert!(s.has_peer_token());
        assert!(s.recreate(EngineHandle(3)).is_err());
    }
}
