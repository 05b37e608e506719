//! Lifecycle of an in-flight request.

use std::collections::HashSet;

use hs_core::{HandleError, HandleResult};

use crate::value::ValueReference;

/// Where a request is in its exchange with a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestState {
    /// Built, not yet sent.
    #[default]
    Created,
    /// Sent, awaiting a response.
    Sent,
    /// Server answered with a challenge.
    Challenged,
    /// Challenge answer sent.
    Answered,
    /// A final response arrived.
    Completed,
    /// Gave up.
    Failed,
}

impl RequestState {
    /// True if `next` may follow `self`.
    pub fn can_transition(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Created, Sent)
                | (Created, Failed)
                | (Sent, Challenged)
                | (Sent, Completed)
                | (Sent, Failed)
                | (Challenged, Answered)
                | (Challenged, Failed)
                | (Answered, Challenged)
                | (Answered, Completed)
                | (Answered, Failed)
        )
    }

    /// True for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

/// Tracks one request's state and the identities it has been challenged for.
#[derive(Debug, Default)]
pub struct RequestTracker {
    state: RequestState,
    challenged: HashSet<ValueReference>,
}

impl RequestTracker {
    /// New tracker in [`RequestState::Created`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Moves to `next`, failing with `INTERNAL_ERROR` on an illegal step.
    pub fn advance(&mut self, next: RequestState) -> HandleResult<()> {
        if !self.state.can_transition(next) {
            return Err(HandleError::internal(format!(
                "illegal request transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Records a challenge for `identity`. A second challenge for the same
    /// identity means the answer was not accepted and the exchange fails.
    pub fn challenge(&mut self, identity: &ValueReference) -> HandleResult<()> {
        if !self.challenged.insert(identity.clone()) {
            self.state = RequestState::Failed;
            return Err(HandleError::new(
                hs_core::ErrorKind::UnableToAuthenticate,
                format!("repeated challenge for {identity}"),
            ));
        }
        self.advance(RequestState::Challenged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_core::ErrorKind;

    #[test]
    fn test_happy_path() {
        let mut t = RequestTracker::new();
        t.advance(RequestState::Sent).unwrap();
        t.challenge(&ValueReference::new("0.NA/10.1000", 300)).unwrap();
        t.advance(RequestState::Answered).unwrap();
        t.challenge(&ValueReference::new("0.NA/10.1001", 300)).unwrap();
        t.advance(RequestState::Answered).unwrap();
        t.advance(RequestState::Completed).unwrap();
        assert!(t.state().is_terminal());
    }

    #[test]
    fn test_illegal_transition() {
        let mut t = RequestTracker::new();
        let err = t.advance(RequestState::Completed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
        t.advance(RequestState::Sent).unwrap();
        t.advance(RequestState::Completed).unwrap();
        assert!(t.advance(RequestState::Sent).is_err());
    }

    #[test]
    fn test_repeated_identity_fails() {
        let id = ValueReference::new("0.NA/10.1000", 300);
        let mut t = RequestTracker::new();
        t.advance(RequestState::Sent).unwrap();
        t.challenge(&id).unwrap();
        t.advance(RequestState::Answered).unwrap();
        assert!(t.challenge(&id).is_err());
        assert_eq!(t.state(), RequestState::Failed);
    }
}
