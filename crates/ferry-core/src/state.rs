//! Session state machines.
//!
//! Every local channel owns a [`StateMachine`] that validates each packet's
//! effect before the packet is acted on. The transition topology is a fixed
//! adjacency table checked by plain data lookup; an illegal transition
//! forces the machine into [`SessionState::Error`], from which the only way
//! out is closing the channel.
//!
//! Two variants share the same topology shape: the dual machine
//! ([`SessionState`]) distinguishes which side of the conversation performed
//! a step, and the collapsed machine ([`SimpleState`]) for peers that do not
//! track the requester/requested distinction.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// States of the dual session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Channel just opened, nothing exchanged yet
    OpenedChannel,
    /// Channel closed; terminal success state
    ClosedChannel,
    /// Failure state; only transitions to itself or to `ClosedChannel`
    Error,
    /// Startup packet exchanged
    Startup,
    /// Requester sent its authentication
    AuthentRequester,
    /// Requested host answered the authentication
    AuthentRequested,
    /// Requester sent the transfer request
    RequestRequester,
    /// Requested host accepted the transfer request
    RequestRequested,
    /// Request answered with an updated validation
    Valid,
    /// Requester is streaming data blocks
    DataRequester,
    /// Requested host is streaming data blocks
    DataRequested,
    /// Sender asked for end-of-transfer confirmation
    EndTransferRequester,
    /// Receiver confirmed end of transfer
    EndTransferRequested,
    /// Sender asked for end-of-request confirmation
    EndRequestRequester,
    /// Receiver confirmed end of request
    EndRequestRequested,
    /// Ping-pong test exchange
    Test,
    /// Information query in progress
    Information,
    /// Administrative validation exchange
    ValidOther,
    /// Shutdown handshake in progress
    Shutdown,
}

impl SessionState {
    /// Legal successor states. The table is fixed at compile time.
    #[must_use]
    pub const fn allowed_next(self) -> &'static [Self] {
        use SessionState as S;
        match self {
            S::OpenedChannel => &[S::Startup, S::Error],
            S::Startup => &[S::AuthentRequester, S::Error],
            S::AuthentRequester => &[S::AuthentRequested, S::Error],
            S::AuthentRequested => &[
                S::RequestRequester,
                S::ValidOther,
                S::Information,
                S::Shutdown,
                S::Test,
                S::Error,
            ],
            S::RequestRequester => &[S::Valid, S::RequestRequested, S::Error],
            S::RequestRequested => &[S::DataRequester, S::DataRequested, S::Error],
            S::Valid => &[S::RequestRequested, S::DataRequested, S::Error],
            S::DataRequester => &[S::DataRequester, S::EndTransferRequester, S::Error],
            S::DataRequested => &[S::DataRequested, S::EndTransferRequester, S::Error],
            S::EndTransferRequester => &[S::EndTransferRequested, S::Error],
            S::EndTransferRequested => &[S::EndRequestRequester, S::Error],
            S::EndRequestRequester => &[S::EndRequestRequested, S::Error],
            S::EndRequestRequested => &[S::ClosedChannel, S::Error],
            S::Information => &[S::ValidOther, S::ClosedChannel, S::Error],
            S::Test => &[S::Test, S::ValidOther],
            S::ValidOther => &[S::ValidOther, S::ClosedChannel, S::Error],
            S::Shutdown => &[S::ClosedChannel, S::Shutdown, S::Error],
            S::Error => &[S::Error, S::ClosedChannel],
            S::ClosedChannel => &[],
        }
    }

    /// Whether the session is finished, successfully or not.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ClosedChannel | Self::Error)
    }

    /// Collapse to the single-role variant.
    #[must_use]
    pub const fn simplify(self) -> SimpleState {
        use SessionState as S;
        match self {
            S::OpenedChannel => SimpleState::Opened,
            S::ClosedChannel => SimpleState::Closed,
            S::Error => SimpleState::Error,
            S::Startup => SimpleState::Startup,
            S::AuthentRequester | S::AuthentRequested => SimpleState::Authent,
            S::RequestRequester | S::RequestRequested => SimpleState::Request,
            S::Valid => SimpleState::Valid,
            S::DataRequester | S::DataRequested => SimpleState::Data,
            S::EndTransferRequester | S::EndTransferRequested => SimpleState::EndTransfer,
            S::EndRequestRequester | S::EndRequestRequested => SimpleState::EndRequest,
            S::Test => SimpleState::Test,
            S::Information => SimpleState::Information,
            S::ValidOther => SimpleState::ValidOther,
            S::Shutdown => SimpleState::Shutdown,
        }
    }
}

/// States of the collapsed single-role machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimpleState {
    /// Channel just opened
    Opened,
    /// Channel closed
    Closed,
    /// Failure state
    Error,
    /// Startup exchanged
    Startup,
    /// Authentication exchange
    Authent,
    /// Transfer request exchange
    Request,
    /// Request validation
    Valid,
    /// Data streaming
    Data,
    /// End-of-transfer handshake
    EndTransfer,
    /// End-of-request handshake
    EndRequest,
    /// Ping-pong test
    Test,
    /// Information query
    Information,
    /// Administrative validation
    ValidOther,
    /// Shutdown handshake
    Shutdown,
}

impl SimpleState {
    /// Legal successor states; same topology shape as the dual table.
    #[must_use]
    pub const fn allowed_next(self) -> &'static [Self] {
        use SimpleState as S;
        match self {
            S::Opened => &[S::Startup, S::Error],
            S::Startup => &[S::Authent, S::Error],
            S::Authent => &[
                S::Authent,
                S::Request,
                S::ValidOther,
                S::Information,
                S::Shutdown,
                S::Test,
                S::Error,
            ],
            S::Request => &[S::Request, S::Valid, S::Data, S::Error],
            S::Valid => &[S::Request, S::Data, S::Error],
            S::Data => &[S::Data, S::EndTransfer, S::Error],
            S::EndTransfer => &[S::EndTransfer, S::EndRequest, S::Error],
            S::EndRequest => &[S::EndRequest, S::Closed, S::Error],
            S::Information => &[S::ValidOther, S::Closed, S::Error],
            S::Test => &[S::Test, S::ValidOther],
            S::ValidOther => &[S::ValidOther, S::Closed, S::Error],
            S::Shutdown => &[S::Closed, S::Shutdown, S::Error],
            S::Error => &[S::Error, S::Closed],
            S::Closed => &[],
        }
    }
}

/// Per-session transition checker over the dual state table.
///
/// The machine itself is not synchronized; callers that share it across
/// tasks must guard it with the session lock.
#[derive(Debug)]
pub struct StateMachine {
    current: SessionState,
    released: bool,
}

impl StateMachine {
    /// A new machine in the initial state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: SessionState::OpenedChannel,
            released: false,
        }
    }

    /// The current state.
    #[must_use]
    pub const fn current(&self) -> SessionState {
        self.current
    }

    /// Attempt a transition to `next`.
    ///
    /// On an illegal transition the machine moves to [`SessionState::Error`]
    /// (unless the channel is already closed, which admits no transition at
    /// all) and the error reports both endpoints.
    pub fn try_transition(&mut self, next: SessionState) -> Result<()> {
        if self.released {
            return Err(Error::Internal("state machine already released".into()));
        }
        let from = self.current;
        if from.allowed_next().contains(&next) {
            self.current = next;
            return Ok(());
        }
        if from != SessionState::ClosedChannel {
            self.current = SessionState::Error;
        }
        Err(Error::IllegalTransition { from, to: next })
    }

    /// Drop the transition table reference at session end. Further
    /// transition attempts fail.
    pub fn release(&mut self) {
        self.released = true;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// All dual states, for table-driven tests and diagnostics.
pub const ALL_STATES: &[SessionState] = &[
    SessionState::OpenedChannel,
    SessionState::ClosedChannel,
    SessionState::Error,
    SessionState::Startup,
    SessionState::AuthentRequester,
    SessionState::AuthentRequested,
    SessionState::RequestRequester,
    SessionState::RequestRequested,
    SessionState::Valid,
    SessionState::DataRequester,
    SessionState::DataRequested,
    SessionState::EndTransferRequester,
    SessionState::EndTransferRequested,
    SessionState::EndRequestRequester,
    SessionState::EndRequestRequested,
    SessionState::Test,
    SessionState::Information,
    SessionState::ValidOther,
    SessionState::Shutdown,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = StateMachine::new();
        assert_eq!(machine.current(), SessionState::OpenedChannel);
    }

    #[test]
    fn test_happy_path_send_side() {
        let mut machine = StateMachine::new();
        let path = [
            SessionState::Startup,
            SessionState::AuthentRequester,
            SessionState::AuthentRequested,
            SessionState::RequestRequester,
            SessionState::RequestRequested,
            SessionState::DataRequester,
            SessionState::DataRequester,
            SessionState::DataRequester,
            SessionState::EndTransferRequester,
            SessionState::EndTransferRequested,
            SessionState::EndRequestRequester,
            SessionState::EndRequestRequested,
            SessionState::ClosedChannel,
        ];
        for next in path {
            machine.try_transition(next).expect("legal transition");
        }
        assert_eq!(machine.current(), SessionState::ClosedChannel);
    }

    #[test]
    fn test_every_illegal_transition_faults() {
        for &from in ALL_STATES {
            for &to in ALL_STATES {
                if from.allowed_next().contains(&to) {
                    continue;
                }
                let mut machine = StateMachine {
                    current: from,
                    released: false,
                };
                let err = machine.try_transition(to).unwrap_err();
                match err {
                    Error::IllegalTransition { from: f, to: t } => {
                        assert_eq!(f, from);
                        assert_eq!(t, to);
                    }
                    other => panic!("expected IllegalTransition, got {other:?}"),
                }
                if from == SessionState::ClosedChannel {
                    assert_eq!(machine.current(), SessionState::ClosedChannel);
                } else {
                    assert_eq!(machine.current(), SessionState::Error);
                }
            }
        }
    }

    #[test]
    fn test_closed_channel_is_terminal() {
        assert!(SessionState::ClosedChannel.allowed_next().is_empty());
        assert!(SessionState::ClosedChannel.is_terminal());
    }

    #[test]
    fn test_error_only_escapes_to_closed() {
        assert_eq!(
            SessionState::Error.allowed_next(),
            &[SessionState::Error, SessionState::ClosedChannel]
        );
    }

    #[test]
    fn test_released_machine_refuses_transitions() {
        let mut machine = StateMachine::new();
        machine.release();
        assert!(machine.try_transition(SessionState::Startup).is_err());
    }

    #[test]
    fn test_simplify_is_total_and_consistent() {
        for &state in ALL_STATES {
            let simple = state.simplify();
            // every dual successor must simplify into a simple successor
            // (or the same collapsed state, for role flips)
            for &next in state.allowed_next() {
                let simple_next = next.simplify();
                assert!(
                    simple.allowed_next().contains(&simple_next) || simple == simple_next,
                    "collapsed topology broken: {state:?} -> {next:?}"
                );
            }
        }
    }
}
