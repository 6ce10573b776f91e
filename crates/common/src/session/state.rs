use std::fmt;

/// Lifecycle of a session.
///
/// ```text
/// opened -> provisional -> established <-> suspended
///                |               |              |
///                +-----------> quitting <-------+
/// any state -> closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Socket up, no box yet.
    Opened,
    /// Box established, identity not yet proven.
    Provisional,
    /// Logged in.
    Established,
    /// Paused so the box can be rotated.
    Suspended,
    /// Draining the outbound queue before closing.
    Quitting,
    /// Terminal.
    Closed,
}

impl State {
    pub fn can_transition(self, to: State) -> bool {
        use State::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Opened, Provisional) => true,
            (Provisional, Established) | (Provisional, Quitting) => true,
            (Established, Suspended) | (Established, Quitting) => true,
            (Suspended, Established) | (Suspended, Quitting) => true,
            _ => false,
        }
    }

    /// Outbound PDUs are still accepted.
    pub fn is_live(self) -> bool {
        !matches!(self, State::Closed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Opened => "opened",
            State::Provisional => "provisional",
            State::Established => "established",
            State::Suspended => "suspended",
            State::Quitting => "quitting",
            State::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod test {
    use super::State::*;

    #[test]
    fn test_closed_is_terminal() {
        for to in [Opened, Provisional, Established, Suspended, Quitting, Closed] {
            assert!(!Closed.can_transition(to));
        }
    }

    #[test]
    fn test_any_live_state_may_close() {
        for from in [Opened, Provisional, Established, Suspended, Quitting] {
            assert!(from.can_transition(Closed));
        }
    }

    #[test]
    fn test_login_must_precede_pause() {
        assert!(!Provisional.can_transition(Suspended));
        assert!(!Opened.can_transition(Established));
        assert!(Established.can_transition(Suspended));
        assert!(Suspended.can_transition(Established));
        assert!(!Quitting.can_transition(Established));
    }
}
