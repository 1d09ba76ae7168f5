//! Connection lifecycle states.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Discovering,
    ConnectingClient,
    ListeningServer,
    Connected,
    /// Transient: reported when a session ends, before the next resting state.
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Idle => "idle",
            LinkState::Discovering => "discovering",
            LinkState::ConnectingClient => "connecting",
            LinkState::ListeningServer => "listening",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// What the lifecycle owner currently has in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkActivity {
    pub session: bool,
    pub connecting: bool,
    pub listening: bool,
    pub discovering: bool,
}

impl LinkActivity {
    /// Resting state. A live session wins, then a pending connect, then a
    /// pending accept, then a discovery pass.
    pub fn state(&self) -> LinkState {
        if self.session {
            LinkState::Connected
        } else if self.connecting {
            LinkState::ConnectingClient
        } else if self.listening {
            LinkState::ListeningServer
        } else if self.discovering {
            LinkState::Discovering
        } else {
            LinkState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_in_flight_is_idle() {
        assert_eq!(LinkActivity::default().state(), LinkState::Idle);
    }

    #[test]
    fn precedence() {
        let mut a = LinkActivity {
            discovering: true,
            ..Default::default()
        };
        assert_eq!(a.state(), LinkState::Discovering);
        a.listening = true;
        assert_eq!(a.state(), LinkState::ListeningServer);
        a.connecting = true;
        assert_eq!(a.state(), LinkState::ConnectingClient);
        a.session = true;
        assert_eq!(a.state(), LinkState::Connected);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(LinkState::ListeningServer.to_string(), "listening");
        assert_eq!(LinkState::Disconnected.to_string(), "disconnected");
    }
}
