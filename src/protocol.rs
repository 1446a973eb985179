//! Handshake tokens and per-peer leg state.
//!
//! Tokens travel as the payload of frames written into control signal
//! files:
//!
//! - `HELLO <id>`: `<id>` wants to connect; written into the target's
//!   `controls/<id>`.
//! - `OK <id>`: `<id>` accepted a greeting; written into the greeter's
//!   `controls/<id>`.
//! - `BYE <id>`: `<id>` is closing.

use std::fmt;

/// A parsed handshake token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Greeting from a connecting peer.
    Hello(String),
    /// Acceptance of our greeting.
    Ok(String),
    /// Peer is going away.
    Bye(String),
}

impl Control {
    /// Parse a decoded payload. Anything that is not exactly a known
    /// command followed by one id yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut words = text.split_whitespace();
        let (command, id) = (words.next()?, words.next()?);
        if words.next().is_some() {
            return None;
        }
        let id = id.to_string();
        match command {
            "HELLO" => Some(Self::Hello(id)),
            "OK" => Some(Self::Ok(id)),
            "BYE" => Some(Self::Bye(id)),
            _ => None,
        }
    }

    /// The id carried by the token.
    pub fn peer(&self) -> &str {
        match self {
            Self::Hello(id) | Self::Ok(id) | Self::Bye(id) => id,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hello(id) => write!(f, "HELLO {id}"),
            Self::Ok(id) => write!(f, "OK {id}"),
            Self::Bye(id) => write!(f, "BYE {id}"),
        }
    }
}

/// State of one peer relationship inside an endpoint.
///
/// A peer with no leg at all is idle with respect to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    /// We wrote `HELLO` and are waiting for `OK`.
    GreetingSent,
    /// We answered the peer's `HELLO` with `OK`.
    Greeted,
    /// Data can flow both ways.
    Connected,
    /// The peer said `BYE`, vanished, or we closed.
    Closed,
}

impl LegState {
    /// Whether application payloads from the peer are accepted.
    pub fn accepts_data(self) -> bool {
        matches!(self, Self::Greeted | Self::Connected)
    }
}
