//! Error kinds surfaced by endpoints.

/// Errors that can occur during endpoint operations.
///
/// [`MalformedFrame`](Self::MalformedFrame) and
/// [`PeerVanished`](Self::PeerVanished) never reach a caller: they
/// describe conditions that are logged and recovered from locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// The shared root or an endpoint directory could not be created.
    StorageUnavailable(String),
    /// A line did not parse as a frame.
    MalformedFrame(String),
    /// A control or data path disappeared mid-protocol.
    PeerVanished(String),
    /// An endpoint with this id already exists.
    DuplicateIdentity(String),
    /// The id cannot be used as a path segment or protocol token.
    InvalidIdentity(String),
    /// The endpoint was closed.
    Closed,
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StorageUnavailable(msg) => write!(f, "Storage unavailable: {msg}"),
            Self::MalformedFrame(msg) => write!(f, "Malformed frame: {msg}"),
            Self::PeerVanished(peer) => write!(f, "Peer vanished: {peer}"),
            Self::DuplicateIdentity(id) => write!(f, "Duplicate endpoint identity: {id}"),
            Self::InvalidIdentity(id) => write!(f, "Invalid endpoint identity: {id:?}"),
            Self::Closed => write!(f, "Endpoint closed"),
        }
    }
}

impl std::error::Error for SocketError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(SocketError::Closed.to_string(), "Endpoint closed");
        assert_eq!(
            SocketError::DuplicateIdentity("h1".into()).to_string(),
            "Duplicate endpoint identity: h1"
        );
    }

    #[test]
    fn test_converts_into_anyhow() {
        let err: anyhow::Error = SocketError::PeerVanished("h2".into()).into();
        assert!(err.to_string().contains("h2"));
    }
}
