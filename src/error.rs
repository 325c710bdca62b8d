use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("User terminated session")]
    UserAborted,
    #[error("User has no permitted remote hosts")]
    NoRemotes,
    #[error("Remote host access denied")]
    AccessDenied,
    #[error("Connection to remote host failed")]
    DialFailed(#[source] std::io::Error),
    #[error("Remote SSH handshake failed")]
    HandshakeFailed(#[source] russh::Error),
    #[error("Remote SSH handshake timed out")]
    HandshakeTimedOut,
    #[error("Remote authentication failed")]
    AuthenticationFailed,
    #[error("Agent forwarding failed")]
    AgentForwardingFailed(#[source] russh::Error),
    #[error("Selector returned an out-of-range remote index: {0}")]
    InvalidSelection(usize),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Malformed users file: {0}")]
    InvalidUsersFile(String),
    #[error("Missing file: {0}")]
    MissingFile(PathBuf),
}

impl From<russh::Error> for ServerError {
    fn from(error: russh::Error) -> Self {
        ServerError::HandshakeFailed(error)
    }
}
