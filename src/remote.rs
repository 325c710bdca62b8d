use serde::Deserialize;

/// A remote host that an authenticated user is permitted to reach.
///
/// Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Remote {
    /// Canonical `host:port` address used when dialing the remote.
    pub address: String,
    /// Human-readable description shown in the interactive selector.
    #[serde(default)]
    pub description: String,
    /// Login name to use on the remote instead of the downstream user name.
    #[serde(default)]
    pub username: Option<String>,
    /// `host:port` aliases that `direct-tcpip` targets are matched against.
    #[serde(default)]
    pub names: Vec<String>,
}

impl Remote {
    // Whether a direct-tcpip target matches this remote. The comparison is
    // byte-for-byte on the full host:port pair.
    pub(crate) fn matches_target(&self, address: &str) -> bool {
        self.names.iter().any(|name| name == address)
    }
}
