use crate::remote::Remote;

/// The server-side view of one authenticated user connection.
///
/// Created once authentication succeeds and never mutated afterwards; every
/// forward running on the connection shares it read-only.
#[derive(Debug)]
pub struct Session {
    /// The authenticated user name.
    pub user: String,
    /// The remote hosts this user is permitted to reach.
    pub remotes: Vec<Remote>,
}
