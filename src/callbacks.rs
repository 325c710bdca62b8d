use async_trait::async_trait;
use russh::keys::{HashAlg, PublicKey};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{error::ServerError, session::Session, ssh::terminal::Terminal};

/// Byte stream connecting the server to a remote host.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

/// How to reach remote hosts. The default dials plain TCP; embedders may
/// override it for testing or to chain through another proxy.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> std::io::Result<BoxedConn>;
}

pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> std::io::Result<BoxedConn> {
        Ok(Box::new(TcpStream::connect(address).await?))
    }
}

/// Audit/authorization hook invoked after a remote host has been chosen,
/// before it is dialed. An error aborts the forward.
#[async_trait]
pub trait SelectedHook: Send + Sync {
    async fn selected(&self, session: &Session, address: &str) -> color_eyre::Result<()>;
}

/// Override for the interactive remote selection UI.
///
/// Returns an index into `session.remotes`, so a custom UI can never hand
/// back a remote the user is not permitted to reach. Out-of-range indices
/// abort the forward.
#[async_trait]
pub trait Selector: Send + Sync {
    async fn select(
        &self,
        terminal: &mut Terminal<'_>,
        session: &Session,
    ) -> Result<usize, ServerError>;
}

/// Override that asks the user which login name to use on the remote host.
#[async_trait]
pub trait UsernamePrompt: Send + Sync {
    async fn username(
        &self,
        terminal: &mut Terminal<'_>,
        session: &Session,
    ) -> Result<String, ServerError>;
}

/// Decides whether a remote host's key is acceptable.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    async fn verify(&self, address: &str, key: &PublicKey) -> bool;
}

/// Accepts any remote host key, logging its fingerprint.
///
/// This matches the behavior of classic jump hosts which leave host key
/// checking to out-of-band processes, and is a known weakness: replace it
/// with a pinning verifier where the set of remote host keys is known.
pub struct AcceptAllHostKeys;

#[async_trait]
impl HostKeyVerifier for AcceptAllHostKeys {
    async fn verify(&self, address: &str, key: &PublicKey) -> bool {
        tracing::warn!(
            %address,
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            "Accepting unverified remote host key."
        );
        true
    }
}
