use russh::{Channel, server::Msg};
use tokio::io::copy_bidirectional;

use crate::{SshmuxServer, callbacks::BoxedConn, error::ServerError, session::Session};

// Validate a direct-tcpip target against the session's allow-list and dial
// the matching remote. The target must equal one of a permitted remote's
// names byte-for-byte; the dial always goes to the remote's canonical
// address, not to whatever the client asked for.
pub(crate) async fn open(
    server: &SshmuxServer,
    session: &Session,
    address: &str,
) -> Result<BoxedConn, ServerError> {
    let Some(remote) = session
        .remotes
        .iter()
        .find(|remote| remote.matches_target(address))
    else {
        return Err(ServerError::AccessDenied);
    };
    if let Some(hook) = server.selected.as_ref() {
        if hook.selected(session, &remote.address).await.is_err() {
            return Err(ServerError::AccessDenied);
        }
    }
    server
        .dialer
        .dial(&remote.address)
        .await
        .map_err(ServerError::DialFailed)
}

// Splice the accepted channel and the remote connection until either side
// reaches EOF or fails; both ends close when the splice returns.
pub(crate) async fn splice(channel: Channel<Msg>, mut conn: BoxedConn) {
    let mut stream = channel.into_stream();
    let _ = copy_bidirectional(&mut stream, &mut conn).await;
}
