use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use russh::{
    Channel, Disconnect,
    client::{self, AuthResult, KeyboardInteractiveAuthResponse},
    keys::PublicKey,
    server,
};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    SshmuxServer,
    callbacks::HostKeyVerifier,
    error::ServerError,
    remote::Remote,
    session::Session,
    ssh::{
        agent::AgentBridge,
        interactive::{default_interactive, keyboard_challenge, password_prompt},
        proxy::{ChannelProxy, ChannelRequest, masked_requests},
        terminal::Terminal,
    },
};

// How long to wait for the client to request agent forwarding before
// proceeding without public-key authentication.
const AGENT_WAIT: Duration = Duration::from_secs(1);

pub(crate) type UpstreamHandle = client::Handle<UpstreamHandler>;

// The connected upstream, shared between the session forward that owns it
// and the connection handler that tunnels later channel opens through it.
pub(crate) type SharedUpstream = Arc<Mutex<UpstreamHandle>>;

// Client-side handler for the connection to the remote host. Host key
// acceptance is delegated to the configured verifier.
pub(crate) struct UpstreamHandler {
    verifier: Arc<dyn HostKeyVerifier>,
    address: String,
}

impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self.verifier.verify(&self.address, key).await)
    }
}

// One session-channel forward: pick a remote host for the user, connect
// and authenticate to it, then relay the session channel transparently.
//
// The flow is: select remote (with the zero/one shortcut), authorize,
// resolve the login name, wait briefly for agent forwarding, dial and
// authenticate upstream, then hand both channels to the relay. Errors are
// written to the user's terminal and unwind through the channel close.
pub(crate) struct SessionForward {
    server: Arc<SshmuxServer>,
    session: Arc<Session>,
    channel: Channel<server::Msg>,
    handle: server::Handle,
    requests: mpsc::UnboundedReceiver<ChannelRequest>,
    agent_signal: oneshot::Receiver<()>,
    // Filled in once the upstream connection is up, switching the
    // connection into tunnel mode for further channel opens.
    upstream_slot: Arc<OnceLock<SharedUpstream>>,
}

impl SessionForward {
    pub(crate) fn new(
        server: Arc<SshmuxServer>,
        session: Arc<Session>,
        channel: Channel<server::Msg>,
        handle: server::Handle,
        requests: mpsc::UnboundedReceiver<ChannelRequest>,
        agent_signal: oneshot::Receiver<()>,
        upstream_slot: Arc<OnceLock<SharedUpstream>>,
    ) -> Self {
        SessionForward {
            server,
            session,
            channel,
            handle,
            requests,
            agent_signal,
            upstream_slot,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.drive().await {
            Ok((upstream, upstream_channel, agent, type_ahead)) => {
                let (masked_rx, _filter) = masked_requests(self.requests);
                ChannelProxy::new(
                    self.channel,
                    self.handle,
                    upstream_channel,
                    Some(masked_rx),
                    type_ahead,
                )
                .run()
                .await;
                // Unwind: release the agent channel and the upstream
                // connection now that the session is over.
                if let Some(agent) = agent {
                    agent.close().await;
                }
                let _ = upstream
                    .lock()
                    .await
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await;
            }
            Err(error) => {
                match &error {
                    ServerError::UserAborted => info!("User terminated the session."),
                    error => debug!(%error, "Session forward ended."),
                }
                let _ = self.channel.close().await;
            }
        }
    }

    // Everything up to the relay handoff: returns the upstream connection,
    // its opened session channel, the agent bridge to keep alive for the
    // session's lifetime, and any input the user typed ahead of the relay.
    async fn drive(
        &mut self,
    ) -> Result<
        (
            SharedUpstream,
            Channel<client::Msg>,
            Option<AgentBridge>,
            Vec<u8>,
        ),
        ServerError,
    > {
        let handle = self.handle.clone();
        let server = Arc::clone(&self.server);
        let session = Arc::clone(&self.session);
        let mut terminal = Terminal::new(&mut self.channel);

        let remotes = &session.remotes;
        let index = match remotes.len() {
            0 => {
                terminal.write("User has no permitted remote hosts\r\n").await?;
                return Err(ServerError::NoRemotes);
            }
            1 => {
                terminal
                    .write(&format!(
                        "Selecting only remote: {}\r\n",
                        remotes[0].description
                    ))
                    .await?;
                0
            }
            _ => {
                let result = match server.interactive.as_ref() {
                    Some(selector) => selector.select(&mut terminal, &session).await,
                    None => default_interactive(&mut terminal, &session).await,
                };
                match result {
                    Ok(index) if index < remotes.len() => index,
                    Ok(index) => {
                        let error = ServerError::InvalidSelection(index);
                        let _ = terminal
                            .write(&format!("Error selecting remote: {error}\r\n"))
                            .await;
                        return Err(error);
                    }
                    Err(ServerError::UserAborted) => return Err(ServerError::UserAborted),
                    Err(error) => {
                        let _ = terminal
                            .write(&format!("Error selecting remote: {error}\r\n"))
                            .await;
                        return Err(error);
                    }
                }
            }
        };
        let remote = remotes[index].clone();

        if let Some(hook) = server.selected.as_ref() {
            if hook.selected(&session, &remote.address).await.is_err() {
                terminal.write("Remote host selection denied\r\n").await?;
                return Err(ServerError::AccessDenied);
            }
        }
        terminal
            .write(&format!("Connecting to {}\r\n", remote.address))
            .await?;

        let username = match server.username_prompt.as_ref() {
            Some(prompt) => match prompt.username(&mut terminal, &session).await {
                Ok(username) => username,
                Err(error) => {
                    let _ = terminal
                        .write(&format!("username prompt failed: {error}\r\n"))
                        .await;
                    return Err(error);
                }
            },
            None => match remote.username.as_deref() {
                Some(username) if !username.is_empty() => username.into(),
                _ => session.user.clone(),
            },
        };

        // Wait briefly for the agent-forwarding request; without it, the
        // upstream authentication simply has no public-key method.
        let agent_requested = matches!(
            timeout(AGENT_WAIT, &mut self.agent_signal).await,
            Ok(Ok(()))
        );
        if !agent_requested {
            terminal.write("\r\n====== sshmux ======\r\n").await?;
            terminal
                .write("No agent request received. Public key authentication will not be\r\n")
                .await?;
            terminal
                .write("available. Either enable agent forwarding (-A), or use a ProxyJump.\r\n")
                .await?;
            terminal
                .write("For more info, see the sshmux wiki.\r\n")
                .await?;
        }

        let mut agent = if agent_requested {
            match AgentBridge::open(&handle).await {
                Ok(agent) => Some(agent),
                Err(error) => {
                    let _ = terminal
                        .write(&format!("agent forwarding failed: {error}\r\n"))
                        .await;
                    return Err(error);
                }
            }
        } else {
            None
        };

        let mut upstream = match connect_upstream(
            &server,
            &remote,
            &username,
            agent.as_mut(),
            &mut terminal,
        )
        .await
        {
            Ok(upstream) => upstream,
            Err(error) => {
                if let Some(agent) = agent.take() {
                    agent.close().await;
                }
                return Err(error);
            }
        };

        let upstream_channel = match upstream.channel_open_session().await {
            Ok(channel) => channel,
            Err(error) => {
                let _ = terminal
                    .write(&format!("Remote session setup failed: {error}\r\n"))
                    .await;
                if let Some(agent) = agent.take() {
                    agent.close().await;
                }
                let _ = upstream.disconnect(Disconnect::ByApplication, "", "en").await;
                return Err(ServerError::HandshakeFailed(error));
            }
        };

        // Tunnel mode: further channel opens on this connection relay to
        // the remote host instead of terminating here.
        let upstream = Arc::new(Mutex::new(upstream));
        let _ = self.upstream_slot.set(Arc::clone(&upstream));

        let type_ahead = terminal.take_pending();
        Ok((upstream, upstream_channel, agent, type_ahead))
    }
}

// Dial the remote host and complete the SSH handshake and authentication
// within the configured deadline.
async fn connect_upstream(
    server: &SshmuxServer,
    remote: &Remote,
    username: &str,
    agent: Option<&mut AgentBridge>,
    terminal: &mut Terminal<'_>,
) -> Result<UpstreamHandle, ServerError> {
    let conn = match server.dialer.dial(&remote.address).await {
        Ok(conn) => conn,
        Err(error) => {
            let _ = terminal
                .write(&format!("Connect failed: {error}\r\n"))
                .await;
            return Err(ServerError::DialFailed(error));
        }
    };
    let config = Arc::new(client::Config::default());
    let handler = UpstreamHandler {
        verifier: Arc::clone(&server.host_keys),
        address: remote.address.clone(),
    };
    let mut upstream =
        match timeout(server.connection_timeout, client::connect_stream(config, conn, handler))
            .await
        {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(error)) => {
                let _ = terminal
                    .write(&format!("Client connection setup failed: {error}\r\n"))
                    .await;
                return Err(ServerError::HandshakeFailed(error));
            }
            Err(_) => {
                let _ = terminal
                    .write("Client connection setup failed: timed out\r\n")
                    .await;
                return Err(ServerError::HandshakeTimedOut);
            }
        };
    match authenticate_upstream(&mut upstream, username, &remote.address, agent, terminal).await {
        Ok(true) => Ok(upstream),
        Ok(false) => {
            let _ = terminal
                .write("Client connection setup failed: all authentication methods failed\r\n")
                .await;
            Err(ServerError::AuthenticationFailed)
        }
        Err(error) => Err(error),
    }
}

// Try the available authentication methods in order: the implicit "none"
// probe, public keys from the forwarded agent, keyboard-interactive, then
// password. The interactive methods relay their prompts to the user.
async fn authenticate_upstream(
    upstream: &mut UpstreamHandle,
    username: &str,
    address: &str,
    agent: Option<&mut AgentBridge>,
    terminal: &mut Terminal<'_>,
) -> Result<bool, ServerError> {
    if let AuthResult::Success = upstream
        .authenticate_none(username)
        .await
        .map_err(ServerError::HandshakeFailed)?
    {
        return Ok(true);
    }

    if let Some(agent) = agent {
        match agent.identities().await {
            Ok(identities) => {
                let hash_alg = upstream
                    .best_supported_rsa_hash()
                    .await
                    .map_err(ServerError::HandshakeFailed)?
                    .flatten();
                for key in identities {
                    match upstream
                        .authenticate_publickey_with(username, key, hash_alg, agent.signer())
                        .await
                    {
                        Ok(AuthResult::Success) => return Ok(true),
                        Ok(AuthResult::Failure { .. }) => {}
                        Err(error) => return Err(ServerError::HandshakeFailed(error)),
                    }
                }
            }
            Err(error) => warn!(%error, "Unable to list agent identities."),
        }
    }

    let mut response = upstream
        .authenticate_keyboard_interactive_start(username, None)
        .await
        .map_err(ServerError::HandshakeFailed)?;
    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => break,
            KeyboardInteractiveAuthResponse::InfoRequest {
                instructions,
                prompts,
                ..
            } => {
                let answers = keyboard_challenge(terminal, &instructions, &prompts).await?;
                response = upstream
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(ServerError::HandshakeFailed)?;
            }
        }
    }

    let password = password_prompt(terminal, username, address).await?;
    match upstream
        .authenticate_password(username, password)
        .await
        .map_err(ServerError::HandshakeFailed)?
    {
        AuthResult::Success => Ok(true),
        AuthResult::Failure { .. } => Ok(false),
    }
}
