use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock, atomic::Ordering},
};

pub(crate) mod agent;
mod direct;
mod interactive;
mod proxy;
mod session_forward;
pub(crate) mod terminal;

use russh::{
    Channel, ChannelId, MethodKind, MethodSet, Pty, Sig,
    keys::{HashAlg, PublicKey},
    server::{Auth, Handler, Msg, Session as ServerSession},
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    SshmuxServer,
    droppable_handle::DroppableHandle,
    session::Session,
    ssh::{
        proxy::{ChannelProxy, ChannelRequest, masked_requests},
        session_forward::{SessionForward, SharedUpstream},
    },
};

// Intake side of one session channel: where the connection handler routes
// intercepted channel requests, and the one-shot fired when the client
// requests agent forwarding.
struct ChannelControl {
    requests: mpsc::UnboundedSender<ChannelRequest>,
    agent: Option<oneshot::Sender<()>>,
}

// Per-connection state for one user SSH connection.
pub struct ServerHandler {
    // The unique ID of this connection.
    id: usize,
    // The IP and port of this connection, when known.
    peer: Option<SocketAddr>,
    // Reference to the process-wide policy and callbacks.
    server: Arc<SshmuxServer>,
    // The authenticated session. Set once authentication succeeds.
    session: Option<Arc<Session>>,
    // Request intake for each open session channel.
    channels: HashMap<ChannelId, ChannelControl>,
    // The connected upstream, once a session forward establishes one.
    // Further channel opens tunnel through it.
    upstream: Arc<OnceLock<SharedUpstream>>,
    // Forwarding tasks tied to this connection's lifetime.
    forwards: Vec<DroppableHandle<()>>,
}

impl ServerHandler {
    pub(crate) fn new(server: Arc<SshmuxServer>, peer: Option<SocketAddr>) -> Self {
        let id = server.session_id.fetch_add(1, Ordering::AcqRel);
        tracing::info!(id, peer = ?peer, "SSH client connected.");
        ServerHandler {
            id,
            peer,
            server,
            session: None,
            channels: HashMap::new(),
            upstream: Arc::new(OnceLock::new()),
            forwards: Vec::new(),
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    // Authenticate the user by public key and attach their remote
    // allow-list to the connection.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        if self.server.users.authenticate(user, public_key) {
            let remotes = self.server.users.remotes_for(user);
            tracing::info!(
                id = self.id, peer = ?self.peer, %user, %fingerprint, remotes = remotes.len(),
                "SSH client authenticated with public key."
            );
            self.session = Some(Arc::new(Session {
                user: user.into(),
                remotes,
            }));
            Ok(Auth::Accept)
        } else {
            tracing::warn!(
                id = self.id, peer = ?self.peer, %user, %fingerprint,
                "Failed public key authentication."
            );
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    // A session channel: interactive selection of a remote host, then a
    // transparent relay to it. Once an earlier forward has connected
    // upstream, additional session channels relay to the upstream instead
    // of starting another selection.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut ServerSession,
    ) -> Result<bool, Self::Error> {
        let Some(user_session) = self.session.clone() else {
            return Err(russh::Error::Disconnect);
        };
        if let Some(upstream) = self.upstream.get().cloned() {
            return match upstream.lock().await.channel_open_session().await {
                Ok(upstream_channel) => {
                    tracing::debug!(id = self.id, "Tunneling session channel to the remote host.");
                    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
                    self.channels.insert(
                        channel.id(),
                        ChannelControl {
                            requests: requests_tx,
                            agent: None,
                        },
                    );
                    let (masked_rx, filter) = masked_requests(requests_rx);
                    let proxy = ChannelProxy::new(
                        channel,
                        session.handle(),
                        upstream_channel,
                        Some(masked_rx),
                        Vec::new(),
                    );
                    self.forwards.push(DroppableHandle(tokio::spawn(async move {
                        let _filter = filter;
                        proxy.run().await;
                    })));
                    Ok(true)
                }
                Err(error) => {
                    tracing::warn!(
                        id = self.id, %error,
                        "Remote host refused tunneled session channel."
                    );
                    Ok(false)
                }
            };
        }
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (agent_tx, agent_rx) = oneshot::channel();
        self.channels.insert(
            channel.id(),
            ChannelControl {
                requests: requests_tx,
                agent: Some(agent_tx),
            },
        );
        let forward = SessionForward::new(
            Arc::clone(&self.server),
            user_session,
            channel,
            session.handle(),
            requests_rx,
            agent_rx,
            Arc::clone(&self.upstream),
        );
        self.forwards
            .push(DroppableHandle(tokio::spawn(forward.run())));
        Ok(true)
    }

    // A direct-tcpip channel (ssh -W): policy-checked forward to a
    // permitted remote, or a tunneled open once a session forward has
    // connected upstream.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut ServerSession,
    ) -> Result<bool, Self::Error> {
        let Some(user_session) = self.session.clone() else {
            return Err(russh::Error::Disconnect);
        };
        let address = format!("{host_to_connect}:{port_to_connect}");
        if let Some(upstream) = self.upstream.get().cloned() {
            // Tunnel mode: open the same channel on the upstream and relay.
            match upstream
                .lock()
                .await
                .channel_open_direct_tcpip(
                    host_to_connect,
                    port_to_connect,
                    originator_address,
                    originator_port,
                )
                .await
            {
                Ok(upstream_channel) => {
                    tracing::debug!(
                        id = self.id, %address,
                        "Tunneling direct-tcpip channel to the remote host."
                    );
                    let proxy = ChannelProxy::new(
                        channel,
                        session.handle(),
                        upstream_channel,
                        None,
                        Vec::new(),
                    );
                    self.forwards
                        .push(DroppableHandle(tokio::spawn(proxy.run())));
                    Ok(true)
                }
                Err(error) => {
                    tracing::warn!(
                        id = self.id, %address, %error,
                        "Remote host refused tunneled channel open."
                    );
                    Ok(false)
                }
            }
        } else {
            match direct::open(&self.server, &user_session, &address).await {
                Ok(conn) => {
                    tracing::info!(
                        id = self.id, user = %user_session.user, %address,
                        "Forwarding direct-tcpip channel."
                    );
                    self.forwards.push(DroppableHandle(tokio::spawn(
                        direct::splice(channel, conn),
                    )));
                    Ok(true)
                }
                Err(error) => {
                    tracing::warn!(
                        id = self.id, user = %user_session.user, %address, %error,
                        "Rejecting direct-tcpip channel."
                    );
                    Ok(false)
                }
            }
        }
    }

    // Some clients (notably PuTTY) wait for the pty/shell replies before
    // sending anything else, so these two are acknowledged locally and
    // re-issued upstream without a reply.
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(control) = self.channels.get(&channel) {
            let _ = control.requests.send(ChannelRequest::Pty {
                term: term.into(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            });
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(control) = self.channels.get(&channel) {
            let _ = control.requests.send(ChannelRequest::Shell);
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    // The remaining request types are forwarded as-is; their replies come
    // back from the remote host through the relay.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(control) = self.channels.get(&channel) {
            let _ = control.requests.send(ChannelRequest::Exec {
                command: data.to_vec(),
            });
            Ok(())
        } else {
            session.channel_failure(channel)
        }
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(control) = self.channels.get(&channel) {
            let _ = control.requests.send(ChannelRequest::Subsystem { name: name.into() });
            Ok(())
        } else {
            session.channel_failure(channel)
        }
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(control) = self.channels.get(&channel) {
            let _ = control.requests.send(ChannelRequest::Env {
                name: variable_name.into(),
                value: variable_value.into(),
            });
            Ok(())
        } else {
            session.channel_failure(channel)
        }
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(control) = self.channels.get(&channel) {
            let _ = control.requests.send(ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            });
        }
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(control) = self.channels.get(&channel) {
            let _ = control.requests.send(ChannelRequest::Signal { signal });
        }
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        if let Some(control) = self.channels.get(&channel) {
            let _ = control.requests.send(ChannelRequest::X11 {
                single_connection,
                auth_protocol: x11_auth_protocol.into(),
                auth_cookie: x11_auth_cookie.into(),
                screen_number: x11_screen_number,
            });
            Ok(())
        } else {
            session.channel_failure(channel)
        }
    }

    // Agent forwarding: acknowledge and fire the one-shot the session
    // forward is waiting on instead of forwarding the request. On a
    // tunneled channel, where no forward is waiting, the request is
    // re-issued upstream like any other.
    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut ServerSession,
    ) -> Result<bool, Self::Error> {
        match self.channels.get_mut(&channel) {
            Some(control) => {
                match control.agent.take() {
                    Some(signal) => {
                        let _ = signal.send(());
                    }
                    None => {
                        let _ = control.requests.send(ChannelRequest::AgentForward);
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // Dropping the intake closes the masked request stream, which tells
    // the relay the downstream session is gone.
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut ServerSession,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self
            .session
            .as_ref()
            .map(|session| session.user.as_str())
            .unwrap_or("unknown");
        tracing::info!(id = self.id, peer = ?self.peer, %user, "SSH client disconnected.");
    }
}
