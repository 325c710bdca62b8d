use russh::{
    ChannelId, ChannelStream,
    keys::{PublicKey, agent::client::AgentClient},
    server::{Handle, Msg},
};

use crate::error::ServerError;

// Bridge to the user's SSH agent, reached back through the user connection
// over an auth-agent@openssh.com channel. The channel doubles as the agent
// transport; anything the agent side requests beyond that is ignored.
pub(crate) struct AgentBridge {
    channel_id: ChannelId,
    handle: Handle,
    client: AgentClient<ChannelStream<Msg>>,
}

impl AgentBridge {
    // Open the agent channel toward the client. Fails when the client
    // refuses the channel, e.g. because no agent is actually forwarded.
    pub(crate) async fn open(handle: &Handle) -> Result<Self, ServerError> {
        let channel = handle
            .channel_open_agent()
            .await
            .map_err(ServerError::AgentForwardingFailed)?;
        let channel_id = channel.id();
        Ok(AgentBridge {
            channel_id,
            handle: handle.clone(),
            client: AgentClient::connect(channel.into_stream()),
        })
    }

    // The public keys held by the user's agent.
    pub(crate) async fn identities(&mut self) -> Result<Vec<PublicKey>, russh::keys::Error> {
        self.client.request_identities().await
    }

    // The agent as a signer, for public-key authentication against the
    // remote host.
    pub(crate) fn signer(&mut self) -> &mut AgentClient<ChannelStream<Msg>> {
        &mut self.client
    }

    pub(crate) async fn close(self) {
        let _ = self.handle.close(self.channel_id).await;
    }
}
