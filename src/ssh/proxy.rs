use russh::{ChannelMsg, Pty, Sig, client, server};
use tokio::sync::mpsc;

use crate::droppable_handle::DroppableHandle;

// A channel-level request received from the downstream client, after the
// session request filter has applied its masking rules. Requests re-issued
// toward the remote host preserve their parameters; `pty-req` and `shell`
// are re-issued without a reply because the filter already acknowledged
// them locally.
#[derive(Debug)]
pub(crate) enum ChannelRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Subsystem {
        name: String,
    },
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal {
        signal: Sig,
    },
    AgentForward,
    X11 {
        single_connection: bool,
        auth_protocol: String,
        auth_cookie: String,
        screen_number: u32,
    },
}

// Bridge the unbounded intake fed by the connection handler into the
// bounded masked stream the relay drains. The single-slot buffer makes the
// filter block while the relay is busy, pacing request flow instead of
// queueing it without bound. Dropping the returned handle stops the
// filter; a closed intake closes the masked stream, which the relay takes
// as its termination signal.
pub(crate) fn masked_requests(
    mut raw: mpsc::UnboundedReceiver<ChannelRequest>,
) -> (mpsc::Receiver<ChannelRequest>, DroppableHandle<()>) {
    let (masked_tx, masked_rx) = mpsc::channel(1);
    let filter = DroppableHandle(tokio::spawn(async move {
        while let Some(request) = raw.recv().await {
            if masked_tx.send(request).await.is_err() {
                break;
            }
        }
    }));
    (masked_rx, filter)
}

// Symmetric relay between an accepted downstream channel and its upstream
// counterpart: bytes in both directions, downstream requests re-issued
// upstream, and upstream replies and exit notifications mirrored back.
// Runs until either side closes; both channels are then closed exactly
// once. Errors are not surfaced: the closes are the signal the SSH peers
// act on.
pub(crate) struct ChannelProxy {
    downstream: russh::Channel<server::Msg>,
    downstream_handle: server::Handle,
    upstream: russh::Channel<client::Msg>,
    // Masked request stream for a session pair; `None` for tunneled pairs,
    // which carry no forwarded requests.
    requests: Option<mpsc::Receiver<ChannelRequest>>,
    // Input the interactive phase read ahead of the relay.
    type_ahead: Vec<u8>,
}

impl ChannelProxy {
    pub(crate) fn new(
        downstream: russh::Channel<server::Msg>,
        downstream_handle: server::Handle,
        upstream: russh::Channel<client::Msg>,
        requests: Option<mpsc::Receiver<ChannelRequest>>,
        type_ahead: Vec<u8>,
    ) -> Self {
        ChannelProxy {
            downstream,
            downstream_handle,
            upstream,
            requests,
            type_ahead,
        }
    }

    pub(crate) async fn run(self) {
        let ChannelProxy {
            mut downstream,
            downstream_handle,
            mut upstream,
            mut requests,
            type_ahead,
        } = self;
        let downstream_id = downstream.id();
        // Replies from the remote host arrive strictly in request order, so
        // a count of outstanding forwarded requests is enough to pair each
        // Success/Failure with the downstream request awaiting it.
        let mut pending_replies = 0usize;
        if !type_ahead.is_empty() && upstream.data(&type_ahead[..]).await.is_err() {
            let _ = downstream.close().await;
            let _ = upstream.close().await;
            return;
        }
        loop {
            tokio::select! {
                msg = downstream.wait() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        ChannelMsg::Data { data } => {
                            if upstream.data(&data[..]).await.is_err() {
                                break;
                            }
                        }
                        ChannelMsg::ExtendedData { ext, data } => {
                            if upstream.extended_data(ext, &data[..]).await.is_err() {
                                break;
                            }
                        }
                        ChannelMsg::Eof => {
                            if upstream.eof().await.is_err() {
                                break;
                            }
                        }
                        ChannelMsg::Close => break,
                        _ => {}
                    }
                }
                msg = upstream.wait() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        ChannelMsg::Data { data } => {
                            if downstream.data(&data[..]).await.is_err() {
                                break;
                            }
                        }
                        ChannelMsg::ExtendedData { ext, data } => {
                            if downstream.extended_data(ext, &data[..]).await.is_err() {
                                break;
                            }
                        }
                        ChannelMsg::Eof => {
                            if downstream.eof().await.is_err() {
                                break;
                            }
                        }
                        ChannelMsg::Close => break,
                        ChannelMsg::ExitStatus { exit_status } => {
                            if downstream_handle
                                .exit_status_request(downstream_id, exit_status)
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        ChannelMsg::ExitSignal {
                            signal_name,
                            core_dumped,
                            error_message,
                            lang_tag,
                        } => {
                            if downstream_handle
                                .exit_signal_request(
                                    downstream_id,
                                    signal_name,
                                    core_dumped,
                                    error_message,
                                    lang_tag,
                                )
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        ChannelMsg::XonXoff { client_can_do } => {
                            if downstream_handle
                                .xon_xoff_request(downstream_id, client_can_do)
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        ChannelMsg::Success => {
                            if pending_replies > 0 {
                                pending_replies -= 1;
                                if downstream_handle
                                    .channel_success(downstream_id)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                        ChannelMsg::Failure => {
                            if pending_replies > 0 {
                                pending_replies -= 1;
                                if downstream_handle
                                    .channel_failure(downstream_id)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                request = async {
                    match requests.as_mut() {
                        Some(requests) => requests.recv().await,
                        None => None,
                    }
                }, if requests.is_some() => {
                    // A closed request stream means the downstream session
                    // is being torn down.
                    let Some(request) = request else { break };
                    if issue_upstream(&upstream, request, &mut pending_replies)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        let _ = downstream.close().await;
        let _ = upstream.close().await;
    }
}

// Re-issue a downstream request on the upstream channel. Requests that
// still await a downstream reply bump `pending_replies`; the proxy loop
// answers them as the upstream verdicts come back.
async fn issue_upstream(
    upstream: &russh::Channel<client::Msg>,
    request: ChannelRequest,
    pending_replies: &mut usize,
) -> Result<(), russh::Error> {
    match request {
        ChannelRequest::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            upstream
                .request_pty(
                    false, &term, col_width, row_height, pix_width, pix_height, &modes,
                )
                .await
        }
        ChannelRequest::Shell => upstream.request_shell(false).await,
        ChannelRequest::Exec { command } => {
            *pending_replies += 1;
            upstream.exec(true, command).await
        }
        ChannelRequest::Subsystem { name } => {
            *pending_replies += 1;
            upstream.request_subsystem(true, &name).await
        }
        ChannelRequest::Env { name, value } => {
            *pending_replies += 1;
            upstream.set_env(true, &name, &value).await
        }
        ChannelRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            upstream
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        ChannelRequest::Signal { signal } => upstream.signal(signal).await,
        ChannelRequest::AgentForward => upstream.agent_forward(false).await,
        ChannelRequest::X11 {
            single_connection,
            auth_protocol,
            auth_cookie,
            screen_number,
        } => {
            *pending_replies += 1;
            upstream
                .request_x11(
                    true,
                    single_connection,
                    &auth_protocol,
                    &auth_cookie,
                    screen_number,
                )
                .await
        }
    }
}
