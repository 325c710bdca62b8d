use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use russh::{
    Channel, ChannelMsg, MethodKind, MethodSet,
    client::{self},
    keys::{PublicKey, key::PrivateKeyWithHashAlg, load_secret_key},
    server::{self, Auth, Handler as ServerHandler, Msg as ServerMsg, Server},
};
use sshmux::{ApplicationConfig, entrypoint};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

const BASTION: &str = "127.0.0.1:18222";
const UPSTREAM: &str = "127.0.0.1:19222";

static PUBLICKEY_ATTEMPTED: AtomicBool = AtomicBool::new(false);

/// Without an agent request, the upstream authentication must contain no
/// public-key attempts: after the 1 s wait and the warning, the bastion
/// goes straight to keyboard-interactive and password, prompting the user
/// through the channel. The remote's declared username overrides the
/// downstream user name.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn session_password_fallback() {
    // 1. Upstream honeypot that only accepts password authentication.
    let upstream_key = load_secret_key(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/keys/upstream"),
        None,
    )
    .expect("Missing file upstream");
    let mut honeypot = Honeypot;
    tokio::spawn(async move {
        honeypot
            .run_on_address(
                Arc::new(server::Config {
                    keys: vec![upstream_key],
                    ..Default::default()
                }),
                UPSTREAM,
            )
            .await
    });

    // 2. Initialize sshmux with a single remote, so selection
    // short-circuits.
    let users_file = std::env::temp_dir().join("sshmux_test_password_users.json");
    tokio::fs::write(
        &users_file,
        format!(
            r#"{{
                "users": [{{ "name": "alice", "keys": ["{}"] }}],
                "remotes": [{{
                    "address": "{UPSTREAM}",
                    "description": "password-only host",
                    "username": "root"
                }}]
            }}"#,
            include_str!("data/keys/key1.pub").trim()
        ),
    )
    .await
    .expect("Failed to write users file");
    let key_file = std::env::temp_dir().join("sshmux_test_password_hostkey");
    let _ = tokio::fs::remove_file(&key_file).await;
    let config = ApplicationConfig::parse_from([
        "sshmux",
        "--listen-address=127.0.0.1",
        "--ssh-port=18222",
        "--private-key-file",
        key_file.to_str().unwrap(),
        "--users-file",
        users_file.to_str().unwrap(),
        "--connection-timeout=5s",
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(BASTION).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for sshmux to start.")
    };

    // 3. Open a session; the only remote is selected automatically.
    let key = load_secret_key(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/keys/key1"),
        None,
    )
    .expect("Missing file key1");
    let mut session = client::connect(Default::default(), BASTION, TestClient)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_publickey("alice", PrivateKeyWithHashAlg::new(Arc::new(key), None))
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );
    let mut channel = session
        .channel_open_session()
        .await
        .expect("Failed to open session channel");

    let mut stderr = String::new();
    wait_for_stderr(&mut channel, &mut stderr, "Selecting only remote: password-only host").await;
    wait_for_stderr(&mut channel, &mut stderr, &format!("Connecting to {UPSTREAM}")).await;
    wait_for_stderr(&mut channel, &mut stderr, "No agent request received.").await;

    // 4. The password prompt carries the remote's username override, and
    // the typed password authenticates upstream.
    wait_for_stderr(&mut channel, &mut stderr, &format!("root@{UPSTREAM}: ")).await;
    channel.data(&b"hunter2\r"[..]).await.unwrap();

    if timeout(Duration::from_secs(10), async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    assert_eq!(&data[..], b"hello from upstream");
                    break;
                }
                Some(_) => {}
                None => panic!("Channel closed before upstream data arrived"),
            }
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for upstream data.")
    };

    // 5. The hidden input must not echo, and no public-key method may
    // have been attempted upstream.
    assert!(!stderr.contains("hunter2"), "password should not echo");
    assert!(
        !PUBLICKEY_ATTEMPTED.load(Ordering::SeqCst),
        "no public-key auth should reach the upstream without an agent"
    );
}

async fn wait_for_stderr(channel: &mut Channel<client::Msg>, stderr: &mut String, needle: &str) {
    if timeout(Duration::from_secs(10), async {
        while !stderr.contains(needle) {
            match channel.wait().await {
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    stderr.push_str(&String::from_utf8_lossy(&data));
                }
                Some(_) => {}
                None => panic!("Channel closed while waiting for {needle:?}"),
            }
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for {needle:?}; stderr so far: {stderr:?}")
    }
}

struct TestClient;

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct Honeypot;

impl Server for Honeypot {
    type Handler = HoneypotHandler;

    fn new_client(&mut self, _peer_addr: Option<std::net::SocketAddr>) -> HoneypotHandler {
        HoneypotHandler
    }
}

struct HoneypotHandler;

impl ServerHandler for HoneypotHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [MethodKind::PublicKey, MethodKind::Password].as_slice(),
            )),
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        PUBLICKEY_ATTEMPTED.store(true, Ordering::SeqCst);
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == "root" && password == "hunter2" {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<ServerMsg>,
        _session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        tokio::spawn(async move {
            let _ = channel.data(&b"hello from upstream"[..]).await;
        });
        Ok(true)
    }
}
