use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use color_eyre::eyre::eyre;
use russh::{
    client::{self},
    keys::{PublicKey, key::PrivateKeyWithHashAlg, load_secret_key},
};
use sshmux::{SelectedHook, Session, SshmuxServer, UserPolicy, serve};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

const BASTION: &str = "127.0.0.1:18522";

// Denies every selection, like an embedder audit hook that fails closed.
struct DenyEverything;

#[async_trait]
impl SelectedHook for DenyEverything {
    async fn selected(&self, _session: &Session, _address: &str) -> color_eyre::Result<()> {
        Err(eyre!("nope"))
    }
}

/// The embedder's `selected` hook runs after target matching and before
/// dialing; an error from it rejects the channel even though the policy
/// would have allowed the target.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn selected_hook_denial() {
    let policy = UserPolicy::from_json(&format!(
        r#"{{
            "users": [{{ "name": "alice", "keys": ["{}"] }}],
            "remotes": [{{
                "address": "127.0.0.1:1",
                "description": "unreachable",
                "names": ["db:22"]
            }}]
        }}"#,
        include_str!("data/keys/key1.pub").trim()
    ))
    .expect("Failed to parse policy");
    let server = Arc::new(
        SshmuxServer::new(policy, Duration::from_secs(5)).with_selected_hook(DenyEverything),
    );
    let host_key = load_secret_key(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/keys/upstream"),
        None,
    )
    .expect("Missing file upstream");
    tokio::spawn(async move { serve(server, host_key, ("127.0.0.1".into(), 18522)).await });
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

    // The target matches the remote's names, but the hook vetoes it.
    assert!(
        session
            .channel_open_direct_tcpip("db", 22, "127.0.0.1", 33000)
            .await
            .is_err(),
        "selected hook should reject the channel"
    );
}

struct TestClient;

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
