use std::{net::SocketAddr, sync::Arc, time::Duration};

use color_eyre::eyre::Context;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::{
    keys::{
        PrivateKey, decode_secret_key,
        ssh_key::{LineEnding, private::Ed25519Keypair},
    },
    server::{Config, Server as _},
};
use tokio::fs;
use tracing::info;

use crate::{ApplicationConfig, SshmuxServer, UserPolicy, ssh::ServerHandler};

// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting sshmux...");
    // Find the private SSH key for sshmux or create a new one.
    let key = match fs::read_to_string(config.private_key_file.as_path()).await {
        Ok(key) => decode_secret_key(&key, None).wrap_err("Error decoding secret key")?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!("Key file not found. Creating...");
            let key = PrivateKey::from(Ed25519Keypair::from_seed(
                &ChaCha20Rng::from_os_rng().random(),
            ));
            let encoded = key
                .to_openssh(LineEnding::LF)
                .wrap_err("Error encoding secret key")?;
            fs::write(config.private_key_file.as_path(), encoded.as_bytes())
                .await
                .wrap_err("Error writing secret key file")?;
            key
        }
        Err(error) => return Err(error).wrap_err("Error reading secret key"),
    };
    let users = UserPolicy::load(config.users_file.as_path())
        .await
        .wrap_err("Error loading users file")?;
    let server = Arc::new(SshmuxServer::new(users, config.connection_timeout));
    serve(server, key, (config.listen_address, config.ssh_port)).await
}

// Accept user SSH connections for the given server until the listener fails.
pub async fn serve(
    server: Arc<SshmuxServer>,
    key: PrivateKey,
    address: (String, u16),
) -> color_eyre::Result<()> {
    let ssh_config = Arc::new(Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });
    info!(host = %address.0, port = address.1, "Listening for SSH connections.");
    let mut acceptor = Acceptor { server };
    acceptor
        .run_on_address(ssh_config, address)
        .await
        .wrap_err("Error listening to SSH port and address")?;
    Ok(())
}

struct Acceptor {
    server: Arc<SshmuxServer>,
}

impl russh::server::Server for Acceptor {
    type Handler = ServerHandler;

    fn new_client(&mut self, peer_address: Option<SocketAddr>) -> ServerHandler {
        ServerHandler::new(Arc::clone(&self.server), peer_address)
    }
}
