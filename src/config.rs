use std::{path::PathBuf, time::Duration};

use clap::Parser;

// CLI configuration for sshmux.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen on for SSH connections from users.
    #[arg(long, default_value_t = String::from("127.0.0.1"), value_name = "ADDRESS")]
    pub listen_address: String,

    /// Port to listen on for SSH connections from users.
    #[arg(long, default_value_t = 2222, value_name = "PORT")]
    pub ssh_port: u16,

    /// File path to the server's secret key. If missing, it will be created for you.
    #[arg(long, default_value_os = "./sshmux_ed25519", value_name = "FILE")]
    pub private_key_file: PathBuf,

    /// JSON file declaring the authorized users, their public keys, and the
    /// remote hosts each of them is permitted to reach.
    #[arg(long, default_value_os = "./users.json", value_name = "FILE")]
    pub users_file: PathBuf,

    /// How long to wait for the SSH handshake with a remote host before
    /// giving up.
    #[arg(
        long,
        default_value = "10s",
        value_parser = parse_duration,
        value_name = "DURATION"
    )]
    pub connection_timeout: Duration,
}

fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    value.parse::<humantime::Duration>().map(Into::into)
}

#[cfg(test)]
mod application_config_tests {
    use std::time::Duration;

    use clap::Parser;

    use super::ApplicationConfig;

    #[test]
    fn parses_default_config() {
        let config = ApplicationConfig::parse_from(["sshmux"]);
        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
    }

    #[test]
    fn parses_human_readable_timeout() {
        let config =
            ApplicationConfig::parse_from(["sshmux", "--connection-timeout", "1m 30s"]);
        assert_eq!(config.connection_timeout, Duration::from_secs(90));
    }

    #[test]
    fn rejects_invalid_timeout() {
        let result =
            ApplicationConfig::try_parse_from(["sshmux", "--connection-timeout", "never"]);
        assert!(result.is_err());
    }
}
