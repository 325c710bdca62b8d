use std::{collections::HashMap, path::Path};

use russh::keys::{HashAlg, PublicKey, ssh_key::Fingerprint};
use serde::Deserialize;
use tokio::fs;

use crate::{error::ServerError, remote::Remote};

// On-disk form of the users file.
#[derive(Debug, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<UserEntry>,
    #[serde(default)]
    remotes: Vec<RemoteEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    name: String,
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteEntry {
    #[serde(flatten)]
    remote: Remote,
    // User names permitted to reach this remote. Absent means everyone.
    #[serde(default)]
    users: Option<Vec<String>>,
}

// Authentication and authorization policy loaded from the users file:
// which public keys identify which user, and which remotes each user may
// reach.
#[derive(Debug)]
pub struct UserPolicy {
    user_fingerprints: HashMap<String, Vec<Fingerprint>>,
    remotes: Vec<RemoteEntry>,
}

impl UserPolicy {
    pub async fn load(path: &Path) -> color_eyre::Result<Self> {
        let data = match fs::read_to_string(path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::MissingFile(path.to_path_buf()).into());
            }
            Err(error) => return Err(error.into()),
        };
        Ok(Self::from_json(&data)?)
    }

    pub fn from_json(data: &str) -> Result<Self, ServerError> {
        let file: UsersFile = serde_json::from_str(data)
            .map_err(|error| ServerError::InvalidUsersFile(error.to_string()))?;
        let mut user_fingerprints: HashMap<String, Vec<Fingerprint>> = HashMap::new();
        for user in file.users {
            let fingerprints = user_fingerprints.entry(user.name).or_default();
            for line in &user.keys {
                let key = PublicKey::from_openssh(line).map_err(|error| {
                    ServerError::InvalidUsersFile(format!("invalid public key ({error})"))
                })?;
                fingerprints.push(key.fingerprint(HashAlg::Sha256));
            }
        }
        let mut remotes = file.remotes;
        for entry in &mut remotes {
            if entry.remote.description.is_empty() {
                entry.remote.description = entry.remote.address.clone();
            }
        }
        Ok(UserPolicy {
            user_fingerprints,
            remotes,
        })
    }

    // Whether the offered public key belongs to the claimed user.
    pub(crate) fn authenticate(&self, user: &str, key: &PublicKey) -> bool {
        let fingerprint = key.fingerprint(HashAlg::Sha256);
        self.user_fingerprints
            .get(user)
            .is_some_and(|fingerprints| fingerprints.contains(&fingerprint))
    }

    // The remotes the given user is permitted to reach, in declaration order.
    pub(crate) fn remotes_for(&self, user: &str) -> Vec<Remote> {
        self.remotes
            .iter()
            .filter(|entry| {
                entry
                    .users
                    .as_ref()
                    .is_none_or(|users| users.iter().any(|name| name == user))
            })
            .map(|entry| entry.remote.clone())
            .collect()
    }
}

#[cfg(test)]
mod user_policy_tests {
    use russh::keys::{HashAlg, parse_public_key_base64};

    use super::UserPolicy;

    static POLICY: &str = r#"{
        "users": [
            {
                "name": "alice",
                "keys": [
                    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMYVfXHTqf3/0W8ZQ/I8zmMirvmosV78n1qtYgVQX58W key1"
                ]
            }
        ],
        "remotes": [
            {
                "address": "10.0.0.5:22",
                "description": "db server",
                "names": ["10.0.0.5:22", "db:22"]
            },
            {
                "address": "10.0.0.9:22",
                "username": "root",
                "users": ["bob"]
            }
        ]
    }"#;

    #[test]
    fn authenticates_declared_keys() {
        let policy = UserPolicy::from_json(POLICY).unwrap();
        let known = parse_public_key_base64(
            "AAAAC3NzaC1lZDI1NTE5AAAAIMYVfXHTqf3/0W8ZQ/I8zmMirvmosV78n1qtYgVQX58W",
        )
        .unwrap();
        let unknown = parse_public_key_base64(
            "AAAAC3NzaC1lZDI1NTE5AAAAIFlIvi8Fw1QvxpkRuAMiBKGL84r2wlgxTj7iOzXWBeU4",
        )
        .unwrap();
        assert!(policy.authenticate("alice", &known));
        assert!(!policy.authenticate("alice", &unknown));
        assert!(!policy.authenticate("bob", &known));
        // Sanity check that the fingerprints differ to begin with.
        assert_ne!(
            known.fingerprint(HashAlg::Sha256),
            unknown.fingerprint(HashAlg::Sha256)
        );
    }

    #[test]
    fn filters_remotes_by_user() {
        let policy = UserPolicy::from_json(POLICY).unwrap();
        let alice = policy.remotes_for("alice");
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].address, "10.0.0.5:22");
        let bob = policy.remotes_for("bob");
        assert_eq!(bob.len(), 2);
        assert_eq!(bob[1].username.as_deref(), Some("root"));
    }

    #[test]
    fn defaults_description_to_address() {
        let policy = UserPolicy::from_json(POLICY).unwrap();
        let bob = policy.remotes_for("bob");
        assert_eq!(bob[1].description, "10.0.0.9:22");
    }

    #[test]
    fn rejects_malformed_keys() {
        let result = UserPolicy::from_json(
            r#"{ "users": [{ "name": "alice", "keys": ["not a key"] }] }"#,
        );
        assert!(result.is_err());
    }
}
