use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct User {
    pub name: String,
    pub password: String,
}

/// PEM files for the TLS listener.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Password of an encrypted PKCS#8 key.
    #[serde(default)]
    pub key_password: Option<String>,
    /// When set, clients must present a certificate issued by this CA.
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
}

/// Broker configuration, usually read from a TOML file:
///
/// ```toml
/// vhosts = ["/", "staging"]
///
/// [[users]]
/// name = "elex"
/// password = "test"
///
/// [tls]
/// cert = "certs/server.crt"
/// key = "certs/server.key"
/// client_ca = "certs/ca.crt"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub users: Vec<User>,
    pub vhosts: Vec<String>,
    pub tls: Option<TlsFiles>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            users: vec![User {
                name: "guest".into(),
                password: "guest".into(),
            }],
            vhosts: vec!["/".into()],
            tls: None,
        }
    }
}

impl BrokerConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        if config.vhosts.is_empty() {
            return Err(Error::Config("at least one vhost is required".into()));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn with_user(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.push(User {
            name: name.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhosts.push(vhost.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = BrokerConfig::from_toml("").unwrap();
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn reads_users_vhosts_and_tls() {
        let config = BrokerConfig::from_toml(
            r#"
            vhosts = ["/", "staging"]

            [[users]]
            name = "elex"
            password = "test"

            [tls]
            cert = "server.crt"
            key = "server.key"
            "#,
        )
        .unwrap();

        assert_eq!(config.vhosts, vec!["/", "staging"]);
        assert_eq!(config.users[0].name, "elex");
        let tls = config.tls.unwrap();
        assert_eq!(tls.cert, PathBuf::from("server.crt"));
        assert_eq!(tls.client_ca, None);
    }

    #[test]
    fn rejects_empty_vhost_list_and_bad_toml() {
        assert!(matches!(BrokerConfig::from_toml("vhosts = []"), Err(Error::Config(_))));
        assert!(matches!(BrokerConfig::from_toml("users = 3"), Err(Error::Config(_))));
    }
}
