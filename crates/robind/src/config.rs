use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level server configuration. Field names mirror the JSON keys
/// that operators write; every field has a default so an empty `{}` is
/// a working testing-MTA config.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_hostname")]
    pub hostname: String,

    #[serde(default = "ServerConfig::default_bind")]
    pub bind: String,

    /// Port 0 disables the listener
    #[serde(default = "ServerConfig::default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default = "ServerConfig::default_secure_port")]
    pub secure_port: u16,

    #[serde(default = "ServerConfig::default_submission_port")]
    pub submission_port: u16,

    #[serde(default = "ServerConfig::default_backlog")]
    pub backlog: u32,

    #[serde(default = "ServerConfig::default_minimum_pool_size")]
    pub minimum_pool_size: usize,

    #[serde(default = "ServerConfig::default_maximum_pool_size")]
    pub maximum_pool_size: usize,

    #[serde(
        default = "ServerConfig::default_thread_keep_alive_time",
        with = "duration_serde"
    )]
    pub thread_keep_alive_time: Duration,

    /// How many commands a session may issue before we hang up on it
    #[serde(default = "ServerConfig::default_transactions_limit")]
    pub transactions_limit: u32,

    /// How many syntax/sequence errors a session may accumulate
    #[serde(default = "ServerConfig::default_error_limit")]
    pub error_limit: u32,

    #[serde(default)]
    pub auth: bool,

    #[serde(default = "default_true")]
    pub starttls: bool,

    #[serde(default = "default_true")]
    pub chunking: bool,

    /// Advertised in EHLO as SIZE and enforced on message data
    #[serde(default)]
    pub size_limit: Option<u64>,

    /// PEM bundle holding the certificate chain and private key
    #[serde(default)]
    pub keystore: Option<PathBuf>,

    /// Either the literal password or the name of a file holding it
    #[serde(default, rename = "keystorepassword")]
    pub keystore_password: String,

    #[serde(
        default = "ServerConfig::default_read_timeout",
        with = "duration_serde"
    )]
    pub read_timeout: Duration,

    #[serde(default)]
    pub users: Vec<UserConfig>,

    #[serde(default)]
    pub scenarios: HashMap<String, ScenarioConfig>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub dovecot_auth: bool,

    #[serde(default = "ServerConfig::default_dovecot_auth_socket")]
    pub dovecot_auth_socket: PathBuf,

    /// Keys we don't understand are warned about at startup rather
    /// than rejected
    #[serde(flatten, skip_serializing)]
    pub unknown: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config is valid")
    }
}

impl ServerConfig {
    fn default_hostname() -> String {
        "robin.example.com".to_string()
    }
    fn default_bind() -> String {
        "::".to_string()
    }
    fn default_smtp_port() -> u16 {
        25
    }
    fn default_secure_port() -> u16 {
        465
    }
    fn default_submission_port() -> u16 {
        587
    }
    fn default_backlog() -> u32 {
        25
    }
    fn default_minimum_pool_size() -> usize {
        1
    }
    fn default_maximum_pool_size() -> usize {
        10
    }
    fn default_thread_keep_alive_time() -> Duration {
        Duration::from_secs(60)
    }
    fn default_transactions_limit() -> u32 {
        200
    }
    fn default_error_limit() -> u32 {
        3
    }
    fn default_read_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_dovecot_auth_socket() -> PathBuf {
        PathBuf::from("/run/dovecot/auth-userdb")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        for key in config.unknown.keys() {
            tracing::warn!("ignoring unknown config key {key:?}");
        }
        Ok(config)
    }

    pub fn user(&self, name: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.name == name)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UserConfig {
    pub name: String,
    #[serde(alias = "pass")]
    pub password: String,
}

/// Canned response overrides selected by greeting identity.
/// Each response string may carry `{$name}` magic tokens.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    /// Greeting values to match, per verb
    pub helo: Option<String>,
    pub lhlo: Option<String>,
    pub ehlo: Option<String>,

    /// If this doesn't start with 2 the TLS handshake is skipped
    pub starttls: Option<String>,
    pub mail: Option<String>,
    #[serde(default)]
    pub rcpt: Vec<RcptScenario>,
    pub data: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RcptScenario {
    /// The RCPT TO address this override applies to
    pub value: String,
    pub response: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "StorageConfig::default_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: Self::default_path(),
        }
    }
}

impl StorageConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("/tmp/store")
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "RelayConfig::default_port")]
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: None,
            port: Self::default_port(),
        }
    }
}

impl RelayConfig {
    fn default_port() -> u16 {
        25
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn empty_config_gets_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_equal!(config.smtp_port, 25);
        assert_equal!(config.secure_port, 465);
        assert_equal!(config.submission_port, 587);
        assert_equal!(config.backlog, 25);
        assert_equal!(config.transactions_limit, 200);
        assert_equal!(config.error_limit, 3);
        assert!(!config.auth);
        assert!(config.starttls);
        assert!(config.chunking);
        assert_equal!(config.read_timeout, Duration::from_secs(300));
    }

    #[test]
    fn camel_case_keys() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "hostname": "mx.test",
                "smtpPort": 2525,
                "maximumPoolSize": 4,
                "transactionsLimit": 10,
                "errorLimit": 1,
                "keystore": "/etc/robin/keys.pem",
                "keystorepassword": "hunter2",
                "threadKeepAliveTime": 30
            }"#,
        )
        .unwrap();
        assert_equal!(config.hostname, "mx.test");
        assert_equal!(config.smtp_port, 2525);
        assert_equal!(config.maximum_pool_size, 4);
        assert_equal!(config.keystore_password, "hunter2");
        assert_equal!(config.thread_keep_alive_time, Duration::from_secs(30));
    }

    #[test]
    fn users_and_scenarios() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "users": [{"name": "alice", "pass": "s3cret"}],
                "scenarios": {
                    "reject": {
                        "helo": "bad.example",
                        "rcpt": [{"value": "c@d", "response": "550 Blocked"}],
                        "data": "554 No thanks"
                    }
                }
            }"#,
        )
        .unwrap();
        assert_equal!(config.user("alice").unwrap().password.as_str(), "s3cret");
        assert!(config.user("bob").is_none());
        let scenario = &config.scenarios["reject"];
        assert_equal!(scenario.helo.as_deref(), Some("bad.example"));
        assert_equal!(scenario.rcpt[0].value.as_str(), "c@d");
    }

    #[test]
    fn unknown_keys_are_collected() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"mysteryKnob": 42}"#).unwrap();
        assert!(config.unknown.contains_key("mysteryKnob"));
    }
}
