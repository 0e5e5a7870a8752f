//! Server configuration

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Fake server configuration
///
/// Immutable once handed to [`crate::SshTestServer::new`]; every session reads it
/// through a shared `Arc`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen port. `None` picks a random port, `Some(0)` lets the OS choose.
    pub port: Option<u16>,
    /// Listen host
    pub host: String,
    /// Accept public-key authentication
    pub allow_key_auth: bool,
    /// Host key in OpenSSH/PEM form (generated when absent)
    pub private_key: Option<String>,
    /// Authorized client key in OpenSSH form (defaults to the host key's public half)
    pub public_key: Option<String>,
    /// Accept password authentication
    pub allow_password_auth: bool,
    pub username: String,
    pub password: String,
    /// Bytes written to the client when `command_match` is seen
    #[serde(deserialize_with = "string_bytes")]
    pub fake_response: Vec<u8>,
    /// Substring that triggers `fake_response`
    pub command_match: Option<String>,
    /// Additional trigger/response pairs, checked after `command_match`
    pub responses: Vec<FakeResponse>,
    /// What happens to real shell output while triggers are configured
    pub intercept_mode: InterceptMode,
    /// Shell spawned for each session
    pub shell: String,
    pub shell_args: Vec<String>,
    /// Client input chunks a session may hold before it is closed
    pub input_queue_depth: usize,
}

/// A canned response and the input substring that triggers it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FakeResponse {
    pub command_match: String,
    #[serde(deserialize_with = "string_bytes")]
    pub response: Vec<u8>,
}

impl FakeResponse {
    pub fn new(command_match: impl Into<String>, response: impl Into<Vec<u8>>) -> Self {
        Self {
            command_match: command_match.into(),
            response: response.into(),
        }
    }
}

/// Treatment of real shell output when triggers are configured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptMode {
    /// Drop shell output; the client only sees canned responses
    #[default]
    Replace,
    /// Forward shell output and inject canned responses alongside it
    Augment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: "0.0.0.0".to_string(),
            allow_key_auth: true,
            private_key: None,
            public_key: None,
            allow_password_auth: false,
            username: String::new(),
            password: String::new(),
            fake_response: Vec::new(),
            command_match: None,
            responses: Vec::new(),
            intercept_mode: InterceptMode::default(),
            shell: "bash".to_string(),
            shell_args: Vec::new(),
            input_queue_depth: 1024,
        }
    }
}

impl ServerConfig {
    /// Load a config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        tracing::info!(
            "loaded config from {} ({} triggers)",
            path.display(),
            config.rules().len()
        );

        Ok(config)
    }

    /// Set the primary trigger and its response
    pub fn with_fake_response(
        mut self,
        command_match: impl Into<String>,
        response: impl Into<Vec<u8>>,
    ) -> Self {
        self.command_match = Some(command_match.into());
        self.fake_response = response.into();
        self
    }

    /// All trigger rules in match priority order
    pub fn rules(&self) -> Vec<FakeResponse> {
        let primary = self
            .command_match
            .as_ref()
            .map(|m| FakeResponse::new(m.clone(), self.fake_response.clone()));

        primary
            .into_iter()
            .chain(self.responses.iter().cloned())
            .collect()
    }

    /// Reject configurations the server cannot serve
    pub fn validate(&self) -> Result<()> {
        if !self.allow_key_auth && !self.allow_password_auth {
            return Err(Error::InvalidConfig(
                "no authentication method enabled".to_string(),
            ));
        }
        if self.rules().iter().any(|r| r.command_match.is_empty()) {
            return Err(Error::InvalidConfig(
                "command match must not be empty".to_string(),
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(Error::InvalidConfig("shell must not be empty".to_string()));
        }
        if self.input_queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "input_queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn string_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    String::deserialize(deserializer).map(String::into_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(config.port.is_none());
        assert!(config.allow_key_auth);
        assert!(!config.allow_password_auth);
        assert_eq!(config.shell, "bash");
        assert!(config.rules().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rules_order() {
        let mut config = ServerConfig::default().with_fake_response("ls -lha", "this is a test");
        config.responses.push(FakeResponse::new("uname", "Linux"));

        let rules = config.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].command_match, "ls -lha");
        assert_eq!(rules[0].response, b"this is a test");
        assert_eq!(rules[1].command_match, "uname");
    }

    #[test]
    fn test_validate_rejects_empty_match() {
        let config = ServerConfig::default().with_fake_response("", "x");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_no_auth() {
        let config = ServerConfig {
            allow_key_auth: false,
            allow_password_auth: false,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let config = ServerConfig {
            input_queue_depth: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_parse_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 2222
            host = "127.0.0.1"
            allow_password_auth = true
            username = "joe"
            password = "user"
            command_match = "ls -lha"
            fake_response = "this is a test"
            intercept_mode = "augment"

            [[responses]]
            command_match = "whoami"
            response = "root"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, Some(2222));
        assert_eq!(config.username, "joe");
        assert_eq!(config.fake_response, b"this is a test");
        assert_eq!(config.intercept_mode, InterceptMode::Augment);
        assert_eq!(config.responses, vec![FakeResponse::new("whoami", "root")]);
        // unspecified fields fall back to defaults
        assert!(config.allow_key_auth);
        assert_eq!(config.shell, "bash");
    }
}
