//! Configuration management

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Engine configuration, consumed once by [`crate::Server::new`]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Where to listen (`inet:port@host`, `inet6:port@host`, `unix:/path`)
    #[serde(default = "default_connection")]
    pub connection: String,
    /// Read/write timeout per stage, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Debug verbosity (0 = info, 1 = debug, 2+ = trace)
    #[serde(default)]
    pub debug: u8,
    /// Pin the largest accepted packet payload instead of following the
    /// negotiated chunk size
    #[serde(default)]
    pub max_payload: Option<usize>,
    /// Remove an existing Unix socket file before binding
    #[serde(default = "default_true")]
    pub remove_stale_socket: bool,
    /// Ask the agent not to send stages the filter has no handler for
    #[serde(default)]
    pub skip_unhandled_stages: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: default_connection(),
            timeout_secs: default_timeout_secs(),
            backlog: default_backlog(),
            debug: 0,
            max_payload: None,
            remove_stale_socket: true,
            skip_unhandled_stages: false,
        }
    }
}

// Default value functions
fn default_connection() -> String {
    "inet:8890@127.0.0.1".to_string()
}
fn default_timeout_secs() -> u64 {
    7210
}
fn default_backlog() -> u32 {
    128
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Parsed listen specification
    pub fn listen_spec(&self) -> Result<ConnSpec> {
        self.connection.parse()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_spec()?;
        if self.timeout_secs == 0 {
            return Err(Error::InvalidConfig("timeout must be positive".into()));
        }
        if self.backlog == 0 {
            return Err(Error::InvalidConfig("backlog must be positive".into()));
        }
        if self.max_payload == Some(0) {
            return Err(Error::InvalidConfig("max_payload must be positive".into()));
        }
        Ok(())
    }
}

/// Listening socket specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnSpec {
    Unix(PathBuf),
    Inet { host: String, port: u16 },
    Inet6 { host: String, port: u16 },
}

impl FromStr for ConnSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }

        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidConfig(format!("connection spec {s:?} has no scheme")))?;

        match scheme.to_ascii_lowercase().as_str() {
            "unix" | "local" => {
                if rest.is_empty() {
                    return Err(Error::InvalidConfig("unix socket path is empty".into()));
                }
                Ok(Self::Unix(PathBuf::from(rest)))
            }
            "inet" => {
                let (port, host) = parse_port_host(rest, "0.0.0.0")?;
                Ok(Self::Inet { host, port })
            }
            "inet6" => {
                let (port, host) = parse_port_host(rest, "::")?;
                let host = host
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .map(str::to_string)
                    .unwrap_or(host);
                Ok(Self::Inet6 { host, port })
            }
            other => Err(Error::InvalidConfig(format!(
                "unknown connection scheme {other:?}"
            ))),
        }
    }
}

fn parse_port_host(rest: &str, any: &str) -> Result<(u16, String)> {
    let (port, host) = match rest.split_once('@') {
        Some((port, host)) if !host.is_empty() => (port, host.to_string()),
        Some((port, _)) => (port, any.to_string()),
        None => (rest, any.to_string()),
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidConfig(format!("invalid port {port:?}")))?;
    Ok((port, host))
}

impl fmt::Display for ConnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Inet { host, port } => write!(f, "inet:{port}@{host}"),
            Self::Inet6 { host, port } => write!(f, "inet6:{port}@{host}"),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> String {
    r#"# Milter Engine Configuration
# Copy this file and customize for your setup

# Listening socket. One of:
#   inet:PORT@HOST    IPv4 (HOST defaults to all interfaces)
#   inet6:PORT@HOST   IPv6
#   unix:/PATH        Unix domain socket (also local:/PATH or plain /PATH)
# Postfix: smtpd_milters = inet:127.0.0.1:8890
# Sendmail: INPUT_MAIL_FILTER(`filter', `S=inet:8890@127.0.0.1')
connection: "inet:8890@127.0.0.1"

# Seconds to wait on the agent for each stage before giving up
timeout_secs: 7210

# Listen backlog
backlog: 128

# Debug verbosity: 0 = info, 1 = debug, 2 = trace
debug: 0

# Largest packet payload to accept (bytes). Leave unset to follow the
# chunk size negotiated with the agent.
# max_payload: 65535

# Remove a leftover Unix socket file before binding
remove_stale_socket: true

# Ask the agent not to send stages the filter does not handle
skip_unhandled_stages: false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_spec_forms() {
        assert_eq!(
            "unix:/var/run/f.sock".parse::<ConnSpec>().unwrap(),
            ConnSpec::Unix("/var/run/f.sock".into())
        );
        assert_eq!(
            "local:/tmp/f.sock".parse::<ConnSpec>().unwrap(),
            ConnSpec::Unix("/tmp/f.sock".into())
        );
        assert_eq!(
            "/tmp/f.sock".parse::<ConnSpec>().unwrap(),
            ConnSpec::Unix("/tmp/f.sock".into())
        );
        assert_eq!(
            "inet:8890@127.0.0.1".parse::<ConnSpec>().unwrap(),
            ConnSpec::Inet {
                host: "127.0.0.1".into(),
                port: 8890
            }
        );
        assert_eq!(
            "inet:10025".parse::<ConnSpec>().unwrap(),
            ConnSpec::Inet {
                host: "0.0.0.0".into(),
                port: 10025
            }
        );
        assert_eq!(
            "inet6:8890@[::1]".parse::<ConnSpec>().unwrap(),
            ConnSpec::Inet6 {
                host: "::1".into(),
                port: 8890
            }
        );
        assert_eq!(
            "inet6:8890".parse::<ConnSpec>().unwrap(),
            ConnSpec::Inet6 {
                host: "::".into(),
                port: 8890
            }
        );
    }

    #[test]
    fn test_conn_spec_errors() {
        for bad in ["", "tcp:25", "inet:", "inet:port@host", "inet:70000", "unix:", "8890"] {
            assert!(
                matches!(bad.parse::<ConnSpec>(), Err(Error::InvalidConfig(_))),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn test_conn_spec_display_roundtrip() {
        for spec in ["inet:8890@127.0.0.1", "inet6:25@::1", "unix:/tmp/x.sock"] {
            let parsed: ConnSpec = spec.parse().unwrap();
            assert_eq!(parsed.to_string(), spec);
        }
    }

    #[test]
    fn test_defaults_from_empty_document() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.connection, "inet:8890@127.0.0.1");
        assert_eq!(config.timeout(), Duration::from_secs(7210));
        assert_eq!(config.backlog, 128);
        assert_eq!(config.debug, 0);
        assert!(config.remove_stale_socket);
        assert!(!config.skip_unhandled_stages);
        config.validate().unwrap();
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = serde_yaml::from_str(&generate_example_config()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_payload, None);
    }

    #[test]
    fn test_validation() {
        let config = Config {
            timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            connection: "bogus".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("milter.yaml");
        let config = Config {
            connection: "unix:/run/milter.sock".into(),
            debug: 2,
            max_payload: Some(1_048_575),
            ..Config::default()
        };
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.connection, config.connection);
        assert_eq!(loaded.debug, 2);
        assert_eq!(loaded.max_payload, Some(1_048_575));
    }
}
