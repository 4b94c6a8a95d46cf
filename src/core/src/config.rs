use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{BerthError, Result};

/// Remote command sub-protocols, newest first.
pub const DEFAULT_REMOTE_COMMAND_PROTOCOLS: [&str; 4] = [
    "v4.channel.k8s.io",
    "v3.channel.k8s.io",
    "v2.channel.k8s.io",
    "channel.k8s.io",
];

/// Port-forward sub-protocols.
pub const DEFAULT_PORT_FORWARD_PROTOCOLS: [&str; 1] = ["portforward.k8s.io"];

/// Daemon configuration file root
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// CRI streaming server settings
    pub streaming: StreamingConfig,

    /// Log level used when `RUST_LOG` is unset
    pub log_level: LogLevel,
}

impl DaemonConfig {
    /// Load a YAML configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BerthError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: DaemonConfig = serde_yaml::from_str(&raw)?;
        config.streaming.validate()?;
        Ok(config)
    }
}

/// CRI streaming server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Address the streaming HTTP server listens on
    pub addr: SocketAddr,

    /// Prefix of issued URLs (defaults to `http://<addr>`)
    pub base_url: Option<String>,

    /// Idle timeout of an upgraded session in seconds
    pub stream_idle_timeout_secs: u64,

    /// How long a client may take to open all sub-streams, in seconds
    pub stream_creation_timeout_secs: u64,

    /// Remote command protocols the server accepts
    pub supported_remote_command_protocols: Vec<String>,

    /// Port-forward protocols the server accepts
    pub supported_port_forward_protocols: Vec<String>,

    /// Lifetime of an issued token in seconds
    pub request_cache_ttl_secs: u64,

    /// Maximum number of live tokens
    pub max_in_flight: usize,

    /// SPDY keep-alive ping period in seconds (0 = disabled)
    pub ping_period_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 10010)),
            base_url: None,
            stream_idle_timeout_secs: 4 * 60 * 60,
            stream_creation_timeout_secs: 30,
            supported_remote_command_protocols: DEFAULT_REMOTE_COMMAND_PROTOCOLS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            supported_port_forward_protocols: DEFAULT_PORT_FORWARD_PROTOCOLS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            request_cache_ttl_secs: 60,
            max_in_flight: 1000,
            ping_period_secs: 0,
        }
    }
}

impl StreamingConfig {
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn stream_creation_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_creation_timeout_secs)
    }

    pub fn request_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.request_cache_ttl_secs)
    }

    /// Keep-alive period, `None` when pings are disabled.
    pub fn ping_period(&self) -> Option<Duration> {
        (self.ping_period_secs > 0).then(|| Duration::from_secs(self.ping_period_secs))
    }

    /// URL prefix for issued streaming URLs, without a trailing slash.
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.addr),
        }
    }

    /// Reject settings the streaming server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.supported_remote_command_protocols.is_empty() {
            return Err(BerthError::Config(
                "supported_remote_command_protocols must not be empty".to_string(),
            ));
        }
        if let Some(unknown) = self
            .supported_remote_command_protocols
            .iter()
            .find(|name| !DEFAULT_REMOTE_COMMAND_PROTOCOLS.contains(&name.as_str()))
        {
            return Err(BerthError::Config(format!(
                "unknown remote command protocol {:?}",
                unknown
            )));
        }
        if self.supported_port_forward_protocols.is_empty() {
            return Err(BerthError::Config(
                "supported_port_forward_protocols must not be empty".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(BerthError::Config("max_in_flight must be > 0".to_string()));
        }
        if self.stream_creation_timeout_secs == 0 || self.request_cache_ttl_secs == 0 {
            return Err(BerthError::Config(
                "stream_creation_timeout_secs and request_cache_ttl_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_streaming_defaults() {
        let config = StreamingConfig::default();
        assert_eq!(config.stream_creation_timeout(), Duration::from_secs(30));
        assert_eq!(config.request_cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.max_in_flight, 1000);
        assert_eq!(config.ping_period(), None);
        assert_eq!(config.supported_remote_command_protocols[0], "v4.channel.k8s.io");
        assert_eq!(config.supported_port_forward_protocols, vec!["portforward.k8s.io"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_url_from_addr() {
        let config = StreamingConfig::default();
        assert_eq!(config.base_url(), "http://127.0.0.1:10010");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let config = StreamingConfig {
            base_url: Some("https://node-1:10250/cri/".to_string()),
            ..Default::default()
        };
        assert_eq!(config.base_url(), "https://node-1:10250/cri");
    }

    #[test]
    fn test_validate_rejects_empty_protocols() {
        let config = StreamingConfig {
            supported_port_forward_protocols: vec![],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BerthError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_remote_command_protocol() {
        let config = StreamingConfig {
            supported_remote_command_protocols: vec![
                "v4.channel.k8s.io".to_string(),
                "v5.channel.k8s.io".to_string(),
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("v5.channel.k8s.io"));

        let config = StreamingConfig {
            supported_remote_command_protocols: vec!["channel.k8s.io".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = StreamingConfig {
            max_in_flight: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "log_level: debug\nstreaming:\n  addr: 0.0.0.0:9000\n  max_in_flight: 5\n  ping_period_secs: 10"
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.streaming.addr.port(), 9000);
        assert_eq!(config.streaming.max_in_flight, 5);
        assert_eq!(config.streaming.ping_period(), Some(Duration::from_secs(10)));
        assert_eq!(config.streaming.stream_creation_timeout_secs, 30);
    }

    #[test]
    fn test_load_missing_file() {
        let err = DaemonConfig::load(Path::new("/nonexistent/berth.yaml")).unwrap_err();
        assert!(matches!(err, BerthError::Config(_)));
    }

    #[test]
    fn test_log_level_into_tracing() {
        let level: tracing::Level = LogLevel::Warn.into();
        assert_eq!(level, tracing::Level::WARN);
    }
}
