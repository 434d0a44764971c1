use std::env;
use std::time::Duration;

use ddp::{ConnectionConfig, ServerOptions};
use thiserror::Error;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3000)
    pub port: u16,
    /// WebSocket endpoint path (default: /websocket)
    pub ddp_path: String,
    /// Identifier sent to clients right after accept (default: 0)
    pub server_id: String,
    /// Keepalive ping period (default: 54s)
    pub ping_period: Duration,
    /// Time allowed between client pongs (default: 60s)
    pub pong_wait: Duration,
    /// Time allowed for one outbound write (default: 10s)
    pub write_wait: Duration,
    /// Largest accepted inbound message in bytes (default: 64 KiB)
    pub max_message_bytes: usize,
    /// Outbound queue capacity per connection (default: 256)
    pub outbound_queue: usize,
    /// Connection admission limit (default: unlimited)
    pub max_connections: Option<usize>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = ConnectionConfig::default();

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let ddp_path = lookup("DDP_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| if v.starts_with('/') { v } else { format!("/{}", v) })
            .unwrap_or_else(|| "/websocket".to_string());

        let server_id = lookup("DDP_SERVER_ID").unwrap_or_else(|| "0".to_string());

        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let pong_wait = secs("DDP_PONG_WAIT_SECS", defaults.pong_wait);
        // The ping period follows pong_wait unless set explicitly
        let ping_period = secs("DDP_PING_PERIOD_SECS", pong_wait * 9 / 10);
        let write_wait = secs("DDP_WRITE_WAIT_SECS", defaults.write_wait);

        if ping_period >= pong_wait {
            return Err(ConfigError::InvalidKeepalive {
                ping_period,
                pong_wait,
            });
        }

        let max_message_bytes = lookup("DDP_MAX_MESSAGE_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_message_size);

        let outbound_queue = lookup("DDP_OUTBOUND_QUEUE")
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.outbound_queue_size);

        let max_connections = lookup("DDP_MAX_CONNECTIONS").and_then(|v| v.parse().ok());

        Ok(Config {
            host,
            port,
            ddp_path,
            server_id,
            ping_period,
            pong_wait,
            write_wait,
            max_message_bytes,
            outbound_queue,
            max_connections,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine options derived from this configuration
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            server_id: self.server_id.clone(),
            max_connections: self.max_connections,
            connection: ConnectionConfig {
                write_wait: self.write_wait,
                pong_wait: self.pong_wait,
                ping_period: self.ping_period,
                max_message_size: self.max_message_bytes,
                outbound_queue_size: self.outbound_queue,
                ..ConnectionConfig::default()
            },
            ..ServerOptions::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid PORT environment variable")]
    InvalidPort,
    #[error("ping period {ping_period:?} must be shorter than pong wait {pong_wait:?}")]
    InvalidKeepalive {
        ping_period: Duration,
        pong_wait: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:3000");
        assert_eq!(config.ddp_path, "/websocket");
        assert_eq!(config.server_id, "0");
        assert_eq!(config.ping_period, Duration::from_secs(54));
        assert_eq!(config.pong_wait, Duration::from_secs(60));
        assert_eq!(config.max_connections, None);

        let options = config.server_options();
        assert_eq!(options.connection.max_message_size, 64 * 1024);
        assert_eq!(options.connection.outbound_queue_size, 256);
        assert_eq!(options.supported_versions, vec!["1", "pre2"]);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PORT", "4000"),
            ("DDP_PATH", "ddp"),
            ("DDP_PONG_WAIT_SECS", "20"),
            ("DDP_MAX_CONNECTIONS", "5"),
            ("DDP_OUTBOUND_QUEUE", "garbage"),
        ])
        .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.ddp_path, "/ddp");
        assert_eq!(config.pong_wait, Duration::from_secs(20));
        assert_eq!(config.ping_period, Duration::from_secs(18));
        assert_eq!(config.max_connections, Some(5));
        assert_eq!(config.outbound_queue, 256);
    }

    #[test]
    fn test_invalid_port() {
        assert!(matches!(load(&[("PORT", "http")]), Err(ConfigError::InvalidPort)));
    }

    #[test]
    fn test_ping_must_be_shorter_than_pong_wait() {
        let err = load(&[("DDP_PING_PERIOD_SECS", "60"), ("DDP_PONG_WAIT_SECS", "30")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKeepalive { .. }));
    }
}
