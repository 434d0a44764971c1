//! Engine tunables.

use std::time::Duration;

/// Protocol versions this engine speaks, preferred first. Both carry
/// ping/pong keepalive; `pre1` has none and is not offered.
pub const SUPPORTED_VERSIONS: &[&str] = &["1", "pre2"];

/// Default length of generated session ids.
pub const SESSION_ID_LENGTH: usize = 17;

/// Per-connection timing and sizing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed to enqueue and flush one outbound write.
    pub write_wait: Duration,
    /// Time allowed between pongs from the peer.
    pub pong_wait: Duration,
    /// Keepalive ping period. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Maximum accepted inbound frame size in bytes.
    pub max_message_size: usize,
    /// Bound of the outbound queue; a producer that cannot enqueue within
    /// `write_wait` closes the connection.
    pub outbound_queue_size: usize,
    /// Envelopes buffered between the reader and the dispatch loop.
    pub inbound_queue_size: usize,
    /// Publication writes buffered ahead of the dispatch loop, across all
    /// subscriptions of a connection. A write that finds it full closes the
    /// connection.
    pub command_queue_size: usize,
    pub session_id_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size: 64 * 1024,
            outbound_queue_size: 256,
            inbound_queue_size: 64,
            command_queue_size: 1024,
            session_id_length: SESSION_ID_LENGTH,
        }
    }
}

/// Process-wide server options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Identifier sent in the `{server_id}` greeting.
    pub server_id: String,
    /// Admission limit; `None` admits every connection.
    pub max_connections: Option<usize>,
    /// Supported protocol versions, preferred first.
    pub supported_versions: Vec<String>,
    pub connection: ConnectionConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_id: "0".to_string(),
            max_connections: None,
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerOptions {
    /// The version proposed in `failed` when negotiation fails: the first
    /// version the client supports that we also support, else our preferred one.
    pub fn negotiate_fallback(&self, client_support: &[String]) -> String {
        client_support
            .iter()
            .find(|v| self.supported_versions.contains(*v))
            .or_else(|| self.supported_versions.first())
            .cloned()
            .unwrap_or_else(|| SUPPORTED_VERSIONS[0].to_string())
    }

    /// Whether `connect{version, support}` may proceed.
    pub fn accepts_version(&self, version: &str, client_support: &[String]) -> bool {
        self.supported_versions.iter().any(|v| v == version)
            && (client_support.is_empty() || client_support.iter().any(|v| v == version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_keepalive_constants() {
        let config = ConnectionConfig::default();
        assert_eq!(config.write_wait, Duration::from_secs(10));
        assert_eq!(config.pong_wait, Duration::from_secs(60));
        assert_eq!(config.ping_period, Duration::from_secs(54));
        assert!(config.ping_period < config.pong_wait);
    }

    #[test]
    fn test_version_negotiation() {
        let options = ServerOptions::default();
        assert!(options.accepts_version("1", &["pre1".into(), "1".into()]));
        assert!(options.accepts_version("1", &[]));
        assert!(!options.accepts_version("2", &["2".into()]));
        // Version not listed in the client's own support list
        assert!(!options.accepts_version("1", &["pre1".into()]));
        // No keepalive in pre1
        assert!(!options.accepts_version("pre1", &["pre1".into()]));
        assert!(options.accepts_version("pre2", &["pre2".into(), "pre1".into()]));

        assert_eq!(
            options.negotiate_fallback(&["7".into(), "pre2".into()]),
            "pre2"
        );
        assert_eq!(options.negotiate_fallback(&["7".into()]), "1");
        assert_eq!(options.negotiate_fallback(&["pre1".into()]), "1");
    }
}
