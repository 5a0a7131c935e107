use std::time::Duration;

/// Timing knobs for one master/slave connection.
///
/// Both ends of a connection should agree on `ping_interval` being
/// comfortably below `ping_max_delay`; the defaults leave one missed ping
/// of slack.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How often the connector sends a keepalive ping.
    pub ping_interval: Duration,
    /// Silence longer than this kills the connection.
    pub ping_max_delay: Duration,
    /// Deadline for the whole authentication handshake.
    pub auth_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            ping_max_delay: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(30),
        }
    }
}

impl LinkConfig {
    pub fn new(ping_interval: Duration, ping_max_delay: Duration) -> Self {
        Self {
            ping_interval,
            ping_max_delay,
            ..Default::default()
        }
    }
}
