use std::time::Duration;

/// Session tunables.
///
/// The defaults match the protocol's conventional values; sessions on both
/// sides of a connection do not need to agree on them, except that a
/// sender honouring a larger `max_message_size` than its peer accepts will
/// have the session terminated by that peer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on one frame's payload, in bytes.
    pub max_message_size: usize,
    /// Target number of per-direction buffer slots. The actual count may
    /// be lower when the memory manager declines reservations.
    pub max_buffers: usize,
    /// How long the receive loop tolerates a slow consumer stalling it
    /// before resetting the offending stream.
    pub receive_timeout: Duration,
    /// Budget for emitting a Close or Reset frame before giving up.
    pub reset_stream_timeout: Duration,
    /// Maximum delay the send loop may introduce to batch adjacent frames
    /// into one transport write.
    pub write_coalesce_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 1 << 20,
            max_buffers: 4,
            receive_timeout: Duration::from_secs(5),
            reset_stream_timeout: Duration::from_secs(120),
            write_coalesce_delay: Duration::from_micros(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_conventions() {
        let config = Config::default();
        assert_eq!(config.max_message_size, 1 << 20);
        assert_eq!(config.max_buffers, 4);
        assert_eq!(config.receive_timeout, Duration::from_secs(5));
        assert_eq!(config.reset_stream_timeout, Duration::from_secs(120));
        assert_eq!(config.write_coalesce_delay, Duration::from_micros(100));
    }
}
