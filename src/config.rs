use std::time::Duration;

/// Wire-format constants fixed by `spec.md` §6.2.
pub const FRAME_H_SIZE: usize = 9;
pub const PACKET_H_MAX_SIZE: usize = 13;
pub const MAX_PACKET_SIZE: usize = 8 * 1024;

/// Tunable knobs for a `Connection`. Production code should use
/// `ConnectionConfig::default()`; tests override `tick_interval` to avoid
/// sleeping for real time.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_packet_size: usize,
    pub tick_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            tick_interval: Duration::from_millis(10),
        }
    }
}
