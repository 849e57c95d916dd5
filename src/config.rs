use std::time::Duration;

/// Largest safe UDP datagram size we will ever send.
pub const UDP_DATAGRAM_MAX_SIZE: usize = 508;

/// BitDust header is 14 bytes for a DATA datagram (1 version + 1 command
/// + 4 stream_id + 4 total_size + 4 block_id), leaving this much room
/// for payload per block.
pub const BLOCK_SIZE: usize = UDP_DATAGRAM_MAX_SIZE - 14;

/// One outgoing ACK is expected per this many received blocks.
pub const BLOCKS_PER_ACK: usize = 8;

/// Backpressure ceiling for a send stream's buffered-but-unacked bytes.
pub const OUTPUT_BUFFER_SIZE: usize = 16 * 1024;

/// Companion backpressure ceiling expressed in outstanding blocks
/// (`next_block_id - highest_contiguous_acked`).
pub const MAX_OUTSTANDING_BLOCKS: usize = BLOCKS_PER_ACK * 10;

pub const RTT_MIN: Duration = Duration::from_millis(4);
pub const RTT_MAX: Duration = Duration::from_secs(3);

/// Used to cap and halve the running RTT average so it tracks recent
/// behavior instead of drifting toward a lifetime mean.
pub const MAX_RTT_SAMPLES: f64 = 100.0;

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const GREETING_TIMEOUT: Duration = Duration::from_secs(30);
pub const ACK_TIMEOUT_LIMIT: u32 = 5;

pub const SESSION_PING_PERIOD: Duration = Duration::from_secs(1);
pub const SESSION_GREETING_PERIOD: Duration = Duration::from_secs(1);
pub const SESSION_ALIVE_PERIOD: Duration = Duration::from_secs(10);

/// Software version byte. Bumped relative to the original implementation
/// to document that this build fixes all multi-byte header fields to
/// network byte order (big-endian) -- see SPEC_FULL.md open question.
pub const SOFTWARE_VERSION: u8 = 2;

pub const SENDING_LIMIT_FACTOR_ON_START: f64 = 1.0;

/// Process-wide configuration: the two global rate budgets plus the
/// scheduler tick period. Everything else is a fixed protocol constant
/// above and is not meant to be tuned per-process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportConfig {
    pub global_in_limit_bytes_per_sec: f64,
    pub global_out_limit_bytes_per_sec: f64,
    pub tick_period: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            global_in_limit_bytes_per_sec: 125_000_000.0,
            global_out_limit_bytes_per_sec: 125_000_000.0,
            tick_period: Duration::from_millis(50),
        }
    }
}

impl TransportConfig {
    pub fn with_global_limits(mut self, in_bps: f64, out_bps: f64) -> Self {
        self.global_in_limit_bytes_per_sec = in_bps;
        self.global_out_limit_bytes_per_sec = out_bps;
        self
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }
}
