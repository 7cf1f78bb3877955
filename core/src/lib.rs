pub mod config;
pub mod events;
pub mod frame;
pub mod metrics;
pub mod sink;
pub mod tls;

pub use frame::{Frame, FrameError, FrameReassembler};
pub use sink::{LogLayout, Sink};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
