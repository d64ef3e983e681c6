//! Timing constants and rate-relative timeout helpers.

use crate::console::CONSOLE_TX_DMA_BUF_LEN;

/// Per-transfer timeout handed to blocking UART transmits.
pub const CONSOLE_TIMEOUT_MS: u32 = 10;

/// Main loop idle delay between service cycles.
pub const SUPERLOOP_DELAY_MS: u32 = 5;

/// Setup mode ends unconditionally after this long.
pub const SETUP_MODE_MAX_MS: u32 = 60_000;
/// Setup mode ends early after this much console idle time.
pub const SETUP_MODE_IDLE_MS: u32 = 2_500;

/// A timeout expressed as an amount of data, resolved against the link
/// rate at the call site. Keeps the deadline meaningful if the console
/// baud rate changes per board.
#[derive(Debug, Clone, Copy)]
pub struct RateRelativeTimeout {
    bytes: usize,
}

impl RateRelativeTimeout {
    pub const fn from_bytes(bytes: usize) -> Self {
        Self { bytes }
    }

    /// Milliseconds to move `bytes` over an 8N1 serial link at `baud`,
    /// rounded up.
    pub const fn at_baud_8n1(self, baud: u32) -> u32 {
        let bits = self.bytes as u64 * 10 * 1000;
        let ms = bits.div_ceil(baud as u64);
        ms as u32
    }
}

/// Worst-case time to flush one full DMA batch of console output.
pub const TX_DMA_DRAIN: RateRelativeTimeout =
    RateRelativeTimeout::from_bytes(CONSOLE_TX_DMA_BUF_LEN);
