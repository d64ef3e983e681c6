//! Hardware seam.
//!
//! Everything the firmware core needs from a board goes through the
//! [`Board`] trait: UART transmit (polled or DMA), the RTC, reset-status
//! readout, LEDs, and the various ways of leaving the application. The
//! backup cells come in through the [`BackupRegisters`] supertrait.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::backup::{BackupRegisters, CanLoaderParams};
use crate::clock::DateTime;

/// LEDs the `led` command drives.
pub const LED_COUNT: usize = 4;

/// Static per-board configuration captured once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BoardConfig {
    /// Console UART baud rate.
    pub baud_rate: u32,
    /// Milliseconds added to the timebase per tick interrupt.
    pub tick_freq: u32,
    /// Hardware revision identifier reported by `version`.
    pub hardware_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration checksum mismatch")]
    ChecksumMismatch,
}

/// [`BoardConfig`] plus a CRC taken at capture time. The main loop
/// re-verifies it every cycle; a mismatch means memory corruption and
/// the only safe answer is to stop.
pub struct CheckedConfig {
    config: BoardConfig,
    checksum: u32,
}

impl CheckedConfig {
    pub fn capture(config: BoardConfig) -> Self {
        Self {
            config,
            checksum: crc32fast::hash(bytemuck::bytes_of(&config)),
        }
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if crc32fast::hash(bytemuck::bytes_of(&self.config)) == self.checksum {
            Ok(())
        } else {
            Err(ConfigError::ChecksumMismatch)
        }
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&mut self) {
        self.config.baud_rate ^= 0x8000_0000;
    }
}

/// What a board must provide. Methods with defaults are optional
/// capabilities; a board without TX DMA or LEDs just leaves them alone.
pub trait Board: BackupRegisters {
    fn config(&self) -> BoardConfig;

    /// Blocking transmit with a millisecond timeout. Returns `false` if
    /// the hardware gave up before everything went out.
    fn uart_transmit(&mut self, bytes: &[u8], timeout_ms: u32) -> bool;

    fn uart_dma_available(&self) -> bool {
        false
    }

    fn uart_dma_busy(&mut self) -> bool {
        false
    }

    /// Starts a DMA transfer; the data must go out before the next call.
    fn uart_transmit_dma(&mut self, bytes: &[u8]) -> bool {
        let _ = bytes;
        false
    }

    fn rtc_read(&mut self) -> DateTime;

    fn rtc_write(&mut self, datetime: &DateTime);

    /// Raw reset-status register, latched from before the flags were
    /// cleared for the next reset.
    fn reset_cause_raw(&mut self) -> u32;

    /// Drives the board LEDs; `levels` holds [`LED_COUNT`] entries,
    /// zero for off. Returns `false` on boards without LEDs.
    fn set_leds(&mut self, levels: &[u32]) -> bool {
        let _ = levels;
        false
    }

    fn system_reset(&mut self) -> !;

    fn jump_to_loader(&mut self) -> !;

    fn jump_to_can_loader(&mut self, params: CanLoaderParams) -> !;

    fn power_off(&mut self) -> !;

    /// Last resort when continuing could do damage. Never returns.
    fn fatal_halt(&mut self) -> !;
}
