//! Non-volatile flag cells.
//!
//! Six 32-bit backup registers survive a core reset (but not a power
//! cycle) and carry one-shot requests across reboots: "enter the loader",
//! "enter setup mode", the reason the watchdog last bit, and so on. Most
//! cells hold a fixed magic value so that random post-power-up garbage is
//! not mistaken for a request; the watchdog and CAN-loader cells pack a
//! payload next to their tag.

use proc_bitfield::bitfield;
use thiserror::Error;

/// Number of backup cells the store manages.
pub const BACKUP_REGISTER_COUNT: usize = 6;

/// Whole-word magic: jump to the ROM loader on next boot.
pub const LOADER_FLAG: u32 = 0xC3;
/// Whole-word magic: enter setup mode on next boot.
pub const SETUP_FLAG: u32 = 0xF9;
/// Tag byte: watchdog fired while the application was running.
pub const WATCHDOG_TAG: u8 = 0x5A;
/// Tag byte: watchdog fired while the CAN loader was running.
pub const CAN_WATCHDOG_TAG: u8 = 0x39;
/// Tag byte marking the CAN-loader cell as populated. Doubles as the
/// "parameters are present" indicator for the baud/termination payload.
pub const CAN_LOADER_TAG: u8 = 0x1B;

/// General-purpose flag codes carried in the shared cell.
pub const FLASH_ERASE_FLAG: u32 = 0x3C;
pub const LOG_PRINT_FLAG: u32 = 0x6C;
pub const HARD_FAULT_FLAG: u32 = 0xFF;

/// The backup cells, by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum BackupRegister {
    /// Loader request (whole word) or watchdog record (tagged word).
    /// The two uses never overlap: the loader flag is written on the way
    /// into a deliberate reset, the watchdog record by the fault path.
    LoaderWatchdog = 0,
    Setup = 1,
    Serial = 2,
    ResetCause = 3,
    General = 4,
    CanLoader = 5,
}

/// Hardware seam for the backup cells. The firmware core never touches
/// registers directly; boards (and the test double) implement this.
pub trait BackupRegisters {
    fn read(&mut self, reg: BackupRegister) -> u32;
    fn write(&mut self, reg: BackupRegister, value: u32);
}

bitfield! {
    /// Watchdog record: faulting program counter in the low 24 bits,
    /// context tag in the high byte.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct WatchdogWord(pub u32): Debug, FromStorage, IntoStorage {
        pub pc: u32 @ 0..=23,
        pub tag: u8 @ 24..=31,
    }
}

bitfield! {
    /// CAN-loader request: tag in the low byte, bus termination nibble,
    /// baud rate in the high half.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CanLoaderWord(pub u32): Debug, FromStorage, IntoStorage {
        pub tag: u8 @ 0..=7,
        pub termination: u8 @ 8..=11,
        pub baudrate: u16 @ 16..=31,
    }
}

/// Parameters handed to the CAN loader on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanLoaderParams {
    pub baudrate: u16,
    pub termination: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlagError {
    /// The general flag cell only holds one pending code at a time.
    #[error("flag register already holds a value")]
    AlreadySet,
}

/// Why the core last reset, decoded from the raw reset-status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    OptionByteLoader,
    LowPower,
    WindowWatchdog,
    IndependentWatchdog,
    Software,
    PowerOn,
    ExternalPin,
    Unknown,
}

impl ResetCause {
    const OBL: u32 = 1 << 25;
    const PIN: u32 = 1 << 26;
    const POR: u32 = 1 << 27;
    const SFT: u32 = 1 << 28;
    const IWDG: u32 = 1 << 29;
    const WWDG: u32 = 1 << 30;
    const LPWR: u32 = 1 << 31;

    /// Decodes a raw status word. Several bits are commonly set at once
    /// (a power-on also latches the pin bit), so the checks run in a
    /// fixed priority order.
    pub fn decode(raw: u32) -> Self {
        if raw & Self::OBL != 0 {
            ResetCause::OptionByteLoader
        } else if raw & Self::LPWR != 0 {
            ResetCause::LowPower
        } else if raw & Self::WWDG != 0 {
            ResetCause::WindowWatchdog
        } else if raw & Self::IWDG != 0 {
            ResetCause::IndependentWatchdog
        } else if raw & Self::SFT != 0 {
            ResetCause::Software
        } else if raw & Self::POR != 0 {
            ResetCause::PowerOn
        } else if raw & Self::PIN != 0 {
            ResetCause::ExternalPin
        } else {
            ResetCause::Unknown
        }
    }
}

impl core::fmt::Display for ResetCause {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ResetCause::OptionByteLoader => "option byte loader",
            ResetCause::LowPower => "low power",
            ResetCause::WindowWatchdog => "window watchdog",
            ResetCause::IndependentWatchdog => "independent watchdog",
            ResetCause::Software => "software",
            ResetCause::PowerOn => "power on",
            ResetCause::ExternalPin => "external pin",
            ResetCause::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Typed view over a board's backup cells. Borrow one wherever a flag
/// needs reading or writing; it holds no state of its own.
pub struct FlagStore<'a, S: BackupRegisters + ?Sized> {
    regs: &'a mut S,
}

impl<'a, S: BackupRegisters + ?Sized> FlagStore<'a, S> {
    pub fn new(regs: &'a mut S) -> Self {
        Self { regs }
    }

    pub fn set_loader_flag(&mut self) {
        self.regs.write(BackupRegister::LoaderWatchdog, LOADER_FLAG);
    }

    /// Consumes the loader request if present.
    pub fn take_loader_flag(&mut self) -> bool {
        if self.regs.read(BackupRegister::LoaderWatchdog) == LOADER_FLAG {
            self.regs.write(BackupRegister::LoaderWatchdog, 0);
            true
        } else {
            false
        }
    }

    /// Records the faulting program counter before a watchdog reset.
    pub fn set_watchdog_record(&mut self, tag: u8, pc: u32) {
        let word = WatchdogWord(0).with_tag(tag).with_pc(pc & 0x00FF_FFFF);
        self.regs.write(BackupRegister::LoaderWatchdog, word.0);
    }

    /// Tag of the stored watchdog record, without consuming it.
    pub fn watchdog_tag(&mut self) -> u8 {
        WatchdogWord(self.regs.read(BackupRegister::LoaderWatchdog)).tag()
    }

    /// Consumes the watchdog record if the application tag matches,
    /// returning the recorded program counter.
    pub fn take_watchdog_record(&mut self) -> Option<u32> {
        let word = WatchdogWord(self.regs.read(BackupRegister::LoaderWatchdog));
        if word.tag() == WATCHDOG_TAG {
            self.regs.write(BackupRegister::LoaderWatchdog, 0);
            Some(word.pc())
        } else {
            None
        }
    }

    pub fn set_setup_flag(&mut self) {
        self.regs.write(BackupRegister::Setup, SETUP_FLAG);
    }

    pub fn take_setup_flag(&mut self) -> bool {
        if self.regs.read(BackupRegister::Setup) == SETUP_FLAG {
            self.regs.write(BackupRegister::Setup, 0);
            true
        } else {
            false
        }
    }

    pub fn set_serial_number(&mut self, serial: u32) {
        self.regs.write(BackupRegister::Serial, serial);
    }

    pub fn serial_number(&mut self) -> u32 {
        self.regs.read(BackupRegister::Serial)
    }

    pub fn record_reset_cause(&mut self, raw: u32) {
        self.regs.write(BackupRegister::ResetCause, raw);
    }

    pub fn reset_cause(&mut self) -> ResetCause {
        ResetCause::decode(self.regs.read(BackupRegister::ResetCause))
    }

    /// Posts a general-purpose code. Fails if another code is pending;
    /// callers decide whether that matters.
    pub fn set_general_flag(&mut self, code: u32) -> Result<(), FlagError> {
        if self.regs.read(BackupRegister::General) != 0 {
            return Err(FlagError::AlreadySet);
        }
        self.regs.write(BackupRegister::General, code);
        Ok(())
    }

    /// Consumes the general flag if it matches `code`.
    pub fn check_general_flag(&mut self, code: u32) -> bool {
        if self.regs.read(BackupRegister::General) == code {
            self.regs.write(BackupRegister::General, 0);
            true
        } else {
            false
        }
    }

    pub fn any_general_flag(&mut self) -> bool {
        self.regs.read(BackupRegister::General) != 0
    }

    pub fn clear_general_flag(&mut self) {
        self.regs.write(BackupRegister::General, 0);
    }

    pub fn set_can_loader_request(&mut self, params: CanLoaderParams) {
        let word = CanLoaderWord(0)
            .with_tag(CAN_LOADER_TAG)
            .with_termination(params.termination & 0xF)
            .with_baudrate(params.baudrate);
        self.regs.write(BackupRegister::CanLoader, word.0);
    }

    /// Reads the CAN-loader request without consuming it. Whether the
    /// request stays armed across the jump is a boot-policy decision.
    pub fn can_loader_request(&mut self) -> Option<CanLoaderParams> {
        let word = CanLoaderWord(self.regs.read(BackupRegister::CanLoader));
        if word.tag() == CAN_LOADER_TAG {
            Some(CanLoaderParams {
                baudrate: word.baudrate(),
                termination: word.termination(),
            })
        } else {
            None
        }
    }

    pub fn clear_can_loader_request(&mut self) {
        self.regs.write(BackupRegister::CanLoader, 0);
    }
}
