//! Boot decision and controlled exits.
//!
//! Runs before anything else at startup: the backup cells decide whether
//! this boot belongs to the ROM loader, the CAN loader, setup mode, or
//! the application, and whether a watchdog fault needs reporting.
//! Exits from the application come back through here so queued console
//! output gets a bounded chance to drain first.

use crate::backup::{BackupRegisters, CanLoaderParams, FlagStore, CAN_WATCHDOG_TAG};
use crate::board::Board;
use crate::console::Console;
use crate::timebase::Timebase;
use crate::timeouts::{CONSOLE_TIMEOUT_MS, TX_DMA_DRAIN};

/// What this boot should do, in priority order of the requests found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    /// Hand over to the ROM loader.
    JumpToLoader,
    /// Hand over to the CAN loader with the stored bus parameters.
    JumpToCanLoader(CanLoaderParams),
    /// Run the application, reporting that the watchdog bit at `pc`.
    ReportWatchdogFault { pc: u32 },
    /// Run the application in setup mode.
    EnterSetup,
    Normal,
}

/// Reads (and consumes, where appropriate) the boot request flags.
///
/// The loader request wins over everything. A CAN-loader request is
/// normally consumed on the way out, but stays armed when the previous
/// session died to the CAN-loader watchdog, so a crashing load attempt
/// retries instead of silently booting the old application.
pub fn evaluate<S: BackupRegisters + ?Sized>(regs: &mut S) -> BootDecision {
    let mut flags = FlagStore::new(regs);
    if flags.take_loader_flag() {
        return BootDecision::JumpToLoader;
    }
    if let Some(params) = flags.can_loader_request() {
        if flags.watchdog_tag() != CAN_WATCHDOG_TAG {
            flags.clear_can_loader_request();
        }
        return BootDecision::JumpToCanLoader(params);
    }
    if let Some(pc) = flags.take_watchdog_record() {
        return BootDecision::ReportWatchdogFault { pc };
    }
    if flags.take_setup_flag() {
        return BootDecision::EnterSetup;
    }
    BootDecision::Normal
}

/// Performs the diverging handovers for a decision. Decisions that run
/// the application fall through to the caller.
pub fn launch<B: Board>(decision: BootDecision, board: &mut B) {
    match decision {
        BootDecision::JumpToLoader => board.jump_to_loader(),
        BootDecision::JumpToCanLoader(params) => board.jump_to_can_loader(params),
        BootDecision::ReportWatchdogFault { .. }
        | BootDecision::EnterSetup
        | BootDecision::Normal => {}
    }
}

/// Pumps the console until it drains or a wire-rate deadline passes,
/// then resets the core. The deadline keeps a wedged UART from blocking
/// the reset forever.
pub fn safe_reset<B: Board>(board: &mut B, console: &mut Console<'_>, timebase: &Timebase) -> ! {
    let deadline = TX_DMA_DRAIN
        .at_baud_8n1(board.config().baud_rate)
        .saturating_add(CONSOLE_TIMEOUT_MS);
    let mark = timebase.mark();
    while console.background_print(board, timebase, CONSOLE_TIMEOUT_MS) {
        if timebase.elapsed_since(mark) > deadline {
            break;
        }
    }
    board.system_reset()
}

/// Arms the loader request and resets; the next boot lands in the ROM
/// loader.
pub fn loader_start<B: Board>(board: &mut B, console: &mut Console<'_>, timebase: &Timebase) -> ! {
    FlagStore::new(&mut *board).set_loader_flag();
    safe_reset(board, console, timebase)
}

/// Arms a CAN-loader request with bus parameters and resets.
pub fn can_loader_start<B: Board>(
    board: &mut B,
    console: &mut Console<'_>,
    timebase: &Timebase,
    params: CanLoaderParams,
) -> ! {
    FlagStore::new(&mut *board).set_can_loader_request(params);
    safe_reset(board, console, timebase)
}

/// Arms setup mode for the next boot, optionally resetting right away.
pub fn request_setup_mode<B: Board>(
    board: &mut B,
    console: &mut Console<'_>,
    timebase: &Timebase,
    reset_now: bool,
) {
    FlagStore::new(&mut *board).set_setup_flag();
    if reset_now {
        safe_reset(board, console, timebase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupRegister, FlagError, WATCHDOG_TAG};
    use crate::board::testing::TestBoard;

    /// No flags set boots straight into the application.
    #[test]
    fn cold_boot_is_normal() {
        let mut board = TestBoard::new();
        assert_eq!(evaluate(&mut board), BootDecision::Normal);
    }

    /// The loader request beats everything else and is consumed.
    #[test]
    fn loader_flag_wins_and_clears() {
        let mut board = TestBoard::new();
        let mut flags = FlagStore::new(&mut board);
        flags.set_loader_flag();
        flags.set_setup_flag();

        assert_eq!(evaluate(&mut board), BootDecision::JumpToLoader);
        // loader consumed; the setup request is next in line
        assert_eq!(evaluate(&mut board), BootDecision::EnterSetup);
        assert_eq!(evaluate(&mut board), BootDecision::Normal);
    }

    /// A CAN-loader request is consumed on a clean handover.
    #[test]
    fn can_loader_request_consumed() {
        let mut board = TestBoard::new();
        let params = CanLoaderParams {
            baudrate: 250,
            termination: 1,
        };
        FlagStore::new(&mut board).set_can_loader_request(params);

        assert_eq!(evaluate(&mut board), BootDecision::JumpToCanLoader(params));
        assert_eq!(evaluate(&mut board), BootDecision::Normal);
    }

    /// If the CAN loader watchdogged, the request stays armed so the
    /// load attempt retries.
    #[test]
    fn can_loader_request_survives_its_watchdog() {
        let mut board = TestBoard::new();
        let params = CanLoaderParams {
            baudrate: 500,
            termination: 0,
        };
        {
            let mut flags = FlagStore::new(&mut board);
            flags.set_can_loader_request(params);
            flags.set_watchdog_record(CAN_WATCHDOG_TAG, 0x1000);
        }

        assert_eq!(evaluate(&mut board), BootDecision::JumpToCanLoader(params));
        assert_eq!(evaluate(&mut board), BootDecision::JumpToCanLoader(params));
    }

    /// An application watchdog record is reported once, then cleared.
    #[test]
    fn watchdog_fault_reported_once() {
        let mut board = TestBoard::new();
        FlagStore::new(&mut board).set_watchdog_record(WATCHDOG_TAG, 0x0123);

        assert_eq!(
            evaluate(&mut board),
            BootDecision::ReportWatchdogFault { pc: 0x0123 }
        );
        assert_eq!(evaluate(&mut board), BootDecision::Normal);
    }

    /// Setup ranks below the watchdog report.
    #[test]
    fn watchdog_outranks_setup() {
        let mut board = TestBoard::new();
        {
            let mut flags = FlagStore::new(&mut board);
            flags.set_watchdog_record(WATCHDOG_TAG, 7);
            flags.set_setup_flag();
        }
        assert_eq!(
            evaluate(&mut board),
            BootDecision::ReportWatchdogFault { pc: 7 }
        );
        assert_eq!(evaluate(&mut board), BootDecision::EnterSetup);
    }

    /// The general-purpose cell plays no part in the boot decision.
    #[test]
    fn general_flag_ignored_by_boot() {
        let mut board = TestBoard::new();
        assert_eq!(
            FlagStore::new(&mut board).set_general_flag(0x3C),
            Ok::<(), FlagError>(())
        );
        assert_eq!(evaluate(&mut board), BootDecision::Normal);
        assert_ne!(board.backup[BackupRegister::General as usize], 0);
    }

    /// `loader_start` arms the loader flag on its way into the reset.
    #[test]
    fn loader_start_arms_flag() {
        use crate::console::RxQueue;

        let rx = RxQueue::new();
        let tb = Timebase::new();
        tb.init(1);
        let mut board = TestBoard::new();
        let mut console = Console::new(&rx, false);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            loader_start(&mut board, &mut console, &tb);
        }));
        assert!(outcome.is_err());
        assert_eq!(evaluate(&mut board), BootDecision::JumpToLoader);
    }

    /// Without an immediate reset, a setup request just arms the flag
    /// for whenever the next reboot happens.
    #[test]
    fn setup_request_without_reset() {
        use crate::console::RxQueue;

        let rx = RxQueue::new();
        let tb = Timebase::new();
        tb.init(1);
        let mut board = TestBoard::new();
        let mut console = Console::new(&rx, false);

        request_setup_mode(&mut board, &mut console, &tb, false);
        assert_eq!(evaluate(&mut board), BootDecision::EnterSetup);
    }

    /// `can_loader_start` stores the bus parameters before resetting.
    #[test]
    fn can_loader_start_stores_params() {
        use crate::console::RxQueue;

        let rx = RxQueue::new();
        let tb = Timebase::new();
        tb.init(1);
        let mut board = TestBoard::new();
        let mut console = Console::new(&rx, false);
        let params = CanLoaderParams {
            baudrate: 125,
            termination: 1,
        };

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            can_loader_start(&mut board, &mut console, &tb, params);
        }));
        assert!(outcome.is_err());
        assert_eq!(evaluate(&mut board), BootDecision::JumpToCanLoader(params));
    }

    /// `safe_reset` drains queued output before pulling the plug.
    #[test]
    fn safe_reset_drains_console() {
        use crate::console::RxQueue;

        let rx = RxQueue::new();
        let tb = Timebase::new();
        tb.init(1);
        let mut board = TestBoard::new();
        let mut console = Console::new(&rx, false);
        console.set_blocking(false);
        console.print_fmt(&mut board, format_args!("bye"));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            safe_reset(&mut board, &mut console, &tb);
        }));
        let panic = outcome.expect_err("reset must not return");
        let msg = panic.downcast_ref::<&str>().copied().unwrap_or_default();
        assert_eq!(msg, "system reset");
        assert_eq!(board.tx_string(), "bye");
    }
}
