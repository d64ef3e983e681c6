//! Firmware core for the galena controller node.
//!
//! The hardware is reached only through the [`board::Board`] trait, so
//! the whole core runs unmodified under a host simulator or a test
//! double. Interrupt context owns the [`Irq`] surface (timebase tick,
//! UART receive); everything else runs from the main superloop in
//! [`Firmware::run`]: pump console output, interpret commands, honor
//! pending reset/off requests, sleep a few milliseconds, repeat.
//!
//! Boot-time requests (loader, CAN loader, setup mode, watchdog
//! reports) travel through the backup registers and are decided in
//! [`boot::evaluate`] before the console even exists.

pub mod auth;
pub mod backup;
pub mod board;
pub mod boot;
pub mod buf;
pub mod clock;
pub mod command;
pub mod console;
pub mod timebase;
pub mod timeouts;

use auth::AuthGate;
use backup::FlagStore;
use board::{Board, CheckedConfig};
use boot::BootDecision;
use command::{CommandEnv, Interpreter, SystemRequest};
use console::{Console, RxQueue};
use timebase::Timebase;
use timeouts::{
    CONSOLE_TIMEOUT_MS, SETUP_MODE_IDLE_MS, SETUP_MODE_MAX_MS, SUPERLOOP_DELAY_MS,
};

/// State shared with interrupt context. Lives for the whole program;
/// interrupt handlers call [`tick`](Self::tick) and
/// [`uart_rx`](Self::uart_rx), the main loop reads through [`Firmware`].
pub struct Irq {
    timebase: Timebase,
    console_rx: RxQueue,
}

impl Irq {
    pub fn new() -> Self {
        Self {
            timebase: Timebase::new(),
            console_rx: RxQueue::new(),
        }
    }

    /// Tick interrupt entry point.
    pub fn tick(&self) {
        self.timebase.tick();
    }

    /// UART receive interrupt entry point. Returns `false` when the
    /// byte was dropped because the ring was full.
    pub fn uart_rx(&self, byte: u8) -> bool {
        self.console_rx.push_from_irq(byte)
    }

    pub fn timebase(&self) -> &Timebase {
        &self.timebase
    }
}

impl Default for Irq {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
struct SetupState {
    entered: u32,
}

/// Main-loop context: the board, the console session, the interpreter,
/// and the captured configuration.
pub struct Firmware<'i, B: Board> {
    board: B,
    irq: &'i Irq,
    console: Console<'i>,
    interp: Interpreter,
    auth: AuthGate,
    config: CheckedConfig,
    pending: Option<SystemRequest>,
    setup: Option<SetupState>,
}

impl<'i, B: Board> Firmware<'i, B> {
    /// Evaluates the boot decision and brings the application up.
    ///
    /// Loader handovers never return from here. If a neighbor-node
    /// handshake is pending in the general flag cell the console starts
    /// silent; [`check_general_flag`](Self::check_general_flag) lifts
    /// that once the handshake completes.
    pub fn start(mut board: B, irq: &'i Irq) -> Self {
        let decision = boot::evaluate(&mut board);
        boot::launch(decision, &mut board);

        let cfg = board.config();
        let config = CheckedConfig::capture(cfg);
        irq.timebase.init(cfg.tick_freq);

        let raw_cause = board.reset_cause_raw();
        let mut flags = FlagStore::new(&mut board);
        flags.record_reset_cause(raw_cause);
        let cause = flags.reset_cause();
        let silent = flags.any_general_flag();
        log::info!("reset cause: {cause} (raw {raw_cause:#010x})");

        let mut console = Console::new(&irq.console_rx, silent);
        console.print_fmt(
            &mut board,
            format_args!(
                "\r\ngalena {}  HW-ID: 0x{:x}\r\n",
                env!("CARGO_PKG_VERSION"),
                cfg.hardware_id
            ),
        );
        if let BootDecision::ReportWatchdogFault { pc } = decision {
            log::warn!("watchdog reset at {pc:#08x}");
            console.print_fmt(&mut board, format_args!("Watchdog reset at 0x{pc:06x}\r\n"));
        }
        console.print_fmt(&mut board, format_args!("# "));
        console.set_blocking(false);

        let mut interp = Interpreter::new();
        let setup = if decision == BootDecision::EnterSetup {
            // setup sessions run unlocked; the window relocks on exit
            interp.unlock_for_setup();
            log::info!("entering setup mode");
            Some(SetupState {
                entered: irq.timebase.mark(),
            })
        } else {
            None
        };

        Self {
            board,
            irq,
            console,
            interp,
            auth: AuthGate::new(),
            config,
            pending: None,
            setup,
        }
    }

    pub fn in_setup_mode(&self) -> bool {
        self.setup.is_some()
    }

    pub fn board(&mut self) -> &mut B {
        &mut self.board
    }

    /// Consumes the general flag if it matches `code`. A match also
    /// ends the console's silent period: the handshake the silence was
    /// protecting has completed.
    pub fn check_general_flag(&mut self, code: u32) -> bool {
        let matched = FlagStore::new(&mut self.board).check_general_flag(code);
        if matched {
            self.console.set_silent(false);
        }
        matched
    }

    /// Posts a general flag for the next session to find.
    pub fn post_general_flag(&mut self, code: u32) -> Result<(), backup::FlagError> {
        FlagStore::new(&mut self.board).set_general_flag(code)
    }

    /// One superloop cycle, minus the idle delay and minus acting on
    /// pending system requests (so it stays testable).
    pub fn poll(&mut self) {
        if let Err(err) = self.config.verify() {
            log::error!("{err}; halting");
            self.board.fatal_halt();
        }

        self.console
            .background_print(&mut self.board, &self.irq.timebase, CONSOLE_TIMEOUT_MS);

        let mut env = CommandEnv {
            board: &mut self.board,
            console: &mut self.console,
            timebase: &self.irq.timebase,
            auth: &mut self.auth,
            pending: &mut self.pending,
        };
        self.interp.service(&mut env);

        self.update_setup_mode();
    }

    fn update_setup_mode(&mut self) {
        let Some(setup) = self.setup else {
            return;
        };
        let tb = &self.irq.timebase;
        let active = self.console.active_mark();
        let idle_base = if active == 0 { setup.entered } else { active };
        if tb.elapsed_since(setup.entered) > SETUP_MODE_MAX_MS
            || tb.elapsed_since(idle_base) > SETUP_MODE_IDLE_MS
        {
            self.setup = None;
            self.interp.relock();
            log::info!("setup mode ended");
        }
    }

    /// The superloop. Never returns; every exit path goes through a
    /// reset or power-off on the board.
    pub fn run(&mut self) -> ! {
        loop {
            self.poll();
            match self.pending.take() {
                Some(SystemRequest::Reset) => {
                    boot::safe_reset(&mut self.board, &mut self.console, &self.irq.timebase)
                }
                Some(SystemRequest::PowerOff) => {
                    while self.console.background_print(
                        &mut self.board,
                        &self.irq.timebase,
                        CONSOLE_TIMEOUT_MS,
                    ) {}
                    self.board.power_off()
                }
                None => {}
            }
            self.irq.timebase.delay(SUPERLOOP_DELAY_MS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{
        BackupRegister, CanLoaderParams, LOG_PRINT_FLAG, WATCHDOG_TAG,
    };
    use crate::board::testing::TestBoard;

    fn started(board: TestBoard, irq: &Irq) -> Firmware<'_, TestBoard> {
        Firmware::start(board, irq)
    }

    /// Types a line and runs enough cycles for it to settle, execute,
    /// and drain its output.
    fn type_line(fw: &mut Firmware<'_, TestBoard>, irq: &Irq, text: &str) {
        for byte in text.bytes() {
            assert!(irq.uart_rx(byte));
        }
        assert!(irq.uart_rx(b'\r'));
        for _ in 0..3 {
            fw.poll();
        }
    }

    /// A clean boot prints the banner with hardware id and prompt, and
    /// latches the raw reset cause into its backup cell.
    #[test]
    fn normal_boot_banner() {
        let irq = Irq::new();
        irq.timebase().init(1);
        let mut fw = started(TestBoard::new(), &irq);

        let out = fw.board().tx_string();
        assert!(out.contains("galena"));
        assert!(out.contains("HW-ID: 0x21"));
        assert!(out.ends_with("# "));
        assert_ne!(
            fw.board().backup[BackupRegister::ResetCause as usize],
            0
        );
        assert!(!fw.in_setup_mode());
    }

    /// A stored watchdog record shows up in the banner once.
    #[test]
    fn watchdog_fault_in_banner() {
        let irq = Irq::new();
        let mut board = TestBoard::new();
        FlagStore::new(&mut board).set_watchdog_record(WATCHDOG_TAG, 0x123);
        let mut fw = started(board, &irq);

        assert!(fw.board().tx_string().contains("Watchdog reset at 0x000123"));
        assert_eq!(
            fw.board().backup[BackupRegister::LoaderWatchdog as usize],
            0
        );
    }

    /// A pending general flag keeps the console silent until the flag
    /// is checked off, then output flows again.
    #[test]
    fn silent_until_general_flag_checked() {
        let irq = Irq::new();
        let mut board = TestBoard::new();
        board.backup[BackupRegister::General as usize] = LOG_PRINT_FLAG;
        let mut fw = started(board, &irq);

        assert!(fw.board().tx.is_empty());
        type_line(&mut fw, &irq, "uptime");
        assert!(fw.board().tx.is_empty());

        assert!(!fw.check_general_flag(0x3C));
        assert!(fw.board().tx.is_empty());
        assert!(fw.check_general_flag(LOG_PRINT_FLAG));
        type_line(&mut fw, &irq, "uptime");
        assert!(fw.board().tx_string().contains("Uptime:"));
    }

    /// Full privileged session: challenge, bypass unlock, load request.
    /// The next boot (same backup cells) hands over to the loader.
    #[test]
    fn load_session_reaches_loader() {
        let irq = Irq::new();
        let mut fw = started(TestBoard::new(), &irq);

        type_line(&mut fw, &irq, "password N3k0c0");
        assert!(fw.board().tx_string().contains("OK"));
        type_line(&mut fw, &irq, "off");
        assert_eq!(fw.pending.take(), Some(SystemRequest::PowerOff));
        type_line(&mut fw, &irq, "load");
        assert_eq!(fw.pending, Some(SystemRequest::Reset));

        // carry the backup cells into the next session
        let backup = fw.board().backup;
        let mut next = TestBoard::new();
        next.backup = backup;
        assert_eq!(boot::evaluate(&mut next), BootDecision::JumpToLoader);
    }

    /// Booting with the setup flag lands in setup mode with privileged
    /// commands unlocked; idle time ends it and relocks.
    #[test]
    fn setup_mode_unlocks_then_expires() {
        let irq = Irq::new();
        irq.timebase().init(1);
        let mut board = TestBoard::new();
        FlagStore::new(&mut board).set_setup_flag();
        let mut fw = started(board, &irq);

        assert!(fw.in_setup_mode());
        fw.board().tx.clear();
        type_line(&mut fw, &irq, "reset");
        assert_eq!(fw.pending.take(), Some(SystemRequest::Reset));
        assert_eq!(
            fw.board().backup[BackupRegister::Setup as usize],
            0,
            "setup flag must be consumed at boot"
        );

        for _ in 0..(SETUP_MODE_IDLE_MS + 10) {
            irq.tick();
        }
        fw.poll();
        assert!(!fw.in_setup_mode());

        fw.board().tx.clear();
        type_line(&mut fw, &irq, "reset");
        assert!(fw.board().tx_string().contains("Error"));
    }

    /// The setup window closes outright after its maximum duration even
    /// with constant console traffic.
    #[test]
    fn setup_mode_hard_deadline() {
        let irq = Irq::new();
        irq.timebase().init(1);
        let mut board = TestBoard::new();
        FlagStore::new(&mut board).set_setup_flag();
        let mut fw = started(board, &irq);
        assert!(fw.in_setup_mode());

        let mut remaining = SETUP_MODE_MAX_MS + 100;
        while remaining > 0 {
            let step = remaining.min(1000);
            for _ in 0..step {
                irq.tick();
            }
            // keep the console active so only the hard deadline applies
            irq.uart_rx(b'x');
            fw.poll();
            remaining -= step;
        }
        assert!(!fw.in_setup_mode());
    }

    /// A CAN-loader request set by a privileged session is found by the
    /// next boot with its parameters intact.
    #[test]
    fn can_loader_request_round_trip() {
        let irq = Irq::new();
        let mut fw = started(TestBoard::new(), &irq);
        let params = CanLoaderParams {
            baudrate: 250,
            termination: 1,
        };
        FlagStore::new(fw.board()).set_can_loader_request(params);

        let backup = fw.board().backup;
        let mut next = TestBoard::new();
        next.backup = backup;
        assert_eq!(
            boot::evaluate(&mut next),
            BootDecision::JumpToCanLoader(params)
        );
    }

    /// Corrupting the captured configuration halts the board on the
    /// next cycle.
    #[test]
    fn config_corruption_halts() {
        let irq = Irq::new();
        let mut fw = started(TestBoard::new(), &irq);
        fw.config.corrupt_for_test();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            fw.poll();
        }));
        let panic = outcome.expect_err("must halt");
        let msg = panic.downcast_ref::<&str>().copied().unwrap_or_default();
        assert_eq!(msg, "fatal halt");
    }
}
