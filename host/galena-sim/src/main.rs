//! Runs the firmware core on a host machine: stdout is the console TX
//! line, stdin feeds the receive interrupt, a thread provides the
//! millisecond tick, and the backup registers live in a small file so
//! they survive simulated resets (and are lost on `off`, like a real
//! power cut).
//!
//! Exit codes mirror the ways off the board: 0 power-off, 1 fatal halt,
//! 10 system reset, 11 ROM-loader handover, 12 CAN-loader handover.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use galena::backup::{BackupRegister, BackupRegisters, CanLoaderParams, BACKUP_REGISTER_COUNT};
use galena::board::{Board, BoardConfig};
use galena::clock::DateTime;
use galena::{Firmware, Irq};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Increase stderr log verbosity (-v, -vv, ...).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// File backing the backup registers across simulated resets.
    #[arg(long, default_value = ".galena-backup")]
    backup_file: PathBuf,

    /// Hardware identifier reported by `version`.
    #[arg(long, default_value_t = 0x21)]
    hardware_id: u32,

    /// Simulated console baud rate, used for drain deadlines.
    #[arg(long, default_value_t = 115_200)]
    baud_rate: u32,
}

const RESET_CAUSE_PIN: u32 = 1 << 26;
const RESET_CAUSE_POR: u32 = 1 << 27;
const RESET_CAUSE_SFT: u32 = 1 << 28;

struct SimBoard {
    config: BoardConfig,
    backup_file: PathBuf,
    cells: [u32; BACKUP_REGISTER_COUNT],
    /// The simulated RTC holds whatever was last written; it does not
    /// tick on its own.
    clock: DateTime,
    resumed: bool,
}

impl SimBoard {
    fn new(args: &Args) -> Self {
        let mut cells = [0u32; BACKUP_REGISTER_COUNT];
        let resumed = match std::fs::read(&args.backup_file) {
            Ok(bytes) if bytes.len() == BACKUP_REGISTER_COUNT * 4 => {
                for (cell, chunk) in cells.iter_mut().zip(bytes.chunks_exact(4)) {
                    *cell = u32::from_le_bytes(chunk.try_into().unwrap());
                }
                true
            }
            _ => false,
        };
        Self {
            config: BoardConfig {
                baud_rate: args.baud_rate,
                tick_freq: 1,
                hardware_id: args.hardware_id,
            },
            backup_file: args.backup_file.clone(),
            cells,
            clock: DateTime::EPOCH,
            resumed,
        }
    }

    fn save_cells(&self) {
        let mut bytes = Vec::with_capacity(BACKUP_REGISTER_COUNT * 4);
        for cell in &self.cells {
            bytes.extend_from_slice(&cell.to_le_bytes());
        }
        if let Err(err) = std::fs::write(&self.backup_file, bytes) {
            log::error!("failed to save backup cells: {err}");
        }
    }

    fn leave(&mut self, note: &str, code: i32) -> ! {
        self.save_cells();
        log::info!("{note}");
        std::process::exit(code)
    }
}

impl BackupRegisters for SimBoard {
    fn read(&mut self, reg: BackupRegister) -> u32 {
        self.cells[reg as usize]
    }

    fn write(&mut self, reg: BackupRegister, value: u32) {
        self.cells[reg as usize] = value;
        self.save_cells();
    }
}

impl Board for SimBoard {
    fn config(&self) -> BoardConfig {
        self.config
    }

    fn uart_transmit(&mut self, bytes: &[u8], _timeout_ms: u32) -> bool {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(bytes).and_then(|()| stdout.flush()).is_ok()
    }

    fn rtc_read(&mut self) -> DateTime {
        self.clock
    }

    fn rtc_write(&mut self, datetime: &DateTime) {
        self.clock = *datetime;
    }

    fn reset_cause_raw(&mut self) -> u32 {
        if self.resumed {
            RESET_CAUSE_SFT
        } else {
            RESET_CAUSE_POR | RESET_CAUSE_PIN
        }
    }

    fn set_leds(&mut self, levels: &[u32]) -> bool {
        log::info!("leds: {levels:?}");
        true
    }

    fn system_reset(&mut self) -> ! {
        self.leave("system reset", 10)
    }

    fn jump_to_loader(&mut self) -> ! {
        self.leave("handing over to the ROM loader", 11)
    }

    fn jump_to_can_loader(&mut self, params: CanLoaderParams) -> ! {
        self.leave(
            &format!(
                "handing over to the CAN loader ({} kbit/s, termination {})",
                params.baudrate, params.termination
            ),
            12,
        )
    }

    fn power_off(&mut self) -> ! {
        // power loss takes the backup domain with it
        let _ = std::fs::remove_file(&self.backup_file);
        log::info!("power off");
        std::process::exit(0)
    }

    fn fatal_halt(&mut self) -> ! {
        log::error!("fatal halt");
        std::process::exit(1)
    }
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    stderrlog::new()
        .verbosity(args.verbose as usize + 2)
        .timestamp(stderrlog::Timestamp::Millisecond)
        .init()?;

    let irq: &'static Irq = Box::leak(Box::new(Irq::new()));

    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(1));
        irq.tick();
    });

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut buf = [0u8; 64];
        loop {
            let n = match stdin.lock().read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                // a line-buffered terminal sends LF; the console wants CR
                let byte = if byte == b'\n' { b'\r' } else { byte };
                if !irq.uart_rx(byte) {
                    log::warn!("receive ring full; byte dropped");
                }
            }
        }
    });

    let board = SimBoard::new(&args);
    let mut firmware = Firmware::start(board, irq);
    firmware.run()
}
