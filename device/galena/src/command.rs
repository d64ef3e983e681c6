//! Line command interpreter.
//!
//! Lines from the console are tokenized in place and dispatched against
//! a fixed table. A replay timer lets a handler re-run itself on a
//! period without blocking the main loop; the paginated `help` output is
//! built on it. Privileged commands sit behind the unlock flag that the
//! `password` handler controls.

use core::fmt;

use crate::auth::{AuthGate, BYPASS_PASSWORD};
use crate::backup::FlagStore;
use crate::board::{Board, LED_COUNT};
use crate::clock::DateTime;
use crate::console::{Console, CONSOLE_RX_BUF_LEN};
use crate::timebase::Timebase;

/// Upper bound on tokens per line.
pub const MAX_ARGS: usize = CONSOLE_RX_BUF_LEN / 2;

/// Transmit headroom required beyond the help text itself before a help
/// entry is emitted: name column, separator, line ending.
const HELP_LINE_OVERHEAD: usize = 25;

/// Actions a handler wants performed once the current service cycle is
/// over and output has had a chance to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemRequest {
    Reset,
    PowerOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandId {
    Help,
    Version,
    Clear,
    Uptime,
    Clock,
    Password,
    Reset,
    Off,
    Load,
    Led,
}

struct CommandSpec {
    name: &'static str,
    id: CommandId,
    help: &'static str,
}

const COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        id: CommandId::Help,
        help: "Shows all available commands",
    },
    CommandSpec {
        name: "?",
        id: CommandId::Help,
        help: "Shows all available commands",
    },
    CommandSpec {
        name: "version",
        id: CommandId::Version,
        help: "Shows the firmware version",
    },
    CommandSpec {
        name: "clear",
        id: CommandId::Clear,
        help: "Clears the terminal",
    },
    CommandSpec {
        name: "uptime",
        id: CommandId::Uptime,
        help: "Uptime in seconds",
    },
    CommandSpec {
        name: "clock",
        id: CommandId::Clock,
        help: "Clock; year, month, day, hour, minute, sec",
    },
    CommandSpec {
        name: "password",
        id: CommandId::Password,
        help: "Password to unlock certain commands",
    },
    CommandSpec {
        name: "reset",
        id: CommandId::Reset,
        help: "Resets the CPU",
    },
    CommandSpec {
        name: "off",
        id: CommandId::Off,
        help: "Switches off the power",
    },
    CommandSpec {
        name: "load",
        id: CommandId::Load,
        help: "Loads new software",
    },
    CommandSpec {
        name: "led",
        id: CommandId::Led,
        help: "Sets the LEDs, 4x (0=off, 1=on)",
    },
];

/// Everything a handler may touch, borrowed for one service cycle.
pub struct CommandEnv<'a, 'i, B: Board> {
    pub board: &'a mut B,
    pub console: &'a mut Console<'i>,
    pub timebase: &'a Timebase,
    pub auth: &'a mut AuthGate,
    pub pending: &'a mut Option<SystemRequest>,
}

impl<B: Board> CommandEnv<'_, '_, B> {
    fn print(&mut self, args: fmt::Arguments<'_>) {
        self.console.print_fmt(self.board, args);
    }
}

#[derive(Default)]
struct ReplayState {
    mark: u32,
    period: u32,
    count: u32,
    suppress_newline: bool,
}

struct HelpState {
    letter: u8,
    scan_from: usize,
    printed: usize,
}

/// Splits `buf` in place at `div`, writing token start offsets into
/// `offsets`. Runs of the divider collapse into one split. Double quotes
/// group divider bytes into a token; the opening quote also drags the
/// token start forward across up to five bytes looking for its partner,
/// an old quirk deployed senders rely on staying put. Quote bytes
/// themselves are blanked to spaces. Returns the token count (at least
/// one; offset 0 is always a token start).
fn nsplit(buf: &mut [u8], div: u8, offsets: &mut [usize]) -> usize {
    let length = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let max_num = offsets.len();
    let mut index = 0usize;
    let mut walked = 0usize;
    let mut in_quotes = false;
    let mut num = 1usize;
    offsets[0] = 0;

    while walked < length && num < max_num && buf[index] != 0 {
        if buf[index] == b'"' {
            in_quotes = !in_quotes;
            if in_quotes {
                let mut lookahead = 0;
                while offsets[num - 1] < buf.len() - 1
                    && buf[offsets[num - 1]] != b'"'
                    && lookahead < 5
                {
                    offsets[num - 1] += 1;
                    lookahead += 1;
                }
                offsets[num - 1] += 1;
            }
            buf[index] = b' ';
        }
        if buf[index] == div && !in_quotes {
            offsets[num] = index + 1;
            buf[index] = 0;
            index += 1;
            walked += 1;
            while walked < length && buf[index] != 0 && buf[index] == div {
                index += 1;
                offsets[num] += 1;
                walked += 1;
            }
            if index < buf.len() && buf[index] != 0 {
                num += 1;
            }
        } else {
            index += 1;
            walked += 1;
        }
    }
    if index < buf.len() {
        buf[index] = 0;
    }
    num
}

/// Token at `offset`, up to the next NUL. Offsets past the buffer (the
/// quote lookahead can push one there) yield the empty token.
fn token(buf: &[u8], offset: usize) -> &str {
    if offset >= buf.len() {
        return "";
    }
    let end = buf[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(buf.len());
    core::str::from_utf8(&buf[offset..end]).unwrap_or("")
}

/// Leading-digits parse with `strtoul`-style tolerance: trailing junk is
/// ignored, no digits at all reads as zero, overflow saturates.
fn parse_u32(s: &str) -> u32 {
    let end = s
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(s.len());
    if end == 0 {
        return 0;
    }
    s[..end].parse().unwrap_or(u32::MAX)
}

pub struct Interpreter {
    command_buffer: [u8; CONSOLE_RX_BUF_LEN],
    arg_offsets: [usize; MAX_ARGS],
    argc: usize,
    replay: ReplayState,
    help: HelpState,
    unlocked: bool,
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            command_buffer: [0; CONSOLE_RX_BUF_LEN],
            arg_offsets: [0; MAX_ARGS],
            argc: 0,
            replay: ReplayState::default(),
            help: HelpState {
                letter: b'a',
                scan_from: 0,
                printed: 0,
            },
            unlocked: false,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Drops any unlock; called when a session must not inherit
    /// privileges, e.g. after the setup window closes.
    pub fn relock(&mut self) {
        self.unlocked = false;
    }

    /// Grants the unlock without a password exchange. Only the setup
    /// window uses this; it pairs with [`relock`](Self::relock).
    pub fn unlock_for_setup(&mut self) {
        self.unlocked = true;
    }

    fn set_replay(&mut self, timebase: &Timebase, period: u32) {
        self.replay.mark = timebase.mark();
        self.replay.period = period;
        if period == 0 {
            self.replay.suppress_newline = false;
            self.replay.count = 0;
        }
    }

    fn arg<'b>(&self, buf: &'b [u8; CONSOLE_RX_BUF_LEN], n: usize) -> &'b str {
        if n < self.argc {
            token(buf, self.arg_offsets[n])
        } else {
            ""
        }
    }

    /// One interpreter cycle: pick up a finished line if there is one,
    /// otherwise fire the replay timer if it is due, then dispatch.
    pub fn service<B: Board>(&mut self, env: &mut CommandEnv<'_, '_, B>) {
        let mut console_buffer = [0u8; CONSOLE_RX_BUF_LEN];
        let mut execute = false;

        if env.console.read_line(env.board, &mut console_buffer) {
            self.set_replay(env.timebase, 0);
            if console_buffer[0] == b'!' {
                // re-run the stored line, echoing what will execute
                self.argc = nsplit(&mut self.command_buffer, b' ', &mut self.arg_offsets);
                env.print(format_args!("#"));
                for n in 0..self.argc {
                    let tok = token(&self.command_buffer, self.arg_offsets[n]);
                    env.print(format_args!("{} ", tok));
                }
                env.print(format_args!("\r\n"));
            } else {
                self.command_buffer = console_buffer;
                self.argc = nsplit(&mut self.command_buffer, b' ', &mut self.arg_offsets);
            }
            execute = true;
        } else if self.replay.period != 0
            && env.timebase.elapsed_since(self.replay.mark) >= self.replay.period
        {
            self.replay.count += 1;
            execute = true;
        }

        if !execute {
            return;
        }

        let buf = self.command_buffer;
        let name = self.arg(&buf, 0);
        match COMMAND_TABLE.iter().find(|spec| spec.name == name) {
            Some(spec) => self.run(spec.id, &buf, env),
            None => {
                if !name.is_empty() {
                    env.print(format_args!("Command not found!"));
                }
            }
        }

        if !self.replay.suppress_newline {
            env.print(format_args!("\r\n#"));
        }
    }

    fn run<B: Board>(
        &mut self,
        id: CommandId,
        buf: &[u8; CONSOLE_RX_BUF_LEN],
        env: &mut CommandEnv<'_, '_, B>,
    ) {
        match id {
            CommandId::Help => self.cmd_help(env),
            CommandId::Version => self.cmd_version(env),
            CommandId::Clear => env.print(format_args!("\x1Bc")),
            CommandId::Uptime => {
                let uptime = env.timebase.uptime();
                env.print(format_args!("Uptime: {}\r\n", uptime));
            }
            CommandId::Clock => self.cmd_clock(buf, env),
            CommandId::Password => self.cmd_password(buf, env),
            CommandId::Reset => self.cmd_system_request(env, SystemRequest::Reset, false),
            CommandId::Off => self.cmd_system_request(env, SystemRequest::PowerOff, false),
            CommandId::Load => self.cmd_system_request(env, SystemRequest::Reset, true),
            CommandId::Led => self.cmd_led(buf, env),
        }
    }

    /// Emits at most one help entry per cycle, rescheduling itself via
    /// the replay timer until the whole table is out. Entries go out
    /// grouped by first letter, ascending from 'a' and wrapping through
    /// the byte values, and only when the transmit ring has room for the
    /// line; a cycle without room retries the same entry.
    fn cmd_help<B: Board>(&mut self, env: &mut CommandEnv<'_, '_, B>) {
        if self.replay.count == 0 {
            self.set_replay(env.timebase, 1);
            self.replay.suppress_newline = true;
            self.help = HelpState {
                letter: b'a',
                scan_from: 0,
                printed: 0,
            };
            env.print(format_args!("\r\n"));
        }

        if self.help.printed >= COMMAND_TABLE.len() {
            self.set_replay(env.timebase, 0);
            return;
        }

        let mut letters_tried = 0u32;
        while letters_tried < 256 {
            let found = COMMAND_TABLE
                .iter()
                .enumerate()
                .skip(self.help.scan_from)
                .find(|(_, spec)| spec.name.as_bytes()[0] == self.help.letter);
            match found {
                Some((idx, spec)) => {
                    if env.console.print_buffer_space() <= spec.help.len() + HELP_LINE_OVERHEAD {
                        // no room this cycle; the replay will retry
                        return;
                    }
                    env.print(format_args!("{:<15} -- {}", spec.name, spec.help));
                    self.help.scan_from = idx + 1;
                    self.help.printed += 1;
                    if self.help.printed >= COMMAND_TABLE.len() {
                        self.set_replay(env.timebase, 0);
                    } else {
                        env.print(format_args!("\r\n"));
                    }
                    return;
                }
                None => {
                    self.help.letter = self.help.letter.wrapping_add(1);
                    if self.help.letter == 0xFF {
                        self.help.letter = 1;
                    }
                    self.help.scan_from = 0;
                    letters_tried += 1;
                }
            }
        }
        self.set_replay(env.timebase, 0);
    }

    fn cmd_version<B: Board>(&mut self, env: &mut CommandEnv<'_, '_, B>) {
        let hardware_id = env.board.config().hardware_id;
        env.print(format_args!(
            "galena {}  HW-ID: 0x{:x}\r\n",
            env!("CARGO_PKG_VERSION"),
            hardware_id
        ));
    }

    /// `clock` prints the calendar time; with six arguments it sets it
    /// first, but only in an unlocked session — a locked set is simply
    /// skipped and the readout still goes out. Out-of-range values fall
    /// back to the epoch rather than reaching the RTC hardware.
    fn cmd_clock<B: Board>(
        &mut self,
        buf: &[u8; CONSOLE_RX_BUF_LEN],
        env: &mut CommandEnv<'_, '_, B>,
    ) {
        if self.argc == 7 && self.unlocked {
            let mut year = parse_u32(self.arg(buf, 1));
            if year > 2000 {
                year -= 2000;
            }
            let mut dt = DateTime {
                year: year as u8,
                month: parse_u32(self.arg(buf, 2)) as u8,
                day: parse_u32(self.arg(buf, 3)) as u8,
                hours: parse_u32(self.arg(buf, 4)) as u8,
                minutes: parse_u32(self.arg(buf, 5)) as u8,
                seconds: parse_u32(self.arg(buf, 6)) as u8,
            };
            dt.validate_and_correct();
            env.board.rtc_write(&dt);
        }
        let dt = env.board.rtc_read();
        env.print(format_args!(
            "OK, 20{:02} {:02} {:02}  {:02} {:02} {:02}\r\n",
            dt.year, dt.month, dt.day, dt.hours, dt.minutes, dt.seconds
        ));
    }

    /// Bare `password` issues a challenge; `password <response>` checks
    /// it. Every attempt drops the unlock first, so a failed response
    /// also relocks. The generator state advances on every check,
    /// matching or not.
    fn cmd_password<B: Board>(
        &mut self,
        buf: &[u8; CONSOLE_RX_BUF_LEN],
        env: &mut CommandEnv<'_, '_, B>,
    ) {
        self.unlocked = false;
        if self.argc < 2 {
            env.auth.renew(env.timebase);
            env.auth.unlock(0);
            let (z, w) = env.auth.challenge_words();
            env.print(format_args!("OK {} {}\r\n", z, w));
            return;
        }
        let response = self.arg(buf, 1);
        let mut ok = env.auth.unlock(parse_u32(response));
        if !ok && response == BYPASS_PASSWORD {
            ok = true;
        }
        self.unlocked = ok;
        if ok {
            log::debug!("console unlocked");
            env.print(format_args!("OK\r\n"));
        } else {
            log::warn!("failed unlock attempt");
            env.print(format_args!("ERROR\r\n"));
        }
    }

    fn cmd_system_request<B: Board>(
        &mut self,
        env: &mut CommandEnv<'_, '_, B>,
        request: SystemRequest,
        load: bool,
    ) {
        if self.argc != 1 || !self.unlocked {
            env.print(format_args!("Error\r\n"));
            return;
        }
        if load {
            FlagStore::new(&mut *env.board).set_loader_flag();
        }
        *env.pending = Some(request);
        env.print(format_args!("OK\r\n"));
    }

    fn cmd_led<B: Board>(
        &mut self,
        buf: &[u8; CONSOLE_RX_BUF_LEN],
        env: &mut CommandEnv<'_, '_, B>,
    ) {
        if !self.unlocked || self.argc > LED_COUNT + 1 {
            env.print(format_args!("Error\r\n"));
            return;
        }
        let mut ok = false;
        if self.argc == LED_COUNT + 1 {
            let mut levels = [0u32; LED_COUNT];
            for (n, level) in levels.iter_mut().enumerate() {
                *level = parse_u32(self.arg(buf, n + 1));
            }
            ok = env.board.set_leds(&levels);
        }
        if ok {
            env.print(format_args!("OK\r\n"));
        } else {
            env.print(format_args!("Error\r\n"));
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}
