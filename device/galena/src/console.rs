//! Interrupt-fed serial console.
//!
//! Reception happens byte-at-a-time in the UART interrupt, which pushes
//! into a ring behind a critical section. The main loop assembles lines
//! from that ring, echoing as it goes, and queues its own output into a
//! transmit ring that [`Console::background_print`] drains a little at a
//! time so command handlers never block on the wire.

use core::fmt;

use critical_section::Mutex;

use crate::board::Board;
use crate::buf::RingBuffer;
use crate::timebase::Timebase;
use crate::timeouts::CONSOLE_TIMEOUT_MS;

/// Receive ring capacity; also the maximum line length.
pub const CONSOLE_RX_BUF_LEN: usize = 320;
/// Transmit ring capacity.
pub const CONSOLE_TX_BUF_LEN: usize = 1024;
/// Bytes handed to the DMA engine per background-print call.
pub const CONSOLE_TX_DMA_BUF_LEN: usize = 550;

const CHAR_DEL: u8 = 0x7F;
const CHAR_BS: u8 = 0x08;

/// Receive side, shared with the UART interrupt.
pub struct RxQueue {
    ring: Mutex<core::cell::RefCell<RingBuffer<CONSOLE_RX_BUF_LEN>>>,
}

impl RxQueue {
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(core::cell::RefCell::new(RingBuffer::new())),
        }
    }

    /// Interrupt entry point. Returns `false` when the ring was full and
    /// the byte was dropped.
    pub fn push_from_irq(&self, byte: u8) -> bool {
        critical_section::with(|cs| self.ring.borrow_ref_mut(cs).enqueue(byte))
    }

    fn pop(&self) -> Option<u8> {
        critical_section::with(|cs| self.ring.borrow_ref_mut(cs).dequeue())
    }

    fn index_in(&self) -> u16 {
        critical_section::with(|cs| self.ring.borrow_ref_mut(cs).index_in())
    }

    pub fn remaining_space(&self) -> usize {
        critical_section::with(|cs| self.ring.borrow_ref_mut(cs).remaining_space())
    }
}

impl Default for RxQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Console state owned by the main loop.
pub struct Console<'i> {
    rx: &'i RxQueue,
    tx: RingBuffer<CONSOLE_TX_BUF_LEN>,
    /// Echo the whole line at completion instead of per keystroke.
    echo_delay: bool,
    /// Transmit synchronously instead of queueing; used during startup
    /// before the background pump runs, and by the test builds.
    blocking: bool,
    /// Swallow all output. Cleared when the post-reset handshake with
    /// the neighbor node completes.
    silent: bool,
    line: [u8; CONSOLE_RX_BUF_LEN],
    line_index: usize,
    last_rx_index_in: u16,
    active_mark: u32,
    disabled_mark: u32,
    disabled_time: u32,
}

impl<'i> Console<'i> {
    pub fn new(rx: &'i RxQueue, start_silent: bool) -> Self {
        Self {
            rx,
            tx: RingBuffer::new(),
            echo_delay: false,
            blocking: true,
            silent: start_silent,
            line: [0; CONSOLE_RX_BUF_LEN],
            line_index: 0,
            last_rx_index_in: 0,
            active_mark: 0,
            disabled_mark: 0,
            disabled_time: 0,
        }
    }

    pub fn set_echo_delay(&mut self, enable: bool) {
        self.echo_delay = enable;
    }

    pub fn set_blocking(&mut self, enable: bool) {
        self.blocking = enable;
    }

    pub fn set_silent(&mut self, enable: bool) {
        self.silent = enable;
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Free space in the transmit ring.
    pub fn print_buffer_space(&self) -> usize {
        self.tx.remaining_space()
    }

    /// Free space in the receive ring.
    pub fn rx_buffer_space(&self) -> usize {
        self.rx.remaining_space()
    }

    /// Timer snapshot from the last cycle where the console had traffic
    /// in flight in either direction.
    pub fn active_mark(&self) -> u32 {
        self.active_mark
    }

    /// Suppresses transmission for `time_ms`, counted from now. Used
    /// around line-direction turnarounds on the shared bus.
    pub fn disable_for(&mut self, timebase: &Timebase, time_ms: u32) {
        self.disabled_mark = timebase.mark();
        self.disabled_time = time_ms;
    }

    pub(crate) fn put_byte<B: Board>(&mut self, board: &mut B, byte: u8) {
        if self.silent {
            return;
        }
        if self.blocking {
            board.uart_transmit(&[byte], CONSOLE_TIMEOUT_MS);
        } else {
            // drop on overflow; the overrun is visible as missing output
            self.tx.enqueue(byte);
        }
    }

    /// `core::fmt` adapter writing through this console.
    pub fn writer<'a, B: Board>(&'a mut self, board: &'a mut B) -> ConsoleWriter<'a, 'i, B> {
        ConsoleWriter {
            console: self,
            board,
        }
    }

    pub(crate) fn print_fmt<B: Board>(&mut self, board: &mut B, args: fmt::Arguments<'_>) {
        let _ = fmt::Write::write_fmt(&mut self.writer(board), args);
    }

    /// Pulls received bytes into the line buffer. Returns `true` when a
    /// full line (terminated by CR) was copied into `out`.
    ///
    /// Printable bytes are stored and echoed; DEL/BS rubs out the last
    /// byte; everything else is ignored. If the line buffer fills up an
    /// overrun notice is printed and the line restarts. Processing is
    /// deferred for a cycle whenever new bytes arrived since the last
    /// call, so a line is only parsed once the sender pauses.
    pub fn read_line<B: Board>(&mut self, board: &mut B, out: &mut [u8]) -> bool {
        let index_in = self.rx.index_in();
        if index_in != self.last_rx_index_in {
            self.last_rx_index_in = index_in;
            return false;
        }

        let mut complete = false;
        while !complete {
            let Some(byte) = self.rx.pop() else {
                break;
            };
            if byte == b'\r' {
                self.line_index = self.line_index.min(CONSOLE_RX_BUF_LEN - 1);
                self.line[self.line_index] = 0;
                if !self.echo_delay {
                    self.put_byte(board, b'\r');
                    self.put_byte(board, b'\n');
                }
                complete = true;
            } else if self.line_index < CONSOLE_RX_BUF_LEN {
                if (0x20..=0x7E).contains(&byte) {
                    self.line[self.line_index] = byte;
                    self.line_index += 1;
                    if !self.echo_delay {
                        self.put_byte(board, byte);
                    }
                } else if (byte == CHAR_DEL || byte == CHAR_BS) && self.line_index > 0 {
                    self.line_index -= 1;
                    self.line[self.line_index] = 0;
                    if !self.echo_delay {
                        self.put_byte(board, byte);
                    }
                }
            } else {
                self.print_fmt(
                    board,
                    format_args!("Console buffer overrun {}\r\n", CONSOLE_RX_BUF_LEN),
                );
                self.line_index = 0;
            }
        }

        if complete {
            if self.echo_delay {
                for i in 0..self.line_index {
                    let byte = self.line[i];
                    self.put_byte(board, byte);
                }
                self.put_byte(board, b'\r');
                self.put_byte(board, b'\n');
            }
            let n = out.len().min(CONSOLE_RX_BUF_LEN);
            out[..n].copy_from_slice(&self.line[..n]);
            self.line_index = 0;
        }
        complete
    }

    /// Pumps queued output toward the wire, bounded by `timeout_ms` of
    /// transmit time (or one DMA batch). Returns whether there was
    /// anything to send this cycle.
    pub fn background_print<B: Board>(
        &mut self,
        board: &mut B,
        timebase: &Timebase,
        timeout_ms: u32,
    ) -> bool {
        let mut suppressed = false;
        if self.disabled_time > 0 {
            if timebase.elapsed_since(self.disabled_mark) > self.disabled_time {
                self.disabled_time = 0;
            } else {
                suppressed = true;
            }
        }

        let pending = !self.tx.is_empty();
        let sent = pending && !suppressed;
        if sent {
            if board.uart_dma_available() {
                if !board.uart_dma_busy() {
                    let mut batch = [0u8; CONSOLE_TX_DMA_BUF_LEN];
                    let mut n = 0;
                    while n < CONSOLE_TX_DMA_BUF_LEN {
                        match self.tx.dequeue() {
                            Some(b) => {
                                batch[n] = b;
                                n += 1;
                            }
                            None => break,
                        }
                    }
                    board.uart_transmit_dma(&batch[..n]);
                }
            } else {
                let mark = timebase.mark();
                while timebase.elapsed_since(mark) < timeout_ms {
                    match self.tx.dequeue() {
                        Some(b) => {
                            board.uart_transmit(&[b], CONSOLE_TIMEOUT_MS);
                        }
                        None => break,
                    }
                }
            }
        }

        if self.rx_buffer_space() != CONSOLE_RX_BUF_LEN || !self.tx.is_empty() {
            self.active_mark = timebase.mark();
        }
        sent
    }
}

pub struct ConsoleWriter<'a, 'i, B: Board> {
    console: &'a mut Console<'i>,
    board: &'a mut B,
}

impl<B: Board> fmt::Write for ConsoleWriter<'_, '_, B> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.console.put_byte(self.board, byte);
        }
        Ok(())
    }
}
