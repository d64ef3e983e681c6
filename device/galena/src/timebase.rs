//! Corruption-checked millisecond timebase.
//!
//! Every counter is stored twice, the second copy bitwise complemented.
//! A read that finds the copies disagreeing reports `0` instead of a
//! garbage value, marks the timebase unhealthy, and records which counter
//! went bad in an error bitmask. Wall-clock code built on top must
//! tolerate the occasional zero answer; it must never see a wild one.

use core::cell::RefCell;

use critical_section::Mutex;
use thiserror::Error;

/// Subsecond counts per whole uptime second.
pub const SUBSECOND_PER_SECOND: u32 = 1000;

/// Milliseconds added on top of every requested delay so a delay is
/// never shorter than asked for, whichever edge of the tick it starts on.
const DELAY_MARGIN_TICKS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("mirrored copies disagree")]
pub struct CoherencyError;

/// A value stored alongside its bitwise complement.
#[derive(Debug, Clone, Copy)]
pub struct Checked<T> {
    value: T,
    mirror: T,
}

impl<T> Checked<T>
where
    T: Copy + Eq + core::ops::Not<Output = T>,
{
    pub fn new(value: T) -> Self {
        Self {
            value,
            mirror: !value,
        }
    }

    pub fn get(&self) -> Result<T, CoherencyError> {
        if self.value == !self.mirror {
            Ok(self.value)
        } else {
            Err(CoherencyError)
        }
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
        self.mirror = !value;
    }

    /// Damages only the primary copy, leaving the mirror stale.
    #[cfg(test)]
    pub(crate) fn corrupt_primary(&mut self, value: T) {
        self.value = value;
    }
}

/// Which counter failed its coherency check. The values are bit positions
/// in the error mask reported by [`Timebase::error_mask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimebaseFault {
    Tick = 0,
    Subsecond = 1,
    Uptime = 2,
    TickFreq = 3,
    /// The tick frequency handed over at init did not match the stored one.
    TickFreqMismatch = 4,
}

struct Counters {
    healthy: bool,
    error_mask: u32,
    /// Millisecond tick counter; wraps at `u32` boundaries.
    tick: Checked<u32>,
    /// Milliseconds into the current uptime second.
    subsecond: Checked<u32>,
    /// Whole seconds since power-on.
    uptime: Checked<u32>,
    /// Milliseconds added to `tick` per interrupt.
    tick_freq: Checked<u32>,
}

impl Counters {
    fn record(&mut self, fault: TimebaseFault) {
        let bit = 1 << fault as u32;
        if self.error_mask & bit == 0 {
            log::warn!("timebase fault: {fault:?}");
        }
        self.healthy = false;
        self.error_mask |= bit;
    }

    fn get_or_zero(&mut self, which: TimebaseFault) -> u32 {
        let cell = match which {
            TimebaseFault::Tick => &self.tick,
            TimebaseFault::Subsecond => &self.subsecond,
            TimebaseFault::Uptime => &self.uptime,
            TimebaseFault::TickFreq | TimebaseFault::TickFreqMismatch => &self.tick_freq,
        };
        match cell.get() {
            Ok(v) => v,
            Err(CoherencyError) => {
                self.record(which);
                0
            }
        }
    }
}

/// Shared timebase, advanced from the tick interrupt and read from the
/// main loop. All access goes through a critical section.
pub struct Timebase {
    counters: Mutex<RefCell<Counters>>,
}

impl Timebase {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(RefCell::new(Counters {
                healthy: true,
                error_mask: 0,
                tick: Checked::new(0),
                subsecond: Checked::new(0),
                uptime: Checked::new(0),
                tick_freq: Checked::new(1),
            })),
        }
    }

    /// Cross-checks the stored tick frequency against what the board
    /// reports. A mismatch is recorded and the board's value wins.
    pub fn init(&self, tick_freq: u32) {
        critical_section::with(|cs| {
            let mut c = self.counters.borrow_ref_mut(cs);
            let stored = c.get_or_zero(TimebaseFault::TickFreq);
            if stored != tick_freq {
                c.record(TimebaseFault::TickFreqMismatch);
                log::warn!(
                    "tick frequency mismatch: stored {} board {}",
                    stored,
                    tick_freq
                );
            }
            c.tick_freq.set(tick_freq);
        });
    }

    /// Interrupt entry point; call once per tick interrupt.
    pub fn tick(&self) {
        critical_section::with(|cs| {
            let mut c = self.counters.borrow_ref_mut(cs);
            let freq = c.get_or_zero(TimebaseFault::TickFreq);
            let tick = c.get_or_zero(TimebaseFault::Tick);
            c.tick.set(tick.wrapping_add(freq));

            let sub = c.get_or_zero(TimebaseFault::Subsecond) + freq;
            if sub >= SUBSECOND_PER_SECOND {
                let up = c.get_or_zero(TimebaseFault::Uptime);
                c.uptime.set(up.wrapping_add(1));
                c.subsecond.set(sub - SUBSECOND_PER_SECOND);
            } else {
                c.subsecond.set(sub);
            }
        });
    }

    fn read(&self, which: TimebaseFault) -> u32 {
        critical_section::with(|cs| self.counters.borrow_ref_mut(cs).get_or_zero(which))
    }

    /// Milliseconds since power-on, wrapping.
    pub fn now(&self) -> u32 {
        self.read(TimebaseFault::Tick)
    }

    /// Whole seconds since power-on.
    pub fn uptime(&self) -> u32 {
        self.read(TimebaseFault::Uptime)
    }

    pub fn tick_freq(&self) -> u32 {
        self.read(TimebaseFault::TickFreq)
    }

    /// Snapshot for later [`elapsed_since`](Self::elapsed_since) calls.
    pub fn mark(&self) -> u32 {
        self.now()
    }

    /// Milliseconds elapsed since `mark`, correct across tick wraparound.
    pub fn elapsed_since(&self, mark: u32) -> u32 {
        self.now().wrapping_sub(mark)
    }

    /// Busy-waits at least `ms` milliseconds.
    ///
    /// The wait is padded by one tick period so a request issued right
    /// before a tick edge still waits the full duration. The loop keeps
    /// its own complemented copies of the start and duration so that a
    /// corrupted timebase cannot turn the wait into an early return
    /// without being noticed.
    pub fn delay(&self, ms: u32) {
        let freq = self.tick_freq();
        let wait = ms.saturating_add(freq.max(DELAY_MARGIN_TICKS));
        let start = self.mark();
        let start_mirror = !start;
        let wait_mirror = !wait;
        while self.elapsed_since(start) < wait {
            if start != !start_mirror || wait != !wait_mirror {
                critical_section::with(|cs| {
                    self.counters
                        .borrow_ref_mut(cs)
                        .record(TimebaseFault::Tick)
                });
                break;
            }
            core::hint::spin_loop();
        }
    }

    /// `false` once any counter has failed a coherency check.
    pub fn healthy(&self) -> bool {
        critical_section::with(|cs| self.counters.borrow_ref_mut(cs).healthy)
    }

    /// Bitmask of [`TimebaseFault`] positions seen so far.
    pub fn error_mask(&self) -> u32 {
        critical_section::with(|cs| self.counters.borrow_ref_mut(cs).error_mask)
    }

    #[cfg(test)]
    pub(crate) fn corrupt_tick_for_test(&self, value: u32) {
        critical_section::with(|cs| {
            self.counters
                .borrow_ref_mut(cs)
                .tick
                .corrupt_primary(value)
        });
    }

    #[cfg(test)]
    pub(crate) fn set_tick_for_test(&self, value: u32) {
        critical_section::with(|cs| self.counters.borrow_ref_mut(cs).tick.set(value));
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ticks accumulate into the millisecond counter and carry into
    /// whole uptime seconds.
    #[test]
    fn tick_accumulates_uptime() {
        let tb = Timebase::new();
        tb.init(1);
        for _ in 0..2500 {
            tb.tick();
        }
        assert_eq!(tb.now(), 2500);
        assert_eq!(tb.uptime(), 2);
        assert!(tb.healthy());
        assert_eq!(tb.error_mask(), 0);
    }

    /// Elapsed time is computed in wrapping arithmetic, so a mark taken
    /// just before the tick counter wraps still measures correctly.
    #[test]
    fn elapsed_across_wraparound() {
        let tb = Timebase::new();
        tb.init(1);
        tb.set_tick_for_test(u32::MAX - 2);
        let mark = tb.mark();
        for _ in 0..10 {
            tb.tick();
        }
        assert_eq!(tb.elapsed_since(mark), 10);
    }

    /// A corrupted counter reads as zero, clears the healthy flag, and
    /// sets the matching bit in the error mask.
    #[test]
    fn corruption_reads_zero_and_flags() {
        let tb = Timebase::new();
        tb.init(1);
        for _ in 0..100 {
            tb.tick();
        }
        tb.corrupt_tick_for_test(0xDEAD_BEEF);
        assert_eq!(tb.now(), 0);
        assert!(!tb.healthy());
        assert_eq!(tb.error_mask() & (1 << TimebaseFault::Tick as u32), 1);
    }

    /// Init against a different frequency than the stored one records a
    /// mismatch but adopts the board's value.
    #[test]
    fn init_frequency_mismatch() {
        let tb = Timebase::new();
        tb.init(10);
        assert!(!tb.healthy());
        assert_ne!(
            tb.error_mask() & (1 << TimebaseFault::TickFreqMismatch as u32),
            0
        );
        assert_eq!(tb.tick_freq(), 10);
        tb.tick();
        assert_eq!(tb.now(), 10);
    }

    /// Faster tick frequencies advance the subsecond counter in larger
    /// steps but uptime still counts whole seconds.
    #[test]
    fn coarse_tick_frequency() {
        let tb = Timebase::new();
        tb.init(10);
        for _ in 0..150 {
            tb.tick();
        }
        assert_eq!(tb.now(), 1500);
        assert_eq!(tb.uptime(), 1);
    }
}
