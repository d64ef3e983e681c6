//! Calendar clock value and its validity rules.

/// Broken-down calendar time as the RTC hardware carries it. `year` is
/// years since 2000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl DateTime {
    /// Fallback value applied when a candidate fails validation.
    pub const EPOCH: DateTime = DateTime {
        year: 16,
        month: 1,
        day: 1,
        hours: 0,
        minutes: 0,
        seconds: 0,
    };

    fn is_valid(&self) -> bool {
        (16..=99).contains(&self.year)
            && (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hours <= 23
            && self.minutes <= 59
            && self.seconds <= 59
    }

    /// Checks the field ranges; out-of-range values reset the whole
    /// value to [`EPOCH`](Self::EPOCH). Returns whether the original was
    /// valid.
    pub fn validate_and_correct(&mut self) -> bool {
        if self.is_valid() {
            true
        } else {
            *self = DateTime::EPOCH;
            false
        }
    }
}
