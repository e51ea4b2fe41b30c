use embedded_sdmmc::{TimeSource, Timestamp};

/// Time source for boards without a real-time clock.
///
/// Every file gets the same creation/modification date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTimeSource {
    year: u16,
    month: u8,
    day: u8,
}

impl FixedTimeSource {
    /// `month` and `day` are one-based.
    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }
}

impl Default for FixedTimeSource {
    fn default() -> Self {
        Self::new(2025, 8, 11)
    }
}

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: self.year.saturating_sub(1970).min(u16::from(u8::MAX)) as u8,
            zero_indexed_month: self.month.saturating_sub(1),
            zero_indexed_day: self.day.saturating_sub(1),
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}
