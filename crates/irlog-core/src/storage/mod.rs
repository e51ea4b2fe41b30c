//! SD card storage: mounting, whole-file and line-oriented access.
//!
//! Files live in the root directory of the first FAT volume and are
//! addressed as `/sdcard/NAME.EXT` with 8.3 names.

mod clock;
mod error;
mod fat;
mod sd_card;

#[cfg(any(test, feature = "host"))]
mod ram;

use alloc::string::String;

pub use clock::FixedTimeSource;
pub use error::*;
pub use sd_card::{CardHandle, SpiCardBus, SpiCardBusError, StorageBus, StorageSession};

#[cfg(any(test, feature = "host"))]
pub use ram::{RamBus, RamCard, RamCardError};

/// Prefix under which the mounted volume appears.
pub const MOUNT_POINT: &str = "/sdcard";

/// Free-form event log written by [`StorageSession::log_event`].
pub const EVENT_LOG_PATH: &str = "/sdcard/SDCARD.TXT";

/// Longest 8.3 name, dot included.
const SHORT_NAME_LEN: usize = 12;

/// Capacity of the mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl SpaceInfo {
    pub fn total_mib(&self) -> f32 {
        self.total_bytes as f32 / (1024.0 * 1024.0)
    }

    pub fn free_mib(&self) -> f32 {
        self.free_bytes as f32 / (1024.0 * 1024.0)
    }
}

/// Contents of a file, split on line terminators.
///
/// Iterating does not consume the contents, so the lines can be walked
/// any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lines {
    text: String,
}

impl Lines {
    pub(crate) fn new(text: String) -> Self {
        Self { text }
    }

    pub fn iter(&self) -> core::str::Lines<'_> {
        self.text.lines()
    }

    /// Number of lines.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The raw file contents.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl<'a> IntoIterator for &'a Lines {
    type Item = &'a str;
    type IntoIter = core::str::Lines<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Resolve `/sdcard/NAME.EXT` to the upper-case short name in the root directory.
pub(crate) fn short_name(path: &str) -> Option<heapless::String<SHORT_NAME_LEN>> {
    let name = path.strip_prefix(MOUNT_POINT)?.strip_prefix('/')?;
    if name.is_empty() || name.contains('/') {
        return None;
    }

    let mut short = heapless::String::new();
    for c in name.chars() {
        short.push(c.to_ascii_uppercase()).ok()?;
    }
    Some(short)
}
