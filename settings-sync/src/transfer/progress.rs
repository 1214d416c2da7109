//! Progress state for store transfers.
//!
//! Percentages reported while a transfer is in flight are capped at 99 so
//! that exactly 100 is only ever seen once the operation has finished.

use serde::{Deserialize, Serialize};

/// Highest percentage reported before a transfer has completed
pub const IN_FLIGHT_CAP: u8 = 99;

/// Observable progress of the current transfer
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Percentage complete (0-100)
    pub percent_complete: f64,

    /// A transfer is running or has just finished and not been reset yet
    pub is_active: bool,
}

impl TransferProgress {
    /// Inactive, nothing to show
    pub fn idle() -> Self {
        Self::default()
    }

    /// Progress bar for a transfer that just started
    pub fn started() -> Self {
        Self {
            percent_complete: 0.0,
            is_active: true,
        }
    }

    /// Update with a new percentage; never moves backwards
    pub fn update(&mut self, percent: u8) {
        let percent = f64::from(percent.min(100));
        if percent > self.percent_complete {
            self.percent_complete = percent;
        }
    }

    /// Check if transfer is complete
    pub fn is_complete(&self) -> bool {
        self.percent_complete >= 100.0
    }
}

/// In-flight percentage for `done` of `total` bytes.
///
/// Returns `None` when the total is unknown, in which case nothing should be
/// reported until completion.
pub fn capped_percent(done: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = (u128::from(done) * 100 / u128::from(total)).min(u128::from(IN_FLIGHT_CAP));
    Some(percent as u8)
}

/// Format a byte count as a human-readable size
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes > GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes > MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes > KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a transfer speed as a human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;

    if bytes_per_second > MB {
        format!("{:.2} MB/s", bytes_per_second as f64 / MB as f64)
    } else if bytes_per_second > KB {
        format!("{:.1} KB/s", bytes_per_second as f64 / KB as f64)
    } else {
        format!("{} B/s", bytes_per_second)
    }
}
