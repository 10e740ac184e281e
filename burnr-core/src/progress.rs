//! Progress parsing and rate computation for the burn process.
//!
//! dd reports progress in several dialects depending on version and phase.
//! [`ProgressParser`] tries a fixed list of patterns in priority order and
//! takes the first that yields a positive byte count. [`ProgressTracker`]
//! holds the mutable counters: byte samples never regress, the displayed
//! percentage is capped at 95 until the sync phase finishes, and speed/ETA
//! are recomputed at most once per 500 ms so the display does not flicker.

use std::time::{Duration, Instant};

use regex::Regex;

/// Minimum wall-clock gap between speed/ETA recomputations.
pub const RATE_INTERVAL: Duration = Duration::from_millis(500);

/// Highest percentage shown while the copy is still running; the remaining
/// span is reserved for the sync phase.
pub const WRITING_PERCENT_CAP: u8 = 95;

/// Percentage shown while the device is syncing.
pub const SYNCING_PERCENT: u8 = 98;

/// Line printed by the burn script when the copy enters its sync phase.
pub const SYNC_MARKER: &str = "Syncing device";

/// Sentinel printed by the burn script after the sync completed.
pub const COMPLETION_SENTINEL: &str = "Burn operation completed successfully";

/// Ordered byte-count extractors for the copy tool's output dialects.
pub struct ProgressParser {
    patterns: Vec<Regex>,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        let patterns = vec![
            // "104857600 bytes (105 MB, 100 MiB) copied, 2.0 s, 52 MB/s"
            Regex::new(r"(\d+)\s+bytes\s+\([^)]+\)\s+copied").unwrap(),
            // "104857600 bytes copied"
            Regex::new(r"(\d+)\s+bytes.*copied").unwrap(),
            // "104857600 bytes"
            Regex::new(r"^(\d+)\s+bytes").unwrap(),
            // "100+0 records out"
            Regex::new(r"(\d+)\+\d+\s+records\s+out").unwrap(),
        ];
        Self { patterns }
    }

    /// Extracts a byte count from one output line. The first pattern that
    /// yields a positive integer wins; a line matching no pattern is not an
    /// error.
    pub fn extract_bytes(&self, line: &str) -> Option<u64> {
        for pattern in &self.patterns {
            if let Some(captures) = pattern.captures(line) {
                if let Ok(bytes) = captures[1].parse::<u64>() {
                    if bytes > 0 {
                        return Some(bytes);
                    }
                }
            }
        }
        None
    }

    pub fn is_sync_marker(&self, line: &str) -> bool {
        line.contains(SYNC_MARKER)
    }

    pub fn is_completion_sentinel(&self, line: &str) -> bool {
        line.contains(COMPLETION_SENTINEL)
    }
}

/// What a recorded sample produced: a percentage to display, and possibly a
/// fresh speed/ETA pair if the rate interval elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub percent: u8,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

/// Mutable progress state for one burn job. Single-writer from the process
/// output path; readers take a snapshot under the engine's lock.
#[derive(Debug)]
pub struct ProgressTracker {
    total_bytes: u64,
    bytes_written: u64,
    percent: u8,
    speed: String,
    eta: String,
    last_rate_update: Option<Instant>,
    last_rate_bytes: u64,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            bytes_written: 0,
            percent: 0,
            speed: String::new(),
            eta: String::new(),
            last_rate_update: None,
            last_rate_bytes: 0,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Records a byte sample at the current instant.
    pub fn record(&mut self, bytes: u64) -> Option<Sample> {
        self.record_at(bytes, Instant::now())
    }

    /// Records a byte sample taken at `now`. Regressive samples are dropped.
    /// The returned percentage is capped at [`WRITING_PERCENT_CAP`]; speed
    /// and ETA are present only when at least [`RATE_INTERVAL`] elapsed
    /// since the previous rate computation.
    pub fn record_at(&mut self, bytes: u64, now: Instant) -> Option<Sample> {
        if bytes < self.bytes_written {
            return None;
        }
        self.bytes_written = bytes;

        let percent = if self.total_bytes > 0 {
            let raw = self.bytes_written.saturating_mul(100) / self.total_bytes;
            raw.min(WRITING_PERCENT_CAP as u64) as u8
        } else {
            0
        };
        self.percent = percent;

        let mut speed = None;
        let mut eta = None;

        match self.last_rate_update {
            None => {
                self.last_rate_update = Some(now);
                self.last_rate_bytes = self.bytes_written;
            }
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= RATE_INTERVAL {
                    let byte_delta = self.bytes_written - self.last_rate_bytes;
                    let bytes_per_sec = byte_delta as f64 / elapsed.as_secs_f64();

                    self.speed = format_speed(bytes_per_sec);
                    speed = Some(self.speed.clone());

                    let remaining = self.total_bytes.saturating_sub(self.bytes_written);
                    self.eta = if bytes_per_sec > 0.0 {
                        format_eta((remaining as f64 / bytes_per_sec) as u64)
                    } else {
                        "Unknown".to_string()
                    };
                    eta = Some(self.eta.clone());

                    self.last_rate_update = Some(now);
                    self.last_rate_bytes = self.bytes_written;
                }
            }
        }

        Some(Sample {
            percent,
            speed,
            eta,
        })
    }

    /// Overrides the displayed percentage for the sync/completion phases.
    pub fn set_phase_percent(&mut self, percent: u8) {
        self.percent = percent;
    }

    /// A cloneable snapshot of the current counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_bytes: self.total_bytes,
            bytes_written: self.bytes_written,
            percent: self.percent,
            speed: self.speed.clone(),
            eta: self.eta.clone(),
        }
    }
}

/// Read-only copy of the progress counters, handed to callers.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub total_bytes: u64,
    pub bytes_written: u64,
    pub percent: u8,
    pub speed: String,
    pub eta: String,
}

/// Renders a transfer rate, e.g. "41.52 MB/s".
pub fn format_speed(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    if bytes_per_sec <= 0.0 {
        return "0 B/s".to_string();
    }
    let mut rate = bytes_per_sec;
    let mut unit = 0;
    while rate >= 1024.0 && unit < UNITS.len() - 1 {
        rate /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", rate, UNITS[unit])
}

/// Renders a remaining time as `H:MM:SS` when an hour or more, else `M:SS`.
pub fn format_eta(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}
