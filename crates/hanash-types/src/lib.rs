//! Shared types for Hanash
//!
//! This crate contains the plain data structures shared between the
//! download engine and its drivers (CLI, a future GUI). Items carry no
//! channels or handles; the engine owns those locally and the registry
//! persists only the data fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Download Types
// ============================================================================

/// Prefix of the destination file while it is still being assembled.
pub const DOWNLOADING_PREFIX: &str = "__downloading__";

/// Suffix of the per-download folder holding segment files.
pub const PARTS_SUFFIX: &str = "_parts";

/// Default segment length in bytes (1 MiB).
pub const DEFAULT_PART_SIZE: u64 = 1_048_576;

/// A single entry in the download registry.
///
/// The id is dense: it equals the item's index in the registry list and is
/// reassigned when items are deleted. Runtime fields (`speed`, `time_left`,
/// `live_connections`, `remaining_parts`) are owned by the running
/// coordinator and reset when the registry is loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub id: usize,
    /// URL as submitted by the user.
    pub url: String,
    /// URL after following redirects, used for all segment requests.
    pub eff_url: String,
    /// Page or playlist the URL was extracted from, if any.
    pub pl_url: Option<String>,
    /// Sanitized file name.
    pub name: String,
    /// Destination folder.
    pub folder: PathBuf,
    /// Total size in bytes; 0 means unknown.
    pub size: u64,
    pub mime_type: String,
    /// Server advertised `accept-ranges` other than "none".
    pub resumable: bool,
    pub max_connections: usize,
    /// Segment length in bytes, capped by the total size.
    pub part_size: u64,
    pub status: Status,
    pub downloaded: u64,
    /// Percentage with one decimal, 0 when the size is unknown.
    pub progress: f64,
    #[serde(default)]
    pub speed: u64,
    /// Estimated seconds remaining; `None` when unknown.
    #[serde(default)]
    pub time_left: Option<u64>,
    #[serde(default)]
    pub live_connections: usize,
    #[serde(default)]
    pub remaining_parts: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadItem {
    pub fn new(url: String, folder: PathBuf) -> Self {
        Self {
            id: 0,
            eff_url: url.clone(),
            url,
            pl_url: None,
            name: String::new(),
            folder,
            size: 0,
            mime_type: String::new(),
            resumable: false,
            max_connections: 1,
            part_size: DEFAULT_PART_SIZE,
            status: Status::Cancelled,
            downloaded: 0,
            progress: 0.0,
            speed: 0,
            time_left: None,
            live_connections: 0,
            remaining_parts: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Folder holding the segment files: `<folder>/<name>_parts`.
    pub fn temp_folder(&self) -> PathBuf {
        self.folder.join(format!("{}{}", self.name, PARTS_SUFFIX))
    }

    /// Destination file while still being assembled.
    pub fn temp_file(&self) -> PathBuf {
        self.folder.join(format!("{}{}", DOWNLOADING_PREFIX, self.name))
    }

    /// Final destination file.
    pub fn target_file(&self) -> PathBuf {
        self.folder.join(&self.name)
    }

    /// Set the segment length, capping it at the total size. Non-positive
    /// values fall back to one segment covering the whole file.
    pub fn set_part_size(&mut self, part_size: u64) {
        self.part_size = if self.size > 0 {
            part_size.min(self.size)
        } else {
            part_size
        };
    }
}

/// Status of a download item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Downloading,
    Paused,
    Cancelled,
    Completed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Downloading => "downloading",
            Status::Paused => "paused",
            Status::Cancelled => "cancelled",
            Status::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// A contiguous byte range `[start, end]` of the remote resource, with
/// inclusive endpoints. Segments are identified by their name `"start-end"`,
/// which is also the file name of the segment on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Parse a segment from its `"start-end"` name.
    pub fn parse(name: &str) -> Option<Self> {
        let (a, b) = name.split_once('-')?;
        Some(Self {
            start: a.parse().ok()?,
            end: b.parse().ok()?,
        })
    }

    pub fn name(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }

    /// Target length in bytes. A segment ending at byte 0 has size 0, which
    /// marks an unknown-size transfer that runs until the server closes.
    pub fn size(&self) -> u64 {
        if self.end == 0 {
            0
        } else {
            self.end - self.start + 1
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings, persisted as a small JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Default download directory.
    pub folder: PathBuf,
    /// Watch the clipboard for URLs (consumed by drivers, not the engine).
    pub monitor: bool,
    pub max_concurrent_downloads: usize,
    pub hide_download_window: bool,
    pub theme: String,
    /// Global speed limit in KB/s; 0 disables the cap.
    #[serde(default)]
    pub speed_limit: u64,
    /// Connections per download for resumable resources.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Segment length for new downloads, in KB.
    #[serde(default = "default_part_size_kb")]
    pub part_size: u64,
}

fn default_max_connections() -> usize {
    10
}

fn default_part_size_kb() -> u64 {
    1024
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            folder: dirs::download_dir()
                .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
                .unwrap_or_else(|| PathBuf::from(".")),
            monitor: true,
            max_concurrent_downloads: 3,
            hide_download_window: true,
            theme: "Green".to_string(),
            speed_limit: 0,
            max_connections: default_max_connections(),
            part_size: default_part_size_kb(),
        }
    }
}

impl Settings {
    /// Global speed limit in bytes per second; 0 disables the cap.
    pub fn speed_limit_bytes(&self) -> u64 {
        self.speed_limit * 1024
    }

    /// Segment length in bytes.
    pub fn part_size_bytes(&self) -> u64 {
        self.part_size * 1024
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events broadcast by the engine to its drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    ItemAdded {
        item: DownloadItem,
    },
    ItemRemoved {
        id: usize,
    },
    StatusChanged {
        id: usize,
        status: Status,
    },
    Progress {
        id: usize,
        downloaded: u64,
        total: u64,
        speed: u64,
        eta: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_round_trip() {
        let seg = Segment::new(512, 1023);
        assert_eq!(seg.name(), "512-1023");
        assert_eq!(Segment::parse("512-1023"), Some(seg));
        assert_eq!(seg.size(), 512);
    }

    #[test]
    fn segment_parse_rejects_garbage() {
        assert_eq!(Segment::parse("512"), None);
        assert_eq!(Segment::parse("a-b"), None);
        assert_eq!(Segment::parse(""), None);
    }

    #[test]
    fn zero_ended_segment_has_size_zero() {
        assert_eq!(Segment::new(0, 0).size(), 0);
    }

    #[test]
    fn part_size_capped_by_total_size() {
        let mut item = DownloadItem::new("http://example.com/a".into(), PathBuf::from("/tmp"));
        item.size = 4096;
        item.set_part_size(1_048_576);
        assert_eq!(item.part_size, 4096);
        item.set_part_size(1024);
        assert_eq!(item.part_size, 1024);
    }

    #[test]
    fn derived_paths() {
        let mut item = DownloadItem::new("http://example.com/a.bin".into(), PathBuf::from("/dl"));
        item.name = "a.bin".to_string();
        assert_eq!(item.temp_folder(), PathBuf::from("/dl/a.bin_parts"));
        assert_eq!(item.temp_file(), PathBuf::from("/dl/__downloading__a.bin"));
        assert_eq!(item.target_file(), PathBuf::from("/dl/a.bin"));
    }
}
