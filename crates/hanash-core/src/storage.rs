//! Storage layer - the registry list file and the settings file

use crate::error::HanashError;
use hanash_types::{DownloadItem, Settings, Status};
use std::path::PathBuf;
use tokio::fs;
use tracing::warn;

/// Registry of download items, one JSON list in a single file.
const LIST_FILE: &str = "downloads.cfg";

/// Application settings, a small JSON object.
const SETTINGS_FILE: &str = "setting.cfg";

/// Reads and writes the files under the engine's data directory.
#[derive(Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub async fn new(dir: PathBuf) -> Result<Self, HanashError> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Load the registry. A missing or corrupt file yields an empty list.
    ///
    /// Statuses are sanitized: anything that was not completed when the
    /// previous session ended becomes cancelled, or completed when no
    /// segments remain. Runtime fields are reset and ids re-derived from
    /// the list position.
    pub async fn load_items(&self) -> Vec<DownloadItem> {
        let path = self.dir.join(LIST_FILE);
        let mut items: Vec<DownloadItem> = match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(list) => list,
                Err(e) => {
                    warn!("corrupt {}, starting with an empty list: {}", LIST_FILE, e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        for (i, item) in items.iter_mut().enumerate() {
            item.id = i;
            if item.status != Status::Completed {
                item.status = if item.remaining_parts == 0 {
                    Status::Completed
                } else {
                    Status::Cancelled
                };
            }
            item.speed = 0;
            item.time_left = None;
            item.live_connections = 0;
        }
        items
    }

    pub async fn save_items(&self, items: &[DownloadItem]) -> Result<(), HanashError> {
        let text = serde_json::to_string_pretty(items)?;
        fs::write(self.dir.join(LIST_FILE), text).await?;
        Ok(())
    }

    /// Load settings, falling back to defaults when missing or corrupt.
    pub async fn load_settings(&self) -> Settings {
        match fs::read_to_string(self.dir.join(SETTINGS_FILE)).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("corrupt {}, using defaults: {}", SETTINGS_FILE, e);
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), HanashError> {
        let text = serde_json::to_string_pretty(settings)?;
        fs::write(self.dir.join(SETTINGS_FILE), text).await?;
        Ok(())
    }
}
