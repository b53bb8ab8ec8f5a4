//! Assembler - splices finished segments into the in-progress file
//!
//! The assembler owns the in-progress file and the persisted completed set.
//! Segment files are written at their start offset; seeking past the end of
//! the file relies on sparse-file semantics, so holes read back as zeros
//! until the missing segments arrive. When every planned segment has been
//! appended, the in-progress file is renamed to the final target and the
//! temp folder is removed.

use crate::engine::{CoordinatorMsg, PartMsg, TICK};
use hanash_types::{Segment, Status};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Barrier};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// File inside the temp folder recording which segments were appended.
pub const COMPLETED_FILE: &str = "completed.cfg";

pub struct Assembler {
    pub(crate) item_id: usize,
    pub(crate) temp_folder: PathBuf,
    pub(crate) temp_file: PathBuf,
    pub(crate) target_file: PathBuf,
    pub(crate) all_parts: HashSet<String>,
    pub(crate) rx: mpsc::UnboundedReceiver<PartMsg>,
    pub(crate) coord_tx: mpsc::UnboundedSender<CoordinatorMsg>,
    pub(crate) barrier: Arc<Barrier>,
}

/// Read the persisted completed set; a missing or corrupt file is empty.
pub async fn load_completed(temp_folder: &Path) -> HashSet<String> {
    match fs::read(temp_folder.join(COMPLETED_FILE)).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(set) => set,
            Err(e) => {
                warn!("corrupt {}, treating as empty: {}", COMPLETED_FILE, e);
                HashSet::new()
            }
        },
        Err(_) => HashSet::new(),
    }
}

async fn save_completed(temp_folder: &Path, set: &HashSet<String>) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(set)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(temp_folder.join(COMPLETED_FILE), bytes).await
}

impl Assembler {
    pub async fn run(mut self) {
        // the in-progress file must exist before the first append
        if let Err(e) = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.temp_file)
            .await
        {
            error!("assembler {}: cannot create {:?}: {}", self.item_id, self.temp_file, e);
        }

        let mut completed = load_completed(&self.temp_folder).await;
        let mut pending: Vec<String> = Vec::new();
        let mut exit = false;
        let mut ticker = interval(TICK);

        loop {
            ticker.tick().await;

            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    PartMsg::Completed(name) => {
                        // a name already in the set was appended earlier and
                        // its file is gone; appending again is a no-op
                        if !completed.contains(&name) && !pending.contains(&name) {
                            pending.push(name);
                        }
                    }
                    PartMsg::Exit => exit = true,
                }
            }

            let mut appended = false;
            let mut i = 0;
            while i < pending.len() {
                let name = pending[i].clone();
                match self.append_part(&name).await {
                    Ok(()) => {
                        debug!("assembler {}: appended segment {}", self.item_id, name);
                        pending.remove(i);
                        completed.insert(name);
                        appended = true;
                    }
                    Err(e) => {
                        // leave it in the list, the next tick retries
                        warn!("assembler {}: cannot append {}: {}", self.item_id, name, e);
                        i += 1;
                    }
                }
            }
            if appended {
                if let Err(e) = save_completed(&self.temp_folder, &completed).await {
                    warn!("assembler {}: cannot persist completed set: {}", self.item_id, e);
                }
            }

            if completed == self.all_parts {
                info!(
                    "assembler {}: all {} segments assembled",
                    self.item_id,
                    self.all_parts.len()
                );
                let _ = self.coord_tx.send(CoordinatorMsg::Status(Status::Completed));
                if let Err(e) = fs::rename(&self.temp_file, &self.target_file).await {
                    error!("assembler {}: cannot rename to {:?}: {}", self.item_id, self.target_file, e);
                }
                if let Err(e) = fs::remove_dir_all(&self.temp_folder).await {
                    warn!("assembler {}: cannot remove temp folder: {}", self.item_id, e);
                }
                break;
            }

            if exit {
                break;
            }
        }

        self.barrier.wait().await;
        debug!("assembler {}: quitting", self.item_id);
    }

    /// Write one segment file into the in-progress file at its offset, then
    /// delete the segment file.
    async fn append_part(&self, name: &str) -> std::io::Result<()> {
        let segment = Segment::parse(name).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad segment name {name}"))
        })?;
        let part_path = self.temp_folder.join(name);
        let bytes = fs::read(&part_path).await?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.temp_file)
            .await?;
        file.seek(SeekFrom::Start(segment.start)).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;

        fs::remove_file(&part_path).await?;
        Ok(())
    }
}
