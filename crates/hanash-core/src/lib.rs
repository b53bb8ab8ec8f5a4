//! Hanash Core - Download Engine
//!
//! This crate provides the resumable multi-connection download engine:
//! URL probing, segment planning, the per-download coordinator with its
//! worker pool and assembler, and the persistent registry with a scheduler
//! that bounds concurrent downloads.

mod engine;
mod error;
mod planner;
mod probe;
mod scheduler;
mod storage;

pub use error::HanashError;
pub use planner::plan_segments;
pub use probe::{build_client, is_bad_status, probe_url, sanitize_file_name, ProbeInfo, USER_AGENT};
pub use scheduler::Scheduler;
pub use storage::Storage;

use engine::{Coordinator, CoordinatorMsg};
use hanash_types::{CoreEvent, DownloadItem, Settings, Status};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};

pub(crate) type SharedItems = Arc<RwLock<Vec<DownloadItem>>>;

/// The engine root: registry, settings, scheduler, and the event channel.
///
/// Cloning is cheap and shares all state; drivers keep one instance and
/// read item snapshots while coordinators update them.
#[derive(Clone)]
pub struct HanashCore {
    items: SharedItems,
    settings: Arc<RwLock<Settings>>,
    storage: Arc<Storage>,
    scheduler: Arc<Scheduler>,
    client: reqwest::Client,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl HanashCore {
    /// Load the registry and settings from `data_dir` and build the engine.
    pub async fn new(data_dir: PathBuf) -> Result<Self, HanashError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await;
        let items = storage.load_items().await;
        info!("loaded {} downloads from the registry", items.len());

        let (event_tx, _) = broadcast::channel(1024);

        Ok(Self {
            items: Arc::new(RwLock::new(items)),
            settings: Arc::new(RwLock::new(settings)),
            storage: Arc::new(storage),
            scheduler: Arc::new(Scheduler::new()),
            client: probe::build_client()?,
            event_tx,
        })
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Probe a URL without touching the registry.
    pub async fn probe(&self, url: &str) -> Result<ProbeInfo, HanashError> {
        probe::probe_url(&self.client, url).await
    }

    /// Probe `url` and insert a new registry item for it. A bad HTTP status
    /// refuses the URL; an existing item with the same name and folder is
    /// returned instead of inserting a duplicate.
    pub async fn add(&self, url: &str, folder: Option<PathBuf>) -> Result<DownloadItem, HanashError> {
        let settings = self.settings.read().await.clone();
        let folder = folder.unwrap_or_else(|| settings.folder.clone());

        let info = self.probe(url).await?;
        if is_bad_status(info.status) {
            return Err(HanashError::BadStatus {
                status: info.status,
                url: url.to_string(),
            });
        }

        let mut item = DownloadItem::new(info.url, folder);
        item.eff_url = info.eff_url;
        item.name = info.name;
        item.size = info.size;
        item.mime_type = info.mime_type;
        item.resumable = info.resumable;
        item.max_connections = if item.resumable {
            settings.max_connections.max(1)
        } else {
            1
        };
        item.set_part_size(settings.part_size_bytes());

        let item = {
            let mut items = self.items.write().await;
            if let Some(existing) = items
                .iter()
                .find(|d| d.name == item.name && d.folder == item.folder)
            {
                info!("\"{}\" already in the registry as {}", existing.name, existing.id);
                return Ok(existing.clone());
            }
            item.id = items.len();
            items.push(item.clone());
            item
        };

        if let Err(e) = self.save_items().await {
            warn!("cannot save registry: {}", e);
        }
        let _ = self.event_tx.send(CoreEvent::ItemAdded { item: item.clone() });
        Ok(item)
    }

    /// Start or queue a download. A no-op when the item is already running.
    ///
    /// The destination folder must be writable and the target file must not
    /// exist unless `overwrite` is set. A different item with the same name
    /// and folder holding an active slot rejects the start.
    pub async fn start(&self, id: usize, overwrite: bool) -> Result<(), HanashError> {
        let item = self.get(id).await?;

        if self.scheduler.is_active(id) || item.status == Status::Downloading {
            info!("download {} is already running", id);
            return Ok(());
        }

        for other_id in self.scheduler.active_ids() {
            if other_id == id {
                continue;
            }
            if let Ok(other) = self.get(other_id).await {
                if other.name == item.name && other.folder == item.folder {
                    return Err(HanashError::AlreadyActive {
                        name: item.name,
                        folder: item.folder,
                    });
                }
            }
        }

        check_folder(&item.folder).await?;

        let target = item.target_file();
        if fs::metadata(&target).await.is_ok() {
            if overwrite {
                fs::remove_file(&target).await?;
            } else {
                return Err(HanashError::TargetExists(target));
            }
        }

        let settings = self.settings.read().await.clone();

        // connection policy is taken from settings at start time; a
        // non-resumable resource is always fetched over one connection
        let item = {
            let mut items = self.items.write().await;
            let entry = items.get_mut(id).ok_or(HanashError::NotFound(id))?;
            entry.max_connections = if entry.resumable {
                settings.max_connections.max(1)
            } else {
                1
            };
            entry.clone()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if !self.scheduler.admit(id, settings.max_concurrent_downloads.max(1), tx.clone()) {
            info!(
                "download {} queued behind {} active downloads",
                id,
                self.scheduler.active_count()
            );
            self.scheduler.enqueue(id);
            self.set_status(id, Status::Pending).await;
            if let Err(e) = self.save_items().await {
                warn!("cannot save registry: {}", e);
            }
            return Ok(());
        }

        self.set_status(id, Status::Downloading).await;

        let mut run_item = item;
        run_item.status = Status::Downloading;
        let coordinator = Coordinator::new(
            run_item,
            self.items.clone(),
            rx,
            tx,
            self.event_tx.clone(),
            self.client.clone(),
            settings.speed_limit_bytes(),
        );

        let core = self.clone();
        tokio::spawn(async move {
            let terminal = coordinator.run().await;
            core.on_coordinator_exit(id, terminal).await;
        });

        Ok(())
    }

    /// Pause a running download. The coordinator stays alive; its workers
    /// abort and their segments return to the queue.
    pub async fn pause(&self, id: usize) -> Result<(), HanashError> {
        self.get(id).await?;
        if !self.scheduler.send(id, CoordinatorMsg::Status(Status::Paused)) {
            info!("download {} is not active, nothing to pause", id);
        }
        Ok(())
    }

    /// Resume a download: unpause a live coordinator, or submit the item
    /// through normal admission. A no-op for active or pending items.
    pub async fn resume(&self, id: usize) -> Result<(), HanashError> {
        let item = self.get(id).await?;
        if self.scheduler.is_active(id) {
            if item.status == Status::Paused {
                self.scheduler.send(id, CoordinatorMsg::Status(Status::Downloading));
            }
            return Ok(());
        }
        if item.status == Status::Pending {
            return Ok(());
        }
        self.start(id, false).await
    }

    /// Cancel a pending or running download.
    pub async fn cancel(&self, id: usize) -> Result<(), HanashError> {
        self.get(id).await?;
        if self.scheduler.unqueue(id) {
            self.set_status(id, Status::Cancelled).await;
            if let Err(e) = self.save_items().await {
                warn!("cannot save registry: {}", e);
            }
            return Ok(());
        }
        self.scheduler.send(id, CoordinatorMsg::Status(Status::Cancelled));
        Ok(())
    }

    /// Cancel everything: pending items become cancelled, live coordinators
    /// receive the cancel signal.
    pub async fn stop_all(&self) {
        for id in self.scheduler.drain_pending() {
            self.set_status(id, Status::Cancelled).await;
        }
        self.scheduler.broadcast(CoordinatorMsg::Status(Status::Cancelled));
        if let Err(e) = self.save_items().await {
            warn!("cannot save registry: {}", e);
        }
    }

    /// Re-submit every cancelled item through normal admission.
    pub async fn resume_all(&self) {
        let ids: Vec<usize> = self
            .items
            .read()
            .await
            .iter()
            .filter(|d| d.status == Status::Cancelled)
            .map(|d| d.id)
            .collect();
        for id in ids {
            if let Err(e) = self.start(id, false).await {
                warn!("resume-all: cannot start {}: {}", id, e);
            }
        }
    }

    /// Remove an item from the registry together with its temp folder and
    /// in-progress file. Refused while any download is active, because ids
    /// are re-derived from list positions.
    pub async fn delete(&self, id: usize) -> Result<DownloadItem, HanashError> {
        if self.scheduler.active_count() > 0 {
            return Err(HanashError::Busy);
        }
        self.scheduler.unqueue(id);

        let removed = {
            let mut items = self.items.write().await;
            if id >= items.len() {
                return Err(HanashError::NotFound(id));
            }
            let removed = items.remove(id);
            for (i, item) in items.iter_mut().enumerate() {
                item.id = i;
            }
            removed
        };

        let _ = fs::remove_dir_all(removed.temp_folder()).await;
        let _ = fs::remove_file(removed.temp_file()).await;

        if let Err(e) = self.save_items().await {
            warn!("cannot save registry: {}", e);
        }
        let _ = self.event_tx.send(CoreEvent::ItemRemoved { id });
        Ok(removed)
    }

    /// Delete every item and its temp state. Refused while downloads run.
    pub async fn delete_all(&self) -> Result<(), HanashError> {
        if self.scheduler.active_count() > 0 {
            return Err(HanashError::Busy);
        }
        self.scheduler.drain_pending();

        let drained = {
            let mut items = self.items.write().await;
            std::mem::take(&mut *items)
        };
        for item in &drained {
            let _ = fs::remove_dir_all(item.temp_folder()).await;
            let _ = fs::remove_file(item.temp_file()).await;
            let _ = self.event_tx.send(CoreEvent::ItemRemoved { id: item.id });
        }

        if let Err(e) = self.save_items().await {
            warn!("cannot save registry: {}", e);
        }
        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<(), HanashError> {
        self.storage.save_settings(&settings).await?;
        *self.settings.write().await = settings;
        Ok(())
    }

    /// Change the global speed limit (KB/s, 0 disables) and push it to every
    /// live coordinator.
    pub async fn set_speed_limit(&self, kb_per_sec: u64) -> Result<(), HanashError> {
        let settings = {
            let mut settings = self.settings.write().await;
            settings.speed_limit = kb_per_sec;
            settings.clone()
        };
        self.storage.save_settings(&settings).await?;
        self.scheduler
            .broadcast(CoordinatorMsg::SpeedLimit(settings.speed_limit_bytes()));
        Ok(())
    }

    // ========================================================================
    // Snapshots and shutdown
    // ========================================================================

    pub async fn get(&self, id: usize) -> Result<DownloadItem, HanashError> {
        self.items
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(HanashError::NotFound(id))
    }

    /// Snapshot of every registry item.
    pub async fn snapshot(&self) -> Vec<DownloadItem> {
        self.items.read().await.clone()
    }

    pub fn active_count(&self) -> usize {
        self.scheduler.active_count()
    }

    /// Persist the registry and settings.
    pub async fn shutdown(&self) -> Result<(), HanashError> {
        self.save_items().await?;
        let settings = self.settings.read().await.clone();
        self.storage.save_settings(&settings).await?;
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn on_coordinator_exit(&self, id: usize, terminal: Status) {
        info!("download {} finished with status {}", id, terminal);
        let next = self.scheduler.release(id);
        if let Err(e) = self.save_items().await {
            warn!("cannot save registry: {}", e);
        }
        if let Some(next_id) = next {
            info!("promoting pending download {}", next_id);
            if let Err(e) = self.start_boxed(next_id, false).await {
                warn!("cannot start pending download {}: {}", next_id, e);
                self.set_status(next_id, Status::Cancelled).await;
            }
        }
    }

    // breaks the start -> exit -> promote -> start type cycle
    fn start_boxed(
        &self,
        id: usize,
        overwrite: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), HanashError>> + Send + '_>> {
        Box::pin(self.start(id, overwrite))
    }

    async fn set_status(&self, id: usize, status: Status) {
        {
            let mut items = self.items.write().await;
            if let Some(item) = items.get_mut(id) {
                item.status = status;
            }
        }
        let _ = self.event_tx.send(CoreEvent::StatusChanged { id, status });
    }

    async fn save_items(&self) -> Result<(), HanashError> {
        let items = self.items.read().await.clone();
        self.storage.save_items(&items).await
    }
}

/// The destination folder must exist and accept a probe write.
async fn check_folder(folder: &Path) -> Result<(), HanashError> {
    let is_dir = fs::metadata(folder).await.map(|m| m.is_dir()).unwrap_or(false);
    if !is_dir {
        return Err(HanashError::FolderNotWritable(folder.to_path_buf()));
    }
    let probe = folder.join(".hanash-write-check");
    if fs::write(&probe, b"0").await.is_err() {
        return Err(HanashError::FolderNotWritable(folder.to_path_buf()));
    }
    let _ = fs::remove_file(&probe).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Serves a fixed body with real Range handling, like a ranged server.
    struct RangeResponder {
        body: Vec<u8>,
        delay: Option<Duration>,
    }

    impl RangeResponder {
        fn new(body: Vec<u8>) -> Self {
            Self { body, delay: None }
        }

        fn delayed(body: Vec<u8>, delay: Duration) -> Self {
            Self { body, delay: Some(delay) }
        }
    }

    impl Respond for RangeResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let range = request
                .headers
                .get("Range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_range);
            let template = match range {
                Some((start, end)) if !self.body.is_empty() => {
                    let end = end
                        .unwrap_or(self.body.len() as u64 - 1)
                        .min(self.body.len() as u64 - 1);
                    ResponseTemplate::new(206)
                        .insert_header("accept-ranges", "bytes")
                        .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
                }
                _ => ResponseTemplate::new(200)
                    .insert_header("accept-ranges", "bytes")
                    .set_body_bytes(self.body.clone()),
            };
            match self.delay {
                Some(delay) => template.set_delay(delay),
                None => template,
            }
        }
    }

    fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
        let (a, b) = value.strip_prefix("bytes=")?.split_once('-')?;
        Some((a.parse().ok()?, b.parse().ok()))
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn core(data: &TempDir) -> HanashCore {
        HanashCore::new(data.path().join("data")).await.unwrap()
    }

    fn test_item(url: String, folder: &Path, name: &str, size: u64, part_size: u64, resumable: bool) -> DownloadItem {
        let mut item = DownloadItem::new(url.clone(), folder.to_path_buf());
        item.eff_url = url;
        item.name = name.to_string();
        item.size = size;
        item.resumable = resumable;
        item.part_size = part_size;
        item
    }

    async fn insert(core: &HanashCore, mut item: DownloadItem) -> usize {
        let mut items = core.items.write().await;
        item.id = items.len();
        let id = item.id;
        items.push(item);
        id
    }

    async fn wait_status(core: &HanashCore, id: usize, wanted: Status, secs: u64) {
        let poll = async {
            loop {
                if core.get(id).await.unwrap().status == wanted {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        timeout(Duration::from_secs(secs), poll)
            .await
            .unwrap_or_else(|_| panic!("item {id} never reached {wanted}"));
    }

    #[tokio::test]
    async fn fresh_download_splits_and_assembles() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        std::fs::create_dir_all(&folder).unwrap();
        let core = core(&dirs).await;

        let content = body(1024);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f.bin"))
            .respond_with(RangeResponder::new(content.clone()))
            .mount(&server)
            .await;

        let item = test_item(format!("{}/f.bin", server.uri()), &folder, "f.bin", 1024, 512, true);
        let id = insert(&core, item).await;

        core.start(id, false).await.unwrap();
        wait_status(&core, id, Status::Completed, 20).await;

        let item = core.get(id).await.unwrap();
        assert_eq!(item.progress, 100.0);
        assert_eq!(item.downloaded, 1024);
        assert_eq!(std::fs::read(folder.join("f.bin")).unwrap(), content);
        assert!(!folder.join("f.bin_parts").exists());
        assert!(!folder.join("__downloading__f.bin").exists());
    }

    #[tokio::test]
    async fn resume_requests_only_the_missing_tail() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        let core = core(&dirs).await;

        let content = body(1024);
        // segment 0-511 finished, 512-1023 got 300 bytes before the kill
        let parts = folder.join("f.bin_parts");
        std::fs::create_dir_all(&parts).unwrap();
        std::fs::write(parts.join("0-511"), &content[..512]).unwrap();
        std::fs::write(parts.join("512-1023"), &content[512..812]).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f.bin"))
            .respond_with(RangeResponder::new(content.clone()))
            .mount(&server)
            .await;

        let item = test_item(format!("{}/f.bin", server.uri()), &folder, "f.bin", 1024, 512, true);
        let id = insert(&core, item).await;

        core.start(id, false).await.unwrap();
        wait_status(&core, id, Status::Completed, 20).await;

        assert_eq!(std::fs::read(folder.join("f.bin")).unwrap(), content);

        // the only request was for the missing tail of the partial segment
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let range = requests[0].headers.get("Range").unwrap().to_str().unwrap();
        assert_eq!(range, "bytes=812-1023");
    }

    #[tokio::test]
    async fn non_resumable_uses_a_single_connection() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        std::fs::create_dir_all(&folder).unwrap();
        let core = core(&dirs).await;

        let content = body(1500);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/plain.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
            .mount(&server)
            .await;

        let item = test_item(format!("{}/plain.bin", server.uri()), &folder, "plain.bin", 1500, 512, false);
        let id = insert(&core, item).await;

        core.start(id, false).await.unwrap();
        wait_status(&core, id, Status::Completed, 20).await;

        let item = core.get(id).await.unwrap();
        assert_eq!(item.max_connections, 1);
        assert_eq!(std::fs::read(folder.join("plain.bin")).unwrap(), content);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_size_streams_until_the_server_closes() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        std::fs::create_dir_all(&folder).unwrap();
        let core = core(&dirs).await;

        let content = body(700);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream.bin"))
            .respond_with(RangeResponder::new(content.clone()))
            .mount(&server)
            .await;

        let item = test_item(format!("{}/stream.bin", server.uri()), &folder, "stream.bin", 0, 512, true);
        let id = insert(&core, item).await;

        core.start(id, false).await.unwrap();
        wait_status(&core, id, Status::Completed, 20).await;

        let item = core.get(id).await.unwrap();
        assert_eq!(item.downloaded, 700);
        assert_eq!(std::fs::read(folder.join("stream.bin")).unwrap(), content);
    }

    #[tokio::test]
    async fn cancel_aborts_workers_and_preserves_parts() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        std::fs::create_dir_all(&folder).unwrap();
        let core = core(&dirs).await;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(RangeResponder::delayed(body(4096), Duration::from_secs(10)))
            .mount(&server)
            .await;

        let item = test_item(format!("{}/slow.bin", server.uri()), &folder, "slow.bin", 4096, 1024, true);
        let id = insert(&core, item).await;

        core.start(id, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        core.cancel(id).await.unwrap();
        wait_status(&core, id, Status::Cancelled, 5).await;

        // temp state is preserved for a later resume
        assert!(folder.join("slow.bin_parts").exists());
        assert!(!folder.join("slow.bin").exists());
    }

    #[tokio::test]
    async fn admission_cap_queues_and_promotes() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        std::fs::create_dir_all(&folder).unwrap();
        let core = core(&dirs).await;

        let mut settings = core.settings().await;
        settings.max_concurrent_downloads = 1;
        core.update_settings(settings).await.unwrap();

        let content = body(512);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.bin"))
            .respond_with(RangeResponder::delayed(content.clone(), Duration::from_millis(700)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b.bin"))
            .respond_with(RangeResponder::new(content.clone()))
            .mount(&server)
            .await;

        let a = insert(&core, test_item(format!("{}/a.bin", server.uri()), &folder, "a.bin", 512, 512, true)).await;
        let b = insert(&core, test_item(format!("{}/b.bin", server.uri()), &folder, "b.bin", 512, 512, true)).await;

        core.start(a, false).await.unwrap();
        core.start(b, false).await.unwrap();

        assert_eq!(core.get(b).await.unwrap().status, Status::Pending);
        assert!(core.active_count() <= 1);

        wait_status(&core, a, Status::Completed, 20).await;
        wait_status(&core, b, Status::Completed, 20).await;
        assert_eq!(std::fs::read(folder.join("a.bin")).unwrap(), content);
        assert_eq!(std::fs::read(folder.join("b.bin")).unwrap(), content);
    }

    #[tokio::test]
    async fn repeated_server_errors_cancel_the_download() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        std::fs::create_dir_all(&folder).unwrap();
        let core = core(&dirs).await;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/throttled.bin"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let item = test_item(format!("{}/throttled.bin", server.uri()), &folder, "throttled.bin", 2048, 512, true);
        let id = insert(&core, item).await;

        core.start(id, false).await.unwrap();
        wait_status(&core, id, Status::Cancelled, 30).await;

        // every 429 shed a connection down to the floor of one
        assert_eq!(core.get(id).await.unwrap().max_connections, 1);
    }

    #[tokio::test]
    async fn duplicate_name_start_is_rejected() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        std::fs::create_dir_all(&folder).unwrap();
        let core = core(&dirs).await;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/same.bin"))
            .respond_with(RangeResponder::delayed(body(512), Duration::from_secs(5)))
            .mount(&server)
            .await;

        let a = insert(&core, test_item(format!("{}/same.bin", server.uri()), &folder, "same.bin", 512, 512, true)).await;
        let b = insert(&core, test_item(format!("{}/same.bin", server.uri()), &folder, "same.bin", 512, 512, true)).await;

        core.start(a, false).await.unwrap();
        let err = core.start(b, false).await.unwrap_err();
        assert!(matches!(err, HanashError::AlreadyActive { .. }));

        core.stop_all().await;
        wait_status(&core, a, Status::Cancelled, 5).await;
    }

    #[tokio::test]
    async fn start_refuses_existing_target_without_overwrite() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("f.bin"), b"old").unwrap();
        let core = core(&dirs).await;

        let item = test_item("http://unused/f.bin".to_string(), &folder, "f.bin", 8, 8, true);
        let id = insert(&core, item).await;

        let err = core.start(id, false).await.unwrap_err();
        assert!(matches!(err, HanashError::TargetExists(_)));
    }

    #[tokio::test]
    async fn start_refuses_missing_folder() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("nope");
        let core = core(&dirs).await;

        let item = test_item("http://unused/f.bin".to_string(), &folder, "f.bin", 8, 8, true);
        let id = insert(&core, item).await;

        let err = core.start(id, false).await.unwrap_err();
        assert!(matches!(err, HanashError::FolderNotWritable(_)));
    }

    #[tokio::test]
    async fn delete_reindexes_and_removes_temp_state() {
        let dirs = TempDir::new().unwrap();
        let folder = dirs.path().join("dl");
        std::fs::create_dir_all(&folder).unwrap();
        let core = core(&dirs).await;

        let a = insert(&core, test_item("http://h/a".into(), &folder, "a.bin", 8, 8, true)).await;
        let b = insert(&core, test_item("http://h/b".into(), &folder, "b.bin", 8, 8, true)).await;
        assert_eq!((a, b), (0, 1));

        let parts = folder.join("a.bin_parts");
        std::fs::create_dir_all(&parts).unwrap();
        std::fs::write(folder.join("__downloading__a.bin"), b"x").unwrap();

        core.delete(a).await.unwrap();
        assert!(!parts.exists());
        assert!(!folder.join("__downloading__a.bin").exists());

        let items = core.snapshot().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, 0);
        assert_eq!(items[0].name, "b.bin");
    }
}
