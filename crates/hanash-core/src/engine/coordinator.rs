//! Coordinator - per-download state machine and byte accounting
//!
//! One coordinator runs per active download. It plans the segments, seeds
//! the byte count from previously completed parts, spawns the assembler and
//! the worker pool, and then polls its inputs on a ~100 ms cadence: control
//! messages, per-slot byte reports, a speed sample every 200 ms. Terminal
//! states are status values; the coordinator never returns an error. On
//! exit it meets the pool and the assembler on a 3-party barrier so no task
//! outlives it.

use crate::engine::{
    assembler::{load_completed, Assembler},
    ByteReport, CoordinatorMsg, JobQueue, PartMsg, PoolManager, PoolMsg, TICK,
};
use crate::planner::plan_segments;
use crate::SharedItems;
use chrono::Utc;
use hanash_types::{CoreEvent, DownloadItem, Segment, Status};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, mpsc, watch, Barrier};
use tokio::time::{interval, Duration, Instant};
use tracing::{error, info, warn};

/// Speed is sampled no more often than this.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Sliding window length for the average speed.
const SPEED_WINDOW: usize = 50;

/// Consecutive server errors without any data before giving up.
const SERVER_ERROR_LIMIT: u32 = 30;

pub struct Coordinator {
    item: DownloadItem,
    items: SharedItems,
    rx: mpsc::UnboundedReceiver<CoordinatorMsg>,
    tx: mpsc::UnboundedSender<CoordinatorMsg>,
    events: broadcast::Sender<CoreEvent>,
    client: Client,
    /// Global speed limit for this download in bytes/s; 0 disables.
    speed_limit: u64,
}

impl Coordinator {
    pub(crate) fn new(
        item: DownloadItem,
        items: SharedItems,
        rx: mpsc::UnboundedReceiver<CoordinatorMsg>,
        tx: mpsc::UnboundedSender<CoordinatorMsg>,
        events: broadcast::Sender<CoreEvent>,
        client: Client,
        speed_limit: u64,
    ) -> Self {
        Self {
            item,
            items,
            rx,
            tx,
            events,
            client,
            speed_limit,
        }
    }

    /// Run the download to a terminal status.
    pub async fn run(mut self) -> Status {
        let id = self.item.id;
        info!(
            "coordinator {}: downloading {} ({} bytes, {} connections)",
            id, self.item.name, self.item.size, self.item.max_connections
        );

        let temp_folder = self.item.temp_folder();
        if let Err(e) = fs::create_dir_all(&temp_folder).await {
            error!("coordinator {}: cannot create {:?}: {}", id, temp_folder, e);
            self.item.status = Status::Cancelled;
            self.publish().await;
            return Status::Cancelled;
        }

        // plan segments; a non-resumable resource is fetched as one piece
        let segments: Vec<Segment> = if self.item.resumable {
            plan_segments(self.item.size, self.item.part_size)
        } else {
            vec![Segment::new(0, self.item.size.saturating_sub(1))]
        };

        // seed the byte count from parts finished in an earlier session
        let completed = load_completed(&temp_folder).await;
        let mut downloaded: i64 = 0;
        let jobs: JobQueue = Arc::new(Mutex::new(VecDeque::new()));
        {
            let mut queue = jobs.lock();
            for segment in &segments {
                if completed.contains(&segment.name()) {
                    downloaded += segment.size() as i64;
                } else {
                    queue.push_back(*segment);
                }
            }
        }
        let mut remaining_jobs = jobs.lock().len();
        info!(
            "coordinator {}: {} of {} segments already done, {} bytes on disk",
            id,
            segments.len() - remaining_jobs,
            segments.len(),
            downloaded
        );

        // one control/data channel pair per worker slot
        let slots = self.item.max_connections.max(1);
        let mut data_rxs = Vec::with_capacity(slots);
        let mut data_txs = Vec::with_capacity(slots);
        for _ in 0..slots {
            let (tx, rx) = mpsc::unbounded_channel::<ByteReport>();
            data_txs.push(tx);
            data_rxs.push(rx);
        }
        let ctrls: Vec<watch::Sender<Status>> = (0..slots)
            .map(|_| watch::channel(Status::Downloading).0)
            .collect();
        let (parts_tx, parts_rx) = mpsc::unbounded_channel();
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let barrier = Arc::new(Barrier::new(3));

        let assembler = Assembler {
            item_id: id,
            temp_folder: temp_folder.clone(),
            temp_file: self.item.temp_file(),
            target_file: self.item.target_file(),
            all_parts: segments.iter().map(Segment::name).collect(),
            rx: parts_rx,
            coord_tx: self.tx.clone(),
            barrier: barrier.clone(),
        };
        tokio::spawn(assembler.run());

        let pool = PoolManager {
            item_id: id,
            url: self.item.eff_url.clone(),
            temp_folder,
            resumable: self.item.resumable,
            max_connections: self.item.max_connections,
            speed_limit: self.speed_limit,
            client: self.client.clone(),
            rx: pool_rx,
            coord_tx: self.tx.clone(),
            jobs: jobs.clone(),
            data_txs,
            ctrls,
            parts_tx: parts_tx.clone(),
            barrier: barrier.clone(),
        };
        tokio::spawn(pool.run());

        let mut status = Status::Downloading;
        let mut old_status = Status::Downloading;
        let mut buff: i64 = 0;
        let mut sample: u64 = 0;
        let mut speed_window: VecDeque<f64> = VecDeque::new();
        let mut live_workers = 0usize;
        let mut server_errors = 0u32;
        let mut last_sample = Instant::now();

        self.item.status = Status::Downloading;
        self.item.downloaded = downloaded.max(0) as u64;
        self.item.remaining_parts = remaining_jobs;
        self.publish().await;

        let mut ticker = interval(TICK);
        loop {
            ticker.tick().await;

            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    CoordinatorMsg::Status(v) => status = v,
                    CoordinatorMsg::LiveWorkers(n) => live_workers = n,
                    CoordinatorMsg::RemainingJobs(n) => remaining_jobs = n,
                    CoordinatorMsg::SpeedLimit(v) => {
                        info!("coordinator {}: speed limit {} B/s", id, v);
                        self.speed_limit = v;
                        let _ = pool_tx.send(PoolMsg::SpeedLimit(v));
                    }
                    CoordinatorMsg::ServerError(code) => {
                        server_errors += 1;
                        warn!(
                            "coordinator {}: server error {} ({} in a row)",
                            id, code, server_errors
                        );
                        if code == 429 {
                            // back off by shedding one connection
                            self.item.max_connections = (self.item.max_connections - 1).max(1);
                            let _ = pool_tx.send(PoolMsg::MaxConnections(self.item.max_connections));
                        }
                        if server_errors >= SERVER_ERROR_LIMIT {
                            error!("coordinator {}: server keeps refusing, giving up", id);
                            status = Status::Cancelled;
                        }
                    }
                }
            }

            // byte reports from every worker slot
            for rx in data_rxs.iter_mut() {
                while let Ok(report) = rx.try_recv() {
                    match report {
                        ByteReport::Net(n) => {
                            buff += n as i64;
                            sample += n;
                            // data is flowing again, the error streak is over
                            if n > 0 {
                                server_errors = 0;
                            }
                        }
                        ByteReport::Disk(n) => buff += n,
                    }
                }
            }

            // flush the buffered delta into the running total once per cycle
            if buff != 0 {
                downloaded = (downloaded + buff).max(0);
                if self.item.size > 0 {
                    downloaded = downloaded.min(self.item.size as i64);
                }
                buff = 0;
            }

            let delta = last_sample.elapsed();
            if delta >= SAMPLE_INTERVAL {
                let speed = sample as f64 / delta.as_secs_f64();
                speed_window.push_back(speed);
                if status != Status::Downloading {
                    speed_window.clear();
                }
                while speed_window.len() > SPEED_WINDOW {
                    speed_window.pop_front();
                }
                let avg_speed = if speed_window.is_empty() {
                    0
                } else {
                    (speed_window.iter().sum::<f64>() / speed_window.len() as f64) as u64
                };

                let done = downloaded.max(0) as u64;
                self.item.downloaded = done;
                self.item.progress = if self.item.size > 0 {
                    (done as f64 * 1000.0 / self.item.size as f64).round() / 10.0
                } else {
                    0.0
                };
                self.item.speed = avg_speed;
                self.item.time_left = (avg_speed > 0 && self.item.size > 0)
                    .then(|| self.item.size.saturating_sub(done) / avg_speed);
                self.item.live_connections = live_workers;
                self.item.remaining_parts = remaining_jobs;
                self.item.status = status;
                self.publish().await;
                let _ = self.events.send(CoreEvent::Progress {
                    id,
                    downloaded: done,
                    total: self.item.size,
                    speed: avg_speed,
                    eta: self.item.time_left,
                });

                sample = 0;
                last_sample = Instant::now();
            }

            if status != old_status {
                info!("coordinator {}: status {}", id, status);
                let _ = pool_tx.send(PoolMsg::Status(status));
                self.item.status = status;
                let _ = self.events.send(CoreEvent::StatusChanged { id, status });

                match status {
                    Status::Cancelled => {
                        self.item.downloaded = downloaded.max(0) as u64;
                        self.item.speed = 0;
                        self.item.time_left = None;
                        self.item.live_connections = 0;
                        self.item.remaining_parts = remaining_jobs;
                        self.publish().await;
                        break;
                    }
                    Status::Completed => {
                        self.item.downloaded = if self.item.size > 0 {
                            self.item.size
                        } else {
                            downloaded.max(0) as u64
                        };
                        self.item.progress = 100.0;
                        self.item.speed = 0;
                        self.item.time_left = None;
                        self.item.live_connections = 0;
                        self.item.remaining_parts = 0;
                        self.item.completed_at = Some(Utc::now());
                        self.publish().await;
                        break;
                    }
                    _ => self.publish().await,
                }
                old_status = status;
            }
        }

        // shut down the assembler and wait for all three parties
        let _ = parts_tx.send(PartMsg::Exit);
        barrier.wait().await;

        info!("coordinator {}: quitting with status {}", id, status);
        status
    }

    /// Publish the working copy into the shared registry snapshot.
    async fn publish(&self) {
        let mut items = self.items.write().await;
        if let Some(slot) = items.get_mut(self.item.id) {
            *slot = self.item.clone();
        }
    }
}
