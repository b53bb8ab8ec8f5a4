//! Worker pool manager - keeps up to N workers busy with segments
//!
//! The pool owns a fixed set of worker slots. Each tick it drains new jobs
//! from the shared queue, dispatches the lowest-offset segment first (a
//! partially assembled media file stays playable that way), reaps finished
//! workers, and reports liveness to the coordinator. The per-worker speed
//! cap is the global limit divided over the connections in use; when the
//! cap changes, busy workers are restarted so they pick it up.

use crate::engine::{ByteReport, CoordinatorMsg, JobQueue, PartMsg, PoolMsg, Worker, TICK};
use hanash_types::{Segment, Status};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Barrier};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

/// Minimum time between applying per-worker speed cap changes.
const CAP_HYSTERESIS: Duration = Duration::from_secs(3);

pub struct PoolManager {
    pub(crate) item_id: usize,
    pub(crate) url: String,
    pub(crate) temp_folder: PathBuf,
    pub(crate) resumable: bool,
    pub(crate) max_connections: usize,
    /// Global per-download speed limit in bytes/s; 0 disables.
    pub(crate) speed_limit: u64,
    pub(crate) client: Client,
    pub(crate) rx: mpsc::UnboundedReceiver<PoolMsg>,
    pub(crate) coord_tx: mpsc::UnboundedSender<CoordinatorMsg>,
    pub(crate) jobs: JobQueue,
    pub(crate) data_txs: Vec<mpsc::UnboundedSender<ByteReport>>,
    pub(crate) ctrls: Vec<watch::Sender<Status>>,
    pub(crate) parts_tx: mpsc::UnboundedSender<PartMsg>,
    pub(crate) barrier: Arc<Barrier>,
}

impl PoolManager {
    pub async fn run(mut self) {
        let slots = self.ctrls.len();
        let mut free: Vec<usize> = (0..slots).rev().collect();
        let mut busy: Vec<usize> = Vec::new();
        let mut handles: Vec<Option<JoinHandle<()>>> = (0..slots).map(|_| None).collect();
        let mut job_list: Vec<Segment> = Vec::new();

        let mut status = Status::Downloading;
        let mut cleanup = false;
        let mut old_cap = 0u64;
        let mut last_cap_change: Option<Instant> = None;
        let mut tracked_live = usize::MAX;
        let mut last_jobs_report = usize::MAX;

        let mut ticker = interval(TICK);
        loop {
            ticker.tick().await;

            // drain new jobs; sort descending so the lowest offset pops first
            {
                let mut queue = self.jobs.lock();
                while let Some(seg) = queue.pop_front() {
                    job_list.push(seg);
                }
            }
            job_list.sort_by(|a, b| b.start.cmp(&a.start));

            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    PoolMsg::Status(v) => {
                        status = v;
                        match v {
                            Status::Paused => {
                                debug!("pool {}: pausing, stopping workers", self.item_id);
                                stop_workers(&self.ctrls, &busy, Status::Paused);
                            }
                            Status::Cancelled | Status::Completed => {
                                stop_workers(&self.ctrls, &busy, Status::Cancelled);
                                cleanup = true;
                            }
                            _ => {}
                        }
                    }
                    PoolMsg::SpeedLimit(v) => {
                        info!("pool {}: speed limit {} B/s", self.item_id, v);
                        self.speed_limit = v;
                    }
                    PoolMsg::MaxConnections(v) => {
                        info!("pool {}: max connections {}", self.item_id, v);
                        self.max_connections = v.max(1);
                    }
                }
            }

            // split the global limit over the connections actually in use
            let worker_cap = if self.speed_limit == 0 {
                0
            } else {
                self.speed_limit / self.max_connections.min(job_list.len().max(1)) as u64
            };
            if worker_cap != old_cap
                && last_cap_change.map_or(true, |t| t.elapsed() >= CAP_HYSTERESIS)
            {
                debug!("pool {}: worker cap {} -> {}", self.item_id, old_cap, worker_cap);
                old_cap = worker_cap;
                last_cap_change = Some(Instant::now());
                // restart busy workers so they come back with the new cap
                stop_workers(&self.ctrls, &busy, Status::Cancelled);
            }

            // hand segments to free slots
            while busy.len() < self.max_connections && status == Status::Downloading {
                let Some(&slot) = free.last() else { break };
                let Some(segment) = job_list.pop() else { break };
                free.pop();
                busy.push(slot);
                self.ctrls[slot].send_replace(Status::Downloading);

                let worker = Worker {
                    slot,
                    segment,
                    url: self.url.clone(),
                    temp_folder: self.temp_folder.clone(),
                    resumable: self.resumable,
                    speed_limit: worker_cap,
                    client: self.client.clone(),
                    ctrl: self.ctrls[slot].subscribe(),
                    data_tx: self.data_txs[slot].clone(),
                    parts_tx: self.parts_tx.clone(),
                    jobs: self.jobs.clone(),
                    coord_tx: self.coord_tx.clone(),
                };
                debug!("pool {}: slot {} takes segment {}", self.item_id, slot, segment);
                handles[slot] = Some(tokio::spawn(worker.run()));
            }

            // reap finished workers back into the free list
            let mut i = 0;
            while i < busy.len() {
                let slot = busy[i];
                let finished = handles[slot].as_ref().map_or(true, |h| h.is_finished());
                if finished {
                    if let Some(handle) = handles[slot].take() {
                        let _ = handle.await;
                    }
                    busy.swap_remove(i);
                    free.push(slot);
                } else {
                    i += 1;
                }
            }

            // tell the coordinator when liveness changes
            if busy.len() != tracked_live {
                tracked_live = busy.len();
                let remaining = tracked_live + job_list.len() + self.jobs.lock().len();
                let _ = self.coord_tx.send(CoordinatorMsg::LiveWorkers(tracked_live));
                let _ = self.coord_tx.send(CoordinatorMsg::RemainingJobs(remaining));
                last_jobs_report = remaining;
            }
            if tracked_live == 0
                && job_list.is_empty()
                && self.jobs.lock().is_empty()
                && last_jobs_report != 0
            {
                let _ = self.coord_tx.send(CoordinatorMsg::RemainingJobs(0));
                last_jobs_report = 0;
            }

            if cleanup && busy.is_empty() {
                break;
            }
        }

        self.barrier.wait().await;
        debug!("pool {}: quitting", self.item_id);
    }
}

fn stop_workers(ctrls: &[watch::Sender<Status>], busy: &[usize], status: Status) {
    for &slot in busy {
        let _ = ctrls[slot].send(status);
    }
}
