//! Worker - fetches a single byte-range segment into its own file
//!
//! A worker is bound to one segment for one attempt. Before transferring it
//! checks what is already on disk: a complete file is reported without
//! touching the network, an oversized file is discarded, a short one is
//! resumed with a narrowed range request. Failed or aborted attempts roll
//! back their reported bytes and return the segment to the job queue.

use crate::engine::{ByteReport, CoordinatorMsg, JobQueue, PartMsg, RateLimiter};
use futures::StreamExt;
use hanash_types::{Segment, Status};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Byte reports are pushed at most this often.
const REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Abort when no data arrives for this long (receive rate below 1 B/s).
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Worker {
    pub(crate) slot: usize,
    pub(crate) segment: Segment,
    pub(crate) url: String,
    pub(crate) temp_folder: PathBuf,
    pub(crate) resumable: bool,
    /// Speed cap in bytes/s; 0 disables the cap.
    pub(crate) speed_limit: u64,
    pub(crate) client: Client,
    pub(crate) ctrl: watch::Receiver<Status>,
    pub(crate) data_tx: mpsc::UnboundedSender<ByteReport>,
    pub(crate) parts_tx: mpsc::UnboundedSender<PartMsg>,
    pub(crate) jobs: JobQueue,
    pub(crate) coord_tx: mpsc::UnboundedSender<CoordinatorMsg>,
}

enum TransferError {
    /// Control channel said cancelled or paused.
    Stopped,
    Stalled,
    /// Received more bytes than the segment's target length.
    Oversize,
    Server(u16),
    Network(reqwest::Error),
    Io(std::io::Error),
}

impl Worker {
    pub async fn run(mut self) {
        let name = self.segment.name();
        let target = self.segment.size();
        let file_path = self.temp_folder.join(&name);

        // reuse whatever a previous attempt left on disk
        let mut start_size = 0u64;
        let mut append = false;
        if self.resumable && target > 0 {
            if let Ok(meta) = fs::metadata(&file_path).await {
                let on_disk = meta.len();
                if on_disk == target {
                    info!("worker {}: segment {} already complete on disk", self.slot, name);
                    let _ = self.data_tx.send(ByteReport::Disk(target as i64));
                    let _ = self.parts_tx.send(PartMsg::Completed(name));
                    return;
                } else if on_disk > target {
                    warn!(
                        "worker {}: segment {} oversized on disk ({} > {}), refetching",
                        self.slot, name, on_disk, target
                    );
                } else if on_disk > 0 {
                    append = true;
                    start_size = on_disk;
                    let _ = self.data_tx.send(ByteReport::Disk(on_disk as i64));
                    debug!("worker {}: resuming segment {} from byte {}", self.slot, name, on_disk);
                }
            }
        }

        // a zero target marks an unknown size: stream until the server closes
        let range = if target == 0 {
            format!("bytes={}-", self.segment.start + start_size)
        } else {
            format!("bytes={}-{}", self.segment.start + start_size, self.segment.end)
        };

        let finished = self
            .transfer(&file_path, &range, start_size, target, append)
            .await;

        let completed = match finished {
            Ok(()) => {
                let on_disk = fs::metadata(&file_path).await.map(|m| m.len()).unwrap_or(0);
                on_disk == target || target == 0
            }
            Err(e) => {
                match e {
                    TransferError::Stopped => debug!("worker {}: segment {} stopped", self.slot, name),
                    TransferError::Stalled => warn!("worker {}: segment {} stalled", self.slot, name),
                    TransferError::Oversize => {
                        warn!("worker {}: segment {} received more than its target", self.slot, name)
                    }
                    TransferError::Server(code) => {
                        warn!("worker {}: server refused segment {} with {}", self.slot, name, code)
                    }
                    TransferError::Network(err) => {
                        warn!("worker {}: segment {} network error: {}", self.slot, name, err)
                    }
                    TransferError::Io(err) => {
                        warn!("worker {}: segment {} write error: {}", self.slot, name, err)
                    }
                }
                false
            }
        };

        if completed {
            debug!("worker {}: segment {} complete", self.slot, name);
            let _ = self.parts_tx.send(PartMsg::Completed(name));
        } else {
            // undo the reported byte count and hand the segment back
            let on_disk = fs::metadata(&file_path).await.map(|m| m.len()).unwrap_or(0);
            let _ = self.data_tx.send(ByteReport::Disk(-(on_disk as i64)));
            self.jobs.lock().push_back(self.segment);
        }
    }

    async fn transfer(
        &mut self,
        file_path: &Path,
        range: &str,
        start_size: u64,
        target: u64,
        append: bool,
    ) -> Result<(), TransferError> {
        let request = self.client.get(&self.url).header(reqwest::header::RANGE, range);
        let response = tokio::select! {
            biased;
            _ = wait_for_stop(&mut self.ctrl) => return Err(TransferError::Stopped),
            r = request.send() => r.map_err(TransferError::Network)?,
        };

        let code = response.status().as_u16();
        if (400..512).contains(&code) {
            let _ = self.coord_tx.send(CoordinatorMsg::ServerError(code));
            return Err(TransferError::Server(code));
        }

        let mut file = if append {
            OpenOptions::new().append(true).open(file_path).await
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(file_path)
                .await
        }
        .map_err(TransferError::Io)?;

        let limiter = (self.speed_limit > 0).then(|| RateLimiter::new(self.speed_limit));
        let mut stream = response.bytes_stream();
        let mut buff: u64 = 0;
        let mut downloaded: u64 = 0;
        let mut last_report = Instant::now();

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.ctrl) => break Err(TransferError::Stopped),
                n = tokio::time::timeout(STALL_TIMEOUT, stream.next()) => n,
            };
            let chunk = match next {
                Err(_) => break Err(TransferError::Stalled),
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(TransferError::Network(e)),
                Ok(Some(Ok(chunk))) => chunk,
            };

            // a tight cap can park us here for a while, so keep the stop
            // signal in the race
            if let Some(limiter) = &limiter {
                tokio::select! {
                    biased;
                    _ = wait_for_stop(&mut self.ctrl) => break Err(TransferError::Stopped),
                    _ = limiter.acquire(chunk.len() as u64) => {}
                }
            }
            if let Err(e) = file.write_all(&chunk).await {
                break Err(TransferError::Io(e));
            }
            buff += chunk.len() as u64;

            if last_report.elapsed() >= REPORT_INTERVAL {
                let _ = self.data_tx.send(ByteReport::Net(buff));
                downloaded += buff;
                buff = 0;
                last_report = Instant::now();
            }

            // abort only when the count strictly exceeds a known target; an
            // exactly-sized transfer is settled by the length check afterwards
            if target > 0 && start_size + downloaded + buff > target {
                break Err(TransferError::Oversize);
            }
        };

        let _ = file.flush().await;
        if buff > 0 {
            let _ = self.data_tx.send(ByteReport::Net(buff));
        }
        result
    }
}

/// Resolve when the control channel turns to cancelled or paused. Closure of
/// the channel counts as a stop so an orphaned worker cannot keep running.
async fn wait_for_stop(ctrl: &mut watch::Receiver<Status>) {
    loop {
        if matches!(*ctrl.borrow(), Status::Cancelled | Status::Paused) {
            return;
        }
        if ctrl.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        temp: TempDir,
        ctrl: watch::Sender<Status>,
        data_tx: mpsc::UnboundedSender<ByteReport>,
        data_rx: mpsc::UnboundedReceiver<ByteReport>,
        parts_tx: mpsc::UnboundedSender<PartMsg>,
        parts_rx: mpsc::UnboundedReceiver<PartMsg>,
        coord_tx: mpsc::UnboundedSender<CoordinatorMsg>,
        coord_rx: mpsc::UnboundedReceiver<CoordinatorMsg>,
        jobs: JobQueue,
    }

    fn fixture() -> Fixture {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (parts_tx, parts_rx) = mpsc::unbounded_channel();
        let (coord_tx, coord_rx) = mpsc::unbounded_channel();
        let (ctrl, _) = watch::channel(Status::Downloading);
        Fixture {
            temp: TempDir::new().unwrap(),
            ctrl,
            data_tx,
            data_rx,
            parts_tx,
            parts_rx,
            coord_tx,
            coord_rx,
            jobs: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn build(url: String, segment: Segment, f: &Fixture) -> Worker {
        Worker {
            slot: 0,
            segment,
            url,
            temp_folder: f.temp.path().to_path_buf(),
            resumable: true,
            speed_limit: 0,
            client: crate::probe::build_client().unwrap(),
            ctrl: f.ctrl.subscribe(),
            data_tx: f.data_tx.clone(),
            parts_tx: f.parts_tx.clone(),
            jobs: f.jobs.clone(),
            coord_tx: f.coord_tx.clone(),
        }
    }

    #[tokio::test]
    async fn resume_requests_only_the_missing_tail() {
        let mut f = fixture();
        let segment = Segment::new(512, 1023);
        let head: Vec<u8> = (0..300).map(|i| (i % 7) as u8).collect();
        let tail: Vec<u8> = (0..212).map(|i| (i % 11) as u8).collect();
        std::fs::write(f.temp.path().join("512-1023"), &head).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f.bin"))
            .and(header("Range", "bytes=812-1023"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(tail.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let w = build(format!("{}/f.bin", server.uri()), segment, &f);
        w.run().await;

        // on-disk bytes seeded first, then the network tail
        assert!(matches!(f.data_rx.try_recv(), Ok(ByteReport::Disk(300))));
        let mut net = 0u64;
        while let Ok(report) = f.data_rx.try_recv() {
            if let ByteReport::Net(n) = report {
                net += n;
            }
        }
        assert_eq!(net, 212);
        assert!(matches!(f.parts_rx.try_recv(), Ok(PartMsg::Completed(name)) if name == "512-1023"));

        let mut expected = head;
        expected.extend_from_slice(&tail);
        assert_eq!(std::fs::read(f.temp.path().join("512-1023")).unwrap(), expected);
    }

    #[tokio::test]
    async fn complete_segment_skips_the_network() {
        let mut f = fixture();
        let segment = Segment::new(0, 511);
        std::fs::write(f.temp.path().join("0-511"), vec![9u8; 512]).unwrap();

        let server = MockServer::start().await;
        let w = build(format!("{}/f.bin", server.uri()), segment, &f);
        w.run().await;

        assert!(matches!(f.data_rx.try_recv(), Ok(ByteReport::Disk(512))));
        assert!(matches!(f.parts_rx.try_recv(), Ok(PartMsg::Completed(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_error_is_reported_and_segment_requeued() {
        let mut f = fixture();
        let segment = Segment::new(0, 511);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f.bin"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let w = build(format!("{}/f.bin", server.uri()), segment, &f);
        w.run().await;

        assert!(matches!(f.coord_rx.try_recv(), Ok(CoordinatorMsg::ServerError(500))));
        assert!(f.parts_rx.try_recv().is_err());
        assert_eq!(f.jobs.lock().pop_front(), Some(segment));
    }

    #[tokio::test]
    async fn oversized_file_is_refetched_from_scratch() {
        let mut f = fixture();
        let segment = Segment::new(0, 511);
        std::fs::write(f.temp.path().join("0-511"), vec![1u8; 600]).unwrap();

        let body = vec![2u8; 512];
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f.bin"))
            .and(header("Range", "bytes=0-511"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let w = build(format!("{}/f.bin", server.uri()), segment, &f);
        w.run().await;

        assert!(matches!(f.parts_rx.try_recv(), Ok(PartMsg::Completed(_))));
        assert_eq!(std::fs::read(f.temp.path().join("0-511")).unwrap(), body);
    }

    #[tokio::test]
    async fn short_body_rolls_back_and_requeues() {
        let mut f = fixture();
        let segment = Segment::new(0, 511);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f.bin"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![3u8; 100]))
            .mount(&server)
            .await;

        let w = build(format!("{}/f.bin", server.uri()), segment, &f);
        w.run().await;

        assert!(f.parts_rx.try_recv().is_err());
        assert_eq!(f.jobs.lock().pop_front(), Some(segment));

        // net reports sum to the received bytes, rollback cancels them out
        let mut total: i64 = 0;
        while let Ok(report) = f.data_rx.try_recv() {
            match report {
                ByteReport::Net(n) => total += n as i64,
                ByteReport::Disk(n) => total += n,
            }
        }
        assert_eq!(total, 0);
    }
}
