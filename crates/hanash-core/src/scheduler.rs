//! Scheduler - bounds concurrent downloads and queues the overflow
//!
//! The scheduler owns the active set (ids with a live coordinator, each
//! with the send half of its control channel) and the FIFO queue of
//! pending ids. Admission is atomic: a start either takes a slot under the
//! cap or the id goes to the queue. There is no process-wide state; the
//! engine root owns one scheduler.

use crate::engine::CoordinatorMsg;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Default)]
pub struct Scheduler {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    active: HashMap<usize, UnboundedSender<CoordinatorMsg>>,
    pending: VecDeque<usize>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_active(&self, id: usize) -> bool {
        self.state.lock().active.contains_key(&id)
    }

    pub fn active_ids(&self) -> Vec<usize> {
        self.state.lock().active.keys().copied().collect()
    }

    /// Take an active slot for `id` if the cap allows it. Registers the
    /// coordinator's control handle on success.
    pub fn admit(&self, id: usize, cap: usize, tx: UnboundedSender<CoordinatorMsg>) -> bool {
        let mut state = self.state.lock();
        if state.active.len() >= cap || state.active.contains_key(&id) {
            return false;
        }
        state.active.insert(id, tx);
        true
    }

    /// Queue `id` behind the currently active downloads.
    pub fn enqueue(&self, id: usize) {
        let mut state = self.state.lock();
        if !state.pending.contains(&id) {
            state.pending.push_back(id);
        }
    }

    /// Drop `id` from the pending queue. Returns whether it was queued.
    pub fn unqueue(&self, id: usize) -> bool {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|&p| p != id);
        state.pending.len() != before
    }

    /// Send a control message to the live coordinator of `id`.
    pub fn send(&self, id: usize, msg: CoordinatorMsg) -> bool {
        self.state
            .lock()
            .active
            .get(&id)
            .map(|tx| tx.send(msg).is_ok())
            .unwrap_or(false)
    }

    /// Send a control message to every live coordinator.
    pub fn broadcast(&self, msg: CoordinatorMsg) {
        for tx in self.state.lock().active.values() {
            let _ = tx.send(msg.clone());
        }
    }

    /// Release the slot of a finished coordinator and hand back the next
    /// pending id, if any.
    pub fn release(&self, id: usize) -> Option<usize> {
        let mut state = self.state.lock();
        state.active.remove(&id);
        state.pending.pop_front()
    }

    /// Empty the pending queue, returning the drained ids.
    pub fn drain_pending(&self) -> Vec<usize> {
        self.state.lock().pending.drain(..).collect()
    }
}
