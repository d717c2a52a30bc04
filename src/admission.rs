//! Admission control for concurrent render jobs
//!
//! At most `max_active` jobs hold a slot. Further callers wait in a strict FIFO
//! queue with a deadline. Releasing a slot while callers wait hands it straight
//! to the head of the queue, so the active count never dips in between. A
//! waiter leaves the queue either by grant or by deadline, whichever happens
//! first under the state lock.

use crate::RenderError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
    deadline: Instant,
}

struct AdmissionState {
    active: usize,
    queue: VecDeque<Waiter>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AdmissionStats {
    pub active: usize,
    pub queued: usize,
    pub max_active: usize,
    /// Time until the oldest waiter's deadline
    pub oldest_deadline_ms: Option<u64>,
}

pub struct AdmissionController {
    max_active: usize,
    state: Mutex<AdmissionState>,
    next_waiter: AtomicU64,
}

/// A held admission slot; dropping it releases the slot.
pub struct AdmissionSlot {
    controller: Arc<AdmissionController>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.controller.release_slot();
    }
}

/// Queue membership of a caller that has not been resolved yet.
struct PendingGrant {
    controller: Arc<AdmissionController>,
    id: u64,
    receiver: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.controller.state.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.id == self.id) {
            state.queue.remove(pos);
            return;
        }
        drop(state);
        // Granted while the caller was going away: hand the slot on.
        if self.receiver.try_recv().is_ok() {
            self.controller.release_slot();
        }
    }
}

impl AdmissionController {
    pub fn new(max_active: usize) -> Arc<Self> {
        Arc::new(Self {
            max_active: max_active.max(1),
            state: Mutex::new(AdmissionState {
                active: 0,
                queue: VecDeque::new(),
            }),
            next_waiter: AtomicU64::new(0),
        })
    }

    /// Take a slot immediately or wait in line until `timeout` elapses.
    pub async fn acquire_slot(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<AdmissionSlot, RenderError> {
        let mut pending = {
            let mut state = self.state.lock();
            if state.active < self.max_active {
                state.active += 1;
                return Ok(AdmissionSlot {
                    controller: Arc::clone(self),
                });
            }

            let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (grant, receiver) = oneshot::channel();
            state.queue.push_back(Waiter {
                id,
                grant,
                deadline: Instant::now() + timeout,
            });
            debug!("Admission queue length {}", state.queue.len());

            PendingGrant {
                controller: Arc::clone(self),
                id,
                receiver,
                settled: false,
            }
        };

        match tokio::time::timeout(timeout, &mut pending.receiver).await {
            Ok(Ok(())) => {
                pending.settled = true;
                Ok(AdmissionSlot {
                    controller: Arc::clone(self),
                })
            }
            Ok(Err(_)) => {
                // Sender dropped without a grant: only possible if removed elsewhere.
                pending.settled = true;
                Err(RenderError::QueueTimeout(timeout))
            }
            Err(_) => {
                let mut state = self.state.lock();
                if let Some(pos) = state.queue.iter().position(|w| w.id == pending.id) {
                    state.queue.remove(pos);
                    pending.settled = true;
                    warn!("Admission wait timed out after {:?}", timeout);
                    return Err(RenderError::QueueTimeout(timeout));
                }
                drop(state);

                // The grant landed between the deadline and the lock; it wins.
                pending.settled = true;
                match pending.receiver.try_recv() {
                    Ok(()) => Ok(AdmissionSlot {
                        controller: Arc::clone(self),
                    }),
                    Err(_) => Err(RenderError::QueueTimeout(timeout)),
                }
            }
        }
    }

    /// Return a slot, handing it to the oldest waiter if there is one.
    fn release_slot(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.state.lock();
        let now = Instant::now();
        AdmissionStats {
            active: state.active,
            queued: state.queue.len(),
            max_active: self.max_active,
            oldest_deadline_ms: state
                .queue
                .front()
                .map(|w| w.deadline.saturating_duration_since(now).as_millis() as u64),
        }
    }
}
