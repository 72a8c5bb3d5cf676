//! Single-consumer spill queue draining evicted frames into the cold tier.

use super::{HotState, StoreError};
use crate::frame::{FrameKey, Tier};
use crate::store::cold::ColdStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Work item for the spill worker. Jobs are processed strictly in order.
#[derive(Debug)]
pub(crate) enum SpillJob {
    /// Move an in-flight frame to the cold tier
    Spill(FrameKey),
    /// Acknowledged once every job queued before it has completed
    Flush(oneshot::Sender<()>),
    /// Clear the cold tier after every job queued before it
    Purge(oneshot::Sender<Result<u64, StoreError>>),
}

pub(crate) struct SpillWorker {
    state: Arc<Mutex<HotState>>,
    cold: Arc<dyn ColdStore>,
    rx: mpsc::Receiver<SpillJob>,
}

impl SpillWorker {
    pub(crate) fn spawn(
        state: Arc<Mutex<HotState>>,
        cold: Arc<dyn ColdStore>,
        rx: mpsc::Receiver<SpillJob>,
    ) -> JoinHandle<()> {
        let worker = Self { state, cold, rx };
        tokio::spawn(worker.run())
    }

    async fn run(mut self) {
        debug!("Spill worker started");

        while let Some(job) = self.rx.recv().await {
            match job {
                SpillJob::Spill(key) => self.spill(key).await,
                SpillJob::Flush(ack) => {
                    let _ = ack.send(());
                }
                SpillJob::Purge(ack) => {
                    let result = self.cold.purge().await;
                    let _ = ack.send(result);
                }
            }
        }

        debug!("Spill queue closed, worker stopped");
    }

    async fn spill(&self, key: FrameKey) {
        let entry = self.state.lock().in_flight.get(&key).cloned();
        // purged (or rewritten) while queued
        let Some(entry) = entry else {
            debug!(key = %key, "Frame no longer in flight, skipping spill");
            return;
        };

        let mut record = entry.record;
        record.image_ref.tier = Tier::Persistent;

        match self.cold.put_frame(&record, &entry.image).await {
            Ok(()) => {
                let mut state = self.state.lock();
                // the in-memory copy is only released once the cold copy exists
                if state.in_flight.remove(&key).is_some() {
                    state
                        .session_mut(&key.session_id)
                        .cold_frame_ids
                        .insert(key.frame_id);
                    state.spilled_total += 1;
                }
                metrics::counter!("recorder.spill.completed").increment(1);
                metrics::counter!("recorder.spill.bytes").increment(entry.image.len() as u64);
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    if state.in_flight.remove(&key).is_some() {
                        state.session_mut(&key.session_id).dropped += 1;
                        state.spill_failures += 1;
                    }
                }
                metrics::counter!("recorder.spill.failed").increment(1);
                error!(key = %key, error = %e, "Cold store write failed, frame dropped");
            }
        }
    }
}

impl Drop for SpillWorker {
    fn drop(&mut self) {
        let pending = self.state.lock().in_flight.len();
        if pending > 0 {
            info!(pending, "Spill worker dropped with frames still in flight");
        }
    }
}
