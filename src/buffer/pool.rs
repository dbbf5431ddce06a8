//! Fixed pool of decode worker threads
//!
//! Samples are dispatched round-robin to OS threads, each fed by its own
//! channel. Results come back on one shared channel and are only consumed by
//! the owning store, so decoded frames are committed on the control task.
//! Samples must already be decrypted: key material never reaches a worker.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::codec::{GeometryCodec, decode_sample};
use crate::types::{DecodedFrame, RawSample};
use crate::{PlayerError, Result};

struct DecodeJob {
    generation: u64,
    sample: RawSample,
}

/// Outcome of decoding one sample on a worker.
#[derive(Debug)]
pub struct DecodeOutput {
    /// Decode timestamp of the source sample
    pub dts: u64,
    pub worker: usize,
    pub frames: Result<Vec<DecodedFrame>>,
    generation: u64,
}

/// Round-robin decode workers owned by one frame store.
pub struct DecodePool {
    senders: Vec<mpsc::UnboundedSender<DecodeJob>>,
    results: mpsc::UnboundedReceiver<DecodeOutput>,
    handles: Vec<JoinHandle<()>>,
    next_worker: usize,
    in_flight: usize,
    generation: u64,
}

impl DecodePool {
    /// Start `workers` threads decoding with `codec`.
    pub fn spawn(workers: usize, codec: Arc<dyn GeometryCodec>) -> Result<Self> {
        if workers == 0 {
            return Err(PlayerError::config("decode pool needs at least one worker"));
        }
        let (result_tx, results) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (job_tx, job_rx) = mpsc::unbounded_channel();
            let result_tx = result_tx.clone();
            let codec = Arc::clone(&codec);
            let handle = std::thread::Builder::new()
                .name(format!("holosync-decode-{index}"))
                .spawn(move || worker_loop(index, codec, job_rx, result_tx))
                .map_err(|e| PlayerError::Collaborator {
                    operation: format!("spawn decode worker {index}"),
                    source: Some(Box::new(e)),
                })?;
            senders.push(job_tx);
            handles.push(handle);
        }

        debug!(workers, codec = codec.name(), "Decode pool started");
        Ok(Self { senders, results, handles, next_worker: 0, in_flight: 0, generation: 0 })
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Samples submitted and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Queue `sample` on the next worker.
    pub fn submit(&mut self, sample: RawSample) -> Result<()> {
        if self.senders.is_empty() {
            return Err(PlayerError::collaborator("decode pool is shut down"));
        }
        let worker = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.senders.len();
        let job = DecodeJob { generation: self.generation, sample };
        self.senders[worker]
            .send(job)
            .map_err(|_| PlayerError::collaborator(format!("decode worker {worker} stopped")))?;
        self.in_flight += 1;
        trace!(worker, in_flight = self.in_flight, "Sample dispatched");
        Ok(())
    }

    /// Wait for every in-flight sample of the current generation.
    pub async fn collect(&mut self) -> Vec<DecodeOutput> {
        let mut outputs = Vec::with_capacity(self.in_flight);
        while self.in_flight > 0 {
            let Some(output) = self.results.recv().await else {
                warn!(lost = self.in_flight, "Decode workers exited with samples in flight");
                self.in_flight = 0;
                break;
            };
            if output.generation != self.generation {
                trace!(worker = output.worker, "Dropping stale decode result");
                continue;
            }
            self.in_flight -= 1;
            outputs.push(output);
        }
        outputs
    }

    /// Forget in-flight work; late results are discarded by `collect`.
    pub fn cancel_in_flight(&mut self) {
        if self.in_flight > 0 {
            debug!(discarded = self.in_flight, "Cancelling in-flight decodes");
        }
        self.in_flight = 0;
        self.generation += 1;
    }

    /// Close the job channels and join the workers.
    pub fn shutdown(&mut self) {
        self.senders.clear();
        self.cancel_in_flight();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Decode worker panicked during shutdown");
            }
        }
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DecodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodePool")
            .field("workers", &self.senders.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

fn worker_loop(
    index: usize,
    codec: Arc<dyn GeometryCodec>,
    mut jobs: mpsc::UnboundedReceiver<DecodeJob>,
    results: mpsc::UnboundedSender<DecodeOutput>,
) {
    trace!(worker = index, "Decode worker started");
    while let Some(job) = jobs.blocking_recv() {
        let dts = job.sample.dts;
        let frames = catch_unwind(AssertUnwindSafe(|| decode_sample(codec.as_ref(), &job.sample)))
            .unwrap_or_else(|_| Err(PlayerError::decode("decode worker", format!("codec panicked on sample at dts {dts}"))));
        let output = DecodeOutput { dts, worker: index, frames, generation: job.generation };
        if results.send(output).is_err() {
            break;
        }
    }
    trace!(worker = index, "Decode worker stopped");
}
