//! The scheduler contract consumed by the context-set builder, plus a
//! standalone native-thread implementation for the binary and the tests.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use tensorport_core::{Result, Status};

use crate::payload::{Payload, RequestInput, TimestampKind};

/// Per-runner initialization hook.
pub type InitFn = Box<dyn Fn(usize) -> Result<()> + Send + Sync>;
/// Batch execution entry point; `usize` is the runner index.
pub type RunFn = Box<dyn Fn(usize, &mut Vec<Payload>) -> Result<()> + Send + Sync>;
/// Per-input shape override hook; `Ok(None)` means no change.
pub type ShapeFn =
    Box<dyn Fn(usize, &str, &RequestInput, &Payload) -> Result<Option<Vec<i64>>> + Send + Sync>;
/// Invoked once per batch with the payloads and the batch-level status.
pub type CompletionFn = Box<dyn FnOnce(Vec<Payload>, Result<()>) + Send>;

/// The contract a backend uses to tie its execution contexts to runners.
///
/// Runner `i` is entered by exactly one scheduler thread, and batches
/// delivered to it are strictly ordered.
pub trait Scheduler {
    fn set_configured(
        &mut self,
        runner_count: usize,
        init: InitFn,
        run: RunFn,
        shape: ShapeFn,
    ) -> Result<()>;
}

/// A batch of payloads bound for one runner.
pub struct Batch {
    pub payloads: Vec<Payload>,
    pub done: CompletionFn,
}

/// One native thread per runner, each draining a dedicated channel.
///
/// On a batch-level error from the run function, the scheduler stamps the
/// error onto every payload that was still ok before invoking the
/// completion; engine errors are mapped to internal at this boundary.
#[derive(Default)]
pub struct StandaloneScheduler {
    senders: Vec<mpsc::Sender<Batch>>,
    handles: Vec<JoinHandle<()>>,
}

impl StandaloneScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runner_count(&self) -> usize {
        self.senders.len()
    }

    /// Queue a batch onto runner `runner_idx`.
    pub fn submit(&self, runner_idx: usize, batch: Batch) -> Result<()> {
        let sender = self.senders.get(runner_idx).ok_or_else(|| {
            Status::internal(format!("invalid runner index {runner_idx}"))
        })?;
        sender
            .send(batch)
            .map_err(|_| Status::internal(format!("runner {runner_idx} has exited")))
    }
}

impl Scheduler for StandaloneScheduler {
    fn set_configured(
        &mut self,
        runner_count: usize,
        init: InitFn,
        run: RunFn,
        _shape: ShapeFn,
    ) -> Result<()> {
        if !self.senders.is_empty() {
            return Err(Status::internal("scheduler is already configured"));
        }

        let run = Arc::new(run);
        for runner_idx in 0..runner_count {
            init(runner_idx)?;

            let (sender, receiver) = mpsc::channel::<Batch>();
            let run = Arc::clone(&run);
            let handle = std::thread::Builder::new()
                .name(format!("runner-{runner_idx}"))
                .spawn(move || {
                    info!(runner = runner_idx, "runner started");
                    while let Ok(mut batch) = receiver.recv() {
                        for payload in &batch.payloads {
                            if let Some(stats) = &payload.stats {
                                stats.capture(TimestampKind::ComputeStart);
                            }
                        }

                        let result = run(runner_idx, &mut batch.payloads)
                            .map_err(Status::into_scheduler);
                        if let Err(err) = &result {
                            for payload in batch.payloads.iter_mut() {
                                if payload.is_ok() {
                                    payload.set_status(err.clone());
                                }
                            }
                        }

                        for payload in &batch.payloads {
                            if let Some(stats) = &payload.stats {
                                stats.capture(TimestampKind::ComputeEnd);
                            }
                        }

                        (batch.done)(batch.payloads, result);
                    }
                })
                .map_err(|e| {
                    Status::internal(format!("failed to spawn runner thread: {e}"))
                })?;

            self.senders.push(sender);
            self.handles.push(handle);
        }
        Ok(())
    }
}

impl Drop for StandaloneScheduler {
    fn drop(&mut self) {
        // Closing the channels lets each runner drain and exit.
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
