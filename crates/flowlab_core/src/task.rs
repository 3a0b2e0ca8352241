//! Cancellation, progress reporting and background execution for long runs.
//!
//! Every long computation in the crate takes a [`CancelToken`] and a
//! [`ProgressSink`]; the token is polled between outer iterations and the sink
//! receives a snapshot after each one. [`spawn_task`] moves such a computation
//! onto its own thread and turns the sink into a channel of [`TaskEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

/// Shared flag checked between outer iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AnalysisError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receives incremental snapshots from a running computation.
pub trait ProgressSink<P> {
    fn report(&mut self, progress: &P);
}

/// Discards progress.
impl<P> ProgressSink<P> for () {
    fn report(&mut self, _progress: &P) {}
}

/// Closures work as sinks.
pub struct FnSink<F>(pub F);

impl<P, F: FnMut(&P)> ProgressSink<P> for FnSink<F> {
    fn report(&mut self, progress: &P) {
        (self.0)(progress)
    }
}

/// Final disposition of a run, reported next to its results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    /// Finished, but the listed positions hold sentinel values.
    Partial { gaps: Vec<usize> },
    /// Stopped early (cancellation or a fatal error) with whatever was produced.
    Aborted { reason: String },
}

impl RunStatus {
    pub fn from_gaps(gaps: Vec<usize>) -> Self {
        if gaps.is_empty() {
            RunStatus::Complete
        } else {
            RunStatus::Partial { gaps }
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, RunStatus::Complete)
    }
}

#[derive(Debug)]
pub enum TaskEvent<P, R> {
    Progress(P),
    Finished(R),
}

/// Handle to a computation running on a background thread.
pub struct TaskHandle<P, R> {
    events: Receiver<TaskEvent<P, R>>,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl<P, R> TaskHandle<P, R> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Non-blocking poll for the next event.
    pub fn try_next(&self) -> Option<TaskEvent<P, R>> {
        self.events.try_recv().ok()
    }

    /// Blocks until the next event; `None` once the task has ended and drained.
    pub fn next(&self) -> Option<TaskEvent<P, R>> {
        self.events.recv().ok()
    }

    /// Blocks until completion, forwarding every progress snapshot to `on_progress`.
    pub fn wait_with(mut self, mut on_progress: impl FnMut(P)) -> Option<R> {
        let mut outcome = None;
        while let Ok(event) = self.events.recv() {
            match event {
                TaskEvent::Progress(p) => on_progress(p),
                TaskEvent::Finished(r) => {
                    outcome = Some(r);
                    break;
                }
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Background task panicked.");
            }
        }
        outcome
    }

    pub fn wait(self) -> Option<R> {
        self.wait_with(|_| {})
    }
}

/// A dropped handle has nobody left to report to, so the task is cancelled.
impl<P, R> Drop for TaskHandle<P, R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ChannelSink<P, R> {
    tx: Sender<TaskEvent<P, R>>,
}

impl<P: Clone, R> ProgressSink<P> for ChannelSink<P, R> {
    fn report(&mut self, progress: &P) {
        // A dropped receiver only means nobody is watching anymore.
        let _ = self.tx.send(TaskEvent::Progress(progress.clone()));
    }
}

/// Runs `job` on a new thread. The job receives a progress sink that forwards
/// snapshots over the handle's channel, and the handle's cancel token.
pub fn spawn_task<P, R, F>(job: F) -> TaskHandle<P, R>
where
    P: Clone + Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut dyn ProgressSink<P>, &CancelToken) -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let thread = std::thread::spawn(move || {
        let mut sink = ChannelSink { tx: tx.clone() };
        let result = job(&mut sink, &worker_cancel);
        let _ = tx.send(TaskEvent::Finished(result));
    });
    TaskHandle {
        events: rx,
        cancel,
        thread: Some(thread),
    }
}
