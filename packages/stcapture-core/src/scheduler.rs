//! Periodic timers for live capture and token refresh.
//!
//! Each timer owns a single-permit semaphore: a tick that finds the previous
//! run still in flight is skipped, never queued, so at most one run of a job
//! exists at any time. Job errors are logged and the timer keeps ticking.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenManager;
use crate::device::{CaptureWorkflow, DeviceTarget};
use crate::sink::LogSink;

#[derive(Debug, Default)]
struct Counters {
    fired: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TimerStats {
        TimerStats {
            fired: self.fired.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a timer's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerStats {
    /// Ticks delivered
    pub fired: u64,
    /// Ticks dropped because a run was in flight
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Handle to a running timer.
pub struct TimerHandle {
    name: &'static str,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    gate: Arc<Semaphore>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop future ticks. A run already in flight sees its cancellation token
    /// fire and stops at its next checkpoint. Safe to call repeatedly.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("Cancelling {} timer", self.name);
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether a run is in flight right now.
    pub fn is_running(&self) -> bool {
        self.gate.available_permits() == 0
    }

    pub fn stats(&self) -> TimerStats {
        self.counters.snapshot()
    }

    /// Cancel and wait for the tick loop and any in-flight run to finish.
    /// Returns the counters as they stand once nothing is running.
    pub async fn shutdown(self) -> TimerStats {
        self.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("{} timer task ended abnormally: {}", self.name, e);
        }
        // the permit is only released once the in-flight run has finished
        if self.gate.acquire().await.is_err() {
            tracing::debug!("{} timer gate closed", self.name);
        }
        self.counters.snapshot()
    }
}

/// Run `job` every `period`, first after `first_tick`.
///
/// The job receives a child cancellation token of the timer.
pub fn spawn_periodic<F, Fut, E>(
    name: &'static str,
    first_tick: Duration,
    period: Duration,
    sink: Arc<dyn LogSink>,
    mut job: F,
) -> TimerHandle
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let cancel = CancellationToken::new();
    let counters = Arc::new(Counters::default());
    let gate = Arc::new(Semaphore::new(1));

    let task = tokio::spawn({
        let cancel = cancel.clone();
        let counters = counters.clone();
        let gate = gate.clone();
        async move {
            let mut ticker = interval_at(Instant::now() + first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!("{} timer started (every {:?})", name, period);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                counters.fired.fetch_add(1, Ordering::Relaxed);

                let Ok(permit) = gate.clone().try_acquire_owned() else {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("{} still running, skipping tick", name);
                    continue;
                };

                let run = job(cancel.child_token());
                let counters = counters.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match run.await {
                        Ok(()) => {
                            counters.completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("{} run failed: {}", name, e);
                            sink.append_log(&format!("{} failed: {}", name, e));
                        }
                    }
                });
            }

            tracing::info!("{} timer stopped", name);
        }
    });

    TimerHandle {
        name,
        cancel,
        counters,
        gate,
        task,
    }
}

/// Wires the capture workflow and the token manager to timers.
pub struct Scheduler {
    workflow: Arc<CaptureWorkflow>,
    tokens: Arc<TokenManager>,
    sink: Arc<dyn LogSink>,
}

impl Scheduler {
    pub fn new(
        workflow: Arc<CaptureWorkflow>,
        tokens: Arc<TokenManager>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            workflow,
            tokens,
            sink,
        }
    }

    /// Capture from `device` every `period`, starting immediately.
    pub fn start_live_capture(&self, device: DeviceTarget, period: Duration) -> TimerHandle {
        let workflow = self.workflow.clone();
        let device = Arc::new(device);
        spawn_periodic(
            "live capture",
            Duration::ZERO,
            period,
            self.sink.clone(),
            move |cancel| {
                let workflow = workflow.clone();
                let device = device.clone();
                async move {
                    workflow.capture(&device, &cancel).await.map(|result| {
                        tracing::debug!("Live capture saved {:?}", result.local_path);
                    })
                }
            },
        )
    }

    /// Refresh the token every `period`, first after one full period.
    pub fn start_token_refresh(&self, period: Duration) -> TimerHandle {
        let tokens = self.tokens.clone();
        spawn_periodic(
            "token refresh",
            period,
            period,
            self.sink.clone(),
            move |_cancel| {
                let tokens = tokens.clone();
                async move { tokens.force_refresh().await.map(|_| ()) }
            },
        )
    }
}
