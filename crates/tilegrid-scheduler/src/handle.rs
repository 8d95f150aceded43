//! Control handles for running schedulers.
//!
//! The hub only ever talks to a [`SchedulerHandle`]; where the scheduler
//! actually runs is up to the [`SchedulerSpawner`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::scheduler::{PipelineScheduler, ScheduleTarget, SchedulerContext};

/// Cancel and processing controls for one running scheduler.
pub struct SchedulerHandle {
    target: ScheduleTarget,
    exit: watch::Sender<bool>,
    processing: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn new(
        target: ScheduleTarget,
        exit: watch::Sender<bool>,
        processing: Arc<AtomicBool>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            target,
            exit,
            processing,
            task,
        }
    }

    pub fn target(&self) -> &ScheduleTarget {
        &self.target
    }

    /// Ask the scheduler to stop after its current tick.
    pub fn cancel(&self) {
        self.exit.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.exit.borrow()
    }

    /// Gate the dispatch step. Refresh keeps running either way.
    pub fn set_processing(&self, on: bool) {
        self.processing.store(on, Ordering::Relaxed);
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Relaxed)
    }

    /// The scheduler's task has ended (stopped or panicked).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_some_and(|t| t.is_finished())
    }

    /// Cancel and wait for the scheduler to wind down.
    pub async fn stop(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(scheduler = %self.target, error = %e, "scheduler task ended abnormally");
            }
        }
    }
}

/// Starts schedulers for the hub.
pub trait SchedulerSpawner: Send + Sync {
    fn start(&self, target: ScheduleTarget, processing: bool) -> SchedulerHandle;
}

/// Runs each scheduler as a task on the current tokio runtime.
pub struct InProcessSpawner {
    ctx: SchedulerContext,
}

impl InProcessSpawner {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }
}

impl SchedulerSpawner for InProcessSpawner {
    fn start(&self, target: ScheduleTarget, processing: bool) -> SchedulerHandle {
        let processing = Arc::new(AtomicBool::new(processing));
        let (exit_tx, exit_rx) = watch::channel(false);
        let scheduler =
            PipelineScheduler::new(target.clone(), self.ctx.clone(), Arc::clone(&processing));
        let task = tokio::spawn(scheduler.run(exit_rx));
        SchedulerHandle::new(target, exit_tx, processing, Some(task))
    }
}
