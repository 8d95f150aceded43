//! Pipeline scheduler — one periodic loop per project or stage.
//!
//! A stage tick runs strictly in order:
//! - resolve the upstream view through the stage strategy
//! - diff/mux it into the stage table
//! - materialize the to-process queue
//! - dispatch, only while processing is enabled
//!
//! A project tick keeps the project's root tile set in sync with its
//! `tiles.json` manifest through the same diff/mux engine.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use tilegrid_core::SchedulerConfig;
use tilegrid_state::{
    Lattice, ProjectId, StageId, StateStore, TileFilter, TileStatus, TileStatusCounts,
};
use tilegrid_worker::{WorkerClient, WorkerPool};

use crate::connectors::ConnectorCache;
use crate::dispatcher::{DispatchReport, Dispatcher, StageContext};
use crate::error::{SchedulerError, SchedulerResult};
use crate::mux::{self, Mirror, MuxSummary, UpstreamTile};
use crate::queue::{self, QueueSummary};

/// File in a project's root listing its source tiles.
pub const MANIFEST_FILE: &str = "tiles.json";

/// What a scheduler instance reconciles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScheduleTarget {
    Project(ProjectId),
    Stage(StageId),
}

impl ScheduleTarget {
    pub fn id(&self) -> &str {
        match self {
            ScheduleTarget::Project(id) | ScheduleTarget::Stage(id) => id,
        }
    }
}

impl fmt::Display for ScheduleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleTarget::Project(id) => write!(f, "project:{id}"),
            ScheduleTarget::Stage(id) => write!(f, "stage:{id}"),
        }
    }
}

/// Tunables shared by every scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub interval: Duration,
    /// Upper bound on queue entries pulled per fill step.
    pub batch_size: usize,
    /// Upper bound on rows written per transaction.
    pub chunk_size: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            interval: config.stage_interval(),
            batch_size: config.dispatch_batch_size,
            chunk_size: config.write_chunk_size,
        }
    }
}

/// Shared services every scheduler runs against.
#[derive(Clone)]
pub struct SchedulerContext {
    pub store: StateStore,
    pub connectors: Arc<ConnectorCache>,
    pub pool: Arc<WorkerPool>,
    pub client: Arc<dyn WorkerClient>,
    pub settings: SchedulerSettings,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub mux: MuxSummary,
    pub queue: QueueSummary,
    /// `None` when processing was off (or for project ticks).
    pub dispatch: Option<DispatchReport>,
    pub counts: TileStatusCounts,
}

/// One entry of a project manifest.
#[derive(Debug, Clone, Deserialize)]
struct ManifestTile {
    relative_path: String,
    #[serde(default)]
    tile_name: Option<String>,
    position: Lattice,
    #[serde(default)]
    step: Lattice,
    #[serde(default = "manifest_default_status")]
    status: TileStatus,
}

fn manifest_default_status() -> TileStatus {
    TileStatus::Complete
}

impl From<ManifestTile> for UpstreamTile {
    fn from(m: ManifestTile) -> Self {
        let tile_name = m.tile_name.unwrap_or_else(|| {
            m.relative_path
                .rsplit('/')
                .next()
                .unwrap_or(&m.relative_path)
                .to_string()
        });
        Self {
            relative_path: m.relative_path,
            tile_name,
            position: m.position,
            step: m.step,
            status: m.status,
        }
    }
}

/// Periodic reconciliation loop for one project or stage.
pub struct PipelineScheduler {
    target: ScheduleTarget,
    ctx: SchedulerContext,
    processing: Arc<AtomicBool>,
}

impl PipelineScheduler {
    pub fn new(target: ScheduleTarget, ctx: SchedulerContext, processing: Arc<AtomicBool>) -> Self {
        Self {
            target,
            ctx,
            processing,
        }
    }

    pub fn target(&self) -> &ScheduleTarget {
        &self.target
    }

    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        match &self.target {
            ScheduleTarget::Project(id) => self.tick_project(id).await,
            ScheduleTarget::Stage(id) => self.tick_stage(id).await,
        }
    }

    async fn tick_project(&self, project_id: &str) -> SchedulerResult<TickReport> {
        let project = self
            .ctx
            .store
            .get_project(project_id)?
            .ok_or_else(|| SchedulerError::ProjectNotFound(project_id.to_string()))?;
        let connector = self.ctx.connectors.get(project_id).await?;
        let mut report = TickReport::default();

        let path = Path::new(&project.root_path).join(MANIFEST_FILE);
        match read_manifest(&path).await? {
            Some(upstream) => {
                let local = connector.load_tiles(&TileFilter::all())?;
                let diff = mux::diff(&upstream, &local, None, Mirror::ThisStage);
                report.mux = mux::apply(connector.as_ref(), &diff, self.ctx.settings.chunk_size)?;
            }
            None => debug!(project = %project_id, path = %path.display(), "no tile manifest"),
        }

        report.counts = connector.count_tiles_by_status()?;
        Ok(report)
    }

    async fn tick_stage(&self, stage_id: &str) -> SchedulerResult<TickReport> {
        let store = &self.ctx.store;
        let chunk_size = self.ctx.settings.chunk_size;
        let stage_ctx = StageContext::load(store, stage_id)?;
        let strategy = stage_ctx.strategy();

        let input = self.ctx.connectors.get(stage_ctx.stage.input_owner()).await?;
        let output = self.ctx.connectors.get(stage_id).await?;

        let upstream = strategy.resolve_input_output(
            input.as_ref(),
            output.as_ref(),
            &stage_ctx.project,
            chunk_size,
        )?;
        let region = &stage_ctx.project.region;
        let bounds = (stage_ctx.stage.is_root_adjacent() && !region.is_unbounded()).then_some(region);
        let local = output.load_tiles(&TileFilter::all())?;
        let diff = mux::diff(&upstream, &local, bounds, Mirror::PrevStage);

        let mut report = TickReport {
            mux: mux::apply(output.as_ref(), &diff, chunk_size)?,
            queue: queue::materialize(output.as_ref(), chunk_size)?,
            ..TickReport::default()
        };

        if self.processing.load(Ordering::Relaxed) {
            let input_root = stage_ctx.input_root(store)?;
            let dispatcher = Dispatcher {
                connector: output.as_ref(),
                pool: &self.ctx.pool,
                client: self.ctx.client.as_ref(),
                batch_size: self.ctx.settings.batch_size,
            };
            report.dispatch = Some(dispatcher.dispatch(&stage_ctx, &input_root).await?);
        }

        report.counts = output.count_tiles_by_status()?;
        debug!(
            stage = %stage_id,
            inserted = report.mux.inserted,
            updated = report.mux.updated,
            deleted = report.mux.deleted,
            queued = report.counts.queued,
            processing = report.counts.processing,
            complete = report.counts.complete,
            "stage tick"
        );
        Ok(report)
    }

    /// Tick until `exit` changes. A failed tick is logged and retried on
    /// the next interval.
    pub async fn run(self, mut exit: watch::Receiver<bool>) {
        info!(scheduler = %self.target, "scheduler started");
        while !*exit.borrow() {
            if let Err(e) = self.tick().await {
                error!(scheduler = %self.target, error = %e, "scheduler tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.settings.interval) => {}
                _ = exit.changed() => break,
            }
        }
        info!(scheduler = %self.target, "scheduler stopped");
    }
}

/// Read a project manifest. `None` if the file does not exist.
async fn read_manifest(path: &Path) -> SchedulerResult<Option<Vec<UpstreamTile>>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SchedulerError::Manifest {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }
    };
    let tiles: Vec<ManifestTile> =
        serde_json::from_slice(&bytes).map_err(|e| SchedulerError::Manifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(Some(tiles.into_iter().map(UpstreamTile::from).collect()))
}
