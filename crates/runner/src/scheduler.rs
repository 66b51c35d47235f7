use crate::activity::ActivityLog;
use crate::build::{BuildExecutor, BuildOutcome, BuildUi};
use crate::cache::VillageCache;
use crate::config::{Pacing, Settings};
use crate::delay::{night_mode_active, uniform_between};
use crate::farm::{FarmBuilder, FarmOptions, FarmUi};
use crate::feed::CoordFeed;
use crate::page::PageError;
use crate::scanner::{Scanner, SlotSource};
use crate::selector::{completed_resource_tasks, ResourceAmounts};
use crate::status::RunnerStatus;
use crate::train::{TrainExecutor, TrainUi};
use async_trait::async_trait;
use farmhand_engine::{now_ms, Engine, TaskFilter};
use farmhand_protocol::{BuildReason, BuildTask, TaskStatus, TrainReason, TrainingTask};
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Pause between two failed tasks of the same cycle.
const BETWEEN_TASKS: Duration = Duration::from_secs(2);

/// The queue reads and writes the runner needs.
pub trait TaskStore: Send + Sync {
    /// Pending build tasks of every village, in run order.
    fn pending_builds(&self, limit: usize) -> anyhow::Result<Vec<BuildTask>>;

    fn pending_trainings(&self, limit: usize) -> anyhow::Result<Vec<TrainingTask>>;

    fn set_build_status(&self, id: &str, status: TaskStatus, note: Option<&str>) -> anyhow::Result<()>;

    fn record_training(&self, id: &str, trained: u32, at_ms: i64, complete: bool) -> anyhow::Result<()>;
}

impl TaskStore for Engine {
    fn pending_builds(&self, limit: usize) -> anyhow::Result<Vec<BuildTask>> {
        self.pending_build_tasks(&TaskFilter::default(), limit)
    }

    fn pending_trainings(&self, limit: usize) -> anyhow::Result<Vec<TrainingTask>> {
        self.pending_training_tasks(&TaskFilter::default(), limit)
    }

    fn set_build_status(&self, id: &str, status: TaskStatus, note: Option<&str>) -> anyhow::Result<()> {
        if !self.update_build_status(id, status, note)? {
            tracing::warn!(task = id, "build task vanished before its status was written");
        }
        Ok(())
    }

    fn record_training(&self, id: &str, trained: u32, at_ms: i64, complete: bool) -> anyhow::Result<()> {
        if !Engine::record_training(self, id, trained, at_ms, complete)? {
            tracing::warn!(task = id, "training task vanished before its total was written");
        }
        Ok(())
    }
}

/// Changes the active village of the session.
#[async_trait]
pub trait VillageSwitch: Send + Sync {
    /// Invalidates `cache` when the village actually changes.
    async fn switch_village(&self, target: &str, cache: &mut VillageCache) -> Result<bool, PageError>;
}

/// Everything the runner drives through the page.
pub trait Game: SlotSource + BuildUi + TrainUi + FarmUi + VillageSwitch {}

impl<T: SlotSource + BuildUi + TrainUi + FarmUi + VillageSwitch> Game for T {}

/// Farm-list builder runs on their own interval.
pub struct FarmSchedule {
    pub options: FarmOptions,
    pub interval: Duration,
    pub feed: Option<Box<dyn CoordFeed>>,
}

/// How a cycle ended, which decides the following sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// An upgrade was started or troops were queued.
    Progress,
    QueueFull,
    /// Tasks exist but none could run now.
    Idle,
    NoTasks,
    /// The browser session is gone.
    Stop,
}

impl Cycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::QueueFull => "queue_full",
            Self::Idle => "idle",
            Self::NoTasks => "no_tasks",
            Self::Stop => "stop",
        }
    }

    pub fn wait(self, pacing: &Pacing) -> Option<Duration> {
        match self {
            Self::Progress => Some(uniform_between(
                pacing.success_min_secs * 1000,
                pacing.success_max_secs * 1000,
            )),
            Self::QueueFull => Some(Duration::from_secs(pacing.queue_full_secs)),
            Self::Idle => Some(Duration::from_secs(pacing.idle_secs)),
            Self::NoTasks => Some(Duration::from_secs(pacing.no_tasks_secs)),
            Self::Stop => None,
        }
    }
}

/// The single loop that owns the page and the field cache.
pub struct TaskRunner<'a, G: Game + ?Sized, S: TaskStore + ?Sized> {
    game: &'a G,
    store: &'a S,
    activity: ActivityLog,
    settings: Settings,
    scanner: Scanner,
    builder: BuildExecutor,
    trainer: TrainExecutor,
    cache: VillageCache,
    active_village: Option<String>,
    farm: Option<FarmSchedule>,
    last_farm: Option<Instant>,
    night_mode: bool,
    shutdown: watch::Receiver<bool>,
    status: Option<watch::Sender<RunnerStatus>>,
}

impl<'a, G: Game + ?Sized, S: TaskStore + ?Sized> TaskRunner<'a, G, S> {
    pub fn new(
        game: &'a G,
        store: &'a S,
        activity: ActivityLog,
        settings: Settings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let scanner = Scanner {
            retries: settings.scan_retries,
            backoff: settings.scan_backoff(),
        };
        let builder = BuildExecutor {
            verify: settings.verify_builds,
        };
        Self {
            game,
            store,
            activity,
            settings,
            scanner,
            builder,
            trainer: TrainExecutor,
            cache: VillageCache::new(),
            active_village: None,
            farm: None,
            last_farm: None,
            night_mode: false,
            shutdown,
            status: None,
        }
    }

    /// The village the session already shows, so tasks for it do not switch.
    pub fn with_active_village(mut self, village: Option<String>) -> Self {
        self.active_village = village.filter(|v| !v.trim().is_empty());
        self
    }

    pub fn with_farm(mut self, farm: FarmSchedule) -> Self {
        self.farm = Some(farm);
        self
    }

    pub fn with_night_mode(mut self, enabled: bool) -> Self {
        self.night_mode = enabled;
        self
    }

    /// Publishes a `RunnerStatus` after every cycle.
    pub fn with_status(mut self, status: watch::Sender<RunnerStatus>) -> Self {
        self.status = Some(status);
        self
    }

    fn publish(&self, last: Option<Cycle>, running: bool) {
        let Some(tx) = &self.status else {
            return;
        };
        let mut snapshot =
            RunnerStatus::from_cache(&self.cache, self.active_village.as_deref(), last.map(Cycle::as_str));
        snapshot.running = running;
        tx.send_replace(snapshot);
    }

    pub fn cache(&self) -> &VillageCache {
        &self.cache
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleeps unless a shutdown arrives first; false means stop.
    async fn pause(&mut self, wait: Duration) -> bool {
        if self.stopping() {
            return false;
        }
        let slept = tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = self.shutdown.changed() => false,
        };
        slept && !self.stopping()
    }

    /// Runs cycles until shutdown or until the browser goes away.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.activity.info("runner_started", "task runner started", json!({}));
        self.publish(None, true);
        while !self.stopping() {
            if night_mode_active(self.night_mode) {
                tracing::info!("night mode, sleeping");
                let night = Duration::from_secs(self.settings.pacing.night_secs);
                if !self.pause(night).await {
                    break;
                }
                continue;
            }

            if self.run_farm_if_due().await == Some(Cycle::Stop) {
                break;
            }

            let wait = match self.run_cycle().await {
                Ok(cycle) => {
                    tracing::debug!(?cycle, "cycle finished");
                    self.publish(Some(cycle), cycle != Cycle::Stop);
                    cycle.wait(&self.settings.pacing)
                }
                Err(e) if crate::page::is_closed_error(&e) => None,
                Err(e) => {
                    self.activity.error("runner_error", &format!("{e:#}"), json!({}));
                    Some(Duration::from_secs(self.settings.pacing.error_secs))
                }
            };
            let Some(wait) = wait else {
                self.activity.warn("browser_closed", "browser session closed, stopping", json!({}));
                break;
            };
            tracing::info!(secs = wait.as_secs(), "waiting before next cycle");
            if !self.pause(wait).await {
                break;
            }
        }
        self.publish(None, false);
        self.activity.info("runner_stopped", "task runner stopped", json!({}));
        Ok(())
    }

    /// One pass over the queue: a build batch for one village, then due training.
    pub async fn run_cycle(&mut self) -> anyhow::Result<Cycle> {
        let limit = self.settings.tasks_per_cycle.max(1);
        let builds = self.store.pending_builds(limit)?;
        let now = now_ms();
        let trainings: Vec<TrainingTask> = self
            .store
            .pending_trainings(limit)?
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect();

        if builds.is_empty() && trainings.is_empty() {
            tracing::info!("no pending tasks");
            return Ok(Cycle::NoTasks);
        }

        let mut result = Cycle::Idle;
        if !builds.is_empty() {
            result = self.run_builds(builds).await?;
            if result == Cycle::Stop {
                return Ok(Cycle::Stop);
            }
        }
        if !trainings.is_empty() {
            match self.run_trainings(&trainings).await? {
                Cycle::Stop => return Ok(Cycle::Stop),
                Cycle::Progress => result = Cycle::Progress,
                _ => {}
            }
        }
        Ok(result)
    }

    async fn ensure_village(&mut self, village: Option<&str>) -> anyhow::Result<bool> {
        let Some(target) = village.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(true);
        };
        if self.active_village.as_deref() == Some(target) {
            return Ok(true);
        }
        if !self.game.switch_village(target, &mut self.cache).await? {
            return Ok(false);
        }
        self.active_village = Some(target.to_string());
        Ok(true)
    }

    /// Tasks of the first village (in queue order) the session can switch to.
    async fn pick_batch(&mut self, builds: Vec<BuildTask>) -> anyhow::Result<Vec<BuildTask>> {
        let mut tried: Vec<Option<String>> = Vec::new();
        for task in &builds {
            if tried.contains(&task.village) {
                continue;
            }
            tried.push(task.village.clone());
            if self.ensure_village(task.village.as_deref()).await? {
                let village = task.village.clone();
                return Ok(builds.into_iter().filter(|t| t.village == village).collect());
            }
            self.activity.warn(
                "village_switch_failed",
                &format!("cannot switch to village {}", task.village.as_deref().unwrap_or_default()),
                json!({ "village": task.village }),
            );
        }
        Ok(Vec::new())
    }

    async fn run_builds(&mut self, builds: Vec<BuildTask>) -> anyhow::Result<Cycle> {
        let mut batch = self.pick_batch(builds).await?;
        if batch.is_empty() {
            return Ok(Cycle::Idle);
        }

        let mut amounts = ResourceAmounts::new();
        if batch.iter().any(BuildTask::is_resource_task) {
            if let Err(e) = self.scanner.scan_if_needed(self.game, &mut self.cache, false).await {
                if e.is_session_closed() {
                    return Ok(Cycle::Stop);
                }
                self.cache.invalidate();
                return Err(e.into());
            }
            self.cache.log_status();
            self.retire_completed(&mut batch)?;

            match self.game.resource_amounts().await {
                Ok(found) => amounts = found,
                Err(e) if e.is_session_closed() => return Ok(Cycle::Stop),
                Err(e) => tracing::warn!(error = %e, "could not read resource stock"),
            }
        }

        let mut fields_tried = false;
        let mut first = true;
        for task in batch.iter() {
            if task.is_resource_task() {
                // One selection pass covers every resource task of the batch.
                if fields_tried {
                    continue;
                }
                fields_tried = true;
                if let Some(cycle) = self.run_fields(&batch, &amounts, &mut first).await? {
                    return Ok(cycle);
                }
                continue;
            }
            if !first && !self.pause(BETWEEN_TASKS).await {
                return Ok(Cycle::Stop);
            }
            first = false;

            tracing::info!(task = %task.label(), target = task.target_level, "running build task");
            let outcome = self
                .builder
                .execute(self.game, &mut self.cache, task, &batch, &amounts)
                .await;
            if let Some(cycle) = self.settle_build(task, &outcome)? {
                return Ok(cycle);
            }
        }
        Ok(Cycle::Idle)
    }

    /// Selects fields until one upgrade starts or a result other than short
    /// stock ends the pass. Tasks whose pick was short of stock drop out.
    async fn run_fields(
        &mut self,
        batch: &[BuildTask],
        amounts: &ResourceAmounts,
        first: &mut bool,
    ) -> anyhow::Result<Option<Cycle>> {
        let mut pool: Vec<BuildTask> =
            batch.iter().filter(|t| t.is_resource_task()).cloned().collect();
        while let Some(lead) = pool.first().cloned() {
            if !*first && !self.pause(BETWEEN_TASKS).await {
                return Ok(Some(Cycle::Stop));
            }
            *first = false;

            tracing::info!(tasks = pool.len(), "selecting a resource field");
            let outcome = self
                .builder
                .execute(self.game, &mut self.cache, &lead, &pool, amounts)
                .await;
            let tried = pool
                .iter()
                .find(|t| t.id == outcome.task_id)
                .cloned()
                .unwrap_or(lead);
            if let Some(cycle) = self.settle_build(&tried, &outcome)? {
                return Ok(Some(cycle));
            }
            if outcome.reason != Some(BuildReason::NotEnoughResources) {
                break;
            }
            pool.retain(|t| t.id != tried.id);
        }
        Ok(None)
    }

    /// Persists a build outcome and logs it; `Some` ends the batch.
    fn settle_build(
        &self,
        task: &BuildTask,
        outcome: &BuildOutcome,
    ) -> anyhow::Result<Option<Cycle>> {
        if let Some(status) = outcome.status {
            let note = outcome.reason.map(BuildReason::as_str);
            self.store.set_build_status(&outcome.task_id, status, note)?;
        }
        let details = serde_json::to_value(outcome).unwrap_or_default();

        if outcome.success {
            let level = outcome.new_level.map(|l| format!(" to level {l}")).unwrap_or_default();
            let message = format!("upgrade of {} started{level}", task.label());
            self.activity.success("build_started", &message, details);
            return Ok(Some(Cycle::Progress));
        }
        match outcome.reason {
            Some(BuildReason::BrowserClosed) => return Ok(Some(Cycle::Stop)),
            Some(BuildReason::QueueFull) => {
                self.activity.info("queue_full", "construction queue is full", details);
                return Ok(Some(Cycle::QueueFull));
            }
            Some(BuildReason::CompletedAlready) => {
                let message = format!("{} already at target", task.label());
                self.activity.success("task_completed", &message, details);
            }
            Some(reason) if reason.is_recoverable() => {
                self.activity
                    .info("build_deferred", &format!("{}: {reason}", task.label()), details);
            }
            _ => {
                self.activity
                    .warn("build_failed", &format!("{} could not be built", task.label()), details);
            }
        }
        Ok(None)
    }

    /// Completes resource tasks the cached levels already satisfy.
    fn retire_completed(&self, batch: &mut Vec<BuildTask>) -> anyhow::Result<()> {
        let done: Vec<String> = completed_resource_tasks(&self.cache, batch)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        for id in &done {
            self.store
                .set_build_status(id, TaskStatus::Completed, Some("completed_already"))?;
            self.activity
                .success("task_completed", "resource task reached its target", json!({ "id": id }));
        }
        batch.retain(|t| !done.contains(&t.id));
        Ok(())
    }

    async fn run_trainings(&mut self, tasks: &[TrainingTask]) -> anyhow::Result<Cycle> {
        let mut result = Cycle::Idle;
        for task in tasks {
            if !self.ensure_village(task.village.as_deref()).await? {
                tracing::warn!(task = %task.id, village = ?task.village, "training village unavailable");
                continue;
            }
            let outcome = self.trainer.run_task(self.game, task).await;
            let details = serde_json::to_value(&outcome).unwrap_or_default();
            if outcome.success {
                self.store
                    .record_training(&task.id, outcome.trained, now_ms(), !task.repeat_forever)?;
                self.activity.success(
                    "training_queued",
                    &format!("{} x {} queued", outcome.trained, task.troop().map(|t| t.to_string()).unwrap_or_default()),
                    details,
                );
                result = Cycle::Progress;
                continue;
            }
            if outcome.reason == Some(TrainReason::BrowserClosed) {
                return Ok(Cycle::Stop);
            }
            let reason = outcome.reason.map(TrainReason::as_str).unwrap_or("error");
            self.activity
                .warn("training_failed", &format!("training {} not applied: {reason}", task.id), details);
        }
        Ok(result)
    }

    /// Runs the farm-list builder when its interval has passed.
    async fn run_farm_if_due(&mut self) -> Option<Cycle> {
        let farm = self.farm.as_ref()?;
        let now = Instant::now();
        if self
            .last_farm
            .is_some_and(|last| now.saturating_duration_since(last) < farm.interval)
        {
            return None;
        }
        self.last_farm = Some(now);

        let mut builder = FarmBuilder::new(self.game);
        if let Some(feed) = farm.feed.as_deref() {
            builder = builder.with_feed(feed);
        }
        match builder.run(&farm.options).await {
            Ok(report) => {
                let added = report.added_count();
                let details = serde_json::to_value(&report).unwrap_or_default();
                self.activity
                    .success("farm_lists", &format!("{added} farm targets added"), details);
                Some(Cycle::Progress)
            }
            Err(e) if e.is_session_closed() => Some(Cycle::Stop),
            Err(e) => {
                self.activity.error("farm_lists", &e.to_string(), json!({}));
                None
            }
        }
    }
}
