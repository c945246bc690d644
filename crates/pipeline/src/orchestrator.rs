//! Pipeline orchestration: builds operator chains from config, runs each
//! pipeline on its own task and routes the output.
//!
//! A pipeline's output goes three ways, in this order: analytics, the
//! observers registered for its id, and back into the hub on the
//! pipeline's output stream type tagged with `source = <pipeline id>`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures::stream::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use pulse_core::{
    meta, AnalyticsConfig, ChartPoint, ConfigError, Packet, PipelineConfig, PipelineError,
    SeriesKey, StreamType,
};
use pulse_hub::StreamHub;

use crate::analytics::{spawn_refresh_task, AnalyticsCollector, PipelineAnalytics};
use crate::observer::{ChannelObserver, ObserverRegistry, PacketObserver, SubscriberId};
use crate::operators::{apply_stages, build_stages, Operator, OperatorSpec, StageStream};
use crate::registry::StageRegistry;

/// Room key used for persisted output without a `room_id`.
const ANY_ROOM: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created, never started.
    Idle,
    Running,
    /// The source or a `take` stage ended.
    Completed,
    /// Stopped after exceeding its error budget.
    Failed,
    Stopped,
}

struct Pipeline {
    config: Arc<PipelineConfig>,
    source: StreamType,
    output: StreamType,
    stages: Vec<Arc<dyn Operator>>,
    /// Present exactly while the pipeline is active.
    handle: Option<JoinHandle<()>>,
    /// Set to `true` on stop. The runner checks it before every side effect.
    cancel: Option<watch::Sender<bool>>,
    status: PipelineStatus,
    /// Bumped on every start and stop so a finished task from an earlier
    /// run cannot overwrite the current status.
    generation: u64,
}

impl Pipeline {
    fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    fn halt(&mut self, id: &str) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        handle.abort();
        self.generation += 1;
        self.status = PipelineStatus::Stopped;
        info!(pipeline = %id, "pipeline stopped");
        true
    }
}

struct Inner {
    hub: StreamHub,
    registry: RwLock<StageRegistry>,
    pipelines: Mutex<HashMap<String, Pipeline>>,
    observers: Arc<ObserverRegistry>,
    analytics: AnalyticsCollector,
    running: AtomicBool,
    refresh: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let pipelines = self.pipelines.get_mut().unwrap_or_else(PoisonError::into_inner);
        for pipeline in pipelines.values_mut() {
            if let Some(cancel) = pipeline.cancel.take() {
                let _ = cancel.send(true);
            }
            if let Some(handle) = pipeline.handle.take() {
                handle.abort();
            }
        }
        if let Some((_, handle)) = self
            .refresh
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Owns the pipelines of one hub.
///
/// Cloning is cheap; clones control the same pipelines. Dropping the last
/// clone aborts every pipeline task.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("running", &self.is_running())
            .field("pipelines", &self.pipeline_ids())
            .finish()
    }
}

impl PipelineOrchestrator {
    pub fn new(hub: StreamHub, analytics: AnalyticsConfig) -> Self {
        Self::with_registry(hub, analytics, StageRegistry::default())
    }

    pub fn with_registry(
        hub: StreamHub,
        analytics: AnalyticsConfig,
        registry: StageRegistry,
    ) -> Self {
        let collector = AnalyticsCollector::new(analytics, hub.clock());
        Self {
            inner: Arc::new(Inner {
                hub,
                registry: RwLock::new(registry),
                pipelines: Mutex::new(HashMap::new()),
                observers: Arc::new(ObserverRegistry::new()),
                analytics: collector,
                running: AtomicBool::new(false),
                refresh: Mutex::new(None),
            }),
        }
    }

    pub fn hub(&self) -> &StreamHub {
        &self.inner.hub
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn pipelines(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pipeline>> {
        self.inner.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Make a predicate available to `filter` stages as `{"predicate": name}`.
    /// Only pipelines created afterwards see it.
    pub fn register_predicate<F>(&self, name: &str, predicate: F)
    where
        F: Fn(&Packet) -> bool + Send + Sync + 'static,
    {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_predicate(name, predicate);
    }

    /// Make a mapper available to `map` stages as `{"mapper": name}`.
    pub fn register_mapper<F>(&self, name: &str, mapper: F)
    where
        F: Fn(Packet) -> anyhow::Result<Packet> + Send + Sync + 'static,
    {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_mapper(name, mapper);
    }

    pub fn register_operator<F>(&self, name: &str, factory: F)
    where
        F: Fn(&OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> + Send + Sync + 'static,
    {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_operator(name, factory);
    }

    // ── Creation and teardown ───────────────────────────────────────

    /// Validate `config`, build its stages and register it. Starts it right
    /// away if the orchestrator is running.
    pub async fn create_pipeline(&self, config: PipelineConfig) -> Result<String, ConfigError> {
        self.create_pipeline_with_stages(config, Vec::new()).await
    }

    /// [`create_pipeline`](Self::create_pipeline) with extra stages appended
    /// after the configured chain.
    #[instrument(skip_all, fields(pipeline = %config.id))]
    pub async fn create_pipeline_with_stages(
        &self,
        config: PipelineConfig,
        extra: Vec<Arc<dyn Operator>>,
    ) -> Result<String, ConfigError> {
        if config.id.trim().is_empty() {
            return Err(ConfigError::EmptyPipelineId);
        }
        let source = config.resolve_source()?;
        let output = config.resolve_output()?;
        if source == output {
            return Err(ConfigError::FeedbackLoop(config.id.clone()));
        }
        let mut stages = {
            let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
            build_stages(&config, &registry)?
        };
        stages.extend(extra);
        let stage_count = stages.len();

        let id = config.id.clone();
        match self.pipelines().entry(id.clone()) {
            Entry::Occupied(_) => return Err(ConfigError::DuplicatePipeline(id)),
            Entry::Vacant(slot) => {
                slot.insert(Pipeline {
                    config: Arc::new(config),
                    source,
                    output,
                    stages,
                    handle: None,
                    cancel: None,
                    status: PipelineStatus::Idle,
                    generation: 0,
                });
            }
        }
        self.inner.analytics.register(&id).await;
        info!(source = %source, output = %output, stages = stage_count, "pipeline created");

        if self.is_running() {
            if let Some(pipeline) = self.pipelines().get_mut(&id) {
                self.launch(&id, pipeline);
            }
        }
        Ok(id)
    }

    /// Stop and forget a pipeline, its analytics and its observers.
    pub async fn remove_pipeline(&self, id: &str) -> bool {
        let removed = {
            let mut pipelines = self.pipelines();
            match pipelines.remove(id) {
                Some(mut pipeline) => {
                    pipeline.halt(id);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.inner.analytics.remove(id).await;
            let observers = self.inner.observers.remove_pipeline(id);
            info!(pipeline = %id, observers, "pipeline removed");
        }
        removed
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start every pipeline that is idle or was stopped, and the periodic
    /// analytics refresh. Completed and failed pipelines stay down until
    /// [`start_pipeline`](Self::start_pipeline) is called for them.
    pub fn start(&self) {
        let was_running = self.inner.running.swap(true, Ordering::SeqCst);
        let mut started = 0usize;
        {
            let mut pipelines = self.pipelines();
            for (id, pipeline) in pipelines.iter_mut() {
                if !pipeline.is_active()
                    && matches!(pipeline.status, PipelineStatus::Idle | PipelineStatus::Stopped)
                {
                    self.launch(id, pipeline);
                    started += 1;
                }
            }
        }
        self.start_refresh();
        if !was_running {
            info!(started, "orchestrator started");
        }
    }

    /// Cancel every active pipeline and the analytics refresh. Pending
    /// window contents are discarded.
    pub fn stop(&self) {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        let mut stopped = 0usize;
        {
            let mut pipelines = self.pipelines();
            for (id, pipeline) in pipelines.iter_mut() {
                if pipeline.halt(id) {
                    stopped += 1;
                }
            }
        }
        self.stop_refresh();
        if was_running || stopped > 0 {
            info!(stopped, "orchestrator stopped");
        }
    }

    pub fn start_pipeline(&self, id: &str) -> Result<(), PipelineError> {
        let mut pipelines = self.pipelines();
        let pipeline = pipelines
            .get_mut(id)
            .ok_or_else(|| PipelineError::UnknownPipeline(id.to_string()))?;
        self.launch(id, pipeline);
        Ok(())
    }

    pub fn stop_pipeline(&self, id: &str) -> Result<(), PipelineError> {
        let mut pipelines = self.pipelines();
        let pipeline = pipelines
            .get_mut(id)
            .ok_or_else(|| PipelineError::UnknownPipeline(id.to_string()))?;
        pipeline.halt(id);
        Ok(())
    }

    /// Subscribe to the source stream now, compose the stages and spawn the
    /// task driving them. No-op for an active pipeline.
    fn launch(&self, id: &str, pipeline: &mut Pipeline) {
        if pipeline.is_active() {
            return;
        }
        pipeline.generation += 1;

        let source: StageStream = self.inner.hub.get_stream(pipeline.source).map(Ok).boxed();
        let stream = apply_stages(source, &pipeline.stages);
        let (cancel_tx, cancel) = watch::channel(false);
        let runner = Runner {
            id: id.to_string(),
            generation: pipeline.generation,
            cancel,
            config: pipeline.config.clone(),
            output: pipeline.output,
            hub: self.inner.hub.clone(),
            analytics: self.inner.analytics.clone(),
            observers: self.inner.observers.clone(),
            owner: Arc::downgrade(&self.inner),
        };

        pipeline.handle = Some(tokio::spawn(runner.run(stream)));
        pipeline.cancel = Some(cancel_tx);
        pipeline.status = PipelineStatus::Running;
        info!(
            pipeline = %id,
            source = %pipeline.source,
            generation = pipeline.generation,
            "pipeline started"
        );
    }

    fn start_refresh(&self) {
        let mut refresh = self.inner.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        if refresh.is_none() {
            let (tx, rx) = watch::channel(false);
            let handle = spawn_refresh_task(self.inner.analytics.clone(), rx);
            *refresh = Some((tx, handle));
        }
    }

    fn stop_refresh(&self) {
        let taken = self.inner.refresh.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((tx, handle)) = taken {
            let _ = tx.send(true);
            handle.abort();
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn pipeline_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipelines().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pipeline_status(&self, id: &str) -> Option<PipelineStatus> {
        self.pipelines().get(id).map(|p| p.status)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.pipelines().get(id).is_some_and(Pipeline::is_active)
    }

    pub fn pipeline_config(&self, id: &str) -> Option<PipelineConfig> {
        self.pipelines().get(id).map(|p| p.config.as_ref().clone())
    }

    /// Analytics snapshot of every pipeline.
    pub async fn get_pipeline_metrics(&self) -> HashMap<String, PipelineAnalytics> {
        self.inner.analytics.snapshot().await
    }

    pub async fn pipeline_metrics(&self, id: &str) -> Option<PipelineAnalytics> {
        self.inner.analytics.get(id).await
    }

    /// Run one analytics refresh now instead of waiting for the timer.
    pub async fn refresh_analytics(&self) {
        self.inner.analytics.tick().await;
    }

    // ── Observers ───────────────────────────────────────────────────

    pub fn subscribe_to_stream<O>(&self, pipeline_id: &str, observer: O) -> SubscriberId
    where
        O: PacketObserver + 'static,
    {
        self.inner.observers.subscribe(pipeline_id, Arc::new(observer))
    }

    /// Subscribe through a bounded queue. When the queue is full, packets for
    /// this subscriber are dropped and counted.
    pub fn subscribe_channel(
        &self,
        pipeline_id: &str,
        capacity: usize,
    ) -> (SubscriberId, mpsc::Receiver<Packet>) {
        let (observer, rx) = ChannelObserver::new(capacity);
        (self.subscribe_to_stream(pipeline_id, observer), rx)
    }

    pub fn unsubscribe_from_stream(&self, pipeline_id: &str, subscriber: SubscriberId) -> bool {
        self.inner.observers.unsubscribe(pipeline_id, subscriber)
    }
}

/// Everything one pipeline task needs, detached from the orchestrator.
struct Runner {
    id: String,
    generation: u64,
    cancel: watch::Receiver<bool>,
    config: Arc<PipelineConfig>,
    output: StreamType,
    hub: StreamHub,
    analytics: AnalyticsCollector,
    observers: Arc<ObserverRegistry>,
    owner: Weak<Inner>,
}

impl Runner {
    async fn run(self, mut stream: StageStream) {
        let mut cancel = self.cancel.clone();
        let mut status = PipelineStatus::Completed;
        loop {
            let next = tokio::select! {
                biased;
                // Only `true` is ever sent; a dropped sender also means stop.
                _ = cancel.changed() => None,
                item = stream.next() => Some(item),
            };
            let Some(next) = next else {
                debug!(pipeline = %self.id, "pipeline run cancelled");
                return;
            };
            let Some(item) = next else {
                break;
            };
            let over_budget = match item {
                Ok(packet) => self.handle_output(packet).await,
                Err(err) => self.handle_error(&err).await,
            };
            if over_budget {
                status = PipelineStatus::Failed;
                break;
            }
        }
        drop(stream);
        self.finish(status);
    }

    /// Returns `true` once the error budget is exceeded.
    async fn handle_output(&self, packet: Packet) -> bool {
        // A stage may still have been working on this packet when the
        // pipeline was stopped.
        if self.cancelled() {
            return false;
        }
        let tagged = packet
            .rerouted(self.output, &self.id)
            .with_meta(meta::PIPELINE_ID, self.id.as_str());

        self.analytics.record_output(&self.id, &tagged).await;
        if self.config.persist {
            self.persist(&tagged);
        }

        let delivery = self.observers.notify(&self.id, &tagged);
        self.analytics.record_dropped(&self.id, delivery.dropped as u64).await;
        let mut over_budget = false;
        for _ in 0..delivery.failed {
            over_budget |= self.count_error().await;
        }

        debug!(
            pipeline = %self.id,
            packet = %tagged.id,
            delivered = delivery.delivered,
            "pipeline output"
        );
        self.hub.emit_packet(tagged);
        over_budget
    }

    async fn handle_error(&self, err: &PipelineError) -> bool {
        if self.cancelled() {
            return false;
        }
        error!(pipeline = %self.id, error = %err, "pipeline error");
        self.count_error().await
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn count_error(&self) -> bool {
        let errors = self.analytics.record_error(&self.id).await;
        self.config.error_budget.is_some_and(|budget| errors > budget)
    }

    fn persist(&self, packet: &Packet) {
        let Some(value) = packet.value() else {
            return;
        };
        let room = packet.room_id().unwrap_or(ANY_ROOM);
        self.hub
            .record_point(SeriesKey::new(&self.id, room), ChartPoint::new(packet.timestamp, value));
    }

    fn finish(&self, status: PipelineStatus) {
        match status {
            PipelineStatus::Failed => {
                error!(
                    pipeline = %self.id,
                    budget = ?self.config.error_budget,
                    "error budget exceeded, pipeline failed"
                )
            }
            _ => info!(pipeline = %self.id, "pipeline completed"),
        }
        let Some(inner) = self.owner.upgrade() else {
            return;
        };
        let mut pipelines = inner.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pipeline) = pipelines.get_mut(&self.id) {
            if pipeline.generation == self.generation {
                pipeline.handle = None;
                pipeline.cancel = None;
                pipeline.status = status;
            }
        }
    }
}
