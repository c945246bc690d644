//! One engine instance: hub, orchestrator, alert rules and event bridges
//! behind a single lifecycle.
//!
//! Engines share nothing with each other, so tests and hosts can run as
//! many side by side as they like.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use pulse_core::{system_clock, ConfigError, EngineConfig, SharedClock};
use pulse_hub::{AlertGenerator, StreamHub};

use crate::bridge::{DomainEventSource, EventBridge};
use crate::orchestrator::PipelineOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Created,
    Initialized,
    Running,
    Stopped,
    Disposed,
}

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    hub: StreamHub,
    orchestrator: PipelineOrchestrator,
    alerts: AlertGenerator,
    state: Mutex<EngineState>,
    alert_tasks: Mutex<Vec<JoinHandle<()>>>,
    bridges: Mutex<Vec<EventBridge>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, system_clock())
    }

    /// Build an engine whose packet timestamps come from `clock`.
    pub fn with_clock(config: EngineConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        let hub = StreamHub::with_clock(config.hub.clone(), clock);
        let orchestrator = PipelineOrchestrator::new(hub.clone(), config.analytics.clone());
        let alerts = AlertGenerator::new(hub.clone());
        Ok(Self {
            config,
            hub,
            orchestrator,
            alerts,
            state: Mutex::new(EngineState::Created),
            alert_tasks: Mutex::new(Vec::new()),
            bridges: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    pub fn alerts(&self) -> &AlertGenerator {
        &self.alerts
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Open the hub channels and create the configured pipelines. Custom
    /// predicates, mappers and operators must be registered on the
    /// orchestrator before this.
    #[instrument(skip_all)]
    pub async fn initialize(&self) -> Result<(), ConfigError> {
        if !matches!(self.state(), EngineState::Created | EngineState::Disposed) {
            return Ok(());
        }
        self.hub.initialize();
        for pipeline in &self.config.pipelines {
            self.orchestrator.create_pipeline(pipeline.clone()).await?;
        }
        self.set_state(EngineState::Initialized);
        info!(pipelines = self.config.pipelines.len(), "engine initialized");
        Ok(())
    }

    /// Start the hub, every pipeline and the configured alert rules.
    /// Initializes first if needed.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<(), ConfigError> {
        match self.state() {
            EngineState::Running => return Ok(()),
            EngineState::Created | EngineState::Disposed => self.initialize().await?,
            EngineState::Initialized | EngineState::Stopped => {}
        }
        // Alert forwarding is set up first so a bad rule leaves nothing running.
        let mut tasks = Vec::with_capacity(self.config.alerts.len());
        for rule in &self.config.alerts {
            match self.alerts.forward(rule) {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    for task in tasks {
                        task.abort();
                    }
                    return Err(err);
                }
            }
        }

        self.hub.start();
        self.orchestrator.start();
        self.alert_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        self.set_state(EngineState::Running);
        info!(alert_rules = self.config.alerts.len(), "engine running");
        Ok(())
    }

    /// Stop pipelines, alert forwarding and hub emission. Series and
    /// pipeline registrations are kept.
    pub fn stop(&self) {
        if self.state() != EngineState::Running {
            return;
        }
        self.orchestrator.stop();
        for task in self.alert_tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        self.hub.stop();
        self.set_state(EngineState::Stopped);
        info!("engine stopped");
    }

    /// Stop, detach event sources, remove every pipeline and drop the hub's
    /// channels and series.
    pub async fn dispose(&self) {
        if self.state() == EngineState::Disposed {
            return;
        }
        self.stop();
        let bridges =
            std::mem::take(&mut *self.bridges.lock().unwrap_or_else(PoisonError::into_inner));
        for bridge in &bridges {
            bridge.detach();
        }
        for id in self.orchestrator.pipeline_ids() {
            self.orchestrator.remove_pipeline(&id).await;
        }
        self.hub.dispose();
        self.set_state(EngineState::Disposed);
        info!(bridges = bridges.len(), "engine disposed");
    }

    /// Feed events from `source` into this engine's hub until dispose.
    pub fn attach_source(&self, source: Arc<dyn DomainEventSource>) {
        let bridge = EventBridge::attach(source, self.hub.clone());
        self.bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bridge);
    }
}
