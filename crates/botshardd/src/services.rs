//! Service wiring — builds every subsystem from one configuration and
//! runs the control loops.
//!
//! Startup order:
//! 1. Build the engine client and the pool probe
//! 2. Construct provisioner, assigner, scaler, health monitor, injection
//!    pipeline, tracker and metrics collector around one state store
//! 3. Seed each configured region's default MAIN channel
//! 4. Spawn the timed loops, all stopped by one `watch` signal

use std::sync::Arc;
use std::time::Duration;

use botshard_api::ApiState;
use botshard_autoscale::{ChannelScaler, ScalerSettings};
use botshard_core::config::EngineConfig;
use botshard_core::{duration_or, BotshardConfig, SharedClock};
use botshard_engine::{HttpEngine, MemoryEngine, SimulationEngine};
use botshard_health::{FleetEvent, HttpProbe, PoolHealthMonitor, PoolProbe};
use botshard_inject::{InjectionPipeline, InjectionSettings};
use botshard_metrics::{LogSink, MetricsCollector};
use botshard_placement::{AssignerSettings, ChannelAssigner, PoolProvisioner};
use botshard_state::StateStore;
use botshard_tracker::{RegistrationTracker, TrackerSettings};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Build the engine client selected by `engine.mode`.
pub fn build_engine(
    config: &EngineConfig,
    clock: SharedClock,
) -> anyhow::Result<Arc<dyn SimulationEngine>> {
    match config.mode.as_str() {
        "memory" => {
            info!("using in-process simulation engine");
            Ok(Arc::new(MemoryEngine::new().with_clock(clock)))
        }
        "http" => {
            let timeout = duration_or(&config.timeout, Duration::from_secs(5));
            info!(endpoint = %config.endpoint, ?timeout, "using HTTP simulation engine");
            Ok(Arc::new(HttpEngine::new(config.endpoint.clone(), timeout)))
        }
        other => anyhow::bail!("unknown engine mode {other:?} (expected memory or http)"),
    }
}

/// Probe used against pool endpoints.
pub fn build_probe(config: &BotshardConfig) -> Arc<dyn PoolProbe> {
    Arc::new(HttpProbe {
        path: config.health.path.clone(),
        timeout: duration_or(&config.health.timeout, Duration::from_secs(2)),
    })
}

/// Every subsystem of one control plane.
pub struct Services {
    pub config: BotshardConfig,
    pub state: StateStore,
    pub clock: SharedClock,
    pub engine: Arc<dyn SimulationEngine>,
    pub provisioner: Arc<PoolProvisioner>,
    pub assigner: Arc<ChannelAssigner>,
    pub scaler: Arc<ChannelScaler>,
    pub health: Arc<PoolHealthMonitor>,
    pub pipeline: Arc<InjectionPipeline>,
    pub tracker: Arc<RegistrationTracker>,
    pub metrics: Arc<MetricsCollector>,
}

impl Services {
    pub fn build(
        config: BotshardConfig,
        state: StateStore,
        engine: Arc<dyn SimulationEngine>,
        probe: Arc<dyn PoolProbe>,
        clock: SharedClock,
    ) -> Self {
        let provisioner = Arc::new(PoolProvisioner::new(
            state.clone(),
            clock.clone(),
            config.pools.clone(),
        ));

        let assigner = Arc::new(ChannelAssigner::new(
            state.clone(),
            provisioner.clone(),
            clock.clone(),
            AssignerSettings {
                default_region: config.fleet.default_region.clone(),
                channel_max_agents: config.fleet.channel_max_agents,
                headroom_ratio: config.assignment.headroom_ratio,
                cache_ttl: duration_or(&config.assignment.cache_ttl, Duration::from_secs(30)),
            },
        ));

        let scaler = Arc::new(ChannelScaler::new(
            state.clone(),
            assigner.clone(),
            clock.clone(),
            ScalerSettings {
                regions: config.fleet.regions.clone(),
                scale_up_threshold: config.autoscale.scale_up_threshold,
                scale_down_threshold: config.autoscale.scale_down_threshold,
                scale_up_batch: config.autoscale.scale_up_batch,
                cooldown: duration_or(&config.autoscale.cooldown, Duration::from_secs(300)),
            },
        ));

        let health = Arc::new(PoolHealthMonitor::new(
            state.clone(),
            probe,
            clock.clone(),
            config.health.unhealthy_threshold,
        ));

        let pipeline = Arc::new(InjectionPipeline::new(
            state.clone(),
            engine.clone(),
            clock.clone(),
            InjectionSettings {
                max_batch_size: config.injection.max_batch_size as usize,
                stall_threshold: duration_or(
                    &config.injection.stall_threshold,
                    Duration::from_secs(5),
                ),
                kick_duration: duration_or(
                    &config.injection.kick_duration,
                    Duration::from_millis(2000),
                ),
            },
        ));

        let tracker = Arc::new(RegistrationTracker::new(
            state.clone(),
            engine.clone(),
            clock.clone(),
            TrackerSettings {
                stuck_timeout: duration_or(&config.tracker.stuck_timeout, Duration::from_secs(600)),
                max_retries: config.tracker.max_retries,
                cleanup_after_hours: config.tracker.cleanup_after_hours,
            },
        ));

        let metrics = Arc::new(
            MetricsCollector::new(
                state.clone(),
                clock.clone(),
                duration_or(&config.metrics.interval, Duration::from_secs(60)),
            )
            .with_sink(Arc::new(LogSink)),
        );

        Self {
            config,
            state,
            clock,
            engine,
            provisioner,
            assigner,
            scaler,
            health,
            pipeline,
            tracker,
            metrics,
        }
    }

    /// Seed the default MAIN channel of every configured region.
    pub async fn bootstrap(&self) -> anyhow::Result<Vec<String>> {
        let created = self
            .assigner
            .ensure_default_channels(&self.config.fleet.regions)
            .await?;
        info!(
            regions = self.config.fleet.regions.len(),
            created = created.len(),
            "default channels ensured"
        );
        Ok(created)
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: self.state.clone(),
            assigner: self.assigner.clone(),
            provisioner: self.provisioner.clone(),
            pipeline: self.pipeline.clone(),
            tracker: self.tracker.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn router(&self) -> axum::Router {
        botshard_api::build_router(self.api_state())
    }

    /// Spawn every control loop. Each exits when `shutdown` changes.
    pub fn spawn_loops(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let c = &self.config;
        let mut handles = Vec::new();

        let scaler = self.scaler.clone();
        let interval = duration_or(&c.autoscale.interval, Duration::from_secs(30));
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { scaler.run(interval, rx).await }));

        let health = self.health.clone();
        let interval = duration_or(&c.health.interval, Duration::from_secs(30));
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { health.run(interval, rx).await }));

        let pipeline = self.pipeline.clone();
        let interval = duration_or(&c.injection.interval, Duration::from_secs(2));
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { pipeline.run(interval, rx).await }));

        let tracker = self.tracker.clone();
        let interval = duration_or(&c.tracker.interval, Duration::from_secs(5));
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { tracker.run(interval, rx).await }));

        let metrics = self.metrics.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { metrics.run(rx).await }));

        let assigner = self.assigner.clone();
        let events = self.health.subscribe();
        handles.push(tokio::spawn(watch_fleet_events(assigner, events, shutdown)));

        info!(loops = handles.len(), "control loops started");
        handles
    }
}

/// React to fleet events until shutdown.
///
/// A drained pool invalidates its region's cached assignments so new agents
/// stop landing on channels the pool can no longer grow.
pub async fn watch_fleet_events(
    assigner: Arc<ChannelAssigner>,
    mut events: broadcast::Receiver<FleetEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(FleetEvent::PoolUnhealthy { pool_id, region, consecutive_failures, .. }) => {
                    warn!(
                        pool = %pool_id,
                        %region,
                        consecutive_failures,
                        "pool drained, invalidating assignment cache"
                    );
                    assigner.invalidate_region(&region).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "fleet event watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    info!("fleet event watcher stopped");
}
