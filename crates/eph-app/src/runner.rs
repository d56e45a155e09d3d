//! Headless simulation loop used by `eph run`.

use crate::broadcast::{BroadcastPublisher, create_snapshot_bus, drain_snapshots};
use crate::scenario::Scenario;
use anyhow::{Context, Result};
use clap::ValueEnum;
use eph_core::model::{PersistenceModel, PredictiveModel};
use eph_core::{EphConfig, TickEvents};
use eph_telemetry::TelemetryPipeline;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::info;

/// Predictive model attached to every agent's surprise term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ModelChoice {
    #[default]
    None,
    Persistence,
}

impl ModelChoice {
    fn build(self) -> Option<Arc<dyn PredictiveModel>> {
        match self {
            Self::None => None,
            Self::Persistence => Some(Arc::new(PersistenceModel)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub scenario: Scenario,
    pub config: EphConfig,
    pub ticks: u64,
    pub model: ModelChoice,
    pub telemetry_path: Option<PathBuf>,
    pub broadcast_capacity: usize,
    /// Ticks between progress log lines; 0 disables them.
    pub log_every: u64,
}

/// Totals accumulated over a run.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunReport {
    pub scenario: String,
    pub ticks: u64,
    pub agent_count: usize,
    pub collisions: usize,
    pub near_collisions: usize,
    pub obstacle_collisions: usize,
    pub numeric_anomalies: usize,
    pub model_fallbacks: usize,
    pub telemetry_batches: u64,
    pub snapshots_received: usize,
    pub snapshots_dropped: u64,
    pub final_mean_speed: f64,
    pub elapsed_secs: f64,
}

impl RunReport {
    fn record(&mut self, events: &TickEvents) {
        self.ticks = events.tick.0;
        self.collisions += events.collisions;
        self.near_collisions += events.near_collisions;
        self.obstacle_collisions += events.obstacle_collisions;
        self.numeric_anomalies += events.numeric_anomalies;
        self.model_fallbacks += events.model_fallbacks;
        if events.telemetry_emitted {
            self.telemetry_batches += 1;
        }
    }
}

/// Build the scenario world, step it `ticks` times and return the accumulated report.
pub fn run(options: RunOptions) -> Result<RunReport> {
    let RunOptions {
        scenario,
        config,
        ticks,
        model,
        telemetry_path,
        broadcast_capacity,
        log_every,
    } = options;

    let mut world = scenario
        .build_world(config)
        .with_context(|| format!("failed to build scenario '{}'", scenario.name))?;
    world.set_model(model.build());

    if let Some(path) = &telemetry_path {
        let pipeline = TelemetryPipeline::create(path)
            .with_context(|| format!("failed to open telemetry file {}", path.display()))?;
        world.set_telemetry(Box::new(pipeline));
    }

    let (sender, receiver) = create_snapshot_bus(broadcast_capacity);
    let publisher = BroadcastPublisher::new(sender);
    let dropped = publisher.dropped_counter();
    world.set_publisher(Box::new(publisher));

    info!(
        scenario = %scenario.name,
        agents = world.agent_count(),
        obstacles = world.obstacles().len(),
        ticks,
        model = world.model_name().unwrap_or("none"),
        "starting run"
    );

    let started = Instant::now();
    let mut report = RunReport {
        scenario: scenario.name.clone(),
        agent_count: world.agent_count(),
        ..RunReport::default()
    };
    for _ in 0..ticks {
        let events = world.step();
        report.record(&events);
        report.snapshots_received += drain_snapshots(&receiver, |_| {});

        if log_every > 0
            && events.tick.0 % log_every == 0
            && let Some(summary) = world.history().last()
        {
            info!(
                tick = summary.tick.0,
                collisions = summary.collisions,
                near_collisions = summary.near_collisions,
                obstacle_collisions = summary.obstacle_collisions,
                mean_speed = summary.mean_speed,
                mean_precision = summary.mean_precision,
                "progress"
            );
        }
    }

    report.final_mean_speed = world.history().last().map_or(0.0, |s| s.mean_speed);
    report.snapshots_dropped = dropped.load(Ordering::Relaxed);
    // dropping the world joins the telemetry worker and flushes the file
    drop(world);
    report.elapsed_secs = started.elapsed().as_secs_f64();

    info!(
        ticks = report.ticks,
        collisions = report.collisions,
        near_collisions = report.near_collisions,
        obstacle_collisions = report.obstacle_collisions,
        numeric_anomalies = report.numeric_anomalies,
        model_fallbacks = report.model_fallbacks,
        snapshots_dropped = report.snapshots_dropped,
        elapsed_secs = report.elapsed_secs,
        "run complete"
    );
    Ok(report)
}
