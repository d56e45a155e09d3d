//! Core types shared across the EPH workspace.
//!
//! Agents live in a generational arena backed by dense columns. Each [`WorldState::step`]
//! runs perception and action selection in parallel against the previous tick's state,
//! then commits every agent's integrated motion sequentially.

pub mod controller;
pub mod dynamics;
pub mod geometry;
pub mod haze;
pub mod model;
pub mod scalar;
pub mod spm;

use controller::{AgentView, ControlContext, ControllerConfig, Decision, Neighbor, Surroundings};
use dynamics::{DynamicsConfig, State, predict};
use eph_index::{IndexError, NeighborhoodIndex, UniformGridIndex};
use geometry::{Obstacle, Topology, Vec2, WorldBounds, to_egocentric};
use haze::{HazeConfig, HazeField, PrecisionMap, SelfHaze};
use model::PredictiveModel;
use ordered_float::OrderedFloat;
use rand::{SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use smallvec::SmallVec;
use spm::{Percept, Sharpness, Spm, SpmConfig, SpmGridSpec, encode};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Convenience alias for associating side data with agents.
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// Simulation clock (ticks processed since start).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    const fn is_multiple_of_interval(self, interval: u32) -> bool {
        interval > 0 && self.0 % interval as u64 == 0
    }
}

/// Group/class label assigned at spawn.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct GroupTag(pub u16);

/// Scalar fields for a single agent used when inserting or snapshotting from the SoA store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Vec2,
    pub velocity: Vec2,
    pub heading: f64,
    /// Preferred direction, fixed at spawn.
    pub goal: Vec2,
    pub group: GroupTag,
}

impl AgentData {
    #[must_use]
    pub const fn new(
        position: Vec2,
        velocity: Vec2,
        heading: f64,
        goal: Vec2,
        group: GroupTag,
    ) -> Self {
        Self {
            position,
            velocity,
            heading,
            goal,
            group,
        }
    }
}

impl Default for AgentData {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            heading: 0.0,
            goal: Vec2::new(1.0, 0.0),
            group: GroupTag::default(),
        }
    }
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentColumns {
    positions: Vec<Vec2>,
    velocities: Vec<Vec2>,
    headings: Vec<f64>,
    goals: Vec<Vec2>,
    groups: Vec<GroupTag>,
}

impl AgentColumns {
    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, agent: AgentData) {
        self.positions.push(agent.position);
        self.velocities.push(agent.velocity);
        self.headings.push(agent.heading);
        self.goals.push(agent.goal);
        self.groups.push(agent.group);
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> AgentData {
        let removed = AgentData {
            position: self.positions.swap_remove(index),
            velocity: self.velocities.swap_remove(index),
            heading: self.headings.swap_remove(index),
            goal: self.goals.swap_remove(index),
            group: self.groups.swap_remove(index),
        };
        self.debug_assert_coherent();
        removed
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            position: self.positions[index],
            velocity: self.velocities[index],
            heading: self.headings[index],
            goal: self.goals[index],
            group: self.groups[index],
        }
    }

    #[must_use]
    pub fn positions(&self) -> &[Vec2] {
        &self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &[Vec2] {
        &self.velocities
    }

    #[must_use]
    pub fn headings(&self) -> &[f64] {
        &self.headings
    }

    /// Preferred directions; never rewritten after spawn.
    #[must_use]
    pub fn goals(&self) -> &[Vec2] {
        &self.goals
    }

    #[must_use]
    pub fn groups(&self) -> &[GroupTag] {
        &self.groups
    }

    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.headings.len());
        debug_assert_eq!(self.positions.len(), self.goals.len());
        debug_assert_eq!(self.positions.len(), self.groups.len());
    }
}

/// Dense SoA storage with generational handles for agent access.
#[derive(Debug)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl Default for AgentArena {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: AgentColumns::default(),
        }
    }

    /// Number of active agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no agents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over active agent handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut AgentColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live agent.
    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new agent and return its handle.
    pub fn insert(&mut self, agent: AgentData) -> AgentId {
        let index = self.columns.len();
        self.columns.push(agent);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id` returning its scalar data if it was present.
    pub fn remove(&mut self, id: AgentId) -> Option<AgentData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }
}

/// Contact flags recorded for an agent after the last commit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactFlags {
    pub collision: bool,
    pub near_collision: bool,
    pub obstacle_collision: bool,
}

/// Per-agent state that is not part of the hot columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntime {
    /// Force applied during the last commit.
    pub last_action: Vec2,
    /// Scalar precision estimate cached for the tick.
    pub precision: f64,
    pub sharpness: Option<Sharpness>,
    /// Objective value of the last decision.
    pub objective: f64,
    pub self_haze: SelfHaze,
    pub contacts: ContactFlags,
    /// SPM observed during the last perception stage.
    pub spm: Option<Spm>,
}

impl Default for AgentRuntime {
    fn default() -> Self {
        Self {
            last_action: Vec2::ZERO,
            precision: 0.0,
            sharpness: None,
            objective: 0.0,
            self_haze: SelfHaze::default(),
            contacts: ContactFlags::default(),
            spm: None,
        }
    }
}

/// Full agent snapshot (columns plus runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub data: AgentData,
    pub runtime: AgentRuntime,
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    /// Agent pairs closer than two agent radii.
    pub collisions: usize,
    pub near_collisions: usize,
    /// Agents overlapping an obstacle.
    pub obstacle_collisions: usize,
    pub numeric_anomalies: usize,
    pub model_fallbacks: usize,
    pub telemetry_emitted: bool,
    pub snapshot_published: bool,
}

/// Summary retained in history and forwarded to telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub agent_count: usize,
    pub collisions: usize,
    pub near_collisions: usize,
    pub obstacle_collisions: usize,
    pub mean_speed: f64,
    pub mean_precision: f64,
    pub numeric_anomalies: usize,
    pub model_fallbacks: usize,
}

/// Per-agent telemetry row keyed by `(tick, id)`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub group: GroupTag,
    pub position: Vec2,
    pub velocity: Vec2,
    pub heading: f64,
    pub action: Vec2,
    pub precision: f64,
    pub self_haze: f64,
    pub contacts: ContactFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spm: Option<Spm>,
}

/// Aggregate payload forwarded to telemetry sinks.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryBatch {
    pub summary: TickSummary,
    pub agents: Vec<AgentRecord>,
}

/// Telemetry sink invoked on telemetry ticks; implementations must not block.
pub trait TelemetrySink: Send {
    fn on_tick(&mut self, batch: &TelemetryBatch);
}

/// No-op telemetry sink.
#[derive(Debug, Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn on_tick(&mut self, _batch: &TelemetryBatch) {}
}

/// Minimal per-agent view for live broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub group: GroupTag,
    pub position: Vec2,
    pub velocity: Vec2,
    pub heading: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    pub tick: Tick,
    pub agents: Vec<AgentSnapshot>,
}

/// Fire-and-forget broadcast hook.
pub trait SnapshotPublisher: Send {
    fn publish(&mut self, snapshot: WorldSnapshot);
}

/// Publisher that discards snapshots.
#[derive(Debug, Default)]
pub struct NullPublisher;

impl SnapshotPublisher for NullPublisher {
    fn publish(&mut self, _snapshot: WorldSnapshot) {}
}

/// Errors that can occur when constructing world state.
#[derive(Debug, Error)]
pub enum WorldStateError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// World extent and body geometry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldConfig {
    pub width: f64,
    pub height: f64,
    pub topology: Topology,
    /// Radius of every agent body.
    pub agent_radius: f64,
    /// Extra clearance beyond contact counted as a near collision.
    pub near_collision_margin: f64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 40.0,
            height: 40.0,
            topology: Topology::Torus,
            agent_radius: 0.5,
            near_collision_margin: 0.5,
        }
    }
}

/// Static configuration for an EPH world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EphConfig {
    pub world: WorldConfig,
    pub spm: SpmConfig,
    pub haze: HazeConfig,
    pub dynamics: DynamicsConfig,
    pub controller: ControllerConfig,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
    /// Interval (ticks) between telemetry batches. 0 disables telemetry.
    pub telemetry_interval: u32,
    /// Attach each agent's SPM to telemetry records.
    pub telemetry_spm: bool,
    /// Interval (ticks) between published snapshots. 0 disables broadcast.
    pub broadcast_interval: u32,
}

/// Derived, immutable pieces produced by [`EphConfig::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub bounds: WorldBounds,
    pub spec: SpmGridSpec,
    pub haze: HazeField,
}

impl Default for EphConfig {
    fn default() -> Self {
        Self {
            world: WorldConfig::default(),
            spm: SpmConfig::default(),
            haze: HazeConfig::default(),
            dynamics: DynamicsConfig::default(),
            controller: ControllerConfig::default(),
            rng_seed: None,
            history_capacity: 256,
            telemetry_interval: 1,
            telemetry_spm: false,
            broadcast_interval: 1,
        }
    }
}

impl EphConfig {
    /// Validates every section, returning the derived grid, haze field and bounds.
    pub fn validate(&self) -> Result<ValidatedConfig, WorldStateError> {
        let bounds = WorldBounds::new(self.world.width, self.world.height, self.world.topology)?;
        if !(self.world.agent_radius > 0.0) || !self.world.agent_radius.is_finite() {
            return Err(WorldStateError::InvalidConfig(
                "agent_radius must be positive",
            ));
        }
        if !(self.world.near_collision_margin >= 0.0) {
            return Err(WorldStateError::InvalidConfig(
                "near_collision_margin must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldStateError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        let spec = SpmGridSpec::new(&self.spm)?;
        let haze = HazeField::new(&self.haze, &spec)?;
        self.dynamics.validate()?;
        self.controller.validate()?;
        Ok(ValidatedConfig { bounds, spec, haze })
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// What one agent sensed this tick.
#[derive(Debug)]
struct Perception {
    neighbors: Vec<Neighbor>,
    obstacles: Vec<Vec2>,
    spm: Spm,
    precision: PrecisionMap,
    scalar_precision: f64,
    sharpness: Sharpness,
}

#[derive(Debug, Default, Clone, Copy)]
struct ContactTally {
    collisions: usize,
    near_collisions: usize,
    obstacle_collisions: usize,
}

/// Aggregate world state driven by the simulation loop.
pub struct WorldState {
    config: EphConfig,
    bounds: WorldBounds,
    spec: SpmGridSpec,
    haze: HazeField,
    tick: Tick,
    rng: SmallRng,
    agents: AgentArena,
    runtime: AgentMap<AgentRuntime>,
    obstacles: Vec<Obstacle>,
    index: UniformGridIndex,
    model: Option<Arc<dyn PredictiveModel>>,
    telemetry: Box<dyn TelemetrySink>,
    publisher: Box<dyn SnapshotPublisher>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.agents.len())
            .field("obstacles", &self.obstacles.len())
            .field("model", &self.model.as_ref().map(|m| m.name()))
            .finish()
    }
}

impl WorldState {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: EphConfig) -> Result<Self, WorldStateError> {
        let ValidatedConfig { bounds, spec, haze } = config.validate()?;
        let rng = config.seeded_rng();
        let mut index = UniformGridIndex::new(
            spec.sensing_range(),
            bounds.width,
            bounds.height,
            bounds.is_torus(),
        );
        index.rebuild(&[])?;
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            bounds,
            spec,
            haze,
            tick: Tick::zero(),
            rng,
            agents: AgentArena::new(),
            runtime: AgentMap::new(),
            obstacles: Vec::new(),
            index,
            model: None,
            telemetry: Box::new(NullTelemetry),
            publisher: Box::new(NullPublisher),
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    fn stage_perceive(&mut self) -> Vec<Perception> {
        let agent_count = self.agents.len();
        if agent_count == 0 {
            return Vec::new();
        }

        let columns = self.agents.columns();
        let positions = columns.positions();
        let velocities = columns.velocities();
        let headings = columns.headings();
        let position_pairs: Vec<(f64, f64)> = positions.iter().map(|&p| p.into()).collect();

        let indexed = match self.index.rebuild(&position_pairs) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "neighborhood index rebuild failed; sensing obstacles only");
                false
            }
        };

        let self_haze: Vec<SelfHaze> = self
            .agents
            .iter_handles()
            .map(|id| self.runtime.get(id).map(|rt| rt.self_haze).unwrap_or_default())
            .collect();

        let index = &self.index;
        let bounds = &self.bounds;
        let spec = &self.spec;
        let haze = &self.haze;
        let obstacles = &self.obstacles;
        let range = spec.sensing_range();
        let range_sq = range * range;
        let agent_radius = self.config.world.agent_radius;
        let neighbor_contact = 2.0 * agent_radius;

        (0..agent_count)
            .into_par_iter()
            .map(|idx| {
                let origin = positions[idx];
                let velocity = velocities[idx];
                let heading = headings[idx];

                let mut neighbors = Vec::new();
                if indexed {
                    index.neighbors_within(
                        idx,
                        range_sq,
                        &mut |other, dist_sq: OrderedFloat<f64>| {
                            if dist_sq.into_inner() < range_sq {
                                neighbors.push(Neighbor {
                                    offset: bounds.displacement(origin, positions[other]),
                                    velocity: velocities[other],
                                });
                            }
                        },
                    );
                }
                let sensed_obstacles: Vec<Vec2> = obstacles
                    .iter()
                    .map(|obstacle| obstacle.nearest_boundary_offset(origin, bounds))
                    .filter(|offset| offset.norm_sq() < range_sq)
                    .collect();

                let nearest_rho = neighbors
                    .iter()
                    .map(|n| SpmGridSpec::rho(n.offset.norm(), neighbor_contact))
                    .chain(
                        sensed_obstacles
                            .iter()
                            .map(|o| SpmGridSpec::rho(o.norm(), agent_radius)),
                    )
                    .min_by(f64::total_cmp);
                let scalar_precision = haze.scalar_precision(spec, nearest_rho);
                let sharpness = haze.sharpness(spec, scalar_precision);

                let mut percepts = Vec::with_capacity(neighbors.len() + sensed_obstacles.len());
                for neighbor in &neighbors {
                    let relative = neighbor.velocity - velocity;
                    let (forward, right) =
                        to_egocentric(neighbor.offset.x, neighbor.offset.y, heading);
                    let (v_forward, v_right) = to_egocentric(relative.x, relative.y, heading);
                    percepts.push(Percept::new(
                        forward,
                        right,
                        v_forward,
                        v_right,
                        neighbor_contact,
                    ));
                }
                for offset in &sensed_obstacles {
                    let (forward, right) = to_egocentric(offset.x, offset.y, heading);
                    let (v_forward, v_right) = to_egocentric(-velocity.x, -velocity.y, heading);
                    percepts.push(Percept::new(
                        forward,
                        right,
                        v_forward,
                        v_right,
                        agent_radius,
                    ));
                }
                let spm = encode(&percepts, spec, sharpness);

                let mut precision = haze.precision_map();
                self_haze[idx].apply(&mut precision, &haze.config().self_haze);

                Perception {
                    neighbors,
                    obstacles: sensed_obstacles,
                    spm,
                    precision,
                    scalar_precision,
                    sharpness,
                }
            })
            .collect()
    }

    fn stage_decide(&self, perceptions: &[Perception]) -> Vec<Decision> {
        let columns = self.agents.columns();
        let positions = columns.positions();
        let velocities = columns.velocities();
        let headings = columns.headings();
        let goals = columns.goals();
        let previous_actions: Vec<Vec2> = self
            .agents
            .iter_handles()
            .map(|id| self.runtime.get(id).map_or(Vec2::ZERO, |rt| rt.last_action))
            .collect();

        let ctx = ControlContext {
            spec: &self.spec,
            dynamics: &self.config.dynamics,
            config: &self.config.controller,
            agent_radius: self.config.world.agent_radius,
        };
        let model = self.model.as_deref();

        perceptions
            .par_iter()
            .enumerate()
            .map(|(idx, perception)| {
                let agent = AgentView {
                    state: State::from_parts(positions[idx], velocities[idx], headings[idx]),
                    goal: goals[idx],
                    previous_action: previous_actions[idx],
                    sharpness: perception.sharpness,
                };
                let surroundings = Surroundings {
                    neighbors: &perception.neighbors,
                    obstacles: &perception.obstacles,
                };
                controller::select_action(
                    &agent,
                    &perception.spm,
                    &surroundings,
                    model,
                    &perception.precision,
                    &ctx,
                )
            })
            .collect()
    }

    /// Integrates every decision; returns the number of rejected (non-finite) states.
    fn stage_commit(&mut self, perceptions: Vec<Perception>, decisions: &[Decision]) -> usize {
        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        let dynamics = self.config.dynamics;
        let self_haze_config = &self.haze.config().self_haze;
        let columns = self.agents.columns_mut();
        let mut rejected = 0;

        for ((idx, perception), decision) in perceptions.into_iter().enumerate().zip(decisions) {
            let state = State::from_parts(
                columns.positions[idx],
                columns.velocities[idx],
                columns.headings[idx],
            );
            let next = predict(state, (decision.action.x, decision.action.y), &dynamics);
            let finite = next.position().is_finite()
                && next.velocity().is_finite()
                && next.theta.is_finite();
            if finite {
                let (position, velocity) = self.bounds.confine(next.position(), next.velocity());
                columns.positions[idx] = position;
                columns.velocities[idx] = velocity;
                columns.headings[idx] = next.theta;
            } else {
                rejected += 1;
            }

            if let Some(runtime) = self.runtime.get_mut(handles[idx]) {
                if finite {
                    runtime.last_action = decision.action;
                }
                runtime.precision = perception.scalar_precision;
                runtime.sharpness = Some(perception.sharpness);
                runtime.objective = decision.objective;
                runtime
                    .self_haze
                    .update(columns.velocities[idx].norm(), self_haze_config);
                runtime.spm = Some(perception.spm);
            }
        }
        rejected
    }

    fn stage_contacts(&mut self) -> ContactTally {
        let agent_count = self.agents.len();
        let positions = self.agents.columns().positions();
        let position_pairs: Vec<(f64, f64)> = positions.iter().map(|&p| p.into()).collect();
        let indexed = self.index.rebuild(&position_pairs).is_ok();

        let radius = self.config.world.agent_radius;
        let contact_sq = (2.0 * radius) * (2.0 * radius);
        let near = 2.0 * radius + self.config.world.near_collision_margin;
        let near_sq = near * near;
        let index = &self.index;
        let bounds = &self.bounds;
        let obstacles = &self.obstacles;

        // (flags, collision pairs owned by this agent, near pairs owned by this agent)
        let results: Vec<(ContactFlags, usize, usize)> = (0..agent_count)
            .into_par_iter()
            .map(|idx| {
                let mut flags = ContactFlags::default();
                let mut owned: SmallVec<[(usize, bool); 8]> = SmallVec::new();
                if indexed {
                    index.neighbors_within(idx, near_sq, &mut |other, dist_sq| {
                        let touching = dist_sq.into_inner() < contact_sq;
                        if touching {
                            flags.collision = true;
                        } else if dist_sq.into_inner() < near_sq {
                            flags.near_collision = true;
                        } else {
                            return;
                        }
                        if other > idx {
                            owned.push((other, touching));
                        }
                    });
                }
                flags.obstacle_collision = obstacles.iter().any(|obstacle| {
                    obstacle.contains(positions[idx], bounds)
                        || obstacle
                            .nearest_boundary_offset(positions[idx], bounds)
                            .norm()
                            < radius
                });
                let collisions = owned.iter().filter(|(_, touching)| *touching).count();
                (flags, collisions, owned.len() - collisions)
            })
            .collect();

        let mut tally = ContactTally::default();
        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        for (id, (flags, collisions, near_collisions)) in handles.into_iter().zip(results) {
            tally.collisions += collisions;
            tally.near_collisions += near_collisions;
            if flags.obstacle_collision {
                tally.obstacle_collisions += 1;
            }
            if let Some(runtime) = self.runtime.get_mut(id) {
                runtime.contacts = flags;
            }
        }
        tally
    }

    fn stage_summary(
        &mut self,
        next_tick: Tick,
        tally: ContactTally,
        numeric_anomalies: usize,
        model_fallbacks: usize,
    ) -> TickSummary {
        let agent_count = self.agents.len();
        let (speed_sum, precision_sum) = self.agents.iter_handles().enumerate().fold(
            (0.0, 0.0),
            |(speed, precision), (idx, id)| {
                let v = self.agents.columns().velocities()[idx].norm();
                let p = self.runtime.get(id).map_or(0.0, |rt| rt.precision);
                (speed + v, precision + p)
            },
        );
        let mean = |sum: f64| {
            if agent_count > 0 {
                sum / agent_count as f64
            } else {
                0.0
            }
        };
        let summary = TickSummary {
            tick: next_tick,
            agent_count,
            collisions: tally.collisions,
            near_collisions: tally.near_collisions,
            obstacle_collisions: tally.obstacle_collisions,
            mean_speed: mean(speed_sum),
            mean_precision: mean(precision_sum),
            numeric_anomalies,
            model_fallbacks,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        summary
    }

    fn stage_telemetry(&mut self, next_tick: Tick, summary: &TickSummary) -> bool {
        if !next_tick.is_multiple_of_interval(self.config.telemetry_interval) {
            return false;
        }
        let include_spm = self.config.telemetry_spm;
        let columns = self.agents.columns();
        let agents = self
            .agents
            .iter_handles()
            .enumerate()
            .filter_map(|(idx, id)| {
                let runtime = self.runtime.get(id)?;
                Some(AgentRecord {
                    id,
                    group: columns.groups()[idx],
                    position: columns.positions()[idx],
                    velocity: columns.velocities()[idx],
                    heading: columns.headings()[idx],
                    action: runtime.last_action,
                    precision: runtime.precision,
                    self_haze: runtime.self_haze.level(),
                    contacts: runtime.contacts,
                    spm: if include_spm { runtime.spm.clone() } else { None },
                })
            })
            .collect();
        let batch = TelemetryBatch {
            summary: summary.clone(),
            agents,
        };
        self.telemetry.on_tick(&batch);
        true
    }

    fn stage_broadcast(&mut self, next_tick: Tick) -> bool {
        if !next_tick.is_multiple_of_interval(self.config.broadcast_interval) {
            return false;
        }
        let snapshot = self.snapshot_at(next_tick);
        self.publisher.publish(snapshot);
        true
    }

    fn snapshot_at(&self, tick: Tick) -> WorldSnapshot {
        let columns = self.agents.columns();
        WorldSnapshot {
            tick,
            agents: self
                .agents
                .iter_handles()
                .enumerate()
                .map(|(idx, id)| AgentSnapshot {
                    id,
                    group: columns.groups()[idx],
                    position: columns.positions()[idx],
                    velocity: columns.velocities()[idx],
                    heading: columns.headings()[idx],
                })
                .collect(),
        }
    }

    /// Execute one simulation tick pipeline returning emitted events.
    pub fn step(&mut self) -> TickEvents {
        let next_tick = self.tick.next();

        let perceptions = self.stage_perceive();
        let decisions = self.stage_decide(&perceptions);
        let mut numeric_anomalies = decisions.iter().filter(|d| d.numeric_anomaly).count();
        let model_fallbacks = decisions.iter().filter(|d| d.model_fallback).count();
        numeric_anomalies += self.stage_commit(perceptions, &decisions);
        let tally = self.stage_contacts();
        let summary = self.stage_summary(next_tick, tally, numeric_anomalies, model_fallbacks);
        let telemetry_emitted = self.stage_telemetry(next_tick, &summary);
        let snapshot_published = self.stage_broadcast(next_tick);

        self.advance_tick();
        debug!(
            tick = next_tick.0,
            collisions = tally.collisions,
            near_collisions = tally.near_collisions,
            obstacle_collisions = tally.obstacle_collisions,
            numeric_anomalies,
            model_fallbacks,
            "tick complete"
        );
        TickEvents {
            tick: self.tick,
            collisions: tally.collisions,
            near_collisions: tally.near_collisions,
            obstacle_collisions: tally.obstacle_collisions,
            numeric_anomalies,
            model_fallbacks,
            telemetry_emitted,
            snapshot_published,
        }
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &EphConfig {
        &self.config
    }

    #[must_use]
    pub fn bounds(&self) -> &WorldBounds {
        &self.bounds
    }

    #[must_use]
    pub fn spec(&self) -> &SpmGridSpec {
        &self.spec
    }

    #[must_use]
    pub fn haze(&self) -> &HazeField {
        &self.haze
    }

    /// Replace the telemetry sink.
    pub fn set_telemetry(&mut self, telemetry: Box<dyn TelemetrySink>) {
        self.telemetry = telemetry;
    }

    /// Replace the snapshot publisher.
    pub fn set_publisher(&mut self, publisher: Box<dyn SnapshotPublisher>) {
        self.publisher = publisher;
    }

    /// Attach or detach the predictive model used for the surprise term.
    pub fn set_model(&mut self, model: Option<Arc<dyn PredictiveModel>>) {
        self.model = model;
    }

    #[must_use]
    pub fn model_name(&self) -> Option<&'static str> {
        self.model.as_ref().map(|m| m.name())
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Advances the world tick counter.
    pub fn advance_tick(&mut self) {
        self.tick = self.tick.next();
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Read-only access to the agent arena.
    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.agents
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Insert an agent; the preferred direction is normalized (falling back to the heading)
    /// and the position is mapped into the world.
    pub fn spawn_agent(&mut self, mut agent: AgentData) -> AgentId {
        agent.goal = agent
            .goal
            .normalized()
            .unwrap_or_else(|| Vec2::from_angle(agent.heading));
        let (position, velocity) = self.bounds.confine(agent.position, agent.velocity);
        agent.position = position;
        agent.velocity = velocity;
        let id = self.agents.insert(agent);
        self.runtime.insert(id, AgentRuntime::default());
        id
    }

    /// Remove an agent and its runtime data.
    pub fn remove_agent(&mut self, id: AgentId) -> Option<AgentData> {
        self.runtime.remove(id);
        self.agents.remove(id)
    }

    /// Add a static obstacle. Intended for world setup, before the first tick.
    pub fn add_obstacle(&mut self, obstacle: Obstacle) -> Result<(), WorldStateError> {
        obstacle.validate()?;
        self.obstacles.push(obstacle);
        Ok(())
    }

    #[must_use]
    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    /// Immutable access to per-agent runtime data.
    #[must_use]
    pub fn runtime(&self) -> &AgentMap<AgentRuntime> {
        &self.runtime
    }

    #[must_use]
    pub fn agent_runtime(&self, id: AgentId) -> Option<&AgentRuntime> {
        self.runtime.get(id)
    }

    /// Full snapshot of one agent.
    #[must_use]
    pub fn snapshot_agent(&self, id: AgentId) -> Option<AgentState> {
        let data = self.agents.snapshot(id)?;
        let runtime = self.runtime.get(id)?.clone();
        Some(AgentState { id, data, runtime })
    }

    /// Broadcast view of the current tick.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        self.snapshot_at(self.tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{BaselineAction, ControlMode};
    use std::sync::Mutex;

    fn sample_agent(seed: u32) -> AgentData {
        let s = f64::from(seed);
        AgentData {
            position: Vec2::new(s, s + 1.0),
            velocity: Vec2::new(s * 0.1, -s * 0.1),
            heading: s * 0.5,
            goal: Vec2::new(1.0, 0.0),
            group: GroupTag(seed as u16),
        }
    }

    fn config() -> EphConfig {
        EphConfig {
            rng_seed: Some(7),
            ..EphConfig::default()
        }
    }

    #[test]
    fn insert_allocates_unique_handles() {
        let mut arena = AgentArena::new();
        let a = arena.insert(sample_agent(0));
        let b = arena.insert(sample_agent(1));
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
        assert!(arena.contains(a));
        assert!(arena.contains(b));
    }

    #[test]
    fn remove_keeps_dense_storage_coherent() {
        let mut arena = AgentArena::new();
        let a = arena.insert(sample_agent(0));
        let b = arena.insert(sample_agent(1));
        let c = arena.insert(sample_agent(2));

        let removed = arena.remove(b).expect("agent removed");
        assert_eq!(removed.group, GroupTag(1));
        assert_eq!(arena.len(), 2);
        assert!(arena.contains(a));
        assert!(arena.contains(c));
        assert!(!arena.contains(b));

        let snapshot_c = arena.snapshot(c).expect("snapshot");
        assert_eq!(snapshot_c.position, Vec2::new(2.0, 3.0));
        assert_eq!(arena.index_of(c), Some(1));

        let d = arena.insert(sample_agent(3));
        assert_ne!(
            b, d,
            "generational handles should not be reused immediately"
        );
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut bad = config();
        bad.spm.n_theta = 0;
        assert!(matches!(
            WorldState::new(bad),
            Err(WorldStateError::InvalidConfig(_))
        ));

        let mut bad = config();
        bad.world.width = 0.0;
        assert!(WorldState::new(bad).is_err());

        let mut bad = config();
        bad.haze.haze_peripheral = -1.0;
        assert!(WorldState::new(bad).is_err());

        let mut bad = config();
        bad.dynamics.mass = 0.0;
        assert!(WorldState::new(bad).is_err());
    }

    #[test]
    fn spawn_normalizes_goal_and_wraps_position() {
        let mut world = WorldState::new(config()).expect("world");
        let id = world.spawn_agent(AgentData {
            position: Vec2::new(41.0, -1.0),
            goal: Vec2::new(0.0, 5.0),
            ..AgentData::default()
        });
        let data = world.agents().snapshot(id).expect("snapshot");
        assert_eq!(data.goal, Vec2::new(0.0, 1.0));
        assert!((data.position.x - 1.0).abs() < 1e-12);
        assert!((data.position.y - 39.0).abs() < 1e-12);

        let fallback = world.spawn_agent(AgentData {
            heading: std::f64::consts::FRAC_PI_2,
            goal: Vec2::ZERO,
            ..AgentData::default()
        });
        let goal = world.agents().snapshot(fallback).expect("snapshot").goal;
        assert!(goal.x.abs() < 1e-12 && (goal.y - 1.0).abs() < 1e-12);
        assert!(world.agent_runtime(fallback).is_some());
        assert!(world.remove_agent(fallback).is_some());
        assert!(world.agent_runtime(fallback).is_none());
    }

    #[test]
    fn lone_agent_accelerates_along_goal() {
        let mut world = WorldState::new(config()).expect("world");
        let id = world.spawn_agent(AgentData {
            position: Vec2::new(5.0, 5.0),
            goal: Vec2::new(1.0, 0.0),
            ..AgentData::default()
        });
        let events = world.step();
        assert_eq!(events.tick, Tick(1));
        assert_eq!(events.collisions, 0);
        let runtime = world.agent_runtime(id).expect("runtime");
        assert_eq!(runtime.last_action, Vec2::new(2.0, 0.0));
        let data = world.agents().snapshot(id).expect("snapshot");
        assert!(data.velocity.x > 0.0 && data.position.x > 5.0);
        let spm = runtime.spm.as_ref().expect("spm cached");
        assert!(spm.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn overlapping_agents_count_one_collision_pair() {
        let mut world = WorldState::new(config()).expect("world");
        let a = world.spawn_agent(AgentData {
            position: Vec2::new(10.0, 10.0),
            ..AgentData::default()
        });
        let b = world.spawn_agent(AgentData {
            position: Vec2::new(10.5, 10.0),
            ..AgentData::default()
        });
        world.spawn_agent(AgentData {
            position: Vec2::new(30.0, 30.0),
            ..AgentData::default()
        });
        let events = world.step();
        assert_eq!(events.collisions, 1);
        assert!(world.agent_runtime(a).expect("a").contacts.collision);
        assert!(world.agent_runtime(b).expect("b").contacts.collision);
    }

    #[test]
    fn agents_inside_the_margin_count_as_near_collisions() {
        let mut cfg = config();
        cfg.controller.mode = ControlMode::Baseline {
            action: BaselineAction::Zero,
        };
        let mut world = WorldState::new(cfg).expect("world");
        let a = world.spawn_agent(AgentData {
            position: Vec2::new(10.0, 10.0),
            ..AgentData::default()
        });
        let b = world.spawn_agent(AgentData {
            position: Vec2::new(11.2, 10.0),
            ..AgentData::default()
        });
        // beyond 2r + margin from everyone
        let apart = world.spawn_agent(AgentData {
            position: Vec2::new(10.0, 11.6),
            ..AgentData::default()
        });
        let events = world.step();
        assert_eq!(events.collisions, 0);
        assert_eq!(events.near_collisions, 1);
        let near_only = ContactFlags {
            near_collision: true,
            ..ContactFlags::default()
        };
        assert_eq!(world.agent_runtime(a).expect("a").contacts, near_only);
        assert_eq!(world.agent_runtime(b).expect("b").contacts, near_only);
        assert_eq!(
            world.agent_runtime(apart).expect("apart").contacts,
            ContactFlags::default()
        );
    }

    #[test]
    fn rejected_state_keeps_previous_action() {
        let mut world = WorldState::new(config()).expect("world");
        let id = world.spawn_agent(AgentData {
            position: Vec2::new(5.0, 5.0),
            ..AgentData::default()
        });
        world.step();
        let before = world.agents().snapshot(id).expect("snapshot");
        let previous = world.agent_runtime(id).expect("runtime").last_action;
        assert_eq!(previous, Vec2::new(2.0, 0.0));

        let perceptions = world.stage_perceive();
        let poisoned = Decision {
            action: Vec2::new(f64::NAN, 0.0),
            objective: f64::NAN,
            iterations: 0,
            numeric_anomaly: true,
            model_fallback: false,
        };
        assert_eq!(world.stage_commit(perceptions, &[poisoned]), 1);
        assert_eq!(world.agent_runtime(id).expect("runtime").last_action, previous);
        assert_eq!(world.agents().snapshot(id).expect("snapshot"), before);
    }

    #[test]
    fn obstacle_overlap_is_counted() {
        let mut world = WorldState::new(config()).expect("world");
        world
            .add_obstacle(Obstacle::Circle {
                center: Vec2::new(20.0, 20.0),
                radius: 2.0,
            })
            .expect("obstacle");
        assert!(
            world
                .add_obstacle(Obstacle::Circle {
                    center: Vec2::ZERO,
                    radius: -1.0,
                })
                .is_err()
        );
        let id = world.spawn_agent(AgentData {
            position: Vec2::new(20.0, 20.0),
            ..AgentData::default()
        });
        let events = world.step();
        assert_eq!(events.obstacle_collisions, 1);
        assert!(world.agent_runtime(id).expect("rt").contacts.obstacle_collision);
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<TelemetryBatch>>>);

    impl TelemetrySink for Recorder {
        fn on_tick(&mut self, batch: &TelemetryBatch) {
            self.0.lock().expect("lock").push(batch.clone());
        }
    }

    #[derive(Clone, Default)]
    struct Collector(Arc<Mutex<Vec<WorldSnapshot>>>);

    impl SnapshotPublisher for Collector {
        fn publish(&mut self, snapshot: WorldSnapshot) {
            self.0.lock().expect("lock").push(snapshot);
        }
    }

    #[test]
    fn telemetry_and_broadcast_follow_their_intervals() {
        let mut cfg = config();
        cfg.telemetry_interval = 2;
        cfg.broadcast_interval = 3;
        cfg.telemetry_spm = true;
        cfg.history_capacity = 4;
        let mut world = WorldState::new(cfg).expect("world");
        let recorder = Recorder::default();
        let collector = Collector::default();
        world.set_telemetry(Box::new(recorder.clone()));
        world.set_publisher(Box::new(collector.clone()));
        world.spawn_agent(sample_agent(3));
        world.spawn_agent(sample_agent(9));

        let mut flags = Vec::new();
        for _ in 0..6 {
            let events = world.step();
            flags.push((events.telemetry_emitted, events.snapshot_published));
        }
        assert_eq!(
            flags,
            vec![
                (false, false),
                (true, false),
                (false, true),
                (true, false),
                (false, false),
                (true, true),
            ]
        );

        let batches = recorder.0.lock().expect("lock");
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].summary.tick, Tick(2));
        assert_eq!(batches[0].agents.len(), 2);
        assert!(batches[0].agents.iter().all(|a| a.spm.is_some()));

        let snapshots = collector.0.lock().expect("lock");
        assert_eq!(
            snapshots.iter().map(|s| s.tick).collect::<Vec<_>>(),
            vec![Tick(3), Tick(6)]
        );

        let ticks: Vec<Tick> = world.history().map(|s| s.tick).collect();
        assert_eq!(ticks, vec![Tick(3), Tick(4), Tick(5), Tick(6)]);
    }
}
