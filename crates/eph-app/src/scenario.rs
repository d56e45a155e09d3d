//! Scenario descriptions: world extent, static obstacles and spawn groups.
//!
//! Scenarios come from a built-in [`Preset`] or a JSON file with the same shape as
//! [`Scenario`]. Spawning draws from the world RNG, so a fixed seed reproduces a run.

use clap::ValueEnum;
use eph_core::geometry::{Obstacle, Vec2};
use eph_core::{AgentData, EphConfig, GroupTag, WorldConfig, WorldState, WorldStateError};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Spawn attempts per agent before accepting a position that overlaps an obstacle.
const SPAWN_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid scenario: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    World(#[from] WorldStateError),
}

/// Axis-aligned spawn rectangle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpawnRegion {
    pub min: Vec2,
    pub max: Vec2,
}

impl SpawnRegion {
    #[must_use]
    pub const fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    fn sample(&self, rng: &mut SmallRng) -> Vec2 {
        Vec2::new(
            rng.random_range(self.min.x..=self.max.x),
            rng.random_range(self.min.y..=self.max.y),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnGroup {
    pub tag: GroupTag,
    pub count: usize,
    pub spawn: SpawnRegion,
    /// Direction every member of the group walks towards; normalized at spawn.
    pub preferred_direction: Vec2,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub world: WorldConfig,
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
    pub groups: Vec<SpawnGroup>,
}

/// Built-in scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// Four groups crossing the center from every side.
    Scramble,
    /// Two opposing groups squeezing through a gap in a wall.
    Corridor,
    /// Counter-flow through randomly scattered point obstacles.
    Random,
}

impl Preset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(name, true).ok()
    }
}

impl Scenario {
    /// Build a preset; `seed` only affects presets with random layout.
    #[must_use]
    pub fn preset(preset: Preset, seed: u64) -> Self {
        match preset {
            Preset::Scramble => scramble(),
            Preset::Corridor => corridor(),
            Preset::Random => random(seed),
        }
    }

    /// Resolve a preset name or a path to a scenario JSON file.
    pub fn resolve(name_or_path: &str, seed: u64) -> Result<Self, ScenarioError> {
        match Preset::from_name(name_or_path) {
            Some(preset) => Ok(Self::preset(preset, seed)),
            None => Self::load(name_or_path),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let scenario: Self = serde_json::from_str(&text)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.groups.iter().all(|group| group.count == 0) {
            return Err(ScenarioError::Invalid("scenario spawns no agents"));
        }
        for group in &self.groups {
            let SpawnRegion { min, max } = group.spawn;
            if !min.is_finite() || !max.is_finite() || min.x > max.x || min.y > max.y {
                return Err(ScenarioError::Invalid("spawn region min must not exceed max"));
            }
            if group.preferred_direction.normalized().is_none() {
                return Err(ScenarioError::Invalid(
                    "preferred_direction must be non-zero",
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.groups.iter().map(|group| group.count).sum()
    }

    /// Create a world for this scenario; the scenario's world section replaces `config.world`.
    pub fn build_world(&self, mut config: EphConfig) -> Result<WorldState, ScenarioError> {
        self.validate()?;
        config.world = self.world.clone();
        let agent_radius = config.world.agent_radius;
        let mut world = WorldState::new(config)?;
        for obstacle in &self.obstacles {
            world.add_obstacle(*obstacle)?;
        }

        let mut overlapping = 0usize;
        for group in &self.groups {
            let heading = group.preferred_direction.angle();
            for _ in 0..group.count {
                let mut position = group.spawn.sample(world.rng());
                let mut attempts = 1;
                while attempts < SPAWN_ATTEMPTS && blocked(&world, position, agent_radius) {
                    position = group.spawn.sample(world.rng());
                    attempts += 1;
                }
                if blocked(&world, position, agent_radius) {
                    overlapping += 1;
                }
                world.spawn_agent(AgentData::new(
                    position,
                    Vec2::ZERO,
                    heading,
                    group.preferred_direction,
                    group.tag,
                ));
            }
        }
        if overlapping > 0 {
            warn!(
                scenario = %self.name,
                overlapping,
                "agents spawned overlapping obstacles"
            );
        }
        debug!(
            scenario = %self.name,
            agents = world.agent_count(),
            obstacles = world.obstacles().len(),
            "scenario world built"
        );
        Ok(world)
    }
}

fn blocked(world: &WorldState, position: Vec2, agent_radius: f64) -> bool {
    let bounds = world.bounds();
    world.obstacles().iter().any(|obstacle| {
        obstacle.contains(position, bounds)
            || obstacle.nearest_boundary_offset(position, bounds).norm() < agent_radius
    })
}

fn scramble() -> Scenario {
    let world = WorldConfig::default();
    let (cx, cy) = (world.width * 0.5, world.height * 0.5);
    let group = |tag: u16, center: Vec2, direction: Vec2| SpawnGroup {
        tag: GroupTag(tag),
        count: 10,
        spawn: SpawnRegion::new(center - Vec2::new(4.0, 3.0), center + Vec2::new(4.0, 3.0)),
        preferred_direction: direction,
    };
    Scenario {
        name: "scramble".into(),
        groups: vec![
            group(0, Vec2::new(cx, cy + 13.0), Vec2::new(0.0, -1.0)),
            group(1, Vec2::new(cx, cy - 13.0), Vec2::new(0.0, 1.0)),
            group(2, Vec2::new(cx + 13.0, cy), Vec2::new(-1.0, 0.0)),
            group(3, Vec2::new(cx - 13.0, cy), Vec2::new(1.0, 0.0)),
        ],
        obstacles: Vec::new(),
        world,
    }
}

fn corridor() -> Scenario {
    let world = WorldConfig::default();
    let wall_x = world.width * 0.5;
    let gap = (world.height * 0.5 - 3.0)..=(world.height * 0.5 + 3.0);
    let mut obstacles = Vec::new();
    let mut y = 1.0;
    while y < world.height {
        if !gap.contains(&y) {
            obstacles.push(Obstacle::Circle {
                center: Vec2::new(wall_x, y),
                radius: 1.0,
            });
        }
        y += 2.0;
    }
    Scenario {
        name: "corridor".into(),
        groups: vec![
            SpawnGroup {
                tag: GroupTag(0),
                count: 12,
                spawn: SpawnRegion::new(Vec2::new(3.0, 12.0), Vec2::new(12.0, 28.0)),
                preferred_direction: Vec2::new(1.0, 0.0),
            },
            SpawnGroup {
                tag: GroupTag(1),
                count: 12,
                spawn: SpawnRegion::new(Vec2::new(28.0, 12.0), Vec2::new(37.0, 28.0)),
                preferred_direction: Vec2::new(-1.0, 0.0),
            },
        ],
        obstacles,
        world,
    }
}

fn random(seed: u64) -> Scenario {
    let world = WorldConfig::default();
    let mut rng = SmallRng::seed_from_u64(seed);
    let obstacles = (0..12)
        .map(|_| Obstacle::Point {
            center: Vec2::new(
                rng.random_range(0.0..world.width),
                rng.random_range(0.0..world.height),
            ),
        })
        .collect();
    Scenario {
        name: "random".into(),
        groups: vec![
            SpawnGroup {
                tag: GroupTag(0),
                count: 15,
                spawn: SpawnRegion::new(Vec2::new(2.0, 2.0), Vec2::new(14.0, 38.0)),
                preferred_direction: Vec2::new(1.0, 0.0),
            },
            SpawnGroup {
                tag: GroupTag(1),
                count: 15,
                spawn: SpawnRegion::new(Vec2::new(26.0, 2.0), Vec2::new(38.0, 38.0)),
                preferred_direction: Vec2::new(-1.0, 0.0),
            },
        ],
        obstacles,
        world,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid_and_populated() {
        for preset in [Preset::Scramble, Preset::Corridor, Preset::Random] {
            let scenario = Scenario::preset(preset, 3);
            scenario.validate().expect("valid preset");
            assert!(scenario.agent_count() > 0);
        }
        assert_eq!(Scenario::preset(Preset::Scramble, 0).groups.len(), 4);
    }

    #[test]
    fn corridor_wall_leaves_a_gap() {
        let scenario = Scenario::preset(Preset::Corridor, 0);
        let ys: Vec<f64> = scenario
            .obstacles
            .iter()
            .map(|obstacle| obstacle.center().y)
            .collect();
        assert!(!ys.is_empty());
        assert!(ys.iter().all(|y| !(17.0..=23.0).contains(y)));
    }

    #[test]
    fn random_preset_depends_on_seed() {
        assert_eq!(
            Scenario::preset(Preset::Random, 5),
            Scenario::preset(Preset::Random, 5)
        );
        assert_ne!(
            Scenario::preset(Preset::Random, 5).obstacles,
            Scenario::preset(Preset::Random, 6).obstacles
        );
    }

    #[test]
    fn preset_names_resolve_case_insensitively() {
        assert_eq!(Preset::from_name("Corridor"), Some(Preset::Corridor));
        assert_eq!(Preset::from_name("nope"), None);
    }

    #[test]
    fn rejects_degenerate_groups() {
        let mut scenario = Scenario::preset(Preset::Scramble, 0);
        scenario.groups[0].preferred_direction = Vec2::ZERO;
        assert!(matches!(
            scenario.validate(),
            Err(ScenarioError::Invalid(_))
        ));

        let mut scenario = Scenario::preset(Preset::Scramble, 0);
        for group in &mut scenario.groups {
            group.count = 0;
        }
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn build_world_spawns_every_group_inside_its_region() {
        let scenario = Scenario::preset(Preset::Scramble, 0);
        let config = EphConfig {
            rng_seed: Some(2),
            ..EphConfig::default()
        };
        let world = scenario.build_world(config).expect("world");
        assert_eq!(world.agent_count(), 40);
        let columns = world.agents().columns();
        for (position, group) in columns.positions().iter().zip(columns.groups()) {
            let region = scenario.groups[group.0 as usize].spawn;
            assert!(position.x >= region.min.x && position.x <= region.max.x);
            assert!(position.y >= region.min.y && position.y <= region.max.y);
        }
    }
}
