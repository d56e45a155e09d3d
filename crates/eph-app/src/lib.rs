//! Application plumbing for the `eph` binary: scenarios, live broadcast and the headless runner.

pub mod broadcast;
pub mod runner;
pub mod scenario;

pub use broadcast::{BroadcastPublisher, SnapshotReceiver, SnapshotSender, create_snapshot_bus};
pub use runner::{ModelChoice, RunOptions, RunReport, run};
pub use scenario::{Preset, Scenario, ScenarioError, SpawnGroup, SpawnRegion};
