use eph_core::geometry::Vec2;
use eph_core::{AgentData, EphConfig, GroupTag, Tick, WorldState};
use eph_telemetry::{TelemetryPipeline, read_summaries};

#[test]
fn pipeline_persists_every_telemetry_tick() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("run.jsonl");

    let config = EphConfig {
        rng_seed: Some(17),
        telemetry_interval: 2,
        telemetry_spm: true,
        ..EphConfig::default()
    };
    {
        let pipeline = TelemetryPipeline::create(&path).expect("pipeline");
        let mut world = WorldState::new(config).expect("world");
        world.set_telemetry(Box::new(pipeline));
        for i in 0..4 {
            let x = 5.0 + 2.0 * f64::from(i);
            world.spawn_agent(AgentData {
                position: Vec2::new(x, 10.0),
                velocity: Vec2::ZERO,
                heading: 0.0,
                goal: Vec2::new(1.0, 0.0),
                group: GroupTag(0),
            });
        }
        for _ in 0..10 {
            world.step();
        }
    }

    let summaries = read_summaries(&path).expect("read back");
    let ticks: Vec<Tick> = summaries.iter().map(|s| s.tick).collect();
    assert_eq!(ticks, vec![Tick(2), Tick(4), Tick(6), Tick(8), Tick(10)]);
    assert!(summaries.iter().all(|s| s.agent_count == 4));

    let text = std::fs::read_to_string(&path).expect("read");
    let agent_rows = text
        .lines()
        .filter(|line| line.contains("\"kind\":\"agent\""))
        .count();
    assert_eq!(agent_rows, 20);
    assert!(text.contains("\"spm\""));
}

#[test]
fn missing_file_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(read_summaries(dir.path().join("absent.jsonl")).is_err());
}
