//! End-to-end behaviour of the booted core on simulated hardware.

use std::sync::Arc;
use std::time::Duration;

use mower_hal::{DriverFactory, HardwareConfig, SimWorld};
use mower_middleware::StateReader;
use mower_planner::GeofenceSpec;
use mower_runtime::{ControlConfig, CoreConfig, MowerCore};
use mower_types::{
    CommandSource, EventPayload, InterlockKind, JobSpec, JobState, MotionCommand, NavigationMode,
    Point, RobotState, topics,
};
use tokio::time::{Instant, sleep, timeout};

async fn boot(world: &SimWorld) -> MowerCore {
    let config = CoreConfig {
        control: ControlConfig {
            scheduler_interval: Duration::from_millis(100),
            ..ControlConfig::default()
        },
        hardware: HardwareConfig::simulated(),
        ..CoreConfig::default()
    };
    MowerCore::start(config, DriverFactory::simulation(world.clone()))
        .await
        .unwrap()
}

async fn wait_for_state(
    reader: &mut StateReader,
    within: Duration,
    pred: impl Fn(&RobotState) -> bool,
) -> Option<Arc<RobotState>> {
    timeout(within, async {
        loop {
            let state = reader.changed().await.ok()?;
            if pred(&state) {
                return Some(state);
            }
        }
    })
    .await
    .ok()
    .flatten()
}

async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Wait until GPS, battery and heading have all been fused.
async fn settled(core: &MowerCore) {
    let mut reader = core.control().state_reader();
    wait_for_state(&mut reader, Duration::from_secs(3), |s| {
        s.position.is_some() && s.battery_percent.is_some() && s.is_clear()
    })
    .await
    .expect("core never produced a settled state");
}

#[tokio::test(flavor = "multi_thread")]
async fn estop_reaches_fused_stream_within_100ms() {
    let world = SimWorld::default();
    let core = boot(&world).await;
    settled(&core).await;
    let mut stops = core.bus().subscribe_critical("test", topics::COMMANDS).unwrap();

    let mut reader = core.control().state_reader();
    world.set_estop(true);
    let state = wait_for_state(&mut reader, Duration::from_millis(100), |s| {
        s.navigation_mode == NavigationMode::EmergencyStop
            && s.active_interlocks.contains(&InterlockKind::EmergencyStop)
    })
    .await;
    assert!(state.is_some(), "e-stop not visible in the fused stream within 100 ms");

    let safety_stop = timeout(Duration::from_millis(500), async {
        loop {
            let event = stops.recv().await.unwrap();
            stops.ack(event.sequence).unwrap();
            if let EventPayload::Command { command, source } = event.payload {
                if command == MotionCommand::Stop && source == CommandSource::Safety {
                    break;
                }
            }
        }
    })
    .await;
    assert!(safety_stop.is_ok(), "no critical safety stop on the command topic");

    // Releasing the switch is not enough: acknowledge, then reset.
    world.set_estop(false);
    let api = core.api();
    let mut acked = false;
    for _ in 0..40 {
        if api.acknowledge(InterlockKind::EmergencyStop).await.is_ok() {
            acked = true;
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    assert!(acked);
    api.reset().await.unwrap();
    assert_eq!(api.status().await.unwrap().state.navigation_mode, NavigationMode::Idle);

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tilt_cuts_the_blade_and_blocks_it() {
    let world = SimWorld::default();
    let core = boot(&world).await;
    settled(&core).await;
    let api = core.api();

    api.set_mode(NavigationMode::Manual).await.unwrap();
    api.blade(true).await.unwrap();
    assert!(eventually(Duration::from_millis(200), || world.state().blade_enabled).await);

    world.set_tilt(40.0, 0.0);
    assert!(
        eventually(Duration::from_millis(200), || !world.state().blade_enabled).await,
        "blade still running 200 ms after tilt"
    );

    let err = api.blade(true).await.unwrap_err();
    assert_eq!(err.status_code(), 403);
    assert!(err.to_string().contains("tilt_detected"), "{err}");

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn job_runs_pauses_on_interlock_and_resumes() {
    let world = SimWorld::default();
    let core = boot(&world).await;
    settled(&core).await;
    let api = core.api();

    // The first fix is the frame origin, so the robot sits near (0, 0).
    api.set_geofence(GeofenceSpec {
        name: "test plot".to_string(),
        vertices: vec![
            Point::new(-1.0, -1.0),
            Point::new(3.0, -1.0),
            Point::new(3.0, 3.0),
            Point::new(-1.0, 3.0),
        ],
        buffer_m: 0.5,
    })
    .await
    .unwrap();

    let job = api
        .create_job(JobSpec {
            name: "plot".to_string(),
            schedule: "0 3 * * *".to_string(),
            enabled: true,
        })
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Scheduled);

    let started = api.start_job(job.id).await.unwrap();
    assert_eq!(started.state, JobState::Running);
    assert!(started.pattern_id.is_some());
    let status = api.status().await.unwrap();
    assert_eq!(status.active_job.map(|j| j.id), Some(job.id));
    assert!(status.pattern.is_some());
    assert!(eventually(Duration::from_millis(300), || world.state().blade_enabled).await);

    // Geofence edits are refused while the job owns the pattern.
    assert_eq!(api.clear_geofence().await.unwrap_err().status_code(), 409);

    world.set_obstacle(Some(0.1));
    let mut paused = false;
    for _ in 0..40 {
        if api.job(job.id).await.unwrap().state == JobState::Paused {
            paused = true;
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    assert!(paused, "job not paused by the obstacle interlock");
    assert_eq!(api.state().navigation_mode, NavigationMode::EmergencyStop);
    assert!(eventually(Duration::from_millis(200), || !world.state().blade_enabled).await);

    // Obstacles clear on their own; the mode still needs a reset.
    world.set_obstacle(Some(3.0));
    let mut reset = false;
    for _ in 0..40 {
        if api.reset().await.is_ok() {
            reset = true;
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    assert!(reset);

    let mut reader = core.control().state_reader();
    let resumed = wait_for_state(&mut reader, Duration::from_secs(1), |s| {
        s.navigation_mode == NavigationMode::Autonomous
    })
    .await;
    assert!(resumed.is_some(), "paused job did not resume");
    assert_eq!(api.job(job.id).await.unwrap().state, JobState::Running);

    let cancelled = api.cancel_job(job.id).await.unwrap();
    assert_eq!(cancelled.state, JobState::Scheduled);
    assert_eq!(cancelled.retry_count, 0);
    assert_eq!(api.state().navigation_mode, NavigationMode::Idle);
    assert!(api.status().await.unwrap().pattern.is_none());

    core.shutdown().await;
}
