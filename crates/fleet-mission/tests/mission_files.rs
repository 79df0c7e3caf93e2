use std::fs;

use fleet_mission::store::{self, CreatePlan, HEADER};
use fleet_mission::MissionError;
use fleet_proto::mission::cmd;
use fleet_proto::{HomePosition, WaypointPatch, WaypointSpec};

fn specs() -> Vec<WaypointSpec> {
    vec![
        WaypointSpec { lat: Some(48.85), lon: Some(2.29), ..Default::default() },
        WaypointSpec {
            lat: Some(48.8512345),
            lon: Some(2.2912345),
            alt: Some(42.5),
            param1: Some(3.0),
            autocontinue: Some(false),
            ..Default::default()
        },
    ]
}

#[test]
fn created_file_parses_back_to_the_same_mission() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("nested/trip.waypoints");
    let home = HomePosition { lat: 48.8584, lon: 2.2945, alt: None };

    let created = store::create(&path, 30.0, &specs(), CreatePlan::Auto { home }).unwrap();
    let report = store::parse(&path).unwrap();

    assert_eq!(report.skipped_lines, 0);
    assert_eq!(report.mission, created);
    assert!(fs::read_to_string(&path).unwrap().starts_with(HEADER));
    assert!(!tmp.path().join("nested/trip.waypoints.tmp").exists());
}

#[test]
fn manual_file_round_trips_at_file_precision() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("manual.waypoints");
    let specs = vec![WaypointSpec { lat: Some(1.123456789012), lon: Some(-0.5), alt: Some(10.1234567), ..Default::default() }];

    store::create(&path, 30.0, &specs, CreatePlan::Manual).unwrap();
    let wp = &store::parse(&path).unwrap().mission.items[0];
    assert!((wp.lat - 1.12345679).abs() < 1e-12);
    assert!((wp.alt - 10.123457).abs() < 1e-9);
}

#[test]
fn modify_patches_one_record_and_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("m.waypoints");
    let home = HomePosition { lat: 10.0, lon: 20.0, alt: Some(5.0) };
    store::create(&path, 30.0, &specs(), CreatePlan::Auto { home }).unwrap();
    let before = fs::read_to_string(&path).unwrap();

    let patch = WaypointPatch { lat: Some(48.9), alt: Some(60.0), command: Some(cmd::NAV_WAYPOINT), ..Default::default() };
    let wp = store::modify(&path, 2, &patch).unwrap();
    assert_eq!(wp.lat, 48.9);
    assert_eq!(wp.lon, 2.29);
    let once = fs::read_to_string(&path).unwrap();

    store::modify(&path, 2, &patch).unwrap();
    let twice = fs::read_to_string(&path).unwrap();
    assert_eq!(once, twice);

    let changed: Vec<_> = before.lines().zip(once.lines()).filter(|(a, b)| a != b).collect();
    assert_eq!(changed.len(), 1);
    assert!(changed[0].1.starts_with("2\t0\t3\t16\t"));
}

#[test]
fn modify_reports_missing_seq_and_bad_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("m.waypoints");
    store::create(&path, 30.0, &specs(), CreatePlan::Manual).unwrap();

    let res = store::modify(&path, 9, &WaypointPatch { alt: Some(1.0), ..Default::default() });
    assert!(matches!(res, Err(MissionError::SeqNotFound { seq: 9, .. })));

    fs::write(&path, format!("{}\n0\t1\t0\n", HEADER)).unwrap();
    let res = store::modify(&path, 0, &WaypointPatch::default());
    assert!(matches!(res, Err(MissionError::Format { .. })));

    fs::write(&path, "garbage\n").unwrap();
    let res = store::modify(&path, 0, &WaypointPatch::default());
    assert!(matches!(res, Err(MissionError::Format { .. })));
}

#[test]
fn missing_file_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let res = store::parse(&tmp.path().join("absent.waypoints"));
    assert!(matches!(res, Err(MissionError::FileNotFound(_))));
}
