//! Integration tests for the full store lifecycle.
//!
//! These tests exercise the complete flow from an on-disk store through
//! ingestion, querying, reopening and sensor management.

use barograph::{
    BarographError, Channel, ErrorKind, PosixTime, Reading, ReadingValues, Resolution, Store,
    StoreConfig,
};
use chrono::{DateTime, TimeDelta, Utc};
use tempfile::tempdir;

/// First second of a ten-minute period.
const BASE: i32 = 1_700_000_400;

fn at(secs: i32) -> DateTime<Utc> {
    PosixTime::new(secs).to_datetime()
}

fn weather(i: i32) -> ReadingValues {
    ReadingValues {
        temperature: 15.0 + f64::from(i % 50) / 10.0,
        pressure: 101_000.0 + f64::from(i),
        humidity: 0.4,
        wind_speed: f64::from(i % 7),
        wind_direction: 270.0,
    }
}

fn one_per_second(start: i32, count: i32) -> Vec<Reading> {
    (0..count)
        .map(|i| Reading::at(PosixTime::new(start + i), weather(i)))
        .collect()
}

#[test]
fn test_ten_minutes_of_readings_make_one_summary() {
    let mut store = Store::open_in_memory().unwrap();
    store.push_readings("A", &one_per_second(BASE, 600), true).unwrap();

    let result = store
        .query_summaries("A", at(BASE), TimeDelta::minutes(10), TimeDelta::minutes(10))
        .unwrap();
    assert_eq!(result.resolution(), Resolution::TenMinutes);
    assert_eq!(result.len(), 1, "expected exactly one ten-minute summary");

    let summary = &result.records()[0];
    assert_eq!(summary.record_count, 600);
    assert_eq!(summary.stamp, PosixTime::new(BASE));
    assert!((summary.min.pressure - 101_000.0).abs() < 1.0);
    assert!((summary.max.pressure - 101_599.0).abs() < 1.0);
    assert_eq!(summary.histogram(Channel::WindDirection).total(), 600);

    let minutes = store
        .query_summaries_at("A", at(BASE), TimeDelta::minutes(10), Resolution::Minute)
        .unwrap();
    assert_eq!(minutes.len(), 10);
    assert!(minutes.records().iter().all(|m| m.record_count == 60));
}

#[test]
fn test_store_lifecycle_on_disk() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("lifecycle.db");

    // Phase 1: nothing exists until the first operation.
    {
        let mut store = Store::open(StoreConfig::new(&path).with_batch_size(100)).unwrap();
        assert!(!path.exists());

        let report = store.push_readings("roof", &one_per_second(BASE, 250), true).unwrap();
        assert_eq!(report.batch.rows, 250);
        assert_eq!(report.batch.chunks_committed, 3);
        store.set_latest_name_for_hardware_id("roof", "hw-7").unwrap();
        store.push_sync_stamp(at(BASE + 300)).unwrap();
        store.close().unwrap();
    }

    // Phase 2: reopen and verify everything persisted.
    {
        let mut store = Store::open(StoreConfig::new(&path)).unwrap();
        let readings: Vec<Reading> = store
            .query_readings("roof", at(BASE), TimeDelta::seconds(1_000))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(readings.len(), 250);
        assert!(readings[10].values.approx_eq(&weather(10)));

        assert_eq!(store.latest_name_for_hardware_id("hw-7").unwrap().as_deref(), Some("roof"));
        assert_eq!(store.get_max_sync_stamp().unwrap(), Some(at(BASE + 300)));
        let info = store.info().unwrap();
        assert_eq!((info.sensors, info.records, info.ten_minute_records), (1, 250, 1));
    }
}

#[test]
fn test_replace_and_ignore_on_collision() {
    let mut store = Store::open_in_memory().unwrap();
    store.push_readings("A", &one_per_second(BASE, 10), true).unwrap();

    let mut hotter = ReadingValues::missing();
    hotter.temperature = 40.0;
    let collision = [Reading::at(PosixTime::new(BASE + 5), hotter)];

    store.push_readings("A", &collision, false).unwrap();
    let kept = store
        .query_readings("A", at(BASE + 5), TimeDelta::zero())
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert!(kept.values.approx_eq(&weather(5)));

    store.push_readings("A", &collision, true).unwrap();
    let replaced = store
        .query_readings("A", at(BASE + 5), TimeDelta::zero())
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert!(replaced.values.pressure.is_nan());

    // The minute summary follows the replacement.
    let minute = store
        .query_summaries_at("A", at(BASE), TimeDelta::minutes(1), Resolution::Minute)
        .unwrap();
    assert_eq!(minute.records()[0].max.temperature, 40.0);
}

#[test]
fn test_sensor_management() {
    let mut store = Store::open_in_memory().unwrap();
    assert!(store.add_sensor("A").unwrap());
    assert!(!store.add_sensor("A").unwrap());
    store.push_readings("B", &one_per_second(BASE, 30), true).unwrap();

    let err = store.add_sensor("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    // Renaming onto an existing name is refused; the data stays put.
    assert!(!store.rename_sensor("B", "A").unwrap());
    assert!(store.rename_sensor("B", "C").unwrap());
    let moved = store
        .query_readings("C", at(BASE), TimeDelta::minutes(1))
        .unwrap()
        .count();
    assert_eq!(moved, 30);

    assert!(store.delete_sensor("C").unwrap());
    assert!(matches!(
        store.query_readings("C", at(BASE), TimeDelta::minutes(1)),
        Err(BarographError::NotFound { .. })
    ));
    let info = store.info().unwrap();
    assert_eq!((info.records, info.minute_records, info.ten_minute_records), (0, 0, 0));

    let names: Vec<String> = store.get_all_sensors().unwrap().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["A".to_string()]);
}

#[test]
fn test_unavailable_storage() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("missing").join("nested").join("store.db");
    let mut store = Store::open(StoreConfig::new(path)).unwrap();

    let err = store.get_all_sensors().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
}

#[test]
fn test_config_file_round_trip() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("barograph.json");
    let db_path = temp_dir.path().join("from_config.db");
    std::fs::write(
        &config_path,
        format!(
            r#"{{ "path": {}, "batch_size": 50, "journal_mode": "delete" }}"#,
            serde_json::to_string(&db_path).unwrap()
        ),
    )
    .unwrap();

    let config = StoreConfig::load(&config_path).unwrap();
    assert_eq!(config.batch_size, 50);
    let mut store = Store::open(config).unwrap();
    let report = store.push_readings("A", &one_per_second(BASE, 120), true).unwrap();
    assert_eq!(report.batch.chunks_committed, 3);
    assert!(db_path.exists());
}
