#![allow(dead_code)]

use rsvshop_recovery::snapshot::{BackupKind, BackupMetadata, Snapshot, SnapshotStore};
use rsvshop_recovery::store::seed;
use rsvshop_recovery::{Collection, DataStore, Record};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

pub fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

/// Load the seed dataset into an empty store.
pub fn populate(store: &dyn DataStore) {
    for (collection, records) in seed::baseline().collections {
        store.insert_many(collection, records).unwrap();
    }
}

pub fn minute(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(n)
}

/// A snapshot roughly `padding` bytes larger than an empty one.
pub fn padded_snapshot(at: DateTime<Utc>, padding: usize) -> Snapshot {
    let mut collections: BTreeMap<Collection, Vec<Record>> = BTreeMap::new();
    collections.insert(
        Collection::Users,
        vec![record(serde_json::json!({
            "id": "u1",
            "email": format!("{}@example.com", "x".repeat(padding)),
        }))],
    );
    Snapshot::new(at, collections)
}

pub fn write_padded(store: &SnapshotStore, name: &str, at: DateTime<Utc>, padding: usize) -> BackupMetadata {
    store
        .write(name, &padded_snapshot(at, padding), BackupKind::Scheduled)
        .unwrap()
}

pub fn stems(store: &SnapshotStore) -> Vec<String> {
    store
        .list()
        .unwrap()
        .iter()
        .map(|m| m.stem().to_string())
        .collect()
}
