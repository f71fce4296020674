//! Baseline dataset used by the RESEED strategy.

use super::{Collection, Record};
use crate::error::Result;
use crate::snapshot::Snapshot;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// Built-in baseline: an admin and a guest account, one hotel with two
/// rooms, a package per room and a week of room inventory.
pub fn baseline() -> Snapshot {
    let now = Utc::now();
    let mut collections: BTreeMap<Collection, Vec<Record>> = BTreeMap::new();

    collections.insert(
        Collection::Users,
        vec![
            record(json!({
                "id": "seed-user-admin",
                "email": "admin@rsvshop.com",
                "name": "Administrator",
                "role": "ADMIN"
            })),
            record(json!({
                "id": "seed-user-1",
                "email": "user1@example.com",
                "name": "Guest",
                "role": "USER"
            })),
        ],
    );

    collections.insert(
        Collection::Hotels,
        vec![record(json!({
            "id": "seed-hotel-1",
            "name": "RSV Hotel",
            "address": "Seoul"
        }))],
    );

    collections.insert(
        Collection::Rooms,
        vec![
            record(json!({
                "id": "seed-room-deluxe",
                "hotelId": "seed-hotel-1",
                "name": "Deluxe Double",
                "capacity": 2
            })),
            record(json!({
                "id": "seed-room-suite",
                "hotelId": "seed-hotel-1",
                "name": "Suite",
                "capacity": 4
            })),
        ],
    );

    collections.insert(
        Collection::Packages,
        vec![
            record(json!({
                "id": "seed-package-breakfast",
                "roomId": "seed-room-deluxe",
                "name": "Breakfast package",
                "price": 15000
            })),
            record(json!({
                "id": "seed-package-spa",
                "roomId": "seed-room-suite",
                "name": "Spa package",
                "price": 50000
            })),
        ],
    );

    let mut inventories = Vec::with_capacity(14);
    for day in 0..7 {
        let date = (now + Duration::days(day)).format("%Y-%m-%d").to_string();
        for (room, total) in [("seed-room-deluxe", 10), ("seed-room-suite", 5)] {
            inventories.push(record(json!({
                "id": format!("seed-inventory-{}-{}", room, day),
                "roomId": room,
                "date": date,
                "totalCount": total,
                "bookedCount": 0
            })));
        }
    }
    collections.insert(Collection::Inventories, inventories);

    Snapshot::new(now, collections)
}

/// Load a seed dataset from a snapshot-format file, or fall back to the
/// built-in baseline when no file is configured.
pub fn load(seed_file: Option<&Path>) -> Result<Snapshot> {
    match seed_file {
        Some(path) => Snapshot::read_from(path),
        None => Ok(baseline()),
    }
}
