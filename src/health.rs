//! Health Monitoring for the data store
//!
//! A poll is a connectivity probe followed, if the store answers, by record
//! counts over the anchor collections. An anchor below its configured
//! minimum, or a restore left half-finished, fails the integrity check.

use crate::metrics;
use crate::store::{Collection, DataStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Minimum record count for one anchor collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRule {
    pub collection: Collection,
    pub min_records: usize,
}

impl AnchorRule {
    pub fn new(collection: Collection, min_records: usize) -> Self {
        Self {
            collection,
            min_records,
        }
    }
}

/// Users, hotels and rooms must be present; bookings are counted only.
pub fn default_anchors() -> Vec<AnchorRule> {
    vec![
        AnchorRule::new(Collection::Users, 1),
        AnchorRule::new(Collection::Hotels, 1),
        AnchorRule::new(Collection::Rooms, 1),
        AnchorRule::new(Collection::Bookings, 0),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthVerdict {
    pub store_reachable: bool,
    pub integrity_ok: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthVerdict {
    pub fn is_healthy(&self) -> bool {
        self.store_reachable && self.integrity_ok
    }
}

/// A verdict plus what the poll saw.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub verdict: HealthVerdict,
    pub counts: BTreeMap<Collection, usize>,
    pub problems: Vec<String>,
}

pub struct HealthMonitor {
    store: Arc<dyn DataStore>,
    anchors: Vec<AnchorRule>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn DataStore>, anchors: Vec<AnchorRule>) -> Self {
        Self { store, anchors }
    }

    pub fn poll(&self) -> HealthVerdict {
        self.report().verdict
    }

    pub fn report(&self) -> HealthReport {
        let checked_at = Utc::now();
        let mut counts = BTreeMap::new();
        let mut problems = Vec::new();

        if let Err(e) = self.store.ping() {
            warn!(error = %e, "Data store connectivity check failed");
            metrics::record_health_poll(false);
            return HealthReport {
                verdict: HealthVerdict {
                    store_reachable: false,
                    integrity_ok: false,
                    checked_at,
                },
                counts,
                problems: vec![e.to_string()],
            };
        }

        match self.store.restore_pending() {
            Ok(true) => problems.push("a restore did not complete".to_string()),
            Ok(false) => {}
            Err(e) => problems.push(format!("cannot read restore marker: {}", e)),
        }

        for anchor in &self.anchors {
            match self.store.count(anchor.collection) {
                Ok(count) => {
                    counts.insert(anchor.collection, count);
                    if count < anchor.min_records {
                        problems.push(format!(
                            "{} has {} records, expected at least {}",
                            anchor.collection, count, anchor.min_records
                        ));
                    }
                }
                Err(e) => problems.push(format!("counting {} failed: {}", anchor.collection, e)),
            }
        }

        let integrity_ok = problems.is_empty();
        if integrity_ok {
            debug!(?counts, "Data store healthy");
        } else {
            warn!(?problems, "Data integrity check failed");
        }
        metrics::record_health_poll(integrity_ok);

        HealthReport {
            verdict: HealthVerdict {
                store_reachable: true,
                integrity_ok,
                checked_at,
            },
            counts,
            problems,
        }
    }
}
