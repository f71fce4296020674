use super::{Collection, Record};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Any => !value.is_null(),
        }
    }
}

/// Required fields of one collection's records.
#[derive(Debug, Clone, Copy)]
pub struct RecordSchema {
    pub collection: Collection,
    pub required: &'static [(&'static str, FieldKind)],
}

impl RecordSchema {
    pub fn for_collection(collection: Collection) -> RecordSchema {
        use FieldKind::*;

        let required: &'static [(&'static str, FieldKind)] = match collection {
            Collection::Users => &[("id", String), ("email", String)],
            Collection::Hotels => &[("id", String), ("name", String)],
            Collection::ShoppingMalls => &[("id", String), ("name", String)],
            Collection::Categories => &[("id", String), ("name", String)],
            Collection::Rooms => &[("id", String), ("name", String)],
            Collection::Packages => &[("id", String), ("name", String), ("roomId", String)],
            Collection::Inventories => &[
                ("id", String),
                ("roomId", String),
                ("date", String),
                ("totalCount", Number),
            ],
            Collection::Products => &[("id", String), ("name", String)],
            Collection::Bookings => &[("id", String)],
            Collection::BookingItems => &[("id", String), ("bookingId", String)],
            Collection::Orders => &[("id", String)],
            Collection::OrderItems => &[("id", String), ("orderId", String), ("quantity", Any)],
        };

        RecordSchema {
            collection,
            required,
        }
    }

    /// Check a single record. Returns a description of the first violation.
    pub fn check(&self, record: &Record) -> std::result::Result<(), String> {
        for (field, kind) in self.required {
            match record.get(*field) {
                None => return Err(format!("missing field '{}'", field)),
                Some(value) if !kind.accepts(value) => {
                    return Err(format!("field '{}' expected {:?}, got {}", field, kind, value))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Check every record of a collection, including `id` uniqueness.
    pub fn validate(&self, records: &[Record]) -> std::result::Result<(), String> {
        let mut seen = HashSet::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            self.check(record)
                .map_err(|e| format!("{}[{}]: {}", self.collection, idx, e))?;
            if let Some(id) = record.get("id").and_then(Value::as_str) {
                if !seen.insert(id) {
                    return Err(format!("{}[{}]: duplicate id '{}'", self.collection, idx, id));
                }
            }
        }
        Ok(())
    }
}
