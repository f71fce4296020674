//! Data store abstraction for the recovery subsystem
//!
//! Every component receives an explicit `Arc<dyn DataStore>` handle at
//! construction. The handle is opened once by the binary and shared for the
//! lifetime of the process.

pub mod file;
pub mod memory;
pub mod schema;
pub mod seed;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use schema::{FieldKind, RecordSchema};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single row: plain field values keyed by field name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Tracked entity collections.
///
/// Declaration order is dependency order: every collection appears after
/// the collections it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "users")]
    Users,
    #[serde(rename = "hotels")]
    Hotels,
    #[serde(rename = "shoppingMalls")]
    ShoppingMalls,
    #[serde(rename = "categories")]
    Categories,
    #[serde(rename = "rooms")]
    Rooms,
    #[serde(rename = "packages")]
    Packages,
    #[serde(rename = "inventories")]
    Inventories,
    #[serde(rename = "products")]
    Products,
    #[serde(rename = "bookings")]
    Bookings,
    #[serde(rename = "bookingItems")]
    BookingItems,
    #[serde(rename = "orders")]
    Orders,
    #[serde(rename = "orderItems")]
    OrderItems,
}

impl Collection {
    /// Parents before children. Used for capture and bulk load.
    pub const LOAD_ORDER: [Collection; 12] = [
        Collection::Users,
        Collection::Hotels,
        Collection::ShoppingMalls,
        Collection::Categories,
        Collection::Rooms,
        Collection::Packages,
        Collection::Inventories,
        Collection::Products,
        Collection::Bookings,
        Collection::BookingItems,
        Collection::Orders,
        Collection::OrderItems,
    ];

    /// Children before parents. Used when wiping the store.
    pub fn delete_order() -> impl Iterator<Item = Collection> {
        Self::LOAD_ORDER.into_iter().rev()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Hotels => "hotels",
            Collection::ShoppingMalls => "shoppingMalls",
            Collection::Categories => "categories",
            Collection::Rooms => "rooms",
            Collection::Packages => "packages",
            Collection::Inventories => "inventories",
            Collection::Products => "products",
            Collection::Bookings => "bookings",
            Collection::BookingItems => "bookingItems",
            Collection::Orders => "orders",
            Collection::OrderItems => "orderItems",
        }
    }

    /// Collections this one holds foreign keys into.
    pub fn parents(&self) -> &'static [Collection] {
        match self {
            Collection::Rooms => &[Collection::Hotels],
            Collection::Packages | Collection::Inventories => &[Collection::Rooms],
            Collection::Products => &[Collection::Categories],
            Collection::Bookings => &[Collection::Users, Collection::Rooms],
            Collection::BookingItems => &[Collection::Bookings, Collection::Packages],
            Collection::Orders => &[Collection::Users, Collection::ShoppingMalls],
            Collection::OrderItems => &[Collection::Orders, Collection::Products],
            _ => &[],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        Collection::LOAD_ORDER
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| crate::error::Error::Config(format!("unknown collection '{}'", s)))
    }
}

/// Handle to the relational data store.
///
/// Implementations must make `insert_many` atomic for a single collection:
/// either every record lands or the collection is left unchanged.
pub trait DataStore: Send + Sync {
    /// Trivial connectivity probe.
    fn ping(&self) -> Result<()>;

    fn count(&self, collection: Collection) -> Result<usize>;

    fn read_all(&self, collection: Collection) -> Result<Vec<Record>>;

    /// Remove every record. Returns the number removed.
    fn delete_all(&self, collection: Collection) -> Result<usize>;

    /// Bulk insert into an empty collection.
    fn insert_many(&self, collection: Collection, records: Vec<Record>) -> Result<usize>;

    /// Persist or clear the "restore in progress" mark.
    fn set_restore_pending(&self, pending: bool) -> Result<()>;

    fn restore_pending(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_order_is_reverse_of_load_order() {
        let delete: Vec<_> = Collection::delete_order().collect();
        assert_eq!(delete.first(), Some(&Collection::OrderItems));
        assert_eq!(delete.last(), Some(&Collection::Users));
        assert_eq!(delete.len(), Collection::LOAD_ORDER.len());
    }

    #[test]
    fn test_parents_load_before_children() {
        for (idx, collection) in Collection::LOAD_ORDER.iter().enumerate() {
            for parent in collection.parents() {
                let parent_idx = Collection::LOAD_ORDER
                    .iter()
                    .position(|c| c == parent)
                    .unwrap();
                assert!(parent_idx < idx, "{} must load after {}", collection, parent);
            }
        }
    }

    #[test]
    fn test_collection_names_round_trip() {
        for collection in Collection::LOAD_ORDER {
            assert_eq!(collection.name().parse::<Collection>().unwrap(), collection);
            let json = serde_json::to_string(&collection).unwrap();
            assert_eq!(json, format!("\"{}\"", collection.name()));
        }
        assert!("hotel".parse::<Collection>().is_err());
    }
}
