//! Station catalog: inventory records, selection predicates and resolution
//!
//! This module turns the portal's raw station inventory and a request's
//! selection into the deduplicated, ordered station list that batches are cut from.

mod geo;
mod inventory;
mod resolver;
mod station;

pub use geo::great_circle_km;
pub use inventory::{CachedInventory, InventorySource, Network};
pub use resolver::resolve;
pub use station::{DeviceType, InventoryStation, SelectedStation};
