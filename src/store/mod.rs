//! Record store adapter: typed reads and writes over the site, lot, phase,
//! message, material-request, device, and queue collections. No business
//! logic lives here.

pub mod db;
pub mod models;

pub use db::{DbHandle, NewMaterialRequest, StoreDb};
pub use models::*;
