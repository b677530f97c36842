//! Catalog Store: durable registry of schemas, targets, device tables,
//! mappings, devices, gateways and jobs.
//!
//! The registry keeps an in-memory mirror guarded by a single mutex and
//! write-through persists every mutation to an embedded SQLite file
//! (`app.db`) under the application folder. Query operations return copies.

pub mod appdb;
pub mod store;

pub use appdb::{app_db_path, app_folder, AppDb};
pub use store::{CatalogStore, NameWarning};
