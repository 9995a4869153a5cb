//! Database access
//!
//! Query functions take a `&mut PgConnection` so the same code runs on a
//! pooled connection or inside a transaction (`&mut *tx`).

pub mod external;
pub mod forms;
pub mod nominations;
pub mod periods;
pub mod pool;
pub mod staff;

pub use pool::{create_pool, run_migrations};
