//! Hotspot shared infrastructure
//!
//! Pieces used by both the API server and the background worker:
//! central database pool construction, migrations and tracing setup.

pub mod db;
pub mod telemetry;

pub use db::{create_pool, run_migrations, PoolSettings};
pub use telemetry::init_tracing;
