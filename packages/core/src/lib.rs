// Library root. Exposes internal modules for integration tests in `tests/`.
// Production entry point remains `src/main.rs`.

pub mod alerts;
pub mod api;
pub mod clinical;
pub mod db;
pub mod error;
pub mod metrics;
pub mod repository;
pub mod scheduler;
pub mod schema;
pub mod services;
pub mod sync;

// Binary-only concerns, public so `main.rs` and tests can reach them.
pub mod cli;
pub mod config;
pub mod logging;
