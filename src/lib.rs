pub mod api_client;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod messaging;
pub mod models;
pub mod rate_limiter;
pub mod retry_scheduler;
pub mod routes;
pub mod store;
pub mod task_store;
pub mod worker_processing;
pub mod worker_registry;
pub mod worker_runtime;
