pub mod cache;
pub mod config;
pub mod due_process;
pub mod error;
pub mod models;
pub mod normalize;
pub mod openapi;
pub mod repo;
pub mod retry;
pub mod routes;
pub mod service;
pub mod stats;
pub mod storage;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
pub use service::CaseService;
