pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod model;
pub mod recorder;
pub mod retry;
pub mod store;
