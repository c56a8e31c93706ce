// Core modules
pub mod alerts;
pub mod api;
pub mod config;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod monitor;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use api::{BrokerApi, BrokerError};
pub use models::*;
