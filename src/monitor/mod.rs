// Watchlist and the multi-rate monitoring service
pub mod service;
pub mod watchlist;

pub use service::{MonitorConfig, MonitorService, ServiceStatus};
pub use watchlist::{Watchlist, WatchlistChange};
