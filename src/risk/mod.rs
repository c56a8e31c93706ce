// Risk management module
pub mod guards;

pub use guards::{Blocked, RiskLimits};
