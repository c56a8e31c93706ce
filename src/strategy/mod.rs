// Turning point signal detection
pub mod signals;

pub use signals::{detect, detect_with, is_fresh, latest_signal, Detection, DetectorConfig};
