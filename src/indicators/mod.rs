// Signal processing primitives
// Zero-phase smoothing and lookahead extremum detection

pub mod peakdetect;
pub mod zero_phase;

pub use peakdetect::{filter_min_distance, peakdetect, Extrema};
pub use zero_phase::{effective_window, hann_window, zero_phase_filter};
