use crate::indicators::{filter_min_distance, peakdetect, zero_phase_filter};
use crate::models::{Bar, Signal, SignalAction, SignalKind};

pub const MIN_WINDOW_LEN: usize = 3;
pub const MAX_WINDOW_LEN: usize = 101;
pub const MIN_LOOKAHEAD: usize = 1;
pub const MAX_LOOKAHEAD: usize = 50;

/// Configuration for turning point detection
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub window_len: usize, // Hann window length, odd
    pub lookahead: usize,  // Samples that must confirm an extremum
    pub delta: f64,        // Minimum amplitude, 0 disables
    pub min_distance: usize,
    pub freshness_threshold: usize, // Max age in bars for a tradeable signal
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_len: 11,
            lookahead: 1,
            delta: 0.0,
            min_distance: 3,
            freshness_threshold: 11,
        }
    }
}

impl DetectorConfig {
    /// Check window length and lookahead against their allowed ranges
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_len % 2 == 0
            || !(MIN_WINDOW_LEN..=MAX_WINDOW_LEN).contains(&self.window_len)
        {
            anyhow::bail!(
                "window_len must be odd and within {}..={}, got {}",
                MIN_WINDOW_LEN,
                MAX_WINDOW_LEN,
                self.window_len
            );
        }
        if !(MIN_LOOKAHEAD..=MAX_LOOKAHEAD).contains(&self.lookahead) {
            anyhow::bail!(
                "lookahead must be within {}..={}, got {}",
                MIN_LOOKAHEAD,
                MAX_LOOKAHEAD,
                self.lookahead
            );
        }
        if !(self.delta >= 0.0) {
            anyhow::bail!("delta must be non-negative, got {}", self.delta);
        }
        Ok(())
    }
}

/// Peaks and troughs found in one bar series, oldest first
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub peaks: Vec<Signal>,
    pub troughs: Vec<Signal>,
    pub total_bars: usize,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty() && self.troughs.is_empty()
    }

    /// Most recent extremum of either kind
    pub fn latest(&self) -> Option<&Signal> {
        self.peaks
            .iter()
            .chain(self.troughs.iter())
            .max_by_key(|s| s.sample_index)
    }

    /// All signals no older than `threshold` bars
    pub fn fresh(&self, threshold: usize) -> Vec<&Signal> {
        let mut fresh: Vec<&Signal> = self
            .peaks
            .iter()
            .chain(self.troughs.iter())
            .filter(|s| s.is_fresh(threshold))
            .collect();
        fresh.sort_by_key(|s| s.sample_index);
        fresh
    }
}

/// Detect peaks and troughs in `bars` with zero delta
pub fn detect(bars: &[Bar], window_len: usize, lookahead: usize, min_distance: usize) -> Detection {
    let config = DetectorConfig {
        window_len,
        lookahead,
        min_distance,
        ..Default::default()
    };
    detect_with(bars, &config)
}

/// Detect peaks and troughs in `bars`
///
/// Closes are smoothed with a zero-phase Hann filter, then extrema are
/// located on the smoothed series. Each reported signal carries the raw
/// close at its index, never the smoothed value.
///
/// Invalid parameters and short series (fewer than `2 * lookahead` bars)
/// yield an empty `Detection` rather than an error, so one bad symbol does
/// not stop a watchlist scan.
pub fn detect_with(bars: &[Bar], config: &DetectorConfig) -> Detection {
    let total_bars = bars.len();
    let empty = Detection {
        total_bars,
        ..Default::default()
    };

    if let Err(e) = config.validate() {
        tracing::warn!("Signal detection skipped: {}", e);
        return empty;
    }

    if total_bars == 0 || total_bars < config.lookahead * 2 {
        tracing::debug!(
            bars = total_bars,
            needed = config.lookahead * 2,
            "Not enough bars to detect peaks"
        );
        return empty;
    }

    let symbol = bars[0].symbol.as_str();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let filtered = zero_phase_filter(&closes, config.window_len);

    let extrema = peakdetect(&filtered, config.lookahead, config.delta);
    let maxima = filter_min_distance(&extrema.maxima, config.min_distance);
    let minima = filter_min_distance(&extrema.minima, config.min_distance);

    let to_signal = |index: usize, kind: SignalKind| Signal {
        symbol: symbol.to_string(),
        kind,
        sample_index: index,
        price: bars[index].close,
        samples_ago: total_bars - 1 - index,
        action: SignalAction::from(kind),
        bar_time: Some(bars[index].timestamp),
    };

    let peaks: Vec<Signal> = maxima
        .iter()
        .filter(|(i, _)| *i < total_bars)
        .map(|(i, _)| to_signal(*i, SignalKind::Peak))
        .collect();
    let troughs: Vec<Signal> = minima
        .iter()
        .filter(|(i, _)| *i < total_bars)
        .map(|(i, _)| to_signal(*i, SignalKind::Trough))
        .collect();

    tracing::debug!(
        symbol,
        peaks = peaks.len(),
        troughs = troughs.len(),
        "Detected turning points"
    );

    Detection {
        peaks,
        troughs,
        total_bars,
    }
}

/// Most recent signal for a bar series, if it is fresh
pub fn latest_signal(bars: &[Bar], config: &DetectorConfig) -> Option<Signal> {
    detect_with(bars, config)
        .latest()
        .filter(|s| s.is_fresh(config.freshness_threshold))
        .cloned()
}

/// Age check: `samples_ago <= threshold`
pub fn is_fresh(signal: &Signal, threshold: usize) -> bool {
    signal.is_fresh(threshold)
}
