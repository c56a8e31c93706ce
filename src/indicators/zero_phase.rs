/// Smallest input the filter will touch; shorter series are returned as-is
const MIN_FILTER_LEN: usize = 5;

/// Normalized Hann window of length `window_len` (coefficients sum to 1)
pub fn hann_window(window_len: usize) -> Vec<f64> {
    if window_len < 2 {
        return vec![1.0; window_len];
    }

    let denom = (window_len - 1) as f64;
    let raw: Vec<f64> = (0..window_len)
        .map(|n| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * n as f64 / denom).cos())
        .collect();

    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / sum).collect()
}

/// Window length actually applied to a series of `len` samples.
///
/// Short series shrink the window to `len / 3` (odd, never below 3) so the
/// filter always has room for its edge extension.
pub fn effective_window(len: usize, window_len: usize) -> usize {
    let mut window = window_len.max(3);

    if len < window * 3 {
        window = (len / 3).max(3);
        if window % 2 == 0 {
            window -= 1;
        }
    }

    if window % 2 == 0 {
        window += 1;
    }

    window
}

/// Zero-phase low-pass filter of `data` with a normalized Hann window
///
/// The window is run forward and then backward over an edge-padded copy of
/// the data, so the output is smoothed without any index shift: an extremum
/// at sample `k` of a symmetric input stays at sample `k`.
///
/// Series shorter than 5 samples are returned unchanged.
pub fn zero_phase_filter(data: &[f64], window_len: usize) -> Vec<f64> {
    if data.len() < MIN_FILTER_LEN {
        return data.to_vec();
    }

    let window = effective_window(data.len(), window_len);
    let kernel = hann_window(window);

    // Edge padding before the filter's own odd extension
    let pad = window / 2;
    let first = data[0];
    let last = data[data.len() - 1];
    let mut padded = Vec::with_capacity(data.len() + 2 * pad);
    padded.extend(std::iter::repeat(first).take(pad));
    padded.extend_from_slice(data);
    padded.extend(std::iter::repeat(last).take(pad));

    let filtered = filtfilt(&kernel, &padded);
    filtered[pad..pad + data.len()].to_vec()
}

/// Forward-backward FIR filter with odd extension at both ends
fn filtfilt(kernel: &[f64], data: &[f64]) -> Vec<f64> {
    let len = data.len();
    if len == 0 {
        return Vec::new();
    }

    let padlen = (3 * kernel.len()).min(len - 1);
    let first = data[0];
    let last = data[len - 1];

    let mut extended = Vec::with_capacity(len + 2 * padlen);
    for i in (1..=padlen).rev() {
        extended.push(2.0 * first - data[i]);
    }
    extended.extend_from_slice(data);
    for i in 1..=padlen {
        extended.push(2.0 * last - data[len - 1 - i]);
    }

    let forward = fir_steady_state(kernel, &extended);
    let reversed: Vec<f64> = forward.into_iter().rev().collect();
    let mut backward = fir_steady_state(kernel, &reversed);
    backward.reverse();

    backward[padlen..padlen + len].to_vec()
}

/// Causal FIR pass that treats every sample before the start as equal to
/// the first sample (steady-state initial conditions)
fn fir_steady_state(kernel: &[f64], input: &[f64]) -> Vec<f64> {
    let Some(&initial) = input.first() else {
        return Vec::new();
    };

    (0..input.len())
        .map(|n| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, coeff)| {
                    let sample = if n >= k { input[n - k] } else { initial };
                    coeff * sample
                })
                .sum()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_hann_window_normalized() {
        let window = hann_window(11);
        assert_eq!(window.len(), 11);
        assert!(approx(window.iter().sum::<f64>(), 1.0));
        // Symmetric with zero endpoints
        assert!(approx(window[0], 0.0));
        assert!(approx(window[10], 0.0));
        for i in 0..11 {
            assert!(approx(window[i], window[10 - i]));
        }
    }

    #[test]
    fn test_window_of_three_is_identity() {
        let data = vec![10.0, 11.0, 12.0, 11.0, 10.0, 9.0, 8.0, 9.0, 10.0, 11.0];
        let filtered = zero_phase_filter(&data, 3);

        assert_eq!(filtered.len(), data.len());
        for (a, b) in filtered.iter().zip(data.iter()) {
            assert!(approx(*a, *b), "{} != {}", a, b);
        }
    }

    #[test]
    fn test_short_series_returned_unchanged() {
        let data = vec![1.0, 5.0, 2.0, 8.0];
        assert_eq!(zero_phase_filter(&data, 11), data);
    }

    #[test]
    fn test_constant_series_preserved() {
        let data = vec![42.0; 60];
        let filtered = zero_phase_filter(&data, 11);
        assert!(filtered.iter().all(|v| approx(*v, 42.0)));
    }

    #[test]
    fn test_effective_window_shrinks() {
        assert_eq!(effective_window(200, 11), 11);
        assert_eq!(effective_window(30, 11), 9);
        assert_eq!(effective_window(12, 11), 3);
        assert_eq!(effective_window(6, 11), 3);
        assert_eq!(effective_window(100, 10), 11);
    }

    #[test]
    fn test_filter_reduces_noise() {
        let data: Vec<f64> = (0..120)
            .map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let filtered = zero_phase_filter(&data, 11);

        // Alternating noise is almost entirely removed away from the edges
        for value in &filtered[20..100] {
            assert!((value - 100.0).abs() < 0.05, "residual {}", value);
        }
    }

    #[test]
    fn test_no_phase_shift_on_symmetric_bump() {
        let data: Vec<f64> = (0..81)
            .map(|i| {
                let d = i as f64 - 40.0;
                100.0 + 10.0 * (-d * d / 50.0).exp()
            })
            .collect();
        let filtered = zero_phase_filter(&data, 11);

        let argmax = filtered
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
            .0;
        assert_eq!(argmax, 40);
    }
}
