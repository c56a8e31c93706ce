/// Local maxima and minima found in a series, as `(index, value)` pairs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extrema {
    pub maxima: Vec<(usize, f64)>,
    pub minima: Vec<(usize, f64)>,
}

impl Extrema {
    pub fn is_empty(&self) -> bool {
        self.maxima.is_empty() && self.minima.is_empty()
    }
}

/// Detect local extrema with a lookahead confirmation distance
///
/// A maximum candidate is accepted once the series has dropped below it by
/// more than `delta` and none of the `lookahead` samples starting at the
/// current position exceed it; minima are symmetric. Detection alternates:
/// after a maximum only a minimum can be found next, and vice versa.
///
/// The very first extremum found is always dropped. The search starts with
/// no candidate, so whichever extremum it confirms first is anchored on
/// the opening sample rather than on a real turn in the series.
///
/// Returns empty results when `lookahead` is zero, `delta` is negative, or
/// the series is no longer than `lookahead`.
pub fn peakdetect(y: &[f64], lookahead: usize, delta: f64) -> Extrema {
    let mut extrema = Extrema::default();

    if lookahead < 1 || !(delta >= 0.0) || y.len() <= lookahead {
        return extrema;
    }

    // Kind of each hit in order found, true for a maximum
    let mut hits: Vec<bool> = Vec::new();

    let mut mx = f64::NEG_INFINITY;
    let mut mn = f64::INFINITY;
    let mut mx_pos = 0usize;
    let mut mn_pos = 0usize;

    for index in 0..y.len() - lookahead {
        let value = y[index];

        if value > mx {
            mx = value;
            mx_pos = index;
        }
        if value < mn {
            mn = value;
            mn_pos = index;
        }

        let ahead = &y[index..index + lookahead];

        if value < mx - delta && mx != f64::INFINITY {
            let ahead_max = ahead.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if ahead_max < mx {
                extrema.maxima.push((mx_pos, mx));
                hits.push(true);
                // Only a minimum may follow
                mx = f64::INFINITY;
                mn = f64::INFINITY;
                continue;
            }
        }

        if value > mn + delta && mn != f64::NEG_INFINITY {
            let ahead_min = ahead.iter().copied().fold(f64::INFINITY, f64::min);
            if ahead_min > mn {
                extrema.minima.push((mn_pos, mn));
                hits.push(false);
                // Only a maximum may follow
                mn = f64::NEG_INFINITY;
                mx = f64::NEG_INFINITY;
            }
        }
    }

    match hits.first() {
        Some(true) => {
            extrema.maxima.remove(0);
        }
        Some(false) => {
            extrema.minima.remove(0);
        }
        None => {}
    }

    extrema
}

/// Drop extrema that sit closer than `min_distance` samples to the
/// previously kept one, keeping the earliest. A distance of 0 or 1 keeps all.
pub fn filter_min_distance(points: &[(usize, f64)], min_distance: usize) -> Vec<(usize, f64)> {
    if min_distance <= 1 {
        return points.to_vec();
    }

    let mut kept: Vec<(usize, f64)> = Vec::with_capacity(points.len());
    for &(index, value) in points {
        match kept.last() {
            Some(&(last_index, _)) if index - last_index < min_distance => {}
            _ => kept.push((index, value)),
        }
    }
    kept
}
