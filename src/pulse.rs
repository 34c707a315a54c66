//! Pulse detection and height measurement for a single channel waveform.
//!
//! Peaks are selected by topographic prominence rather than a plain threshold
//! crossing, so noise bumps and shoulder peaks that do not stand out from
//! their surroundings are rejected. Each surviving peak is corrected by the
//! mean of a pre-peak baseline window, which makes the height measurement
//! insensitive to slow baseline drift.

/// Default baseline window start, relative to the peak.
pub const PED_START: i64 = -100;
/// Default baseline window end, relative to the peak (exclusive).
pub const PED_END: i64 = -15;

/// Indices of local maxima whose prominence is at least `min_prominence`.
///
/// Prominence of a peak is its height above the higher of the two lowest
/// points reached while descending to the nearest strictly-higher sample (or
/// the signal border) on either side. Flat-topped peaks report the middle
/// sample of the plateau.
pub fn find_peaks(wave: &[i16], min_prominence: f64) -> Vec<usize> {
    local_maxima(wave)
        .into_iter()
        .filter(|&peak| prominence(wave, peak) >= min_prominence)
        .collect()
}

/// Corrected pulse heights for one waveform. Never fails; a waveform with no
/// qualifying peaks yields an empty list. Peaks too close to the start of the
/// trace for a full baseline window are dropped.
///
/// The baseline window is `[peak + ped_start, peak + ped_end)` with both
/// offsets negative.
pub fn pulse_heights(
    wave: &[i16],
    ped_start: i64,
    ped_end: i64,
    min_prominence: f64,
) -> Vec<f64> {
    if ped_start >= ped_end || ped_end > 0 {
        return Vec::new();
    }
    let mut heights = Vec::new();
    for peak in find_peaks(wave, min_prominence) {
        if (peak as i64) < -ped_start {
            continue;
        }
        let lo = (peak as i64 + ped_start) as usize;
        let hi = (peak as i64 + ped_end) as usize;
        let window = &wave[lo..hi];
        let baseline = window.iter().map(|&v| v as f64).sum::<f64>() / window.len() as f64;
        heights.push(wave[peak] as f64 - baseline);
    }
    heights
}

fn local_maxima(wave: &[i16]) -> Vec<usize> {
    let mut maxima = Vec::new();
    let n = wave.len();
    let mut i = 1;
    while n >= 2 && i < n - 1 {
        if wave[i - 1] < wave[i] {
            // Scan over a possible plateau.
            let mut ahead = i + 1;
            while ahead < n - 1 && wave[ahead] == wave[i] {
                ahead += 1;
            }
            if wave[ahead] < wave[i] {
                maxima.push((i + ahead - 1) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    maxima
}

fn prominence(wave: &[i16], peak: usize) -> f64 {
    let height = wave[peak];

    let mut left_min = height;
    let mut i = peak;
    while i > 0 && wave[i - 1] <= height {
        i -= 1;
        left_min = left_min.min(wave[i]);
    }

    let mut right_min = height;
    let mut j = peak;
    while j + 1 < wave.len() && wave[j + 1] <= height {
        j += 1;
        right_min = right_min.min(wave[j]);
    }

    (height - left_min.max(right_min)) as f64
}
