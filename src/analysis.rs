//! Reduction of a populated capture store into per-channel linearity curves.

use log::{info, warn};

use crate::error::LinearityError;
use crate::pulse::{self, PED_END, PED_START};
use crate::store::CaptureReader;

/// Minimum prominence accepted at any pulser DAC setting.
pub const PROMINENCE_FLOOR: f64 = 50.0;
/// Additional prominence required per pulser DAC count.
pub const PROMINENCE_PER_DAC: f64 = 100.0;

/// Detection threshold for a given stimulus level. Larger injected pulses
/// ride on proportionally larger noise, so the threshold scales with the DAC
/// setting but never drops below the floor.
pub fn prominence_for(pulser_dac: u32) -> f64 {
    (PROMINENCE_PER_DAC * pulser_dac as f64).max(PROMINENCE_FLOOR)
}

/// Per-channel mean and RMS pulse height at every stored stimulus level.
/// `mean[ch][k]` and `rms[ch][k]` correspond to `pulser_dacs[k]`; levels are
/// sorted ascending regardless of acquisition order. A channel with no
/// qualifying pulses at a level carries NaN there, not zero.
#[derive(Clone, Debug)]
pub struct LinearityCurves {
    pub pulser_dacs: Vec<u32>,
    pub mean: Vec<Vec<f64>>,
    pub rms: Vec<Vec<f64>>,
}

impl LinearityCurves {
    pub fn num_channels(&self) -> usize {
        self.mean.len()
    }
}

/// Run the pulse analyzer over every stored event and reduce to one curve per
/// channel. Unreadable or oddly named entries degrade that data point with a
/// warning; they never abort the whole analysis.
pub fn analyze_store(reader: &CaptureReader) -> Result<LinearityCurves, LinearityError> {
    let mut dacs: Vec<u32> = Vec::new();
    for name in reader.group_names()? {
        match name.strip_prefix("dac").and_then(|s| s.parse().ok()) {
            Some(dac) => dacs.push(dac),
            None => warn!("ignoring group {name:?}: not a dac<level> name"),
        }
    }
    dacs.sort_unstable();

    // Level-major accumulation, transposed to channel-major at the end.
    let mut mean_per_dac: Vec<Vec<f64>> = Vec::with_capacity(dacs.len());
    let mut rms_per_dac: Vec<Vec<f64>> = Vec::with_capacity(dacs.len());
    let mut num_channels = 0usize;

    for &dac in &dacs {
        info!("analyzing DAC value {dac}");
        let group = reader.group(&format!("dac{dac}"));
        let min_prominence = prominence_for(dac);
        let mut ch_heights: Vec<Vec<f64>> = Vec::new();
        let mut names = group.dataset_names()?;
        names.sort_by_key(|n| n.strip_prefix("ev").and_then(|s| s.parse::<usize>().ok()));
        for name in &names {
            let event = match group.read_dataset(name) {
                Ok(event) => event,
                Err(err) => {
                    warn!("skipping dataset {name:?} at dac{dac}: {err}");
                    continue;
                }
            };
            if ch_heights.len() < event.nrows() {
                ch_heights.resize(event.nrows(), Vec::new());
            }
            for (ch, row) in event.rows().into_iter().enumerate() {
                let wave = row.to_vec();
                let heights = pulse::pulse_heights(&wave, PED_START, PED_END, min_prominence);
                ch_heights[ch].extend(heights);
            }
        }
        num_channels = num_channels.max(ch_heights.len());
        let (means, rmss): (Vec<f64>, Vec<f64>) =
            ch_heights.iter().map(|h| mean_and_std(h)).unzip();
        mean_per_dac.push(means);
        rms_per_dac.push(rmss);
    }

    let mut mean = vec![Vec::with_capacity(dacs.len()); num_channels];
    let mut rms = vec![Vec::with_capacity(dacs.len()); num_channels];
    for (per_dac_mean, per_dac_rms) in mean_per_dac.iter().zip(&rms_per_dac) {
        for ch in 0..num_channels {
            mean[ch].push(per_dac_mean.get(ch).copied().unwrap_or(f64::NAN));
            rms[ch].push(per_dac_rms.get(ch).copied().unwrap_or(f64::NAN));
        }
    }

    Ok(LinearityCurves {
        pulser_dacs: dacs,
        mean,
        rms,
    })
}

/// Mean and population standard deviation; NaN for an empty sample set so
/// "no qualifying pulses" is distinguishable from a zero response.
fn mean_and_std(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance = samples
        .iter()
        .map(|v| {
            let delta = v - mean;
            delta * delta
        })
        .sum::<f64>()
        / samples.len() as f64;
    (mean, variance.sqrt())
}
