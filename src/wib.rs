use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::LinearityError;

/// Number of FEMB slots on a WIB. Requests always describe every slot;
/// unused slots are explicitly disabled.
pub const NUM_FEMB_SLOTS: usize = 4;
/// Channels read out per FEMB (2 COLDATA x 64).
pub const CHANNELS_PER_FEMB: usize = 128;

/// Per-FEMB front-end settings, one per slot of a [`ConfigureRequest`].
#[derive(Clone, Debug, Serialize)]
pub struct FembConfig {
    pub enabled: bool,
    pub test_cap: bool,
    pub gain: u32,
    pub peak_time: u32,
    pub baseline: u32,
    pub pulse_dac: u32,
    pub leak: u32,
    pub leak_10x: bool,
    pub ac_couple: bool,
    pub buffer: u32,
    pub strobe_skip: u32,
    pub strobe_delay: u32,
    pub strobe_length: u32,
}

impl FembConfig {
    fn disabled() -> Self {
        Self {
            enabled: false,
            test_cap: false,
            gain: 0,
            peak_time: 0,
            baseline: 0,
            pulse_dac: 0,
            leak: 0,
            leak_10x: false,
            ac_couple: false,
            buffer: 0,
            strobe_skip: 0,
            strobe_delay: 0,
            strobe_length: 0,
        }
    }

    /// Fixed calibration settings for a pulser run: test capacitor in,
    /// lowest gain/peaking time, AC coupled, strobe registers maxed.
    fn pulser(pulse_dac: u32) -> Self {
        Self {
            enabled: true,
            test_cap: true,
            gain: 0,
            peak_time: 0,
            baseline: 0,
            pulse_dac,
            leak: 0,
            leak_10x: false,
            ac_couple: true,
            buffer: 1,
            strobe_skip: 255,
            strobe_delay: 255,
            strobe_length: 255,
        }
    }
}

/// Full WIB configuration request for one stimulus level.
#[derive(Clone, Debug, Serialize)]
pub struct ConfigureRequest {
    pub cold: bool,
    pub pulser: bool,
    pub fembs: Vec<FembConfig>,
}

impl ConfigureRequest {
    /// Build a pulser-run request with the first `num_fembs` slots enabled at
    /// amplitude `pulse_dac`. FEMBs are assumed to be connected sequentially
    /// starting at slot 0; the remaining slots are disabled.
    pub fn pulser_run(pulse_dac: u32, num_fembs: usize, cold: bool) -> Self {
        let fembs = (0..NUM_FEMB_SLOTS)
            .map(|slot| {
                if slot < num_fembs {
                    FembConfig::pulser(pulse_dac)
                } else {
                    FembConfig::disabled()
                }
            })
            .collect();
        Self {
            cold,
            pulser: true,
            fembs,
        }
    }

    pub fn enabled_fembs(&self) -> usize {
        self.fembs.iter().filter(|f| f.enabled).count()
    }
}

/// One spy-buffer readout: frame timestamps plus a `(channel, tick)` sample
/// array per enabled FEMB, all captured at the same acquisition instant.
#[derive(Clone, Debug)]
pub struct Acquisition {
    pub timestamps: Vec<u64>,
    pub fembs: Vec<Array2<i16>>,
}

/// Capability interface to a WIB: submit a configuration, read out the spy
/// buffer. Any transport (or a simulator) can sit behind this.
pub trait WibClient {
    fn configure(&mut self, req: &ConfigureRequest) -> Result<(), LinearityError>;

    /// Fill and read the spy buffers. `buf1` requests the second buffer,
    /// needed when FEMB 2 or 3 is enabled.
    fn acquire(&mut self, buf1: bool) -> Result<Acquisition, LinearityError>;
}

/// Deterministic FEMB front-end simulator. Every enabled FEMB produces 128
/// channels of noisy baseline with periodic bipolar calibration pulses whose
/// amplitude scales with the configured pulser DAC. Fault injection hooks
/// allow exercising the abort paths of a sweep.
pub struct SimulatedWib {
    rng: StdRng,
    samples_per_channel: usize,
    config: Option<ConfigureRequest>,
    configure_calls: usize,
    acquire_calls: usize,
    fail_configure_at: Option<usize>,
    fail_acquire_at: Option<usize>,
    timestamp: u64,
}

/// ADC counts of positive lobe per pulser DAC count.
const SIM_GAIN_POS: f64 = 80.0;
/// ADC counts of undershoot per pulser DAC count.
const SIM_GAIN_NEG: f64 = 60.0;
const SIM_PEDESTAL: i16 = 900;
const SIM_FIRST_PULSE: usize = 200;
const SIM_PULSE_PERIOD: usize = 500;
/// Ticks in one spy-buffer readout.
const SIM_SPY_SAMPLES: usize = 2184;

impl SimulatedWib {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            samples_per_channel: SIM_SPY_SAMPLES,
            config: None,
            configure_calls: 0,
            acquire_calls: 0,
            fail_configure_at: None,
            fail_acquire_at: None,
            timestamp: 0,
        }
    }

    /// Shorten the synthesized waveforms (tests mostly need one pulse).
    #[cfg(test)]
    pub fn with_samples_per_channel(mut self, samples: usize) -> Self {
        self.samples_per_channel = samples;
        self
    }

    /// Reject the n-th configure call (0-based).
    #[cfg(test)]
    pub fn fail_configure_at(mut self, call: usize) -> Self {
        self.fail_configure_at = Some(call);
        self
    }

    /// Return no data on the n-th acquire call (0-based).
    #[cfg(test)]
    pub fn fail_acquire_at(mut self, call: usize) -> Self {
        self.fail_acquire_at = Some(call);
        self
    }

    fn synth_femb(&mut self, pulse_dac: u32) -> Array2<i16> {
        let ticks = self.samples_per_channel;
        let mut femb = Array2::zeros((CHANNELS_PER_FEMB, ticks));
        let pos = SIM_GAIN_POS * pulse_dac as f64;
        let neg = SIM_GAIN_NEG * pulse_dac as f64;
        for ch in 0..CHANNELS_PER_FEMB {
            // Small per-channel pedestal spread, like real front-ends show.
            let pedestal = (SIM_PEDESTAL + (ch % 7) as i16) as f64;
            let mut wave: Vec<f64> = (0..ticks)
                .map(|_| pedestal + self.rng.gen_range(-3..=3) as f64)
                .collect();
            if pulse_dac > 0 {
                let mut peak = SIM_FIRST_PULSE;
                while peak + 16 < ticks {
                    wave[peak - 1] += pos * 0.5;
                    wave[peak] += pos;
                    wave[peak + 1] += pos * 0.5;
                    // Undershoot of the AC-coupled bipolar response.
                    for k in 0..10usize {
                        wave[peak + 4 + k] -= neg * (10 - k) as f64 / 10.0;
                    }
                    peak += SIM_PULSE_PERIOD;
                }
            }
            for (t, v) in wave.into_iter().enumerate() {
                femb[[ch, t]] = v.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            }
        }
        femb
    }
}

impl WibClient for SimulatedWib {
    fn configure(&mut self, req: &ConfigureRequest) -> Result<(), LinearityError> {
        let call = self.configure_calls;
        self.configure_calls += 1;
        if self.fail_configure_at == Some(call) {
            return Err(LinearityError::ConfigRejected);
        }
        if req.fembs.len() != NUM_FEMB_SLOTS {
            return Err(LinearityError::ConfigRejected);
        }
        self.config = Some(req.clone());
        Ok(())
    }

    fn acquire(&mut self, _buf1: bool) -> Result<Acquisition, LinearityError> {
        let call = self.acquire_calls;
        self.acquire_calls += 1;
        if self.fail_acquire_at == Some(call) {
            return Err(LinearityError::AcquisitionFailed);
        }
        let config = self
            .config
            .take()
            .ok_or(LinearityError::AcquisitionFailed)?;
        let dacs: Vec<u32> = config
            .fembs
            .iter()
            .filter(|f| f.enabled)
            .map(|f| f.pulse_dac)
            .collect();
        let fembs = dacs.into_iter().map(|dac| self.synth_femb(dac)).collect();
        let t0 = self.timestamp;
        self.timestamp += self.samples_per_channel as u64;
        let timestamps = (0..self.samples_per_channel as u64)
            .map(|i| t0 + i)
            .collect();
        self.config = Some(config);
        Ok(Acquisition { timestamps, fembs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulser_run_disables_unused_slots() {
        let req = ConfigureRequest::pulser_run(12, 2, false);
        assert_eq!(req.fembs.len(), NUM_FEMB_SLOTS);
        assert_eq!(req.enabled_fembs(), 2);
        assert!(req.fembs[0].enabled && req.fembs[1].enabled);
        assert!(!req.fembs[2].enabled && !req.fembs[3].enabled);
        assert_eq!(req.fembs[1].pulse_dac, 12);
        assert!(req.fembs[1].test_cap && req.fembs[1].ac_couple);
        assert_eq!(req.fembs[3].pulse_dac, 0);
    }

    #[test]
    fn simulator_yields_one_array_per_enabled_femb() {
        let mut wib = SimulatedWib::new(7).with_samples_per_channel(256);
        wib.configure(&ConfigureRequest::pulser_run(5, 3, false))
            .unwrap();
        let acq = wib.acquire(true).unwrap();
        assert_eq!(acq.fembs.len(), 3);
        for femb in &acq.fembs {
            assert_eq!(femb.dim(), (CHANNELS_PER_FEMB, 256));
        }
        assert_eq!(acq.timestamps.len(), 256);
    }

    #[test]
    fn simulator_fault_injection() {
        let mut wib = SimulatedWib::new(0).fail_configure_at(0);
        let err = wib
            .configure(&ConfigureRequest::pulser_run(0, 1, false))
            .unwrap_err();
        assert!(matches!(err, LinearityError::ConfigRejected));

        let mut wib = SimulatedWib::new(0)
            .with_samples_per_channel(64)
            .fail_acquire_at(1);
        wib.configure(&ConfigureRequest::pulser_run(0, 1, false))
            .unwrap();
        assert!(wib.acquire(false).is_ok());
        let err = wib.acquire(false).unwrap_err();
        assert!(matches!(err, LinearityError::AcquisitionFailed));
    }

    #[test]
    fn acquire_without_configure_is_a_failure() {
        let mut wib = SimulatedWib::new(0);
        assert!(matches!(
            wib.acquire(false),
            Err(LinearityError::AcquisitionFailed)
        ));
    }
}
