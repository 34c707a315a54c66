//! Pulser sweep: step the calibration DAC through a sequence of levels and
//! persist every acquisition into one capture store per FEMB under test.

use std::path::PathBuf;

use log::{debug, info};

use crate::error::LinearityError;
use crate::store::CaptureWriter;
use crate::wib::{ConfigureRequest, WibClient, NUM_FEMB_SLOTS};

/// Parameters of one linearity sweep.
#[derive(Clone, Debug)]
pub struct SweepPlan {
    /// Pulser DAC settings, visited in the order given here.
    pub pulser_dacs: Vec<u32>,
    pub acquisitions_per_dac: usize,
    pub cold: bool,
}

impl Default for SweepPlan {
    fn default() -> Self {
        Self {
            pulser_dacs: vec![0, 5, 10, 15, 20],
            acquisitions_per_dac: 20,
            cold: false,
        }
    }
}

/// Drive the WIB through `plan` and populate one capture store per
/// destination. One acquire call yields data for every enabled FEMB at the
/// same instant, fanned out so event `i` lines up across all destinations.
///
/// Any configure or acquire failure aborts the whole run; measurement points
/// already flushed stay readable, and every store is closed on all exit paths
/// (writers hold no long-lived handles, each dataset is closed as written).
pub fn run_sweep<W: WibClient>(
    wib: &mut W,
    destinations: &[PathBuf],
    plan: &SweepPlan,
) -> Result<(), LinearityError> {
    if destinations.is_empty() || destinations.len() > NUM_FEMB_SLOTS {
        return Err(LinearityError::DestinationCount(destinations.len()));
    }
    let mut writers = destinations
        .iter()
        .map(CaptureWriter::create)
        .collect::<Result<Vec<_>, _>>()?;
    // FEMB 2 and 3 are read out through the second spy buffer.
    let buf1 = destinations.len() > 2;

    for &dac in &plan.pulser_dacs {
        let req = ConfigureRequest::pulser_run(dac, writers.len(), plan.cold);
        info!(
            "configuring WIB with {} FEMBs for pulser run with DAC value {dac}",
            req.enabled_fembs()
        );
        wib.configure(&req)?;

        let mut groups = writers
            .iter_mut()
            .map(|w| w.create_group(&format!("dac{dac}")))
            .collect::<Result<Vec<_>, _>>()?;

        for ev in 0..plan.acquisitions_per_dac {
            let acq = wib.acquire(buf1)?;
            debug!(
                "event {ev} at dac{dac}: first frame timestamp {:?}",
                acq.timestamps.first()
            );
            if acq.fembs.len() < groups.len() {
                return Err(LinearityError::FembMismatch {
                    expected: groups.len(),
                    actual: acq.fembs.len(),
                });
            }
            for (group, samples) in groups.iter_mut().zip(&acq.fembs) {
                group.write_dataset(&format!("ev{ev}"), samples)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CaptureReader;
    use crate::wib::{SimulatedWib, CHANNELS_PER_FEMB};

    fn destinations(dir: &std::path::Path, count: usize) -> Vec<PathBuf> {
        (0..count).map(|i| dir.join(format!("femb{i}"))).collect()
    }

    #[test]
    fn sweep_populates_every_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dests = destinations(dir.path(), 3);
        let mut wib = SimulatedWib::new(42).with_samples_per_channel(600);
        let plan = SweepPlan {
            pulser_dacs: vec![0, 5, 10],
            acquisitions_per_dac: 2,
            cold: false,
        };
        run_sweep(&mut wib, &dests, &plan).unwrap();

        for dest in &dests {
            let reader = CaptureReader::open(dest).unwrap();
            let mut groups = reader.group_names().unwrap();
            groups.sort();
            assert_eq!(groups, vec!["dac0", "dac10", "dac5"]);
            for name in groups {
                let group = reader.group(&name);
                let mut events = group.dataset_names().unwrap();
                events.sort();
                assert_eq!(events, vec!["ev0", "ev1"]);
                for ev in events {
                    let data = group.read_dataset(&ev).unwrap();
                    assert_eq!(data.dim(), (CHANNELS_PER_FEMB, 600));
                }
            }
        }
    }

    #[test]
    fn configure_failure_aborts_but_keeps_flushed_levels() {
        let dir = tempfile::tempdir().unwrap();
        let dests = destinations(dir.path(), 2);
        // Second stimulus level of three is rejected.
        let mut wib = SimulatedWib::new(1)
            .with_samples_per_channel(600)
            .fail_configure_at(1);
        let plan = SweepPlan {
            pulser_dacs: vec![0, 5, 10],
            acquisitions_per_dac: 2,
            cold: false,
        };
        let err = run_sweep(&mut wib, &dests, &plan).unwrap_err();
        assert!(matches!(err, LinearityError::ConfigRejected));

        // The first level's data is persisted and readable in every store.
        for dest in &dests {
            let reader = CaptureReader::open(dest).unwrap();
            assert_eq!(reader.group_names().unwrap(), vec!["dac0"]);
            let group = reader.group("dac0");
            assert_eq!(group.dataset_names().unwrap().len(), 2);
            let data = group.read_dataset("ev0").unwrap();
            assert_eq!(data.dim(), (CHANNELS_PER_FEMB, 600));
        }
    }

    #[test]
    fn acquire_failure_aborts_mid_level() {
        let dir = tempfile::tempdir().unwrap();
        let dests = destinations(dir.path(), 1);
        let mut wib = SimulatedWib::new(1)
            .with_samples_per_channel(600)
            .fail_acquire_at(3);
        let plan = SweepPlan {
            pulser_dacs: vec![0, 5],
            acquisitions_per_dac: 2,
            cold: false,
        };
        let err = run_sweep(&mut wib, &dests, &plan).unwrap_err();
        assert!(matches!(err, LinearityError::AcquisitionFailed));

        let reader = CaptureReader::open(&dests[0]).unwrap();
        let mut groups = reader.group_names().unwrap();
        groups.sort();
        // dac5 exists but holds only the event flushed before the failure.
        assert_eq!(groups, vec!["dac0", "dac5"]);
        assert_eq!(reader.group("dac0").dataset_names().unwrap().len(), 2);
        assert_eq!(reader.group("dac5").dataset_names().unwrap().len(), 1);
    }

    #[test]
    fn destination_count_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut wib = SimulatedWib::new(0);
        let plan = SweepPlan::default();
        assert!(matches!(
            run_sweep(&mut wib, &[], &plan),
            Err(LinearityError::DestinationCount(0))
        ));
        let too_many = destinations(dir.path(), 5);
        assert!(matches!(
            run_sweep(&mut wib, &too_many, &plan),
            Err(LinearityError::DestinationCount(5))
        ));
    }

    #[test]
    fn simulated_sweep_round_trips_through_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let dests = destinations(dir.path(), 1);
        let mut wib = SimulatedWib::new(9).with_samples_per_channel(1400);
        let plan = SweepPlan {
            pulser_dacs: vec![10, 5],
            acquisitions_per_dac: 2,
            cold: false,
        };
        run_sweep(&mut wib, &dests, &plan).unwrap();

        let reader = CaptureReader::open(&dests[0]).unwrap();
        let curves = crate::analysis::analyze_store(&reader).unwrap();
        assert_eq!(curves.pulser_dacs, vec![5, 10]);
        assert_eq!(curves.num_channels(), CHANNELS_PER_FEMB);
        for ch in 0..CHANNELS_PER_FEMB {
            let at5 = curves.mean[ch][0];
            let at10 = curves.mean[ch][1];
            assert!(at5.is_finite() && at10.is_finite());
            // The simulated front end is linear in the DAC setting.
            assert!(at10 > at5);
        }
    }
}
