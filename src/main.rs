mod analysis;
mod error;
mod plot;
mod pulse;
mod store;
mod sweep;
mod wib;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use crate::error::LinearityError;
use crate::store::CaptureReader;
use crate::sweep::{run_sweep, SweepPlan};
use crate::wib::SimulatedWib;

/// Acquire FEMB pulser data and/or produce ADC linearity plots.
#[derive(Parser)]
#[command(name = "femb-linearity", version, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire pulser data from a WIB spy buffer into capture stores
    Acquire {
        /// Address of the wib_server to connect to
        #[arg(short = 'w', long, default_value = "127.0.0.1")]
        wib_server: String,
        /// Load the cold FEMB configuration [default: warm]
        #[arg(short, long)]
        cold: bool,
        /// Number of acquisitions per pulser DAC setting
        #[arg(short, long, default_value_t = 20)]
        nacq: usize,
        /// Pulser DAC settings to sweep, in acquisition order
        #[arg(long, value_delimiter = ',', default_values_t = [0u32, 5, 10, 15, 20])]
        dacs: Vec<u32>,
        /// Run against the built-in FEMB front-end simulator instead of a WIB
        #[arg(long)]
        simulate: bool,
        /// Capture store path per FEMB to acquire data for (1 to 4)
        #[arg(required = true, num_args = 1..=4)]
        femb_data: Vec<PathBuf>,
    },
    /// Analyze a capture store and render linearity plots
    Analyze {
        /// Capture store holding FEMB pulser data
        femb_data: PathBuf,
        /// Directory to write the ADC linearity plots into
        plot_loc: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().cmd {
        Command::Acquire {
            wib_server,
            cold,
            nacq,
            dacs,
            simulate,
            femb_data,
        } => {
            let plan = SweepPlan {
                pulser_dacs: dacs,
                acquisitions_per_dac: nacq,
                cold,
            };
            if !simulate {
                return Err(LinearityError::TransportUnavailable)
                    .with_context(|| format!("cannot drive the WIB at {wib_server}"));
            }
            info!("running pulser sweep against the FEMB simulator");
            let mut wib = SimulatedWib::new(rand::random());
            run_sweep(&mut wib, &femb_data, &plan).context("pulser sweep failed")?;
            info!("sweep complete: {} capture store(s) written", femb_data.len());
            Ok(())
        }
        Command::Analyze {
            femb_data,
            plot_loc,
        } => {
            let reader = CaptureReader::open(&femb_data)
                .with_context(|| format!("cannot open capture store {}", femb_data.display()))?;
            let curves = analysis::analyze_store(&reader).context("analysis failed")?;
            let written = plot::render_curves(&curves, &plot_loc).context("plotting failed")?;
            for path in &written {
                info!("wrote {}", path.display());
            }
            Ok(())
        }
    }
}
