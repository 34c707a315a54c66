use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide error type. Pulse analysis itself never fails; a waveform with
/// no qualifying peaks is an empty result, not an error.
#[derive(Debug, Error)]
pub enum LinearityError {
    #[error("WIB rejected the configuration request; see the WIB log for details")]
    ConfigRejected,
    #[error("WIB returned no data for the acquisition; see the WIB log for details")]
    AcquisitionFailed,
    #[error("no WIB transport backend is compiled in; pass --simulate or supply a WibClient implementation")]
    TransportUnavailable,
    #[error("expected between 1 and 4 output destinations, got {0}")]
    DestinationCount(usize),
    #[error("acquisition carried {actual} FEMB payloads but {expected} destinations are open")]
    FembMismatch { expected: usize, actual: usize },
    #[error("storage error: {0}")]
    Store(#[from] std::io::Error),
    #[error("corrupt capture store at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to render plot: {0}")]
    Plot(String),
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for LinearityError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        LinearityError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for LinearityError {
    fn from(value: image::ImageError) -> Self {
        LinearityError::Plot(value.to_string())
    }
}
