//! Rendering of linearity curves: one PNG per 16-channel block (one COLDADC),
//! mean pulse height vs pulser DAC with RMS error bars.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use log::info;
use once_cell::sync::Lazy;
use plotters::element::ErrorBar;
use plotters::prelude::*;
use plotters::series::DashedLineSeries;

use crate::analysis::LinearityCurves;
use crate::error::LinearityError;

/// Channels per rendered block: one COLDADC's worth.
pub const CHANNELS_PER_BLOCK: usize = 16;

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    /// Four colors cycled by `channel % 4` within a block.
    pub palette: [RGBColor; 4],
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 700,
            background: RGBColor(255, 255, 255),
            // The tab10 colors the collaboration's plots traditionally use.
            palette: [
                RGBColor(31, 119, 180),
                RGBColor(255, 127, 14),
                RGBColor(44, 160, 44),
                RGBColor(214, 39, 40),
            ],
        }
    }
}

/// Process-wide rendering style: initialized on first use, never mutated.
static STYLE: Lazy<PlotStyle> = Lazy::new(PlotStyle::default);

/// Render every 16-channel block of `curves` into `out_dir` (created if
/// missing) as `COLDADC_<block>.png`. Returns the written paths in block
/// order.
pub fn render_curves(
    curves: &LinearityCurves,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, LinearityError> {
    fs::create_dir_all(out_dir)?;
    info!("generating plots in {}", out_dir.display());
    let mut written = Vec::new();
    let blocks = curves.num_channels().div_ceil(CHANNELS_PER_BLOCK);
    for block in 0..blocks {
        let png = render_block_png(curves, block, &STYLE)?;
        let path = out_dir.join(format!("COLDADC_{block}.png"));
        fs::write(&path, png)?;
        written.push(path);
    }
    Ok(written)
}

/// Render one block to PNG bytes. NaN points (insufficient samples) are left
/// out, so a degraded data point shows up as a gap rather than a zero.
pub fn render_block_png(
    curves: &LinearityCurves,
    block: usize,
    style: &PlotStyle,
) -> Result<Vec<u8>, LinearityError> {
    let first = block * CHANNELS_PER_BLOCK;
    let last = ((block + 1) * CHANNELS_PER_BLOCK).min(curves.num_channels());
    if first >= last {
        return Err(LinearityError::Plot(format!(
            "block {block} holds no channels"
        )));
    }
    let xs: Vec<f64> = curves.pulser_dacs.iter().map(|&d| d as f64).collect();
    let x_max = xs.last().copied().unwrap_or(0.0).max(1.0);

    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;
    for ch in first..last {
        for (mean, rms) in curves.mean[ch].iter().zip(&curves.rms[ch]) {
            if mean.is_finite() {
                let spread = if rms.is_finite() { *rms } else { 0.0 };
                y_min = y_min.min(mean - spread);
                y_max = y_max.max(mean + spread);
            }
        }
    }
    // Block with no measurable channel at all: keep the frame drawable.
    if !y_min.is_finite() || !y_max.is_finite() {
        y_min = 0.0;
        y_max = 1.0;
    } else if (y_max - y_min).abs() < f64::EPSILON {
        y_min -= 1.0;
        y_max += 1.0;
    }

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(format!("COLDADC {block}"), ("sans-serif", 24).into_font())
            .set_label_area_size(LabelAreaPosition::Left, 60)
            .set_label_area_size(LabelAreaPosition::Bottom, 45)
            .build_cartesian_2d(0f64..x_max * 1.05, y_min..y_max)?;
        chart
            .configure_mesh()
            .x_desc("Pulser DAC (ADC)")
            .y_desc("Pulse Height (ADC)")
            .light_line_style(&BLACK.mix(0.1))
            .draw()?;

        for ch in first..last {
            let within = ch - first;
            let color = style.palette[within % 4];
            let points: Vec<(f64, f64, f64)> = xs
                .iter()
                .zip(curves.mean[ch].iter().zip(&curves.rms[ch]))
                .filter(|(_, (mean, _))| mean.is_finite())
                .map(|(&x, (&mean, &rms))| (x, mean, if rms.is_finite() { rms } else { 0.0 }))
                .collect();

            // Break the line wherever a NaN point was dropped; the legend
            // entry hangs off the last drawn segment.
            let runs = finite_runs(&xs, &curves.mean[ch]);
            let num_runs = runs.len();
            for (k, run) in runs.into_iter().enumerate() {
                let anno = match within / 4 {
                    0 => chart.draw_series(LineSeries::new(run, &color))?,
                    1 => chart.draw_series(DashedLineSeries::new(
                        run,
                        10,
                        6,
                        ShapeStyle::from(&color),
                    ))?,
                    2 => chart.draw_series(DashedLineSeries::new(
                        run,
                        6,
                        4,
                        ShapeStyle::from(&color),
                    ))?,
                    _ => chart.draw_series(DashedLineSeries::new(
                        run,
                        2,
                        4,
                        ShapeStyle::from(&color),
                    ))?,
                };
                if k + 1 == num_runs {
                    anno.label(format!("Ch {ch}")).legend(move |(x, y)| {
                        PathElement::new(vec![(x, y), (x + 20, y)], &color)
                    });
                }
            }
            chart.draw_series(points.iter().map(|&(x, mean, rms)| {
                ErrorBar::new_vertical(x, mean - rms, mean, mean + rms, color.filled(), 6)
            }))?;
        }
        chart
            .configure_series_labels()
            .border_style(&BLACK.mix(0.3))
            .background_style(&style.background.mix(0.9))
            .draw()?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

/// Runs of consecutive finite points, each a drawable polyline.
fn finite_runs(xs: &[f64], ys: &[f64]) -> Vec<Vec<(f64, f64)>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    for (&x, &y) in xs.iter().zip(ys) {
        if y.is_finite() {
            current.push((x, y));
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, LinearityError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| LinearityError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}
