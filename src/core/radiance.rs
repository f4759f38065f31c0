//! Radiometric reference capture and DN to radiance fitting.
//!
//! A calibrated uniform source (integrating sphere) is stepped through a grid
//! of luminances while the sensor is stepped through a grid of exposures. The
//! averaged captures form a [`RadianceCube`]; after dark subtraction, smile
//! alignment and flat fielding each pixel gets a DN -> luminance interpolant
//! per exposure knot, which [`RadianceFit`] evaluates to convert runtime frames.

use crate::core::interp::{eval_knots, second_derivatives, ExtrapolationPolicy, InterpolationKind, Interpolator};
use crate::core::smile::SmileShifts;
use crate::types::{Frame, HsiError, HsiImage, HsiResult, PixelFormat};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Averaged DN captures on an (exposure, luminance) grid.
///
/// Axis order of `data` is (cross-track, spectral, exposure, luminance). Grid
/// coordinates are strictly increasing; cells excluded by the saturation
/// policy stay in `data` but are marked invalid and never reach a fit.
#[derive(Debug, Clone, PartialEq)]
pub struct RadianceCube {
    exposures_ms: Vec<f64>,
    luminances: Vec<f64>,
    data: Array4<f64>,
    /// (exposure, luminance)
    valid: Array2<bool>,
    /// Source-off average per exposure, (cross-track, spectral, exposure)
    dark: Array3<f64>,
}

impl RadianceCube {
    /// Empty cube with every cell invalid
    pub fn new(exposures_ms: Vec<f64>, luminances: Vec<f64>, rows: usize, cols: usize) -> HsiResult<Self> {
        validate_grid(&exposures_ms, &luminances)?;
        let (ne, nl) = (exposures_ms.len(), luminances.len());
        Ok(Self {
            data: Array4::zeros((rows, cols, ne, nl)),
            valid: Array2::from_elem((ne, nl), false),
            dark: Array3::zeros((rows, cols, ne)),
            exposures_ms,
            luminances,
        })
    }

    /// Reassemble a stored cube, checking grid and axis lengths
    pub fn from_parts(
        exposures_ms: Vec<f64>,
        luminances: Vec<f64>,
        data: Array4<f64>,
        valid: Array2<bool>,
        dark: Array3<f64>,
    ) -> HsiResult<Self> {
        let cube = Self {
            exposures_ms,
            luminances,
            data,
            valid,
            dark,
        };
        cube.validate()?;
        Ok(cube)
    }

    pub fn exposures_ms(&self) -> &[f64] {
        &self.exposures_ms
    }

    pub fn luminances(&self) -> &[f64] {
        &self.luminances
    }

    /// (cross-track rows, spectral pixels) of every cell
    pub fn frame_dim(&self) -> (usize, usize) {
        let (rows, cols, _, _) = self.data.dim();
        (rows, cols)
    }

    pub fn data(&self) -> &Array4<f64> {
        &self.data
    }

    pub fn cell(&self, exposure: usize, luminance: usize) -> ArrayView2<'_, f64> {
        self.data.slice(s![.., .., exposure, luminance])
    }

    pub fn dark(&self, exposure: usize) -> ArrayView2<'_, f64> {
        self.dark.slice(s![.., .., exposure])
    }

    /// Source-off averages, (cross-track, spectral, exposure)
    pub fn darks(&self) -> &Array3<f64> {
        &self.dark
    }

    pub fn is_valid(&self, exposure: usize, luminance: usize) -> bool {
        self.valid.get((exposure, luminance)).copied().unwrap_or(false)
    }

    pub fn valid_mask(&self) -> &Array2<bool> {
        &self.valid
    }

    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Indices of valid cells in (exposure, luminance) order
    pub fn valid_cells(&self) -> Vec<(usize, usize)> {
        self.valid
            .indexed_iter()
            .filter(|(_, v)| **v)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn set_cell(&mut self, exposure: usize, luminance: usize, image: &HsiImage) -> HsiResult<()> {
        self.check_cell_shape(image)?;
        self.data.slice_mut(s![.., .., exposure, luminance]).assign(image);
        self.valid[[exposure, luminance]] = true;
        Ok(())
    }

    pub fn set_dark(&mut self, exposure: usize, image: &HsiImage) -> HsiResult<()> {
        self.check_cell_shape(image)?;
        self.dark.slice_mut(s![.., .., exposure]).assign(image);
        Ok(())
    }

    /// Exclude one grid cell from fitting
    pub fn invalidate(&mut self, exposure: usize, luminance: usize) {
        self.valid[[exposure, luminance]] = false;
    }

    /// Dark-subtracted, smile-aligned and flat-fielded cell
    pub fn corrected_cell(
        &self,
        exposure: usize,
        luminance: usize,
        smile: &SmileShifts,
        flat: &HsiImage,
    ) -> HsiResult<HsiImage> {
        let signal = &self.cell(exposure, luminance) - &self.dark(exposure);
        let aligned = smile.apply(&signal)?;
        Ok(aligned / flat)
    }

    /// Check grid monotonicity and axis lengths, e.g. after deserializing
    pub fn validate(&self) -> HsiResult<()> {
        validate_grid(&self.exposures_ms, &self.luminances)?;
        let (rows, cols) = self.frame_dim();
        let (ne, nl) = (self.exposures_ms.len(), self.luminances.len());
        if self.data.dim() != (rows, cols, ne, nl)
            || self.valid.dim() != (ne, nl)
            || self.dark.dim() != (rows, cols, ne)
        {
            return Err(HsiError::Configuration(format!(
                "Radiance cube axes disagree with its {}x{} grid",
                ne, nl
            )));
        }
        Ok(())
    }

    fn check_cell_shape(&self, image: &HsiImage) -> HsiResult<()> {
        if image.dim() != self.frame_dim() {
            return Err(HsiError::InputData(format!(
                "Capture is {:?} but the radiance cube holds {:?} cells",
                image.dim(),
                self.frame_dim()
            )));
        }
        Ok(())
    }
}

/// Both grid axes must be non-empty, finite and strictly increasing
pub fn validate_grid(exposures_ms: &[f64], luminances: &[f64]) -> HsiResult<()> {
    for (name, axis) in [("exposure", exposures_ms), ("luminance", luminances)] {
        if axis.is_empty() {
            return Err(HsiError::Configuration(format!("Empty {} grid", name)));
        }
        if axis.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(HsiError::Configuration(format!(
                "{} grid values must be finite and non-negative",
                name
            )));
        }
        if let Some(w) = axis.windows(2).find(|w| w[1] <= w[0]) {
            return Err(HsiError::Configuration(format!(
                "{} grid must be strictly increasing ({} followed by {})",
                name, w[0], w[1]
            )));
        }
    }
    if exposures_ms[0] <= 0.0 {
        return Err(HsiError::Configuration("Exposure grid must be positive".to_string()));
    }
    Ok(())
}

/// Calibrated light source driven during radiance capture
pub trait LuminanceSource {
    /// Blocks until the source reports the setpoint reached. Implementations
    /// must give up and return an error once `timeout` has passed.
    fn set_luminance(&mut self, luminance: f64, timeout: Duration) -> HsiResult<()>;

    /// Luminance currently reported by the source
    fn luminance(&mut self) -> HsiResult<f64>;

    fn turn_off(&mut self) -> HsiResult<()>;
}

/// Sensor delivering raw frames
pub trait FrameSource {
    fn set_exposure(&mut self, exposure_ms: f64) -> HsiResult<()>;

    fn capture(&mut self) -> HsiResult<Frame>;
}

/// Shared cancellation request for long captures
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Radiance cube capture parameters
#[derive(Debug, Clone)]
pub struct RadianceCubeParams {
    /// Frames averaged per grid cell
    pub frames_to_average: usize,
    /// Wait after the source reports a new setpoint
    pub settle_time: Duration,
    /// Longest accepted blocking time of a luminance change
    pub luminance_timeout: Duration,
    /// Allowed difference between setpoint and read-back luminance
    pub luminance_tolerance: f64,
    /// A cell is excluded when any frame has more pixels than this at max DN
    pub saturation_pixel_limit: usize,
    pub pixel_format: PixelFormat,
}

impl Default for RadianceCubeParams {
    fn default() -> Self {
        Self {
            frames_to_average: 10,
            settle_time: Duration::from_secs(2),
            luminance_timeout: Duration::from_secs(60),
            luminance_tolerance: 1.0,
            saturation_pixel_limit: 1000,
            pixel_format: PixelFormat::Mono12,
        }
    }
}

/// Captures the radiance reference cube from a calibrated source
pub struct RadianceCubeBuilder {
    params: RadianceCubeParams,
}

impl RadianceCubeBuilder {
    pub fn new(params: RadianceCubeParams) -> Self {
        Self { params }
    }

    pub fn standard() -> Self {
        Self::new(RadianceCubeParams::default())
    }

    pub fn params(&self) -> &RadianceCubeParams {
        &self.params
    }

    /// Capture every (exposure, luminance) cell plus a dark per exposure.
    ///
    /// The cube is only returned once complete; a cancelled or failed capture
    /// yields an error and no cube. The source is switched off on every exit.
    pub fn capture(
        &self,
        exposures_ms: &[f64],
        luminances: &[f64],
        camera: &mut dyn FrameSource,
        source: &mut dyn LuminanceSource,
        cancel: &CancelFlag,
    ) -> HsiResult<RadianceCube> {
        validate_grid(exposures_ms, luminances)?;
        if self.params.frames_to_average == 0 {
            return Err(HsiError::Configuration(
                "frames_to_average must be at least 1".to_string(),
            ));
        }
        log::info!(
            "Capturing radiance cube: {} exposures x {} luminances, {} frames per cell",
            exposures_ms.len(),
            luminances.len(),
            self.params.frames_to_average
        );

        let result = self.capture_grid(exposures_ms, luminances, camera, source, cancel);
        if let Err(e) = source.turn_off() {
            log::warn!("Failed to switch the luminance source off: {}", e);
        }

        if let Ok(cube) = &result {
            log::info!(
                "Radiance cube complete: {}/{} cells valid",
                cube.n_valid(),
                exposures_ms.len() * luminances.len()
            );
        }
        result
    }

    fn capture_grid(
        &self,
        exposures_ms: &[f64],
        luminances: &[f64],
        camera: &mut dyn FrameSource,
        source: &mut dyn LuminanceSource,
        cancel: &CancelFlag,
    ) -> HsiResult<RadianceCube> {
        source.turn_off()?;
        let mut darks = Vec::with_capacity(exposures_ms.len());
        for &exposure in exposures_ms {
            check_cancel(cancel, format!("dark capture at {} ms", exposure))?;
            camera.set_exposure(exposure)?;
            let (dark, _) = self.average_frames(camera, exposure)?;
            darks.push(dark);
        }

        let (rows, cols) = darks[0].dim();
        let mut cube = RadianceCube::new(exposures_ms.to_vec(), luminances.to_vec(), rows, cols)?;
        for (ei, dark) in darks.iter().enumerate() {
            cube.set_dark(ei, dark)?;
        }

        for (li, &luminance) in luminances.iter().enumerate() {
            check_cancel(cancel, format!("luminance {}", luminance))?;
            self.drive_source(source, luminance)?;

            for (ei, &exposure) in exposures_ms.iter().enumerate() {
                check_cancel(cancel, format!("cell {} ms / luminance {}", exposure, luminance))?;
                self.check_luminance(source, luminance)?;
                camera.set_exposure(exposure)?;

                let (mean, saturated) = self.average_frames(camera, exposure)?;
                cube.set_cell(ei, li, &mean)?;
                if saturated > self.params.saturation_pixel_limit {
                    log::warn!(
                        "Excluding cell {} ms / luminance {}: {} pixels at max DN (limit {})",
                        exposure,
                        luminance,
                        saturated,
                        self.params.saturation_pixel_limit
                    );
                    cube.invalidate(ei, li);
                } else {
                    log::debug!("Captured cell {} ms / luminance {}", exposure, luminance);
                }
            }
        }

        Ok(cube)
    }

    /// Mean of the configured number of frames and the worst per-frame
    /// saturated pixel count
    fn average_frames(&self, camera: &mut dyn FrameSource, exposure_ms: f64) -> HsiResult<(HsiImage, usize)> {
        let max_dn = self.params.pixel_format.max_dn();
        let n = self.params.frames_to_average;

        let first = camera.capture()?;
        check_exposure(&first, exposure_ms)?;
        let mut worst = first.saturated_pixel_count(max_dn);
        let mut sum = first.into_data();

        for _ in 1..n {
            let frame = camera.capture()?;
            check_exposure(&frame, exposure_ms)?;
            if frame.dim() != sum.dim() {
                return Err(HsiError::InputData(format!(
                    "Frame size changed during averaging: {:?} vs {:?}",
                    frame.dim(),
                    sum.dim()
                )));
            }
            worst = worst.max(frame.saturated_pixel_count(max_dn));
            sum += frame.data();
        }

        Ok((sum / n as f64, worst))
    }

    fn drive_source(&self, source: &mut dyn LuminanceSource, luminance: f64) -> HsiResult<()> {
        let timeout = self.params.luminance_timeout;
        let start = Instant::now();
        source.set_luminance(luminance, timeout).map_err(|e| match e {
            HsiError::InputData(_) | HsiError::Cancelled(_) => e,
            other => HsiError::InputData(format!("Luminance source failed to reach {}: {}", luminance, other)),
        })?;
        // Sources that overrun their deadline are still rejected
        let elapsed = start.elapsed();
        if elapsed > timeout {
            return Err(HsiError::InputData(format!(
                "Luminance source took {:.1} s to reach {} (timeout {:.1} s)",
                elapsed.as_secs_f64(),
                luminance,
                timeout.as_secs_f64()
            )));
        }
        if !self.params.settle_time.is_zero() {
            std::thread::sleep(self.params.settle_time);
        }
        Ok(())
    }

    fn check_luminance(&self, source: &mut dyn LuminanceSource, expected: f64) -> HsiResult<()> {
        let actual = source.luminance()?;
        if (actual - expected).abs() > self.params.luminance_tolerance {
            return Err(HsiError::InputData(format!(
                "Luminance drifted to {} while capturing setpoint {}",
                actual, expected
            )));
        }
        Ok(())
    }
}

fn check_cancel(cancel: &CancelFlag, at: String) -> HsiResult<()> {
    if cancel.is_cancelled() {
        log::info!("Radiance capture cancelled before {}", at);
        return Err(HsiError::Cancelled(format!("radiance capture stopped before {}", at)));
    }
    Ok(())
}

fn check_exposure(frame: &Frame, exposure_ms: f64) -> HsiResult<()> {
    if (frame.exposure_ms() - exposure_ms).abs() > 1e-6 * exposure_ms {
        return Err(HsiError::InputData(format!(
            "Frame exposure {} ms does not match setpoint {} ms",
            frame.exposure_ms(),
            exposure_ms
        )));
    }
    Ok(())
}

/// Spectral radiance of the calibrated source at its reference luminance
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpectrum {
    /// Wavelength knots (nm)
    sfit_x: Vec<f64>,
    /// Spectral radiance at the knots
    sfit_y: Vec<f64>,
    /// Luminance at which `sfit_y` was certified
    spec_rad_ref_luminance: f64,
}

impl SourceSpectrum {
    pub fn new(sfit_x: Vec<f64>, sfit_y: Vec<f64>, spec_rad_ref_luminance: f64) -> HsiResult<Self> {
        Interpolator::new(&sfit_x, &sfit_y, InterpolationKind::Linear, ExtrapolationPolicy::Clamp)?;
        if sfit_y.iter().any(|&v| v <= 0.0) {
            return Err(HsiError::Configuration(
                "Source spectral radiance must be positive".to_string(),
            ));
        }
        if !(spec_rad_ref_luminance > 0.0) {
            return Err(HsiError::Configuration(format!(
                "Reference luminance must be positive, got {}",
                spec_rad_ref_luminance
            )));
        }
        Ok(Self {
            sfit_x,
            sfit_y,
            spec_rad_ref_luminance,
        })
    }

    pub fn sfit_x(&self) -> &[f64] {
        &self.sfit_x
    }

    pub fn sfit_y(&self) -> &[f64] {
        &self.sfit_y
    }

    pub fn spec_rad_ref_luminance(&self) -> f64 {
        self.spec_rad_ref_luminance
    }

    /// Spectral radiance at each wavelength with the source at `luminance`
    pub fn radiance(&self, wavelengths_nm: ArrayView1<f64>, luminance: f64) -> HsiResult<Array1<f64>> {
        let spectrum = Interpolator::new(
            &self.sfit_x,
            &self.sfit_y,
            InterpolationKind::Linear,
            ExtrapolationPolicy::Clamp,
        )?;
        let scale = luminance / self.spec_rad_ref_luminance;
        Ok(wavelengths_nm.mapv(|wl| spectrum.eval(wl) * scale))
    }
}

/// Radiance fit parameters
#[derive(Debug, Clone)]
pub struct RadianceFitParams {
    /// Interpolant family for DN -> luminance and across exposure knots
    pub interpolation: InterpolationKind,
    /// Behaviour for exposures outside the captured range
    pub extrapolation: ExtrapolationPolicy,
    /// Behaviour for DN above the brightest (or below the dark) knot
    pub dn_extrapolation: ExtrapolationPolicy,
    /// Cross-track rows averaged together for noise robustness
    pub group_rows: usize,
}

impl Default for RadianceFitParams {
    fn default() -> Self {
        Self {
            interpolation: InterpolationKind::Cubic,
            extrapolation: ExtrapolationPolicy::Clamp,
            dn_extrapolation: ExtrapolationPolicy::Linear,
            group_rows: 1,
        }
    }
}

/// Per-pixel DN -> luminance interpolant at one captured exposure.
///
/// Knot `k` of pixel `(r, c)` maps `dn_per_ms[[r, c, k]]` to `luminances[k]`.
/// When the lowest captured luminance is positive the first knot is the dark
/// anchor (0 DN, luminance 0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureKnot {
    exposure_ms: f64,
    luminances: Vec<f64>,
    /// Corrected DN per ms, (cross-track, spectral, knot)
    dn_per_ms: Array3<f64>,
    /// Spline second derivatives matching `dn_per_ms`
    curvature: Array3<f64>,
}

impl ExposureKnot {
    /// Build from the corrected cells `(luminance, image)` captured at
    /// `exposure_ms`, in increasing luminance order
    fn build(exposure_ms: f64, cells: &[(f64, &HsiImage)], kind: InterpolationKind) -> HsiResult<Self> {
        let Some(&(lowest, first)) = cells.first() else {
            return Err(HsiError::fit("radiance", format!("no valid cell at {} ms", exposure_ms)));
        };
        let (rows, cols) = first.dim();
        let offset = usize::from(lowest > 0.0);

        let mut luminances = Vec::with_capacity(cells.len() + offset);
        if offset == 1 {
            luminances.push(0.0);
        }
        luminances.extend(cells.iter().map(|&(l, _)| l));

        let n = luminances.len();
        let mut dn_per_ms = Array3::zeros((rows, cols, n));
        for (k, &(_, image)) in cells.iter().enumerate() {
            dn_per_ms
                .index_axis_mut(Axis(2), k + offset)
                .assign(&image.mapv(|dn| dn / exposure_ms));
        }

        let mut curvature = Array3::zeros((rows, cols, n));
        let mut rejected = 0usize;
        let mut first_rejected = None;
        for r in 0..rows {
            for c in 0..cols {
                let x = dn_per_ms.slice(s![r, c, ..]).to_vec();
                if x.windows(2).any(|w| !(w[1] > w[0])) {
                    rejected += 1;
                    first_rejected.get_or_insert((r, c));
                    continue;
                }
                let m = second_derivatives(&x, &luminances, kind);
                curvature.slice_mut(s![r, c, ..]).assign(&ArrayView1::from(m.as_slice()));
            }
        }
        if let Some((r, c)) = first_rejected {
            return Err(HsiError::fit(
                "radiance",
                format!(
                    "{} pixels at {} ms have DN not increasing with luminance (first at row {}, pixel {})",
                    rejected, exposure_ms, r, c
                ),
            ));
        }

        Ok(Self {
            exposure_ms,
            luminances,
            dn_per_ms,
            curvature,
        })
    }

    pub fn exposure_ms(&self) -> f64 {
        self.exposure_ms
    }

    pub fn luminances(&self) -> &[f64] {
        &self.luminances
    }

    pub fn dn_per_ms(&self) -> &Array3<f64> {
        &self.dn_per_ms
    }

    /// Source luminance producing `dn_per_ms` at pixel `(row, col)`
    pub fn luminance(&self, row: usize, col: usize, dn_per_ms: f64, extrapolation: ExtrapolationPolicy) -> f64 {
        eval_knots(
            self.dn_per_ms.slice(s![row, col, ..]),
            ArrayView1::from(self.luminances.as_slice()),
            self.curvature.slice(s![row, col, ..]),
            extrapolation,
            dn_per_ms,
        )
    }

    fn validate(&self, dim: (usize, usize)) -> HsiResult<()> {
        let (rows, cols, n) = self.dn_per_ms.dim();
        if (rows, cols) != dim || n != self.luminances.len() || self.curvature.dim() != (rows, cols, n) || n == 0 {
            return Err(HsiError::Configuration(format!(
                "Radiance knot at {} ms has inconsistent axes",
                self.exposure_ms
            )));
        }
        if self.luminances.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(HsiError::Configuration(format!(
                "Radiance knot luminances at {} ms are not strictly increasing",
                self.exposure_ms
            )));
        }
        Ok(())
    }
}

/// Everything of a radiance fit except the source spectrum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadianceModel {
    knots: Vec<ExposureKnot>,
    /// Source radiance per unit luminance on the aligned wavelength axis
    unit_radiance: Array1<f64>,
    interpolation: InterpolationKind,
    extrapolation: ExtrapolationPolicy,
    dn_extrapolation: ExtrapolationPolicy,
}

/// DN to radiance conversion fitted from a [`RadianceCube`].
///
/// At each captured exposure every pixel carries an interpolant from
/// corrected DN per ms to source luminance through its valid grid cells, so
/// captured cells convert back to their own luminance exactly. Between
/// exposure knots the per-knot luminances are interpolated across exposure;
/// radiance is that luminance times the source radiance per unit luminance.
#[derive(Debug, Clone, PartialEq)]
pub struct RadianceFit {
    model: RadianceModel,
    source: SourceSpectrum,
}

impl RadianceFit {
    /// Fit interpolants from the valid cells of `cube`.
    ///
    /// `wavelengths_nm` is the aligned (reference row) wavelength axis and
    /// `flat` the dark-subtracted, smile-aligned flat field.
    pub fn fit(
        cube: &RadianceCube,
        smile: &SmileShifts,
        flat: &HsiImage,
        wavelengths_nm: ArrayView1<f64>,
        source: &SourceSpectrum,
        params: &RadianceFitParams,
    ) -> HsiResult<Self> {
        let (rows, cols) = cube.frame_dim();
        if flat.dim() != (rows, cols) || smile.len() != rows || wavelengths_nm.len() != cols {
            return Err(HsiError::Configuration(format!(
                "Radiance cube {}x{} does not match flat field {:?}, {} smile rows, {} wavelengths",
                rows,
                cols,
                flat.dim(),
                smile.len(),
                wavelengths_nm.len()
            )));
        }
        if flat.iter().any(|&v| !(v > 0.0)) {
            return Err(HsiError::fit("radiance", "flat field has non-positive pixels"));
        }

        log::info!(
            "Fitting radiance interpolants from {}/{} valid cells",
            cube.n_valid(),
            cube.exposures_ms().len() * cube.luminances().len()
        );

        let unit_radiance = source.radiance(wavelengths_nm, 1.0)?;
        let cells = cube.valid_cells();
        let mut corrected = correct_cells(cube, &cells, smile, flat)?;
        if params.group_rows > 1 {
            for image in corrected.iter_mut() {
                average_row_groups(image, params.group_rows);
            }
        }

        let mut knots = Vec::new();
        for (ei, &exposure) in cube.exposures_ms().iter().enumerate() {
            let at_exposure: Vec<(f64, &HsiImage)> = cells
                .iter()
                .zip(&corrected)
                .filter(|((e, _), _)| *e == ei)
                .map(|(&(_, li), image)| (cube.luminances()[li], image))
                .collect();
            if at_exposure.is_empty() {
                log::warn!("No valid cell at {} ms, dropping exposure knot", exposure);
                continue;
            }
            knots.push(ExposureKnot::build(exposure, &at_exposure, params.interpolation)?);
        }

        if knots.is_empty() {
            return Err(HsiError::fit(
                "radiance",
                "no exposure has a valid cell; all cells saturated",
            ));
        }
        log::info!(
            "Radiance fit uses exposure knots {:?} ms",
            knots.iter().map(|k| k.exposure_ms).collect::<Vec<_>>()
        );

        Ok(Self {
            model: RadianceModel {
                knots,
                unit_radiance,
                interpolation: params.interpolation,
                extrapolation: params.extrapolation,
                dn_extrapolation: params.dn_extrapolation,
            },
            source: source.clone(),
        })
    }

    /// Reassemble a stored fit, checking that its parts agree
    pub fn from_parts(model: RadianceModel, source: SourceSpectrum) -> HsiResult<Self> {
        let fit = Self { model, source };
        fit.validate()?;
        Ok(fit)
    }

    pub fn model(&self) -> &RadianceModel {
        &self.model
    }

    pub fn knots(&self) -> &[ExposureKnot] {
        &self.model.knots
    }

    pub fn exposures_ms(&self) -> Vec<f64> {
        self.model.knots.iter().map(|k| k.exposure_ms).collect()
    }

    pub fn unit_radiance(&self) -> &Array1<f64> {
        &self.model.unit_radiance
    }

    pub fn source(&self) -> &SourceSpectrum {
        &self.source
    }

    pub fn sfit_x(&self) -> &[f64] {
        self.source.sfit_x()
    }

    pub fn sfit_y(&self) -> &[f64] {
        self.source.sfit_y()
    }

    pub fn spec_rad_ref_luminance(&self) -> f64 {
        self.source.spec_rad_ref_luminance()
    }

    pub fn extrapolation(&self) -> ExtrapolationPolicy {
        self.model.extrapolation
    }

    pub fn dn_extrapolation(&self) -> ExtrapolationPolicy {
        self.model.dn_extrapolation
    }

    pub fn with_extrapolation(mut self, extrapolation: ExtrapolationPolicy) -> Self {
        self.model.extrapolation = extrapolation;
        self
    }

    pub fn with_dn_extrapolation(mut self, extrapolation: ExtrapolationPolicy) -> Self {
        self.model.dn_extrapolation = extrapolation;
        self
    }

    pub fn frame_dim(&self) -> (usize, usize) {
        self.model
            .knots
            .first()
            .map(|k| {
                let (rows, cols, _) = k.dn_per_ms.dim();
                (rows, cols)
            })
            .unwrap_or((0, 0))
    }

    /// Convert a flat-fielded image captured at `exposure_ms` to radiance.
    ///
    /// DN beyond the captured range follows the DN extrapolation policy and
    /// exposures beyond the knots follow the exposure policy.
    pub fn radiance(&self, image: &HsiImage, exposure_ms: f64) -> HsiResult<HsiImage> {
        if image.dim() != self.frame_dim() {
            return Err(HsiError::InputData(format!(
                "Image {:?} does not match the radiance fit {:?}",
                image.dim(),
                self.frame_dim()
            )));
        }
        if !(exposure_ms > 0.0) {
            return Err(HsiError::InputData(format!(
                "Exposure must be positive, got {} ms",
                exposure_ms
            )));
        }

        let weights = knot_weights(
            &self.exposures_ms(),
            self.model.interpolation,
            self.model.extrapolation,
            exposure_ms,
        )?;
        let active: Vec<(f64, &ExposureKnot)> = weights
            .iter()
            .zip(&self.model.knots)
            .filter(|(w, _)| **w != 0.0)
            .map(|(&w, knot)| (w, knot))
            .collect();
        let dn_policy = self.model.dn_extrapolation;
        let unit_radiance = &self.model.unit_radiance;

        let convert = |(row, col): (usize, usize), &dn: &f64| {
            let x = dn / exposure_ms;
            let luminance: f64 = active
                .iter()
                .map(|(w, knot)| w * knot.luminance(row, col, x, dn_policy))
                .sum();
            luminance * unit_radiance[col]
        };

        #[cfg(feature = "parallel")]
        let radiance = Zip::indexed(image).par_map_collect(convert);
        #[cfg(not(feature = "parallel"))]
        let radiance = Zip::indexed(image).map_collect(convert);

        Ok(radiance)
    }

    /// Check knot ordering and axis lengths, e.g. after deserializing
    pub fn validate(&self) -> HsiResult<()> {
        let knots = &self.model.knots;
        if knots.is_empty() {
            return Err(HsiError::Configuration("Radiance fit has no exposure knots".to_string()));
        }
        let exposures = self.exposures_ms();
        if exposures.iter().any(|e| !(*e > 0.0)) || exposures.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(HsiError::Configuration(format!(
                "Radiance fit exposure knots {:?} must be positive and strictly increasing",
                exposures
            )));
        }
        let dim = self.frame_dim();
        for knot in knots {
            knot.validate(dim)?;
        }
        if self.model.unit_radiance.len() != dim.1 {
            return Err(HsiError::Configuration(format!(
                "Radiance fit has {} source radiances for {} spectral pixels",
                self.model.unit_radiance.len(),
                dim.1
            )));
        }
        Ok(())
    }
}

/// Weights `w` such that the interpolant through `(x, y)` at `xq` equals
/// `sum(w * y)` for any knot values `y`
fn knot_weights(
    x: &[f64],
    kind: InterpolationKind,
    extrapolation: ExtrapolationPolicy,
    xq: f64,
) -> HsiResult<Vec<f64>> {
    (0..x.len())
        .map(|k| {
            let mut unit = vec![0.0; x.len()];
            unit[k] = 1.0;
            Ok(Interpolator::new(x, &unit, kind, extrapolation)?.eval(xq))
        })
        .collect()
}

fn average_row_groups(plane: &mut Array2<f64>, group_rows: usize) {
    for mut group in plane.axis_chunks_iter_mut(Axis(0), group_rows) {
        if let Some(mean) = group.mean_axis(Axis(0)) {
            group.assign(&mean);
        }
    }
}

#[cfg(feature = "parallel")]
fn correct_cells(
    cube: &RadianceCube,
    cells: &[(usize, usize)],
    smile: &SmileShifts,
    flat: &HsiImage,
) -> HsiResult<Vec<HsiImage>> {
    use rayon::prelude::*;

    cells
        .par_iter()
        .map(|&(e, l)| cube.corrected_cell(e, l, smile, flat))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn correct_cells(
    cube: &RadianceCube,
    cells: &[(usize, usize)],
    smile: &SmileShifts,
    flat: &HsiImage,
) -> HsiResult<Vec<HsiImage>> {
    cells
        .iter()
        .map(|&(e, l)| cube.corrected_cell(e, l, smile, flat))
        .collect()
}
