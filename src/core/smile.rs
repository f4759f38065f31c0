use crate::core::wavelength::{Polynomial, RowWavelengthFit};
use crate::types::{HsiError, HsiImage, HsiResult};
use ndarray::{Array1, ArrayView1, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Per-row sub-pixel shifts aligning every row to the reference row's wavelength axis.
///
/// Shifting row `i` by `shifts[i]` pixels means `aligned[j] = row[j - shifts[i]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmileShifts {
    shifts: Vec<f64>,
    reference_row: usize,
}

impl SmileShifts {
    /// The reference row's entry must be exactly zero
    pub fn new(shifts: Vec<f64>, reference_row: usize) -> HsiResult<Self> {
        match shifts.get(reference_row) {
            None => Err(HsiError::fit(
                "smile",
                format!("reference row {} outside {} rows", reference_row, shifts.len()),
            )),
            Some(&s) if s != 0.0 => Err(HsiError::fit(
                "smile",
                format!("reference row {} has non-zero shift {}", reference_row, s),
            )),
            Some(_) => Ok(Self { shifts, reference_row }),
        }
    }

    /// No correction; used when re-deriving shifts from scratch
    pub fn zeros(n_rows: usize, reference_row: usize) -> Self {
        Self {
            shifts: vec![0.0; n_rows],
            reference_row: reference_row.min(n_rows.saturating_sub(1)),
        }
    }

    pub fn shifts(&self) -> &[f64] {
        &self.shifts
    }

    pub fn reference_row(&self) -> usize {
        self.reference_row
    }

    pub fn len(&self) -> usize {
        self.shifts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shifts.is_empty()
    }

    pub fn max_abs(&self) -> f64 {
        self.shifts.iter().fold(0.0, |m, s| m.max(s.abs()))
    }

    /// Align every row of `image` onto the reference wavelength axis
    pub fn apply(&self, image: &HsiImage) -> HsiResult<HsiImage> {
        let (rows, cols) = image.dim();
        if rows != self.shifts.len() {
            return Err(HsiError::Configuration(format!(
                "Smile shifts cover {} rows but image has {}",
                self.shifts.len(),
                rows
            )));
        }

        let mut aligned = HsiImage::zeros((rows, cols));
        Zip::from(aligned.axis_iter_mut(Axis(0)))
            .and(image.axis_iter(Axis(0)))
            .and(&Array1::from(self.shifts.clone()))
            .for_each(|mut out, row, &shift| out.assign(&shift_row(row, shift)));
        Ok(aligned)
    }
}

/// `out[j] = row[j - shift]` with linear interpolation; samples past the edges
/// repeat the edge value
pub fn shift_row(row: ArrayView1<f64>, shift: f64) -> Array1<f64> {
    let n = row.len();
    if shift == 0.0 || n == 0 {
        return row.to_owned();
    }
    let last = (n - 1) as f64;
    Array1::from_shape_fn(n, |j| {
        let src = (j as f64 - shift).clamp(0.0, last);
        let i0 = src.floor() as usize;
        let i1 = (i0 + 1).min(n - 1);
        let frac = src - i0 as f64;
        row[i0] * (1.0 - frac) + row[i1] * frac
    })
}

/// Smile estimation parameters
#[derive(Debug, Clone)]
pub struct SmileParams {
    /// Row all others are aligned to (default: geometric centre)
    pub reference_row: Option<usize>,
    /// Cross-correlation search radius (pixels)
    pub max_shift_px: usize,
    /// Largest allowed change in shift between neighbouring rows (pixels)
    pub max_step_px: f64,
    /// Largest allowed deviation from a smooth fit over rows (pixels)
    pub max_residual_px: f64,
    /// Degree of the smooth curve shifts are checked against
    pub smooth_degree: usize,
}

impl Default for SmileParams {
    fn default() -> Self {
        Self {
            reference_row: None,
            max_shift_px: 10,
            max_step_px: 0.5,
            max_residual_px: 0.5,
            smooth_degree: 2,     // Smile is close to parabolic across track
        }
    }
}

/// Derives smile shifts from an HgAr frame or from per-row line fits
pub struct SmileCorrector {
    params: SmileParams,
}

impl SmileCorrector {
    pub fn new(params: SmileParams) -> Self {
        Self { params }
    }

    pub fn standard() -> Self {
        Self::new(SmileParams::default())
    }

    fn reference_row(&self, n_rows: usize) -> HsiResult<usize> {
        let row = self.params.reference_row.unwrap_or(n_rows / 2);
        if row >= n_rows {
            return Err(HsiError::Configuration(format!(
                "Smile reference row {} outside {} rows",
                row, n_rows
            )));
        }
        Ok(row)
    }

    /// Discard previous shifts and start from an uncorrected state
    pub fn reset(&self, n_rows: usize) -> HsiResult<SmileShifts> {
        log::info!("Resetting smile shifts for {} rows", n_rows);
        Ok(SmileShifts::zeros(n_rows, self.reference_row(n_rows)?))
    }

    /// Sub-pixel cross-correlation of every row against the reference row
    pub fn from_cross_correlation(&self, hgar: &HsiImage) -> HsiResult<SmileShifts> {
        let (rows, cols) = hgar.dim();
        let reference_row = self.reference_row(rows)?;
        let max_lag = self.params.max_shift_px.min(cols.saturating_sub(2));
        log::info!(
            "Estimating smile by cross-correlation: {} rows, reference row {}, search +/-{} px",
            rows, reference_row, max_lag
        );

        let reference = centered(hgar.row(reference_row));
        if reference.iter().all(|&v| v == 0.0) {
            return Err(HsiError::InputData(format!(
                "Reference row {} of the HgAr frame has no spectral structure",
                reference_row
            )));
        }

        let mut shifts = Vec::with_capacity(rows);
        for r in 0..rows {
            if r == reference_row {
                shifts.push(0.0);
                continue;
            }
            let row = centered(hgar.row(r));
            shifts.push(correlation_peak(&reference, &row, max_lag));
        }

        let smile = SmileShifts::new(shifts, reference_row)?;
        self.validate(&smile)?;
        log::info!("Smile estimated, max |shift| = {:.3} px", smile.max_abs());
        Ok(smile)
    }

    /// Shifts from matched line positions: for each row the mean of
    /// (reference pixel - row pixel) over lines matched in both rows
    pub fn from_line_positions(&self, fits: &[RowWavelengthFit]) -> HsiResult<SmileShifts> {
        let rows = fits.len();
        let reference_row = self.reference_row(rows)?;
        let reference = &fits[reference_row].matches;

        let mut shifts = Vec::with_capacity(rows);
        let mut missing = Vec::new();
        for (r, fit) in fits.iter().enumerate() {
            if r == reference_row {
                shifts.push(0.0);
                continue;
            }
            let deltas: Vec<f64> = fit
                .matches
                .iter()
                .filter_map(|m| {
                    reference
                        .iter()
                        .find(|rm| rm.wavelength_nm == m.wavelength_nm)
                        .map(|rm| rm.pixel - m.pixel)
                })
                .collect();
            if deltas.is_empty() {
                missing.push(r);
                shifts.push(0.0);
            } else {
                shifts.push(deltas.iter().sum::<f64>() / deltas.len() as f64);
            }
        }

        if !missing.is_empty() {
            return Err(HsiError::fit(
                "smile",
                format!("rows {:?} share no matched line with reference row {}", missing, reference_row),
            ));
        }

        let smile = SmileShifts::new(shifts, reference_row)?;
        self.validate(&smile)?;
        Ok(smile)
    }

    /// Reject shift curves with jumps between neighbouring rows or rows far
    /// from a smooth fit
    pub fn validate(&self, smile: &SmileShifts) -> HsiResult<()> {
        let shifts = smile.shifts();

        let jumps: Vec<usize> = shifts
            .windows(2)
            .enumerate()
            .filter(|(_, w)| (w[1] - w[0]).abs() > self.params.max_step_px)
            .map(|(i, _)| i + 1)
            .collect();

        let points: Vec<(f64, f64)> = shifts.iter().enumerate().map(|(i, &s)| (i as f64, s)).collect();
        let degree = self.params.smooth_degree.min(points.len().saturating_sub(1));
        let outliers: Vec<usize> = match Polynomial::fit(&points, degree) {
            Some(smooth) => points
                .iter()
                .filter(|&&(x, y)| (smooth.eval(x) - y).abs() > self.params.max_residual_px)
                .map(|&(x, _)| x as usize)
                .collect(),
            None => Vec::new(),
        };

        if jumps.is_empty() && outliers.is_empty() {
            return Ok(());
        }
        log::warn!("Smile validation failed: jumps at rows {:?}, outliers {:?}", jumps, outliers);
        Err(HsiError::fit(
            "smile",
            format!(
                "discontinuous shifts: jumps > {} px at rows {:?}; rows {:?} deviate > {} px from a degree {} trend",
                self.params.max_step_px, jumps, outliers, self.params.max_residual_px, degree
            ),
        ))
    }
}

fn centered(row: ArrayView1<f64>) -> Array1<f64> {
    let mean = row.mean().unwrap_or(0.0);
    row.mapv(|v| v - mean)
}

/// Lag maximizing sum_j reference[j] * row[j - lag], refined with a parabola
fn correlation_peak(reference: &Array1<f64>, row: &Array1<f64>, max_lag: usize) -> f64 {
    let n = reference.len() as isize;
    let max_lag = max_lag as isize;
    let correlation = |lag: isize| -> f64 {
        let lo = lag.max(0);
        let hi = (n + lag).min(n);
        let mut sum = 0.0;
        for j in lo..hi {
            sum += reference[j as usize] * row[(j - lag) as usize];
        }
        sum / (hi - lo).max(1) as f64
    };

    let scores: Vec<f64> = (-max_lag..=max_lag).map(correlation).collect();
    let best = scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(max_lag as usize);

    let lag = best as f64 - max_lag as f64;
    if best == 0 || best + 1 == scores.len() {
        return lag;
    }
    let (l, c, r) = (scores[best - 1], scores[best], scores[best + 1]);
    let denom = l - 2.0 * c + r;
    if denom.abs() < 1e-12 {
        return lag;
    }
    lag + (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::peaks::tests::synthetic_spectrum;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    pub(crate) const LINE_CENTERS: [f64; 4] = [60.0, 140.0, 210.0, 330.0];

    /// HgAr-like frame whose rows are displaced by `true_shift(row)`:
    /// row r has its lines at `center - true_shift(r)`
    pub(crate) fn smiling_frame(rows: usize, cols: usize, true_shift: impl Fn(usize) -> f64) -> HsiImage {
        let mut frame = Array2::zeros((rows, cols));
        for r in 0..rows {
            let lines: Vec<(f64, f64, f64)> = LINE_CENTERS
                .iter()
                .zip([900.0, 1200.0, 500.0, 700.0])
                .map(|(&c, h)| (c - true_shift(r), h, 2.5))
                .collect();
            frame.row_mut(r).assign(&synthetic_spectrum(cols, &lines, 20.0));
        }
        frame
    }

    fn parabola(r: usize) -> f64 {
        let d = r as f64 - 20.0;
        0.002 * d * d
    }

    #[test]
    fn test_cross_correlation_recovers_smile() {
        let frame = smiling_frame(41, 400, parabola);
        let smile = SmileCorrector::standard().from_cross_correlation(&frame).unwrap();

        assert_eq!(smile.reference_row(), 20);
        assert_eq!(smile.shifts()[20], 0.0);
        for r in 0..41 {
            assert_abs_diff_eq!(smile.shifts()[r], parabola(r), epsilon = 0.1);
        }
    }

    #[test]
    fn test_apply_aligns_rows() {
        let frame = smiling_frame(41, 400, parabola);
        let smile = SmileCorrector::standard().from_cross_correlation(&frame).unwrap();
        let aligned = smile.apply(&frame).unwrap();

        let reference = aligned.row(20).to_owned();
        let edge = aligned.row(0).to_owned();
        // Line peaks now sit on the same pixel
        assert_abs_diff_eq!(edge[140], reference[140], epsilon = 40.0);
    }

    #[test]
    fn test_discontinuity_is_flagged() {
        let frame = smiling_frame(41, 400, |r| if r == 33 { 5.0 } else { parabola(r) });
        let result = SmileCorrector::standard().from_cross_correlation(&frame);
        match result {
            Err(HsiError::CalibrationFit { detail, .. }) => assert!(detail.contains("33")),
            other => panic!("expected smile fit error, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_and_invariants() {
        let corrector = SmileCorrector::standard();
        let smile = corrector.reset(9).unwrap();
        assert_eq!(smile.reference_row(), 4);
        assert!(smile.shifts().iter().all(|&s| s == 0.0));

        assert!(SmileShifts::new(vec![0.1, 0.2, 0.3], 1).is_err());
        assert!(SmileShifts::new(vec![0.1, 0.0], 5).is_err());
    }

    #[test]
    fn test_shift_row_moves_features() {
        let row = Array1::from(vec![0.0, 0.0, 10.0, 0.0, 0.0, 0.0]);
        let shifted = shift_row(row.view(), 2.0);
        assert_eq!(shifted[4], 10.0);
        let half = shift_row(row.view(), 0.5);
        assert_eq!(half[2], 5.0);
        assert_eq!(half[3], 5.0);
    }
}
