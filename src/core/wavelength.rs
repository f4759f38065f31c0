use crate::core::line_matcher::{LineMatch, LineMatcher, MatchReviewer};
use crate::core::peaks::PeakDetector;
use crate::core::smile::SmileShifts;
use crate::types::{HsiError, HsiImage, HsiResult};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Singular values below this are treated as zero in polynomial fits
const RANK_EPS: f64 = 1e-10;

/// Polynomial in the scaled coordinate t = (x - origin) / scale.
///
/// y = sum(coefficients[k] * t^k)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    pub coefficients: Vec<f64>,
    pub origin: f64,
    pub scale: f64,
}

impl Polynomial {
    /// Least-squares fit of the given degree. Returns `None` for singular systems.
    pub fn fit(points: &[(f64, f64)], degree: usize) -> Option<Self> {
        if points.len() < degree + 1 {
            return None;
        }
        let n = points.len() as f64;
        let origin = points.iter().map(|p| p.0).sum::<f64>() / n;
        let scale = points
            .iter()
            .map(|p| (p.0 - origin).abs())
            .fold(0.0, f64::max);
        let scale = if scale > 0.0 { scale } else { 1.0 };

        // Vandermonde system on the scaled abscissa, solved by SVD
        let size = degree + 1;
        let vandermonde = DMatrix::from_fn(points.len(), size, |i, k| {
            ((points[i].0 - origin) / scale).powi(k as i32)
        });
        let values = DVector::from_iterator(points.len(), points.iter().map(|p| p.1));

        let svd = vandermonde.svd(true, true);
        if svd.rank(RANK_EPS) < size {
            return None;
        }
        let solution = svd.solve(&values, RANK_EPS).ok()?;
        Some(Self {
            coefficients: solution.iter().copied().collect(),
            origin,
            scale,
        })
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn eval(&self, x: f64) -> f64 {
        let t = (x - self.origin) / self.scale;
        self.coefficients.iter().rev().fold(0.0, |acc, &c| acc * t + c)
    }

    /// dy/dx
    pub fn derivative(&self, x: f64) -> f64 {
        let t = (x - self.origin) / self.scale;
        let mut value = 0.0;
        for k in (1..self.coefficients.len()).rev() {
            value = value * t + k as f64 * self.coefficients[k];
        }
        value / self.scale
    }

    /// The polynomial q with q(x) = p(x + dx)
    pub fn shifted(&self, dx: f64) -> Self {
        Self {
            coefficients: self.coefficients.clone(),
            origin: self.origin - dx,
            scale: self.scale,
        }
    }
}

/// Wavelength fitting parameters
#[derive(Debug, Clone)]
pub struct WavelengthFitParams {
    /// Highest polynomial degree; lowered to (points - 1) for sparse rows
    pub max_degree: usize,
    /// Spectral pixels per row, used for the monotonicity check
    pub n_pixels: usize,
}

impl Default for WavelengthFitParams {
    fn default() -> Self {
        Self {
            max_degree: 3,
            n_pixels: 1024,
        }
    }
}

/// Pixel to wavelength fit of a single cross-track row
#[derive(Debug, Clone)]
pub struct RowWavelengthFit {
    pub row: usize,
    pub polynomial: Polynomial,
    /// First-degree fit of the same points
    pub linear: Polynomial,
    pub rms_residual_nm: f64,
    pub matches: Vec<LineMatch>,
}

/// Fits pixel -> wavelength functions from matched emission lines
pub struct WavelengthFitter {
    params: WavelengthFitParams,
}

impl WavelengthFitter {
    pub fn new(params: WavelengthFitParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &WavelengthFitParams {
        &self.params
    }

    /// Fit one row. Fails when the matched wavelengths do not increase with
    /// pixel index or the fitted curve is not monotonic over the sensor.
    pub fn fit_row(&self, row: usize, matches: &[LineMatch]) -> HsiResult<RowWavelengthFit> {
        let mut sorted = matches.to_vec();
        sorted.sort_by(|a, b| a.pixel.total_cmp(&b.pixel));

        if sorted.len() < 2 {
            return Err(HsiError::fit(
                "wavelength fit",
                format!("row {}: {} matched point(s), at least 2 required", row, sorted.len()),
            ));
        }

        let offending: Vec<String> = sorted
            .windows(2)
            .filter(|w| w[1].wavelength_nm <= w[0].wavelength_nm)
            .map(|w| {
                format!(
                    "px {:.1} -> {:.3} nm then px {:.1} -> {:.3} nm",
                    w[0].pixel, w[0].wavelength_nm, w[1].pixel, w[1].wavelength_nm
                )
            })
            .collect();
        if !offending.is_empty() {
            return Err(HsiError::fit(
                "wavelength fit",
                format!("row {}: wavelengths not increasing with pixel: {}", row, offending.join("; ")),
            ));
        }

        let points: Vec<(f64, f64)> = sorted.iter().map(|m| (m.pixel, m.wavelength_nm)).collect();
        let degree = self.params.max_degree.min(points.len() - 1).max(1);
        let singular = || {
            HsiError::fit(
                "wavelength fit",
                format!("row {}: singular system for {} points", row, points.len()),
            )
        };
        let polynomial = Polynomial::fit(&points, degree).ok_or_else(singular)?;
        let linear = Polynomial::fit(&points, 1).ok_or_else(singular)?;

        if let Some(px) = (0..self.params.n_pixels).find(|&px| polynomial.derivative(px as f64) <= 0.0) {
            return Err(HsiError::fit(
                "wavelength fit",
                format!(
                    "row {}: degree {} fit is not monotonic (derivative <= 0 at pixel {})",
                    row, degree, px
                ),
            ));
        }

        let rms_residual_nm = (points
            .iter()
            .map(|&(x, y)| (polynomial.eval(x) - y).powi(2))
            .sum::<f64>()
            / points.len() as f64)
            .sqrt();

        log::debug!(
            "Row {}: degree {} fit through {} lines, rms {:.4} nm",
            row, degree, points.len(), rms_residual_nm
        );

        Ok(RowWavelengthFit {
            row,
            polynomial,
            linear,
            rms_residual_nm,
            matches: sorted,
        })
    }

    /// Detect, match and fit every row of an HgAr frame.
    ///
    /// Rows that fail are collected and reported together.
    pub fn fit_frame(
        &self,
        hgar: &HsiImage,
        detector: &PeakDetector,
        matcher: &LineMatcher,
        reviewer: &mut dyn MatchReviewer,
    ) -> HsiResult<Vec<RowWavelengthFit>> {
        let (rows, _) = hgar.dim();
        log::info!("Fitting wavelengths for {} rows", rows);

        let mut fits = Vec::with_capacity(rows);
        let mut failures = Vec::new();
        for row in 0..rows {
            let peaks = detector.detect(hgar.row(row));
            let result = matcher
                .match_with_review(row, &peaks, reviewer)
                .and_then(|matches| self.fit_row(row, &matches));
            match result {
                Ok(fit) => fits.push(fit),
                Err(e) => failures.push(format!("{}", e)),
            }
        }

        if !failures.is_empty() {
            return Err(HsiError::fit(
                "wavelength fit",
                format!("{} of {} rows failed: {}", failures.len(), rows, failures.join(" | ")),
            ));
        }
        Ok(fits)
    }
}

/// Per-row pixel -> wavelength mapping plus one shared linear fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavelengthMap {
    pub rows: Vec<Polynomial>,
    /// Coarse linear fit of the reference row, used for window selection
    pub linear: Polynomial,
    pub reference_row: usize,
    pub n_pixels: usize,
}

impl WavelengthMap {
    /// Assemble from individually fitted rows (ordered by row index)
    pub fn from_rows(fits: &[RowWavelengthFit], reference_row: usize, n_pixels: usize) -> HsiResult<Self> {
        let reference = fits
            .iter()
            .find(|f| f.row == reference_row)
            .ok_or_else(|| {
                HsiError::fit("wavelength map", format!("reference row {} was not fitted", reference_row))
            })?;
        Ok(Self {
            rows: fits.iter().map(|f| f.polynomial.clone()).collect(),
            linear: reference.linear.clone(),
            reference_row,
            n_pixels,
        })
    }

    /// Every row uses the reference fit displaced by its smile shift:
    /// p_i(x) = p_ref(x + s_i)
    pub fn from_reference(reference: &RowWavelengthFit, smile: &SmileShifts, n_pixels: usize) -> Self {
        Self {
            rows: smile
                .shifts()
                .iter()
                .map(|&s| reference.polynomial.shifted(s))
                .collect(),
            linear: reference.linear.clone(),
            reference_row: smile.reference_row(),
            n_pixels,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row_wavelengths(&self, row: usize) -> Option<Array1<f64>> {
        self.rows
            .get(row)
            .map(|p| Array1::from_shape_fn(self.n_pixels, |px| p.eval(px as f64)))
    }

    /// Wavelength axis shared by all rows after smile alignment
    pub fn wavelengths(&self) -> Array1<f64> {
        self.row_wavelengths(self.reference_row)
            .unwrap_or_else(|| self.linear_wavelengths())
    }

    pub fn linear_wavelengths(&self) -> Array1<f64> {
        Array1::from_shape_fn(self.n_pixels, |px| self.linear.eval(px as f64))
    }

    /// (rows x pixels) wavelength grid
    pub fn grid(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.rows.len(), self.n_pixels), |(r, px)| self.rows[r].eval(px as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::line_matcher::{hgar_reference_lines, LineMatchParams};
    use crate::core::peaks::{tests::synthetic_spectrum, PeakDetectionParams};
    use crate::core::line_matcher::AutoAccept;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn line(pixel: f64, wavelength_nm: f64) -> LineMatch {
        LineMatch {
            pixel,
            wavelength_nm,
            intensity: 100.0,
            residual_nm: 0.0,
        }
    }

    #[test]
    fn test_polynomial_fit_recovers_quadratic() {
        let truth = |x: f64| 400.0 + 0.5 * x + 1e-4 * x * x;
        let points: Vec<(f64, f64)> = (0..20).map(|i| (i as f64 * 50.0, truth(i as f64 * 50.0))).collect();
        let poly = Polynomial::fit(&points, 2).unwrap();
        assert_abs_diff_eq!(poly.eval(333.0), truth(333.0), epsilon = 1e-8);
        assert_abs_diff_eq!(poly.derivative(100.0), 0.5 + 2e-4 * 100.0, epsilon = 1e-9);

        let shifted = poly.shifted(2.5);
        assert_abs_diff_eq!(shifted.eval(100.0), poly.eval(102.5), epsilon = 1e-9);
    }

    #[test]
    fn test_polynomial_fit_cubic_and_rank_deficient() {
        let truth = |x: f64| 380.0 + 0.6 * x - 2e-5 * x * x + 3e-9 * x * x * x;
        let points: Vec<(f64, f64)> = (0..12).map(|i| (i as f64 * 180.0, truth(i as f64 * 180.0))).collect();
        let poly = Polynomial::fit(&points, 3).unwrap();
        for x in [0.0, 777.0, 1980.0] {
            assert_relative_eq!(poly.eval(x), truth(x), max_relative = 1e-12);
        }

        // Two distinct abscissae cannot carry a quadratic
        let repeated = [(10.0, 1.0), (10.0, 1.5), (20.0, 2.0), (20.0, 2.5)];
        assert!(Polynomial::fit(&repeated, 2).is_none());
        let line = Polynomial::fit(&repeated, 1).unwrap();
        assert_relative_eq!(line.eval(15.0), 1.75, max_relative = 1e-12);
        assert!(Polynomial::fit(&[(5.0, 1.0), (5.0, 2.0)], 1).is_none());
    }

    #[test]
    fn test_two_points_give_exact_line() {
        let fitter = WavelengthFitter::new(WavelengthFitParams { max_degree: 3, n_pixels: 512 });
        let fit = fitter
            .fit_row(0, &[line(100.0, 435.833), line(300.0, 763.511)])
            .unwrap();
        assert_eq!(fit.polynomial.degree(), 1);
        assert_abs_diff_eq!(fit.polynomial.eval(100.0), 435.833, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.polynomial.eval(300.0), 763.511, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.linear.eval(300.0), 763.511, epsilon = 1e-9);
    }

    #[test]
    fn test_non_monotonic_matches_rejected() {
        let fitter = WavelengthFitter::new(WavelengthFitParams::default());
        let result = fitter.fit_row(4, &[line(100.0, 546.074), line(300.0, 435.833), line(500.0, 763.511)]);
        match result {
            Err(HsiError::CalibrationFit { detail, .. }) => {
                assert!(detail.contains("row 4"));
                assert!(detail.contains("px 300.0"));
            }
            other => panic!("expected fit error, got {:?}", other),
        }
    }

    #[test]
    fn test_fit_is_monotonic_over_sensor() {
        let fitter = WavelengthFitter::new(WavelengthFitParams { max_degree: 2, n_pixels: 800 });
        let fit = fitter
            .fit_row(0, &[line(20.0, 404.656), line(250.0, 546.074), line(540.0, 763.511), line(610.0, 811.531)])
            .unwrap();
        let wl: Vec<f64> = (0..800).map(|px| fit.polynomial.eval(px as f64)).collect();
        assert!(wl.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_fit_frame_and_map_from_rows() {
        // 0.6 nm/px starting at 380 nm, same in every row
        let px = |wl: f64| (wl - 380.0) / 0.6;
        let lines: Vec<(f64, f64, f64)> = vec![
            (px(435.833), 900.0, 2.0),
            (px(546.074), 1000.0, 2.0),
            (px(763.511), 600.0, 2.0),
            (px(696.543), 300.0, 2.0),
        ];
        let spectrum = synthetic_spectrum(700, &lines, 10.0);
        let hgar = Array2::from_shape_fn((3, 700), |(_, c)| spectrum[c]);

        let detector = PeakDetector::new(PeakDetectionParams {
            min_height: 100.0,
            min_prominence: 50.0,
            min_width: 2.0,
        });
        let matcher = LineMatcher::new(
            LineMatchParams {
                top_k: 2,
                hint_wavelengths: Some(vec![546.074, 435.833]),
                max_error_nm: 2.0,
            },
            hgar_reference_lines(),
        );
        let fitter = WavelengthFitter::new(WavelengthFitParams { max_degree: 2, n_pixels: 700 });

        let fits = fitter.fit_frame(&hgar, &detector, &matcher, &mut AutoAccept).unwrap();
        assert_eq!(fits.len(), 3);
        assert_eq!(fits[1].matches.len(), 4);

        let map = WavelengthMap::from_rows(&fits, 1, 700).unwrap();
        let wl = map.wavelengths();
        assert_abs_diff_eq!(wl[0], 380.0, epsilon = 0.2);
        assert_abs_diff_eq!(wl[100], 440.0, epsilon = 0.2);
        assert_eq!(map.grid().dim(), (3, 700));
    }
}
