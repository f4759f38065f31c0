use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Peak detection parameters
#[derive(Debug, Clone)]
pub struct PeakDetectionParams {
    /// Minimum peak height (DN)
    pub min_height: f64,
    /// Minimum prominence above the higher of the two surrounding minima (DN)
    pub min_prominence: f64,
    /// Minimum full width at half prominence (pixels)
    pub min_width: f64,
}

impl Default for PeakDetectionParams {
    fn default() -> Self {
        Self {
            min_height: 0.0,
            min_prominence: 10.0,   // Well above read noise for 12-bit frames
            min_width: 2.0,         // Emission lines span several pixels
        }
    }
}

/// One detected spectral peak
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Pixel index of the local maximum
    pub index: usize,
    /// Sub-pixel position from a three-point parabolic fit
    pub position: f64,
    /// Signal value at `index`
    pub intensity: f64,
    pub prominence: f64,
    /// Width at half prominence (pixels)
    pub width: f64,
}

/// Peaks found in one spectrum, ordered by pixel index
pub type PeakSet = Vec<Peak>;

/// Finds local maxima in a 1-D spectrum
pub struct PeakDetector {
    params: PeakDetectionParams,
}

impl PeakDetector {
    pub fn new(params: PeakDetectionParams) -> Self {
        Self { params }
    }

    pub fn standard() -> Self {
        Self::new(PeakDetectionParams::default())
    }

    pub fn params(&self) -> &PeakDetectionParams {
        &self.params
    }

    /// Detect peaks passing the height, prominence and width thresholds.
    ///
    /// Prominence and width are checked jointly: a spike that is tall but
    /// narrower than `min_width` is rejected.
    pub fn detect(&self, spectrum: ArrayView1<f64>) -> PeakSet {
        let signal: Vec<f64> = spectrum.iter().copied().collect();
        let candidates = local_maxima(&signal);
        log::debug!("{} local maxima in {} pixel spectrum", candidates.len(), signal.len());

        let mut peaks = PeakSet::new();
        for index in candidates {
            let intensity = signal[index];
            if intensity < self.params.min_height {
                continue;
            }

            let (prominence, left_base, right_base) = prominence(&signal, index);
            if prominence < self.params.min_prominence {
                continue;
            }

            let width = half_prominence_width(&signal, index, prominence, left_base, right_base);
            if width < self.params.min_width {
                log::debug!(
                    "Rejecting narrow peak at pixel {} (width {:.2} px, prominence {:.1})",
                    index, width, prominence
                );
                continue;
            }

            peaks.push(Peak {
                index,
                position: parabolic_position(&signal, index),
                intensity,
                prominence,
                width,
            });
        }

        peaks
    }
}

/// Indices of local maxima; flat tops report their (lower) middle sample
fn local_maxima(signal: &[f64]) -> Vec<usize> {
    let n = signal.len();
    let mut maxima = Vec::new();
    if n < 3 {
        return maxima;
    }

    let mut i = 1;
    while i < n - 1 {
        if signal[i - 1] < signal[i] {
            let mut ahead = i;
            while ahead + 1 < n && signal[ahead + 1] == signal[i] {
                ahead += 1;
            }
            if ahead + 1 < n && signal[ahead + 1] < signal[i] {
                maxima.push((i + ahead) / 2);
            }
            i = ahead + 1;
        } else {
            i += 1;
        }
    }
    maxima
}

/// Topographic prominence and the indices of the left/right bases
fn prominence(signal: &[f64], peak: usize) -> (f64, usize, usize) {
    let height = signal[peak];

    let mut left_base = peak;
    let mut left_min = height;
    let mut i = peak;
    while i > 0 {
        i -= 1;
        if signal[i] > height {
            break;
        }
        if signal[i] < left_min {
            left_min = signal[i];
            left_base = i;
        }
    }

    let mut right_base = peak;
    let mut right_min = height;
    let mut i = peak;
    while i + 1 < signal.len() {
        i += 1;
        if signal[i] > height {
            break;
        }
        if signal[i] < right_min {
            right_min = signal[i];
            right_base = i;
        }
    }

    (height - left_min.max(right_min), left_base, right_base)
}

/// Width at half prominence with linear interpolation of the crossing points
fn half_prominence_width(
    signal: &[f64],
    peak: usize,
    prominence: f64,
    left_base: usize,
    right_base: usize,
) -> f64 {
    let reference = signal[peak] - 0.5 * prominence;

    let mut i = peak;
    while i > left_base && signal[i] > reference {
        i -= 1;
    }
    let mut left = i as f64;
    if signal[i] < reference {
        left += (reference - signal[i]) / (signal[i + 1] - signal[i]);
    }

    let mut i = peak;
    while i < right_base && signal[i] > reference {
        i += 1;
    }
    let mut right = i as f64;
    if signal[i] < reference {
        right -= (reference - signal[i]) / (signal[i - 1] - signal[i]);
    }

    right - left
}

fn parabolic_position(signal: &[f64], index: usize) -> f64 {
    if index == 0 || index + 1 >= signal.len() {
        return index as f64;
    }
    let (l, c, r) = (signal[index - 1], signal[index], signal[index + 1]);
    let denom = l - 2.0 * c + r;
    if denom.abs() < 1e-12 {
        return index as f64;
    }
    let delta = 0.5 * (l - r) / denom;
    index as f64 + delta.clamp(-0.5, 0.5)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::Array1;

    /// Gaussian lines on a flat background
    pub(crate) fn synthetic_spectrum(len: usize, lines: &[(f64, f64, f64)], background: f64) -> Array1<f64> {
        Array1::from_shape_fn(len, |i| {
            let x = i as f64;
            background
                + lines
                    .iter()
                    .map(|&(center, height, sigma)| {
                        height * (-(x - center).powi(2) / (2.0 * sigma * sigma)).exp()
                    })
                    .sum::<f64>()
        })
    }

    #[test]
    fn test_detects_expected_peaks() {
        let spectrum = synthetic_spectrum(
            400,
            &[(50.0, 120.0, 3.0), (150.0, 80.0, 2.5), (310.0, 200.0, 4.0)],
            5.0,
        );
        let detector = PeakDetector::new(PeakDetectionParams {
            min_height: 30.0,
            min_prominence: 20.0,
            min_width: 2.0,
        });

        let peaks = detector.detect(spectrum.view());
        let indices: Vec<usize> = peaks.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![50, 150, 310]);

        // Symmetric lines sit exactly on their sample
        assert_eq!(peaks[0].position, 50.0);
        assert!((peaks[2].intensity - 205.0).abs() < 1e-9);
        // FWHM of a gaussian is 2.355 sigma
        assert!((peaks[0].width - 2.355 * 3.0).abs() < 0.2);
    }

    #[test]
    fn test_height_threshold_excludes_dim_peak() {
        let spectrum = synthetic_spectrum(300, &[(80.0, 150.0, 3.0), (200.0, 40.0, 3.0)], 0.0);
        let detector = PeakDetector::new(PeakDetectionParams {
            min_height: 50.0,
            min_prominence: 10.0,
            min_width: 2.0,
        });

        let peaks = detector.detect(spectrum.view());
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].index, 80);
    }

    #[test]
    fn test_narrow_spike_rejected_despite_height() {
        let mut spectrum = synthetic_spectrum(300, &[(80.0, 100.0, 3.0)], 0.0);
        spectrum[200] = 500.0; // hot pixel

        let detector = PeakDetector::new(PeakDetectionParams {
            min_height: 50.0,
            min_prominence: 10.0,
            min_width: 2.0,
        });
        let peaks = detector.detect(spectrum.view());
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].index, 80);
    }

    #[test]
    fn test_low_prominence_shoulder_rejected() {
        // Small bump riding on the flank of a bright line
        let spectrum = synthetic_spectrum(200, &[(100.0, 300.0, 10.0), (130.0, 25.0, 2.0)], 0.0);
        let detector = PeakDetector::new(PeakDetectionParams {
            min_height: 20.0,
            min_prominence: 20.0,
            min_width: 2.0,
        });
        let peaks = detector.detect(spectrum.view());
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].index, 100);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let spectrum = synthetic_spectrum(256, &[(40.0, 90.0, 2.0), (180.0, 60.0, 3.0)], 2.0);
        let detector = PeakDetector::standard();
        assert_eq!(detector.detect(spectrum.view()), detector.detect(spectrum.view()));
    }

    #[test]
    fn test_plateau_reports_middle() {
        let spectrum = Array1::from(vec![0.0, 10.0, 50.0, 50.0, 50.0, 10.0, 0.0]);
        let detector = PeakDetector::new(PeakDetectionParams {
            min_height: 0.0,
            min_prominence: 1.0,
            min_width: 1.0,
        });
        let peaks = detector.detect(spectrum.view());
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].index, 3);
    }
}
