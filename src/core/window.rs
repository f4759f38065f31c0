use crate::types::{Frame, HsiError, HsiResult};
use ndarray::{s, Axis};
use serde::{Deserialize, Serialize};

/// Parameters for finding the illuminated cross-track window
#[derive(Debug, Clone)]
pub struct WindowParams {
    /// Row is illuminated when its mean exceeds floor + fraction * (max - floor)
    pub threshold_fraction: f64,
    /// Dark level of unilluminated rows; defaults to the dimmest row mean
    pub noise_floor_dn: Option<f64>,
    /// Minimum brightest-row mean for the capture to be usable (DN)
    pub min_signal_dn: f64,
    /// Rows trimmed from each end of the illuminated range
    pub edge_margin: usize,
    /// Hardware window offset/height step in sensor rows
    pub granularity: usize,
    /// Saturation level of the sensor, if known
    pub max_dn: Option<f64>,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            threshold_fraction: 0.5,
            noise_floor_dn: None,
            min_signal_dn: 10.0,
            edge_margin: 0,
            granularity: 4,      // Typical GigE sensor ROI step
            max_dn: None,
        }
    }
}

/// Illuminated rows and the hardware window that covers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometry {
    /// First illuminated row (sensor coordinates, inclusive)
    pub row_min: usize,
    /// Last illuminated row (sensor coordinates, inclusive)
    pub row_max: usize,
    /// Hardware window offset, a multiple of the granularity
    pub hw_offset: usize,
    /// Hardware window height, a multiple of the granularity
    pub hw_height: usize,
    /// Software crop inside the hardware window
    pub crop: CropGeometry,
}

/// Software crop applied to frames read from the hardware window.
///
/// Offsets are relative to the hardware window and index a frame already in
/// (cross-track, spectral) order: `offset_y`/`height` select cross-track rows
/// and `offset_x`/`width` select spectral pixels. Drivers for sensors that
/// read the spectral axis along sensor rows must transpose each frame before
/// cropping, and map full-sensor spans with [`CropGeometry::from_full_sensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CropGeometry {
    pub offset_y: usize,
    pub height: Option<usize>,
    pub offset_x: usize,
    pub width: Option<usize>,
}

/// Start and length of a crop along one sensor axis, in full-sensor pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSpan {
    pub start: usize,
    pub size: usize,
}

impl CropGeometry {
    /// Crop for a sensor mounted with the spectral axis along sensor rows
    /// (Y) and the cross-track axis along sensor columns (X).
    ///
    /// `spectral` and `spatial` are full-sensor spans; `hw_offset_y` and
    /// `hw_offset_x` are the hardware window offsets in sensor axes. The
    /// result applies to the transposed (cross-track, spectral) frame.
    pub fn from_full_sensor(
        spectral: SensorSpan,
        spatial: SensorSpan,
        hw_offset_y: usize,
        hw_offset_x: usize,
    ) -> HsiResult<Self> {
        let relative = |span: SensorSpan, hw_offset: usize, axis: &str| {
            span.start.checked_sub(hw_offset).ok_or_else(|| {
                HsiError::Configuration(format!(
                    "{} crop starts at sensor pixel {} before the hardware window offset {}",
                    axis, span.start, hw_offset
                ))
            })
        };
        if spectral.size == 0 || spatial.size == 0 {
            return Err(HsiError::Configuration("Crop spans must not be empty".to_string()));
        }
        Ok(Self {
            offset_y: relative(spatial, hw_offset_x, "Spatial")?,
            height: Some(spatial.size),
            offset_x: relative(spectral, hw_offset_y, "Spectral")?,
            width: Some(spectral.size),
        })
    }
}

/// Determines the illuminated window from a flat-field capture
pub struct GeometricWindower {
    params: WindowParams,
}

impl GeometricWindower {
    pub fn new(params: WindowParams) -> Self {
        Self { params }
    }

    pub fn standard() -> Self {
        Self::new(WindowParams::default())
    }

    /// Find the illuminated rows of a full-sensor flat-field frame and round
    /// the covering hardware window to the granularity
    pub fn find_window(&self, flat: &Frame) -> HsiResult<WindowGeometry> {
        let data = flat.data();
        let (rows, cols) = data.dim();
        log::info!("Finding illuminated window in {}x{} flat-field frame", rows, cols);

        if let Some(max_dn) = self.params.max_dn {
            if flat.saturated_pixel_count(max_dn) == data.len() {
                return Err(HsiError::InputData(
                    "Flat-field frame is saturated everywhere".to_string(),
                ));
            }
        }

        let row_means = data
            .mean_axis(Axis(1))
            .ok_or_else(|| HsiError::InputData("Flat-field frame has no columns".to_string()))?;
        let brightest = row_means.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        if brightest < self.params.min_signal_dn {
            return Err(HsiError::InputData(format!(
                "Flat-field frame under-exposed: brightest row mean {:.1} DN < {:.1} DN",
                brightest, self.params.min_signal_dn
            )));
        }

        let floor = self
            .params
            .noise_floor_dn
            .unwrap_or_else(|| row_means.fold(f64::INFINITY, |m, &v| m.min(v)));
        let threshold = floor + self.params.threshold_fraction * (brightest - floor);
        log::debug!("Row threshold {:.2} DN (floor {:.2}, brightest {:.2})", threshold, floor, brightest);

        let illuminated: Vec<bool> = row_means.iter().map(|&m| m >= threshold).collect();
        let (first, last) = longest_run(&illuminated).ok_or_else(|| {
            HsiError::InputData("No illuminated rows above the noise threshold".to_string())
        })?;

        let margin = self.params.edge_margin;
        if last < first + 2 * margin {
            return Err(HsiError::InputData(format!(
                "Illuminated range {}..={} is narrower than twice the edge margin {}",
                first, last, margin
            )));
        }
        let (row_min, row_max) = (first + margin, last - margin);

        let geometry = self.hardware_window(row_min, row_max, rows)?;
        log::info!(
            "Illuminated rows {}..={}, hardware window offset {} height {}",
            row_min, row_max, geometry.hw_offset, geometry.hw_height
        );
        Ok(geometry)
    }

    /// Round the window outward to the granularity and verify the result
    fn hardware_window(&self, row_min: usize, row_max: usize, sensor_rows: usize) -> HsiResult<WindowGeometry> {
        let g = self.params.granularity.max(1);
        let hw_offset = (row_min / g) * g;
        let mut hw_end = (row_max + 1).div_ceil(g) * g;
        if hw_end > sensor_rows {
            hw_end = (sensor_rows / g) * g;
        }
        let hw_height = hw_end.saturating_sub(hw_offset);

        let geometry = WindowGeometry {
            row_min,
            row_max,
            hw_offset,
            hw_height,
            crop: CropGeometry {
                offset_y: row_min - hw_offset,
                height: Some(row_max - row_min + 1),
                offset_x: 0,
                width: None,
            },
        };

        let problems = verify_window(&geometry, g, sensor_rows);
        if !problems.is_empty() {
            return Err(HsiError::Configuration(format!(
                "Hardware window offset {} height {} (granularity {}) is invalid: {}",
                hw_offset,
                hw_height,
                g,
                problems.join(", ")
            )));
        }
        Ok(geometry)
    }
}

fn verify_window(geometry: &WindowGeometry, granularity: usize, sensor_rows: usize) -> Vec<&'static str> {
    let mut problems = Vec::new();
    if geometry.hw_offset % granularity != 0 {
        problems.push("offset not a multiple of the granularity");
    }
    if geometry.hw_height == 0 || geometry.hw_height % granularity != 0 {
        problems.push("height not a positive multiple of the granularity");
    }
    if geometry.hw_offset > geometry.row_min {
        problems.push("window starts below the first illuminated row");
    }
    if geometry.hw_offset + geometry.hw_height <= geometry.row_max {
        problems.push("window ends before the last illuminated row");
    }
    if geometry.hw_offset + geometry.hw_height > sensor_rows {
        problems.push("window exceeds the sensor");
    }
    problems
}

/// Inclusive bounds of the longest run of `true`
fn longest_run(flags: &[bool]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = None;
    for (i, &f) in flags.iter().chain(std::iter::once(&false)).enumerate() {
        match (f, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if best.map_or(true, |(b0, b1)| i - s > b1 - b0 + 1) {
                    best = Some((s, i - 1));
                }
                start = None;
            }
            _ => {}
        }
    }
    best
}

/// Cut the crop window out of a frame read from the hardware window.
///
/// `frame` must already be in (cross-track, spectral) order; see
/// [`CropGeometry`] for sensors mounted the other way round.
pub fn crop_frame(frame: &Frame, crop: &CropGeometry) -> HsiResult<Frame> {
    let (rows, cols) = frame.dim();
    let height = crop.height.unwrap_or(rows.saturating_sub(crop.offset_y));
    let width = crop.width.unwrap_or(cols.saturating_sub(crop.offset_x));
    if crop.offset_y + height > rows || crop.offset_x + width > cols || height == 0 || width == 0 {
        return Err(HsiError::Configuration(format!(
            "Crop {}+{} x {}+{} does not fit a {}x{} frame",
            crop.offset_y, height, crop.offset_x, width, rows, cols
        )));
    }

    let data = frame
        .data()
        .slice(s![crop.offset_y..crop.offset_y + height, crop.offset_x..crop.offset_x + width])
        .to_owned();
    Ok(frame.derive(data, frame.level()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ndarray::Array2;

    fn frame(data: Array2<f64>) -> Frame {
        Frame::raw(data, 10.0, Utc::now()).unwrap()
    }

    #[test]
    fn test_full_sensor_spans_map_onto_transposed_frame() {
        // Hardware window read in sensor order: rows are spectral, columns cross-track
        let (hw_offset_y, hw_offset_x) = (2, 1);
        let sensor = Array2::from_shape_fn((10, 8), |(y, x)| ((y + hw_offset_y) * 100 + x + hw_offset_x) as f64);
        let spectral = SensorSpan { start: 4, size: 5 };
        let spatial = SensorSpan { start: 3, size: 4 };

        let crop = CropGeometry::from_full_sensor(spectral, spatial, hw_offset_y, hw_offset_x).unwrap();
        assert_eq!(
            crop,
            CropGeometry { offset_y: 2, height: Some(4), offset_x: 2, width: Some(5) }
        );

        let cropped = crop_frame(&frame(sensor.t().to_owned()), &crop).unwrap();
        assert_eq!(cropped.dim(), (4, 5));
        // Cross-track row 0 is sensor column 3, spectral pixel 0 is sensor row 4
        assert_eq!(cropped.data()[[0, 0]], 403.0);
        assert_eq!(cropped.data()[[3, 4]], 806.0);

        let before_window = SensorSpan { start: 1, size: 5 };
        assert!(matches!(
            CropGeometry::from_full_sensor(before_window, spatial, hw_offset_y, hw_offset_x),
            Err(HsiError::Configuration(_))
        ));
    }

    #[test]
    fn test_uniform_frame_is_fully_illuminated() {
        let flat = frame(Array2::from_elem((64, 100), 200.0));
        let geometry = GeometricWindower::standard().find_window(&flat).unwrap();
        assert_eq!(geometry.row_min, 0);
        assert_eq!(geometry.row_max, 63);
        assert_eq!(geometry.hw_offset, 0);
        assert_eq!(geometry.hw_height, 64);
    }

    #[test]
    fn test_window_rounded_to_granularity() {
        // Rows 13..=50 lit on a 100 row sensor
        let flat = frame(Array2::from_shape_fn((100, 40), |(r, _)| {
            if (13..=50).contains(&r) { 800.0 } else { 5.0 }
        }));
        let geometry = GeometricWindower::standard().find_window(&flat).unwrap();
        assert_eq!((geometry.row_min, geometry.row_max), (13, 50));
        assert_eq!(geometry.hw_offset, 12);
        assert_eq!(geometry.hw_height, 40);
        assert_eq!(geometry.hw_offset % 4, 0);
        assert_eq!(geometry.hw_height % 4, 0);
        assert_eq!(geometry.crop.offset_y, 1);
        assert_eq!(geometry.crop.height, Some(38));
    }

    #[test]
    fn test_edge_margin_and_longest_run() {
        let flat = frame(Array2::from_shape_fn((80, 10), |(r, _)| {
            if (2..=4).contains(&r) || (20..=60).contains(&r) { 500.0 } else { 0.0 }
        }));
        let windower = GeometricWindower::new(WindowParams {
            edge_margin: 3,
            ..WindowParams::default()
        });
        let geometry = windower.find_window(&flat).unwrap();
        assert_eq!((geometry.row_min, geometry.row_max), (23, 57));
    }

    #[test]
    fn test_window_that_cannot_fit_sensor_is_flagged() {
        // 30 row sensor, granularity 8: last lit row 29 cannot be covered
        let flat = frame(Array2::from_shape_fn((30, 10), |(r, _)| if r >= 10 { 500.0 } else { 0.0 }));
        let windower = GeometricWindower::new(WindowParams {
            granularity: 8,
            ..WindowParams::default()
        });
        assert!(matches!(windower.find_window(&flat), Err(HsiError::Configuration(_))));
    }

    #[test]
    fn test_dark_frame_rejected() {
        let dark = frame(Array2::from_elem((16, 16), 1.0));
        assert!(matches!(
            GeometricWindower::standard().find_window(&dark),
            Err(HsiError::InputData(_))
        ));
    }

    #[test]
    fn test_crop_frame() {
        let raw = frame(Array2::from_shape_fn((10, 20), |(r, c)| (r * 100 + c) as f64));
        let crop = CropGeometry {
            offset_y: 2,
            height: Some(5),
            offset_x: 4,
            width: Some(10),
        };
        let cropped = crop_frame(&raw, &crop).unwrap();
        assert_eq!(cropped.dim(), (5, 10));
        assert_eq!(cropped.data()[[0, 0]], 204.0);

        let too_big = CropGeometry { offset_y: 8, height: Some(5), ..CropGeometry::default() };
        assert!(crop_frame(&raw, &too_big).is_err());
    }
}
