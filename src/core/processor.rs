use crate::core::smile::SmileShifts;
use crate::io::bundle::CalibrationBundle;
use crate::types::{Frame, HsiError, HsiImage, HsiResult, ProcessingLevel};
use ndarray::Array1;
use std::sync::Arc;

/// Dark-subtract and smile-align a flat-field capture into the normalizer used
/// at level 2. Every pixel must remain strictly positive.
pub fn derive_flat_field(flat: &Frame, dark: &HsiImage, smile: &SmileShifts) -> HsiResult<HsiImage> {
    if flat.dim() != dark.dim() {
        return Err(HsiError::InputData(format!(
            "Flat-field frame {:?} does not match dark frame {:?}",
            flat.dim(),
            dark.dim()
        )));
    }

    let signal = flat.data() - dark;
    let mut bad_rows: Vec<usize> = Vec::new();
    let mut bad_pixels = 0;
    for (row, values) in signal.outer_iter().enumerate() {
        let count = values.iter().filter(|&&v| !(v > 0.0)).count();
        if count > 0 {
            bad_pixels += count;
            bad_rows.push(row);
        }
    }
    if bad_pixels > 0 {
        let shown: Vec<String> = bad_rows.iter().take(10).map(|r| r.to_string()).collect();
        return Err(HsiError::fit(
            "flat field",
            format!(
                "{} pixels not positive after dark subtraction in rows [{}{}]",
                bad_pixels,
                shown.join(", "),
                if bad_rows.len() > 10 { ", ..." } else { "" }
            ),
        ));
    }

    let aligned = smile.apply(&signal)?;
    log::info!(
        "Flat field derived: mean {:.1} DN over {} pixels",
        aligned.mean().unwrap_or(0.0),
        aligned.len()
    );
    Ok(aligned)
}

/// Applies the requested processing level to raw frames.
///
/// The calibration bundle is shared read-only between frames. Swapping it
/// requires `&mut self`, so no frame can be in flight during a swap.
pub struct FrameProcessor {
    bundle: Arc<CalibrationBundle>,
    level: ProcessingLevel,
    /// Radiance of the reference panel per spectral pixel
    reference_panel: Option<Array1<f64>>,
}

impl FrameProcessor {
    /// Fails with a configuration error if `bundle` lacks anything `level` needs
    pub fn new(
        bundle: Arc<CalibrationBundle>,
        level: ProcessingLevel,
        reference_panel: Option<Array1<f64>>,
    ) -> HsiResult<Self> {
        check_prerequisites(&bundle, level, reference_panel.as_ref())?;
        log::info!("Frame processor ready at level {} ({})", level.code(), level);
        Ok(Self {
            bundle,
            level,
            reference_panel,
        })
    }

    pub fn level(&self) -> ProcessingLevel {
        self.level
    }

    pub fn bundle(&self) -> &Arc<CalibrationBundle> {
        &self.bundle
    }

    /// Replace the calibration after recalibration; the current level must
    /// still be supported
    pub fn swap_bundle(&mut self, bundle: Arc<CalibrationBundle>) -> HsiResult<()> {
        check_prerequisites(&bundle, self.level, self.reference_panel.as_ref())?;
        log::info!("Swapped calibration bundle for camera {}", bundle.camera_id);
        self.bundle = bundle;
        Ok(())
    }

    /// Correct one raw frame to the configured level
    pub fn process(&self, frame: &Frame) -> HsiResult<Frame> {
        if frame.level() != ProcessingLevel::Raw {
            return Err(HsiError::InputData(format!(
                "Frame already processed to level {}; only raw frames are accepted",
                frame.level()
            )));
        }
        if self.level == ProcessingLevel::Raw {
            return Ok(frame.clone());
        }

        let dark = require(self.bundle.dark_pic.as_ref(), "dark_pic")?;
        if frame.dim() != dark.dim() {
            return Err(HsiError::InputData(format!(
                "Frame {:?} does not match calibration geometry {:?}",
                frame.dim(),
                dark.dim()
            )));
        }
        let mut data = frame.data() - dark;

        if self.level >= ProcessingLevel::FlatFielded {
            let smile = require(self.bundle.smile_shifts.as_ref(), "smile_shifts")?;
            let flat = require(self.bundle.flat_field_pic.as_ref(), "flat_field_pic")?;
            data = smile.apply(&data)? / flat;
        }

        if self.level >= ProcessingLevel::Radiance {
            let fit = require(self.bundle.radiance_fit.as_ref(), "radiance_fit")?;
            data = fit.radiance(&data, frame.exposure_ms())?;
        }

        if self.level == ProcessingLevel::Reflectance {
            let panel = require(self.reference_panel.as_ref(), "reference panel")?;
            data = data / panel;
        }

        Ok(frame.derive(data, self.level))
    }

    /// Process independent frames, in parallel when enabled
    pub fn process_batch(&self, frames: &[Frame]) -> Vec<HsiResult<Frame>> {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            frames.par_iter().map(|f| self.process(f)).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            frames.iter().map(|f| self.process(f)).collect()
        }
    }
}

fn require<'a, T>(item: Option<&'a T>, name: &str) -> HsiResult<&'a T> {
    item.ok_or_else(|| HsiError::Configuration(format!("Calibration is missing {}", name)))
}

fn check_prerequisites(
    bundle: &CalibrationBundle,
    level: ProcessingLevel,
    reference_panel: Option<&Array1<f64>>,
) -> HsiResult<()> {
    let mut missing = Vec::new();
    if level >= ProcessingLevel::DarkSubtracted && bundle.dark_pic.is_none() {
        missing.push("dark_pic");
    }
    if level >= ProcessingLevel::FlatFielded {
        if bundle.flat_field_pic.is_none() {
            missing.push("flat_field_pic");
        }
        if bundle.smile_shifts.is_none() {
            missing.push("smile_shifts");
        }
    }
    if level >= ProcessingLevel::Radiance && bundle.radiance_fit.is_none() {
        missing.push("radiance_fit");
    }
    if level == ProcessingLevel::Reflectance && reference_panel.is_none() {
        missing.push("reference panel radiance");
    }
    if !missing.is_empty() {
        return Err(HsiError::Configuration(format!(
            "Level {} ({}) requires {} which the calibration for camera {} lacks",
            level.code(),
            level,
            missing.join(", "),
            bundle.camera_id
        )));
    }

    // Every array the level touches must describe the same geometry
    let Some(dark) = bundle.dark_pic.as_ref().filter(|_| level >= ProcessingLevel::DarkSubtracted) else {
        return Ok(());
    };
    let (rows, cols) = dark.dim();
    let mut mismatched = Vec::new();
    if level >= ProcessingLevel::FlatFielded {
        if bundle.flat_field_pic.as_ref().map_or(false, |f| f.dim() != (rows, cols)) {
            mismatched.push("flat_field_pic");
        }
        if bundle.smile_shifts.as_ref().map_or(false, |s| s.len() != rows) {
            mismatched.push("smile_shifts");
        }
    }
    if level >= ProcessingLevel::Radiance
        && bundle.radiance_fit.as_ref().map_or(false, |f| f.frame_dim() != (rows, cols))
    {
        mismatched.push("radiance_fit");
    }
    if level == ProcessingLevel::Reflectance && reference_panel.map_or(false, |p| p.len() != cols) {
        mismatched.push("reference panel");
    }
    if !mismatched.is_empty() {
        return Err(HsiError::Configuration(format!(
            "{} disagree with the {}x{} dark frame",
            mismatched.join(", "),
            rows,
            cols
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::Utc;
    use ndarray::Array2;

    fn raw(value: f64, dim: (usize, usize)) -> Frame {
        Frame::raw(Array2::from_elem(dim, value), 10.0, Utc::now()).unwrap()
    }

    fn flat_bundle(dim: (usize, usize)) -> CalibrationBundle {
        let dark = HsiImage::zeros(dim);
        let smile = SmileShifts::zeros(dim.0, dim.0 / 2);
        let flat = derive_flat_field(&raw(200.0, dim), &dark, &smile).unwrap();
        let mut bundle = CalibrationBundle::new("cam-test");
        bundle.dark_pic = Some(dark);
        bundle.smile_shifts = Some(smile);
        bundle.flat_field_pic = Some(flat);
        bundle
    }

    #[test]
    fn test_flat_fielded_uniform_frame_is_one() {
        let dim = (16, 32);
        let processor =
            FrameProcessor::new(Arc::new(flat_bundle(dim)), ProcessingLevel::FlatFielded, None).unwrap();

        let out = processor.process(&raw(200.0, dim)).unwrap();
        assert_eq!(out.level(), ProcessingLevel::FlatFielded);
        for &v in out.data().iter() {
            assert_eq!(v, 1.0);
        }
    }

    #[test]
    fn test_double_application_rejected() {
        let dim = (8, 8);
        let processor =
            FrameProcessor::new(Arc::new(flat_bundle(dim)), ProcessingLevel::FlatFielded, None).unwrap();
        let once = processor.process(&raw(200.0, dim)).unwrap();
        assert!(matches!(processor.process(&once), Err(HsiError::InputData(_))));
    }

    #[test]
    fn test_missing_prerequisites_fail_at_construction() {
        let bundle = Arc::new(CalibrationBundle::new("cam-test"));
        assert!(FrameProcessor::new(bundle.clone(), ProcessingLevel::Raw, None).is_ok());
        for level in [ProcessingLevel::DarkSubtracted, ProcessingLevel::FlatFielded, ProcessingLevel::Radiance] {
            assert!(matches!(
                FrameProcessor::new(bundle.clone(), level, None),
                Err(HsiError::Configuration(_))
            ));
        }

        let flat_only = Arc::new(flat_bundle((4, 4)));
        assert!(matches!(
            FrameProcessor::new(flat_only.clone(), ProcessingLevel::Radiance, None),
            Err(HsiError::Configuration(_))
        ));
        // Reflectance without a panel is unsupported
        assert!(matches!(
            FrameProcessor::new(flat_only, ProcessingLevel::Reflectance, None),
            Err(HsiError::Configuration(_))
        ));
    }

    #[test]
    fn test_dark_only_bundle_supports_level_one() {
        let mut bundle = CalibrationBundle::new("cam-test");
        bundle.dark_pic = Some(HsiImage::from_elem((4, 6), 12.0));
        let processor = FrameProcessor::new(Arc::new(bundle), ProcessingLevel::DarkSubtracted, None).unwrap();

        let out = processor.process(&raw(100.0, (4, 6))).unwrap();
        assert_abs_diff_eq!(out.data()[[2, 3]], 88.0);
        assert_eq!(out.exposure_ms(), 10.0);
    }

    #[test]
    fn test_swap_bundle_revalidates() {
        let dim = (8, 8);
        let mut processor =
            FrameProcessor::new(Arc::new(flat_bundle(dim)), ProcessingLevel::FlatFielded, None).unwrap();
        let empty = Arc::new(CalibrationBundle::new("cam-test"));
        assert!(processor.swap_bundle(empty).is_err());

        let mut brighter = flat_bundle(dim);
        brighter.flat_field_pic = Some(HsiImage::from_elem(dim, 400.0));
        processor.swap_bundle(Arc::new(brighter)).unwrap();
        let out = processor.process(&raw(200.0, dim)).unwrap();
        assert_eq!(out.data()[[0, 0]], 0.5);
    }

    #[test]
    fn test_non_positive_flat_field_reported() {
        let mut flat = Array2::from_elem((6, 10), 50.0);
        flat[[3, 4]] = 5.0;
        let frame = Frame::raw(flat, 10.0, Utc::now()).unwrap();
        let dark = HsiImage::from_elem((6, 10), 5.0);

        match derive_flat_field(&frame, &dark, &SmileShifts::zeros(6, 3)) {
            Err(HsiError::CalibrationFit { step, detail }) => {
                assert_eq!(step, "flat field");
                assert!(detail.contains("rows [3]"));
            }
            other => panic!("expected fit error, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_matches_single() {
        let dim = (8, 8);
        let processor =
            FrameProcessor::new(Arc::new(flat_bundle(dim)), ProcessingLevel::FlatFielded, None).unwrap();
        let frames = vec![raw(100.0, dim), raw(300.0, dim)];
        let out = processor.process_batch(&frames);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().data()[[1, 1]], 0.5);
        assert_eq!(out[1].as_ref().unwrap().data()[[1, 1]], 1.5);
    }
}
