use chrono::Utc;
use hsicalib::core::{
    Polynomial, RadianceCube, RadianceFit, RadianceFitParams, SmileShifts, SourceSpectrum, WavelengthMap,
};
use hsicalib::io::{CalibrationBundle, CalibrationStore, CalibrationUpdate};
use hsicalib::{HsiError, HsiImage};
use ndarray::{Array1, Array2};
use tempfile::TempDir;

const DIM: (usize, usize) = (6, 40);

fn wavelength_map() -> WavelengthMap {
    let points: Vec<(f64, f64)> = (0..5)
        .map(|i| {
            let px = i as f64 * 9.5;
            (px, 401.3 + 0.61 * px + 3.3e-4 * px * px)
        })
        .collect();
    let reference = Polynomial::fit(&points, 2).expect("Failed to fit polynomial");
    let linear = Polynomial::fit(&points, 1).expect("Failed to fit line");
    let shifts = SmileShifts::new(vec![0.31, 0.12, 0.02, 0.0, 0.04, 0.17], 3).expect("Invalid smile");
    WavelengthMap {
        rows: shifts.shifts().iter().map(|&s| reference.shifted(s)).collect(),
        linear,
        reference_row: 3,
        n_pixels: DIM.1,
    }
}

/// Bundle with every field populated by values that do not print exactly in decimal
fn full_bundle() -> CalibrationBundle {
    let smile = SmileShifts::new(vec![0.31, 0.12, 0.02, 0.0, 0.04, 0.17], 3).expect("Invalid smile");
    let flat = HsiImage::from_shape_fn(DIM, |(r, c)| 900.0 + (r as f64 * 1.7 + c as f64 / 3.0).cos() * 40.0);
    let dark = HsiImage::from_shape_fn(DIM, |(r, c)| 2.0 + ((r * 31 + c * 7) % 13) as f64 / 11.0);

    let exposures = vec![2.5, 5.0, 10.0];
    let luminances = vec![12.5, 25.0, 50.0];
    let mut cube = RadianceCube::new(exposures.clone(), luminances.clone(), DIM.0, DIM.1).expect("Invalid grid");
    for (ei, &e) in exposures.iter().enumerate() {
        cube.set_dark(ei, &dark).expect("dark");
        for (li, &l) in luminances.iter().enumerate() {
            let cell = &dark + &flat.mapv(|f| f * e * l / 7000.0);
            cube.set_cell(ei, li, &cell).expect("cell");
        }
    }
    cube.invalidate(2, 2);

    let map = wavelength_map();
    let source = SourceSpectrum::new(vec![380.0, 600.0, 1000.0], vec![0.7, 1.1, 0.9], 50.0).expect("Invalid source");
    let fit = RadianceFit::fit(
        &cube,
        &smile,
        &flat,
        map.wavelengths().view(),
        &source,
        &RadianceFitParams::default(),
    )
    .expect("Failed to fit radiance");

    let mut bundle = CalibrationBundle::new("cam-roundtrip");
    bundle.calibration_date = Some(Utc::now());
    bundle.hgar_pic = Some(flat.mapv(|v| v / 3.0));
    bundle.dark_pic = Some(dark);
    bundle.flat_field_pic = Some(flat);
    bundle.smile_shifts = Some(smile);
    bundle.wavelengths = Some(map);
    bundle.rad_ref = Some(cube);
    bundle.radiance_fit = Some(fit);
    bundle
}

#[test]
fn test_full_bundle_roundtrip_is_bit_identical() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("cal.json");

    let bundle = full_bundle();
    bundle.dump(&path).expect("Failed to dump");
    let loaded = CalibrationBundle::load(&path).expect("Failed to load");
    assert_eq!(loaded, bundle);

    // Named arrays survive with identical bits
    let original = bundle.wavelengths().expect("wavelengths");
    let reloaded = loaded.wavelengths().expect("wavelengths");
    for (a, b) in original.iter().zip(reloaded.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
    assert_eq!(loaded.sfit_x(), Some(&[380.0, 600.0, 1000.0][..]));
    assert_eq!(loaded.spec_rad_ref_luminance(), Some(50.0));

    let first = std::fs::read(&path).expect("read");
    loaded.dump(&path).expect("Failed to re-dump");
    assert_eq!(std::fs::read(&path).expect("read"), first);
}

#[test]
fn test_bundle_file_uses_named_arrays() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("cal.json");
    let bundle = full_bundle();
    bundle.dump(&path).expect("Failed to dump");

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("valid JSON");
    for key in [
        "wavelengths",
        "wavelengths_linear",
        "smile_shifts",
        "flat_field_pic",
        "HgAr_pic",
        "dark_pic",
        "rad_ref",
        "sfit_x",
        "sfit_y",
        "spec_rad_ref_luminance",
    ] {
        assert!(json.get(key).map_or(false, |v| !v.is_null()), "missing top-level {}", key);
    }

    let len = |v: &serde_json::Value| v.as_array().map(|a| a.len());
    assert_eq!(len(&json["wavelengths"]), Some(DIM.1));
    assert_eq!(len(&json["wavelengths_linear"]), Some(DIM.1));
    assert_eq!(len(&json["flat_field_pic"]), Some(DIM.0));
    assert_eq!(len(&json["HgAr_pic"][0]), Some(DIM.1));
    assert_eq!(json["smile_shifts"], serde_json::json!([0.31, 0.12, 0.02, 0.0, 0.04, 0.17]));
    assert_eq!(json["sfit_x"], serde_json::json!([380.0, 600.0, 1000.0]));
    assert_eq!(json["sfit_y"], serde_json::json!([0.7, 1.1, 0.9]));
    assert_eq!(json["spec_rad_ref_luminance"], serde_json::json!(50.0));
    // Cross-track x spectral x exposure x luminance
    assert_eq!(len(&json["rad_ref"]), Some(DIM.0));
    assert_eq!(len(&json["rad_ref"][0]), Some(DIM.1));
    assert_eq!(len(&json["rad_ref"][0][0]), Some(3));
    assert_eq!(len(&json["rad_ref"][0][0][0]), Some(3));
    let cube = bundle.rad_ref.as_ref().expect("rad_ref");
    assert_eq!(json["rad_ref"][5][17][1][2].as_f64(), Some(cube.data()[[5, 17, 1, 2]]));
    assert_eq!(json["rad_ref_luminances"], serde_json::json!([12.5, 25.0, 50.0]));
    assert!(json["wavelength_polynomials"].is_object());
    assert!(json["radiance_model"].is_object());
}

#[test]
fn test_tampered_cube_grid_fails_whole_load() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("cal.json");
    full_bundle().dump(&path).expect("Failed to dump");

    let mut json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("valid JSON");
    json["rad_ref_luminances"] = serde_json::json!([12.5, 50.0, 25.0]);
    std::fs::write(&path, serde_json::to_string(&json).expect("serialize")).expect("write");

    assert!(matches!(CalibrationBundle::load(&path), Err(HsiError::Persistence(_))));
}

#[test]
fn test_tampered_wavelength_axis_fails_whole_load() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("cal.json");
    full_bundle().dump(&path).expect("Failed to dump");

    let mut json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("valid JSON");
    json["wavelengths"][0] = serde_json::json!(123.0);
    std::fs::write(&path, serde_json::to_string(&json).expect("serialize")).expect("write");

    assert!(matches!(CalibrationBundle::load(&path), Err(HsiError::Persistence(_))));
}

#[test]
fn test_partial_calibration_survives_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("cal.json");

    {
        let mut store = CalibrationStore::open_or_create(&path, "cam-02").expect("Failed to create store");
        store
            .commit(CalibrationUpdate::Dark(Array2::from_elem(DIM, 4.0)))
            .expect("Failed to commit dark");
        // A later step fails before producing an update; nothing else is written
        let bad_source = SourceSpectrum::new(vec![400.0, 900.0], vec![1.0, 0.0], 10.0);
        assert!(bad_source.is_err());
    }

    let store = CalibrationStore::open_or_create(&path, "cam-02").expect("Failed to reopen store");
    assert_eq!(store.bundle().completed_steps(), vec!["dark_pic"]);
    assert_eq!(store.bundle().dark_pic.as_ref().map(|d| d[[0, 0]]), Some(4.0));
    assert!(store.bundle().wavelengths_linear().is_none());

    let wavelengths: Option<Array1<f64>> = store.bundle().wavelengths();
    assert!(wavelengths.is_none());
}
