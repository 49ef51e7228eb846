use approx::assert_abs_diff_eq;
use diffim::convolve::{Convolver, DirectConvolver};
use diffim::{
    BBox, Footprint, Image, MaskedImage, PsfMatchConfig, SelectionError, Span, Threshold,
    delta_function_basis, fit_candidates, mask_planes, select_footprints,
};
use ndarray::Array2;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Every maximal horizontal run of pixels above the cutoff is one footprint.
fn detect_runs(image: &MaskedImage<f64>, threshold: Threshold, npix_min: usize) -> Vec<Footprint> {
    let pixels = image.image();
    let variance = image.variance();
    let mut footprints = Vec::new();
    for y in 0..pixels.height() {
        let mut start = None;
        for x in 0..=pixels.width() {
            let above = x < pixels.width()
                && pixels.get(x, y) > threshold.cutoff(variance.get(x, y));
            match (above, start) {
                (true, None) => start = Some(x),
                (false, Some(x0)) => {
                    let span = Span::new(
                        y as i32 + image.y0(),
                        x0 as i32 + image.x0(),
                        x as i32 - 1 + image.x0(),
                    );
                    if span.len() >= npix_min {
                        footprints.push(Footprint::new(vec![span]));
                    }
                    start = None;
                }
                _ => {}
            }
        }
    }
    footprints
}

const STARS: [(usize, usize); 6] = [(20, 20), (45, 30), (2, 40), (50, 12), (30, 55), (60, 62)];

fn config_toml(min_clean_fp: usize) -> String {
    format!(
        r#"
kernelCols = 3
kernelRows = 3
fpNpixMin = 1
fpNpixMax = 50
fpGrowKsize = 2.0
minCleanFp = {min_clean_fp}
detThreshold = 500.0
detThresholdScaling = 0.5
detThresholdMin = 50.0
detThresholdType = "value"
"#
    )
}

/// A faint textured sky with bright single-pixel stars, and the same field shifted by
/// one pixel with a constant offset.
fn star_field() -> (MaskedImage<f64>, MaskedImage<f64>) {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut template =
        Image::from_fn(80, 80, |_, _| 10.0 + 5.0 * (2.0 * rng.sample::<f64, _>(Standard) - 1.0));
    for &(x, y) in &STARS {
        template.set(x, y, template.get(x, y) + 1000.0);
    }

    // out(x, y) = in(x + 1, y)
    let mut shift = Array2::zeros((3, 3));
    shift[[1, 2]] = 1.0;
    let mut science = Array2::zeros((80, 80));
    DirectConvolver.convolve(science.view_mut(), template.view(), shift.view(), 1, 1, false);
    science += 5.0;

    let template = MaskedImage::from_image(template, 1.0);
    let mut science = MaskedImage::from_image(Image::new(science), 1.0);
    // Within the grown margin of the star at (50, 12).
    science.mask_mut().set_bits(52, 14, mask_planes::BAD);
    (template, science)
}

#[test]
fn manhattan_growth_expands_a_pixel_by_the_kernel_size() {
    let mut config = PsfMatchConfig::from_toml_str(&config_toml(1)).unwrap();
    config.kernel_cols = 5;
    config.kernel_rows = 3;
    config.fp_grow_ksize = 1.0;
    assert_eq!(config.grow_pixels(), 5);

    let grown = Footprint::new(vec![Span::new(30, 30, 30)]).grow(config.grow_pixels(), false);
    assert_eq!(grown.bbox(), BBox::new(25, 25, 35, 35));
}

#[test]
fn selected_footprints_feed_the_kernel_fit() {
    init_logging();
    let (template, science) = star_field();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("psf_match.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(config_toml(4).as_bytes()).unwrap();
    let config = PsfMatchConfig::load(&path).unwrap();

    let selection = select_footprints(&template, &science, &config, &detect_runs).unwrap();
    assert_eq!(selection.iterations, 1);
    assert_eq!(selection.threshold, 500.0);
    // The star at the left edge cannot be extracted and the one at (50, 12) is masked
    // in the science image.
    let centers: Vec<(i32, i32)> = selection
        .footprints
        .iter()
        .map(|fp| fp.bbox().center())
        .collect();
    assert_eq!(centers, vec![(20, 20), (45, 30), (30, 55), (60, 62)]);
    for fp in &selection.footprints {
        assert_eq!(fp.bbox().width(), 13);
        assert_eq!(fp.bbox().height(), 13);
    }

    let basis = Arc::new(delta_function_basis(3, 3).unwrap());
    let candidates =
        fit_candidates(&template, &science, &selection.footprints, &basis, &config).unwrap();
    assert_eq!(candidates.len(), 4);
    for candidate in &candidates {
        let stencil = candidate.solution.kernel.compute_image(false);
        assert_abs_diff_eq!(stencil[[1, 2]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stencil.sum(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(candidate.solution.background, 5.0, epsilon = 1e-4);
        assert!(candidate.statistics.evaluate_quality(1e-3, 1e-3));
    }
}

#[test]
fn unreachable_thresholds_report_no_footprints() {
    init_logging();
    let (template, science) = star_field();
    let config = PsfMatchConfig::from_toml_str(&config_toml(1)).unwrap();

    // Every star is masked in the template.
    let mut template = template;
    for &(x, y) in &STARS {
        template.mask_mut().set_bits(x, y, mask_planes::SAT);
    }

    match select_footprints(&template, &science, &config, &detect_runs) {
        Err(SelectionError::NoFootprints {
            final_threshold,
            iterations,
        }) => {
            // 500, 250, 125, 62.5 are all above the floor of 50.
            assert_eq!(iterations, 4);
            assert_eq!(final_threshold, 31.25);
        }
        other => panic!("Expected NoFootprints, got {other:?}"),
    }
}
