use approx::assert_abs_diff_eq;
use diffim::convolve::{Convolver, DirectConvolver, ValidRegion};
use diffim::solver::validate_solution;
use diffim::{
    BasisKernel, SolveStrategy, Image, KernelBasis, KernelSolver, LinearCombinationKernel, NormalEquations,
    SolverError, alard_lupton_basis, delta_function_basis,
};
use ndarray::{Array2, array};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Uniform texture in `[0, 200)`: a flat template leaves the delta basis degenerate.
fn textured_template(size: usize, seed: u64) -> Image<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Image::from_fn(size, size, |_, _| {
        100.0 + 100.0 * (2.0 * rng.sample::<f64, _>(Standard) - 1.0)
    })
}

/// `template` convolved with `coefficients` over `basis`, plus `background`.
fn synthesize_science(
    template: &Image<f64>,
    basis: &Arc<KernelBasis>,
    coefficients: Vec<f64>,
    background: f64,
) -> Image<f64> {
    let kernel = LinearCombinationKernel::new(Arc::clone(basis), coefficients).unwrap();
    let mut science = Array2::zeros((template.height(), template.width()));
    DirectConvolver.convolve(
        science.view_mut(),
        template.view(),
        kernel.compute_image(false).view(),
        kernel.ctr_x(),
        kernel.ctr_y(),
        false,
    );
    science += background;
    Image::new(science)
}

fn one_hot(len: usize, index: usize) -> Vec<f64> {
    let mut coefficients = vec![0.0; len];
    coefficients[index] = 1.0;
    coefficients
}

#[test]
fn recovers_a_known_kernel_and_background() {
    init_logging();
    let basis = Arc::new(delta_function_basis(3, 3).unwrap());
    let template = textured_template(40, 1);
    let science = synthesize_science(&template, &basis, one_hot(9, 2), 5.0);
    let variance = Image::from_elem(40, 40, 1e-4f32);

    let solution = KernelSolver::new(Arc::clone(&basis))
        .apply(&template, &science, &variance)
        .unwrap();

    assert_eq!(solution.coefficients.len(), 10);
    assert_eq!(solution.num_pixels, 38 * 38);
    for (k, &c) in solution.coefficients.iter().take(9).enumerate() {
        if k == 2 {
            assert!((c - 1.0).abs() < 1e-6, "coefficient {k} = {c}");
        } else {
            assert!(c.abs() < 1e-6, "coefficient {k} = {c}");
        }
    }
    assert!(((solution.background - 5.0) / 5.0).abs() < 1e-6);
    assert_eq!(solution.background, solution.coefficients[9]);
    for &sigma in &solution.uncertainties {
        assert!(sigma.is_finite() && sigma >= 0.0);
        assert!(sigma < 1e-3, "uncertainty {sigma}");
    }
    assert_eq!(solution.background_error, solution.uncertainties[9]);
    assert_abs_diff_eq!(solution.kernel.kernel_sum(), 1.0, epsilon = 1e-6);
}

#[test]
fn end_to_end_identity_kernel_on_a_64_pixel_image() {
    init_logging();
    let basis = Arc::new(delta_function_basis(3, 3).unwrap());
    let template = textured_template(64, 2);
    // The central delta is the identity kernel.
    let science = synthesize_science(&template, &basis, one_hot(9, 4), 5.0);
    let variance = Image::from_elem(64, 64, 1.0f32);

    let solution = KernelSolver::new(Arc::clone(&basis))
        .apply(&template, &science, &variance)
        .unwrap();

    let stencil = solution.kernel.compute_image(false);
    assert_abs_diff_eq!(
        stencil,
        array![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]],
        epsilon = 1e-6
    );
    assert_abs_diff_eq!(solution.background, 5.0, epsilon = 1e-4);
    assert!(
        solution
            .variances
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    );
    assert!(
        solution
            .uncertainties
            .iter()
            .all(|s| s.is_finite() && *s >= 0.0)
    );
    assert_eq!(solution.kernel_error.coefficients().len(), 9);

    let json = serde_json::to_value(&solution).unwrap();
    assert_eq!(json["strategy"], "Ldlt");
    assert_eq!(json["num_pixels"], 62 * 62);
    assert!(json.get("kernel").is_none());
}

#[test]
fn uniform_template_falls_back_past_the_factorizations() {
    init_logging();
    // Every delta kernel sees the same flat field, so M has rank one. A power-of-two
    // level keeps every elimination step exact, so the symmetric, Cholesky and LU
    // solves all hit exact zero pivots.
    let basis = Arc::new(delta_function_basis(3, 3).unwrap());
    let template = Image::from_elem(64, 64, 128.0f64);
    let science = synthesize_science(&template, &basis, one_hot(9, 4), 5.0);
    let variance = Image::from_elem(64, 64, 1.0f64);

    match KernelSolver::new(basis).apply(&template, &science, &variance) {
        Ok(solution) => {
            assert_eq!(solution.strategy, SolveStrategy::EigenPseudoInverse);
            assert_eq!(solution.num_pixels, 62 * 62);
        }
        Err(
            SolverError::SolveFailed(_)
            | SolverError::CovarianceFactorization(_)
            | SolverError::UncertaintyNan { .. }
            | SolverError::NegativeVariance { .. },
        ) => {}
        Err(other) => panic!("Unexpected failure for a rank-deficient system: {other:?}"),
    }
}

#[test]
fn permuting_the_basis_permutes_coefficients_but_not_the_kernel() {
    let basis = Arc::new(delta_function_basis(3, 3).unwrap());
    let reversed: Vec<BasisKernel> = basis.iter().rev().cloned().collect();
    let reversed = Arc::new(KernelBasis::new(reversed).unwrap());

    let template = textured_template(32, 3);
    let mut truth = vec![0.0; 9];
    truth[1] = 0.25;
    truth[4] = 0.6;
    truth[8] = 0.15;
    let science = synthesize_science(&template, &basis, truth, -2.0);
    let variance = Image::from_elem(32, 32, 2.0f64);

    let forward = KernelSolver::new(basis)
        .apply(&template, &science, &variance)
        .unwrap();
    let backward = KernelSolver::new(reversed)
        .apply(&template, &science, &variance)
        .unwrap();

    for k in 0..9 {
        assert_abs_diff_eq!(
            forward.coefficients[k],
            backward.coefficients[8 - k],
            epsilon = 1e-8
        );
    }
    assert_abs_diff_eq!(
        forward.kernel.compute_image(false),
        backward.kernel.compute_image(false),
        epsilon = 1e-8
    );
    assert_abs_diff_eq!(forward.background, backward.background, epsilon = 1e-6);
}

#[test]
fn noisy_images_give_finite_non_negative_uncertainties() {
    init_logging();
    let basis = Arc::new(delta_function_basis(3, 3).unwrap());
    let template = textured_template(48, 4);
    let clean = synthesize_science(&template, &basis, one_hot(9, 4), 5.0);

    let noise = Normal::new(0.0, 1.0).unwrap();
    let mut rng = StdRng::seed_from_u64(44);
    let science = Image::from_fn(48, 48, |x, y| clean.get(x, y) + noise.sample(&mut rng));
    let variance = Image::from_elem(48, 48, 1.0f64);

    let solution = KernelSolver::new(basis)
        .apply(&template, &science, &variance)
        .unwrap();
    assert!(validate_solution(&solution.coefficients, &solution.variances).is_ok());
    assert!(solution.variances.iter().all(|&v| v >= 0.0));
    assert_abs_diff_eq!(solution.coefficients[4], 1.0, epsilon = 1e-2);
    assert_abs_diff_eq!(solution.kernel.kernel_sum(), 1.0, epsilon = 1e-2);
}

#[test]
fn normal_matrix_is_symmetric_for_a_gaussian_basis() {
    let basis = alard_lupton_basis(3, &[0.7, 1.5, 3.0], &[4, 3, 2]).unwrap();
    let template = textured_template(30, 5);
    let mut rng = StdRng::seed_from_u64(55);
    let science = Array2::from_shape_fn((30, 30), |_| rng.sample::<f64, _>(Standard) * 50.0);
    let variance = Array2::from_shape_fn((30, 30), |_| 0.5 + rng.sample::<f64, _>(Standard));

    let convolved: Vec<Array2<f64>> = basis
        .iter()
        .map(|kernel| {
            let mut output = Array2::zeros((30, 30));
            DirectConvolver.convolve(
                output.view_mut(),
                template.view(),
                kernel.stencil(),
                kernel.ctr_x(),
                kernel.ctr_y(),
                false,
            );
            output
        })
        .collect();
    let region = ValidRegion::new(30, 30, 7, 7, 3, 3).unwrap();
    let equations = NormalEquations::build(&convolved, science.view(), variance.view(), &region);

    let n = basis.len() + 1;
    assert_eq!(equations.m.dim(), (n, n));
    for i in 0..n {
        for j in 0..n {
            assert_eq!(equations.m[[i, j]], equations.m[[j, i]]);
        }
    }
}

#[test]
fn negative_variance_is_reported_with_its_index() {
    let result = validate_solution(&array![0.5, 0.5, 1.0], &array![1e-3, -4.0, 1e-3]);
    match result {
        Err(SolverError::NegativeVariance { index, value }) => {
            assert_eq!(index, 1);
            assert_eq!(value, -4.0);
        }
        other => panic!("Expected NegativeVariance, got {other:?}"),
    }
}
