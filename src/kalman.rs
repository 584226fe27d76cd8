//! Square-root Kalman update and unscented predict on a panel.
//!
//! Covariances are only ever stored as lower Cholesky factors `L` with
//! `P = L Lᵀ`. Updates and predicts obtain the new factor from a QR
//! decomposition of a stacked matrix whose Gram matrix is the target
//! covariance, so `P` is never formed.

use nalgebra::{DMatrix, DVector};

use crate::error::Result;
use crate::sigma_points::{calculate_sigma_points, SigmaWeights};
use crate::transition::TransitionFunction;

/// Floor for the predicted standard deviation of a measurement.
const MIN_ROOT_SIGMA: f64 = 1e-100;

/// Pivots below this are treated as zero in rank-one updates.
const MIN_PIVOT: f64 = 1e-300;

/// Smallest |a| an anchoring scaling factor is divided by.
const MIN_ABS_SCALING: f64 = 1e-10;

const LN_2PI: f64 = 1.8378770664093453;

/// One Gaussian of the mixture belief of one individual.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureComponent {
    pub mean: DVector<f64>,
    /// Lower Cholesky factor of the covariance.
    pub chol: DMatrix<f64>,
}

impl MixtureComponent {
    pub fn covariance(&self) -> DMatrix<f64> {
        &self.chol * self.chol.transpose()
    }
}

/// Filter state of a whole panel: one component per (individual, mixture).
#[derive(Debug, Clone)]
pub struct FilterState {
    n_obs: usize,
    n_mixtures: usize,
    /// Row-major over (individual, mixture).
    pub components: Vec<MixtureComponent>,
    /// n_obs × n_mixtures
    pub log_weights: DMatrix<f64>,
}

impl FilterState {
    /// Every individual starts from the same mixture.
    ///
    /// `initial_states` is n_mixtures × n_latent, `initial_chols[j]` the lower
    /// factor of component `j`.
    pub fn new(
        n_obs: usize,
        initial_states: &DMatrix<f64>,
        initial_chols: &[DMatrix<f64>],
        mixture_weights: &DVector<f64>,
    ) -> Self {
        let n_mixtures = initial_states.nrows();
        let mut components = Vec::with_capacity(n_obs * n_mixtures);
        for _ in 0..n_obs {
            for j in 0..n_mixtures {
                components.push(MixtureComponent {
                    mean: initial_states.row(j).transpose(),
                    chol: initial_chols[j].clone(),
                });
            }
        }
        let log_weights =
            DMatrix::from_fn(n_obs, n_mixtures, |_, j| mixture_weights[j].ln());

        Self {
            n_obs,
            n_mixtures,
            components,
            log_weights,
        }
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn n_mixtures(&self) -> usize {
        self.n_mixtures
    }

    pub fn component(&self, obs: usize, mixture: usize) -> &MixtureComponent {
        &self.components[obs * self.n_mixtures + mixture]
    }
}

/// Inputs of one scalar measurement update.
#[derive(Debug, Clone, Copy)]
pub struct UpdateInputs<'a> {
    /// One value per individual; NaN marks a missing measurement.
    pub measurements: &'a DVector<f64>,
    /// n_obs × n_controls, first column is the constant.
    pub controls: &'a DMatrix<f64>,
    pub control_params: &'a DVector<f64>,
    /// One loading per latent factor.
    pub loadings: &'a DVector<f64>,
    pub meas_sd: f64,
}

/// Log density of a zero-mean normal with standard deviation `sd`.
fn normal_logpdf(x: f64, sd: f64) -> f64 {
    let z = x / sd;
    -0.5 * LN_2PI - sd.ln() - 0.5 * z * z
}

fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Square-root update of one component with a scalar measurement.
///
/// Decomposes `M = [[σ, 0], [Lᵀλ, Lᵀ]]` as `QR`. Then `R[0,0]` is the
/// predicted measurement sd, `R[0,1:] / R[0,0]` the Kalman gain and
/// `R[1:,1:]ᵀ` the updated factor. Returns the log density of the residual.
pub fn sqrt_update_component(
    component: &mut MixtureComponent,
    loadings: &DVector<f64>,
    meas_sd: f64,
    target: f64,
) -> f64 {
    let n = component.mean.len();
    let residual = target - loadings.dot(&component.mean);

    let lt = component.chol.transpose();
    let f_star = &lt * loadings;

    let mut m = DMatrix::<f64>::zeros(n + 1, n + 1);
    m[(0, 0)] = meas_sd;
    for i in 0..n {
        m[(i + 1, 0)] = f_star[i];
        for j in 0..n {
            m[(i + 1, j + 1)] = lt[(i, j)];
        }
    }

    let r = m.qr().r();
    let raw = r[(0, 0)];
    // the sign of R[0,0] carries the sign of the gain
    let root_sigma = if raw.abs() < MIN_ROOT_SIGMA {
        MIN_ROOT_SIGMA.copysign(raw)
    } else {
        raw
    };

    let gain = DVector::from_iterator(n, (0..n).map(|j| r[(0, j + 1)] / root_sigma));
    component.mean += gain * residual;
    component.chol = r.view((1, 1), (n, n)).transpose();

    normal_logpdf(residual, root_sigma.abs())
}

/// Measurement update of every individual and mixture component.
///
/// Returns the log-likelihood contribution of each individual. Individuals
/// with a missing measurement or missing controls are passed through with a
/// contribution of zero. With two or more components the log-weights are
/// renormalized per individual after the update.
pub fn sqrt_linear_update(state: &mut FilterState, inputs: &UpdateInputs) -> DVector<f64> {
    let n_obs = state.n_obs;
    let n_mix = state.n_mixtures;
    let mut loglikes = DVector::<f64>::zeros(n_obs);

    // an infinitely noisy measurement carries no information
    if inputs.meas_sd.is_infinite() {
        return loglikes;
    }

    let mut per_component = vec![0.0; n_mix];
    for i in 0..n_obs {
        let y = inputs.measurements[i];
        let control_row = inputs.controls.row(i);
        if !y.is_finite() || control_row.iter().any(|c| !c.is_finite()) {
            continue;
        }
        let intercept: f64 = control_row
            .iter()
            .zip(inputs.control_params.iter())
            .map(|(c, d)| c * d)
            .sum();
        let target = y - intercept;

        for (j, ll) in per_component.iter_mut().enumerate() {
            let comp = &mut state.components[i * n_mix + j];
            *ll = sqrt_update_component(comp, inputs.loadings, inputs.meas_sd, target);
        }

        if n_mix == 1 {
            loglikes[i] = per_component[0];
        } else {
            let weighted: Vec<f64> = per_component
                .iter()
                .enumerate()
                .map(|(j, ll)| ll + state.log_weights[(i, j)])
                .collect();
            let total = logsumexp(&weighted);
            for (j, w) in weighted.iter().enumerate() {
                state.log_weights[(i, j)] = w - total;
            }
            loglikes[i] = total;
        }
    }
    loglikes
}

/// Update with an anchoring outcome.
///
/// The outcome loads on the anchored scale of the factor, so the loading of
/// each anchored factor is its anchoring scaling factor for the period and
/// all other loadings are zero.
pub fn sqrt_linear_anchoring_update(
    state: &mut FilterState,
    inputs: &UpdateInputs,
    anchoring_scaling: &DVector<f64>,
    loads_on: &[bool],
) -> DVector<f64> {
    let loadings = DVector::from_iterator(
        anchoring_scaling.len(),
        anchoring_scaling
            .iter()
            .zip(loads_on.iter())
            .map(|(a, &on)| if on { *a } else { 0.0 }),
    );
    let anchored = UpdateInputs {
        loadings: &loadings,
        ..*inputs
    };
    sqrt_linear_update(state, &anchored)
}

/// In-place rank-one update (`sign > 0`) or downdate (`sign < 0`) of a
/// lower Cholesky factor: `L' L'ᵀ = L Lᵀ + sign · v vᵀ`. `v` is workspace.
///
/// Downdate columns whose pivot would become non-positive are left
/// unchanged.
pub fn cholesky_rank_one_update(l: &mut DMatrix<f64>, v: &mut DVector<f64>, sign: f64) {
    let n = l.nrows();
    for j in 0..n {
        let ljj = l[(j, j)];
        let vj = v[j];

        if sign > 0.0 {
            let r = ljj.hypot(vj);
            if r < MIN_PIVOT {
                continue;
            }
            let c = ljj / r;
            let s = vj / r;
            l[(j, j)] = r;
            for i in (j + 1)..n {
                let lij = l[(i, j)];
                l[(i, j)] = c * lij + s * v[i];
                v[i] = c * v[i] - s * lij;
            }
        } else {
            let arg = ljj * ljj - vj * vj;
            if ljj.abs() < MIN_PIVOT || arg <= 0.0 {
                continue;
            }
            let r = arg.sqrt();
            let c = r / ljj;
            let s = vj / ljj;
            l[(j, j)] = r;
            for i in (j + 1)..n {
                l[(i, j)] = (l[(i, j)] - s * v[i]) / c;
                v[i] = c * v[i] - s * l[(i, j)];
            }
        }
    }
}

/// Flip columns so that the diagonal is non-negative. `L Lᵀ` is unchanged.
fn normalize_diagonal_signs(l: &mut DMatrix<f64>) {
    for j in 0..l.ncols() {
        if l[(j, j)] < 0.0 {
            let mut col = l.column_mut(j);
            col *= -1.0;
        }
    }
}

/// Predicted mean and factor of one component from its transformed sigma points.
///
/// The factor is `Rᵀ` from the QR of `[√w_j (X_j − mean)]_j` stacked on
/// `diag(shock_sds)`. A negative centre weight is applied afterwards as a
/// rank-one downdate.
pub fn predict_component(
    points: &DMatrix<f64>,
    weights: &DVector<f64>,
    shock_sds: &DVector<f64>,
) -> MixtureComponent {
    let n_sigma = points.nrows();
    let n = points.ncols();
    let mean = points.transpose() * weights;

    let w0 = weights[0];
    let start = if w0 < 0.0 { 1 } else { 0 };
    let n_dev = n_sigma - start;

    let mut stacked = DMatrix::<f64>::zeros(n_dev + n, n);
    for (row, s) in (start..n_sigma).enumerate() {
        let sw = weights[s].sqrt();
        for c in 0..n {
            stacked[(row, c)] = sw * (points[(s, c)] - mean[c]);
        }
    }
    for f in 0..n {
        stacked[(n_dev + f, f)] = shock_sds[f];
    }

    let mut chol = stacked.qr().r().transpose();
    normalize_diagonal_signs(&mut chol);

    if w0 < 0.0 {
        let mut v = (points.row(0).transpose() - &mean) * (-w0).sqrt();
        cholesky_rank_one_update(&mut chol, &mut v, -1.0);
    }

    MixtureComponent { mean, chol }
}

/// Map latent columns to the anchored scale, apply the transition and map
/// the result back to the scale of the next period.
///
/// `points` has one column per factor (latent first); the anchoring
/// vectors have one entry per latent factor.
pub fn transform_sigma_points(
    points: &DMatrix<f64>,
    transition: &TransitionFunction,
    params: &[Vec<f64>],
    scaling: (&DVector<f64>, &DVector<f64>),
    constants: (&DVector<f64>, &DVector<f64>),
) -> Result<DMatrix<f64>> {
    let n_latent = transition.n_latent_factors();
    let (scale_t, scale_next) = scaling;
    let (const_t, const_next) = constants;

    let mut anchored = points.clone();
    for f in 0..n_latent {
        let mut col = anchored.column_mut(f);
        col *= scale_t[f];
        col.add_scalar_mut(const_t[f]);
    }

    let mut out = transition.apply(&anchored, params)?;
    for f in 0..n_latent {
        let scale = if scale_next[f].abs() < MIN_ABS_SCALING {
            MIN_ABS_SCALING.copysign(scale_next[f])
        } else {
            scale_next[f]
        };
        let mut col = out.column_mut(f);
        col.add_scalar_mut(-const_next[f]);
        col /= scale;
    }
    Ok(out)
}

/// Inputs of one unscented predict step (period `t` → `t + 1`).
#[derive(Debug, Clone, Copy)]
pub struct PredictInputs<'a> {
    pub transition: &'a TransitionFunction,
    /// Parameters per latent factor for the stage of period `t`.
    pub transition_params: &'a [Vec<f64>],
    /// One shock sd per latent factor.
    pub shock_sds: &'a DVector<f64>,
    /// n_obs × n_observed_factors at period `t`.
    pub observed_factors: &'a DMatrix<f64>,
    pub sigma: &'a SigmaWeights,
    /// Anchoring scaling factors at `t` and `t + 1`.
    pub anchoring_scaling: (&'a DVector<f64>, &'a DVector<f64>),
    /// Anchoring constants at `t` and `t + 1`.
    pub anchoring_constants: (&'a DVector<f64>, &'a DVector<f64>),
}

/// Square-root unscented predict of every component.
///
/// All sigma points of the panel are transformed in one batch.
pub fn sqrt_unscented_predict(state: &mut FilterState, inputs: &PredictInputs) -> Result<()> {
    let n_obs = state.n_obs;
    let n_mix = state.n_mixtures;
    let n_sigma = inputs.sigma.n_sigma_points();
    let n_latent = inputs.transition.n_latent_factors();
    let n_observed = inputs.observed_factors.ncols();

    let mut batch = DMatrix::<f64>::zeros(n_obs * n_mix * n_sigma, n_latent + n_observed);
    for i in 0..n_obs {
        for j in 0..n_mix {
            let comp = &state.components[i * n_mix + j];
            let points = calculate_sigma_points(&comp.mean, &comp.chol, inputs.sigma.scaling_factor);
            let base = (i * n_mix + j) * n_sigma;
            for s in 0..n_sigma {
                for f in 0..n_latent {
                    batch[(base + s, f)] = points[(s, f)];
                }
                for o in 0..n_observed {
                    batch[(base + s, n_latent + o)] = inputs.observed_factors[(i, o)];
                }
            }
        }
    }

    let transformed = transform_sigma_points(
        &batch,
        inputs.transition,
        inputs.transition_params,
        inputs.anchoring_scaling,
        inputs.anchoring_constants,
    )?;

    for (k, comp) in state.components.iter_mut().enumerate() {
        let block = transformed.rows(k * n_sigma, n_sigma).clone_owned();
        *comp = predict_component(&block, &inputs.sigma.weights, inputs.shock_sds);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::{CustomTransition, TransitionKind};
    use approx::assert_relative_eq;

    fn single_state(mean: &[f64], chol: DMatrix<f64>, n_obs: usize) -> FilterState {
        let n = mean.len();
        let states = DMatrix::from_row_slice(1, n, mean);
        FilterState::new(n_obs, &states, &[chol], &DVector::from_element(1, 1.0))
    }

    fn no_controls(n_obs: usize) -> (DMatrix<f64>, DVector<f64>) {
        (DMatrix::from_element(n_obs, 1, 1.0), DVector::zeros(1))
    }

    #[test]
    fn test_update_scalar_closed_form() {
        let mut comp = MixtureComponent {
            mean: DVector::from_element(1, 1.0),
            chol: DMatrix::from_element(1, 1, 2.0),
        };
        let ll = sqrt_update_component(&mut comp, &DVector::from_element(1, 1.0), 1.0, 3.0);

        // S = 4 + 1, K = 0.8, residual = 2
        assert!((comp.mean[0] - 2.6).abs() < 1e-12);
        assert!((comp.covariance()[(0, 0)] - 0.8).abs() < 1e-12);
        let expected = -0.5 * (2.0 * std::f64::consts::PI * 5.0).ln() - 0.5 * 4.0 / 5.0;
        assert!((ll - expected).abs() < 1e-12, "ll={} expected={}", ll, expected);
    }

    #[test]
    fn test_update_matches_standard_kalman() {
        let chol = DMatrix::from_row_slice(2, 2, &[1.2, 0.0, 0.4, 0.7]);
        let mean = DVector::from_vec(vec![0.5, -0.3]);
        let loadings = DVector::from_vec(vec![0.8, 1.5]);
        let sd = 0.6;
        let target = 1.1;

        let p = &chol * chol.transpose();
        let p_l = &p * &loadings;
        let s = loadings.dot(&p_l) + sd * sd;
        let k = &p_l / s;
        let residual = target - loadings.dot(&mean);
        let expected_mean = &mean + &k * residual;
        let expected_cov = &p - &k * k.transpose() * s;
        let expected_ll = -0.5 * (2.0 * std::f64::consts::PI * s).ln() - 0.5 * residual * residual / s;

        let mut comp = MixtureComponent { mean, chol };
        let ll = sqrt_update_component(&mut comp, &loadings, sd, target);

        assert_relative_eq!(comp.mean, expected_mean, epsilon = 1e-12);
        assert_relative_eq!(comp.covariance(), expected_cov, epsilon = 1e-12);
        assert!((ll - expected_ll).abs() < 1e-12);
    }

    #[test]
    fn test_uninformative_update_leaves_state_unchanged() {
        let chol = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.3, 0.5]);
        let mean = DVector::from_vec(vec![0.2, 0.4]);
        let loadings = DVector::from_vec(vec![1.0, 1.0]);

        let mut comp = MixtureComponent {
            mean: mean.clone(),
            chol: chol.clone(),
        };
        sqrt_update_component(&mut comp, &loadings, 1e12, 5.0);
        assert_relative_eq!(comp.mean, mean, epsilon = 1e-10);
        assert_relative_eq!(comp.covariance(), &chol * chol.transpose(), epsilon = 1e-10);

        let mut state = single_state(&[0.2, 0.4], chol.clone(), 2);
        let before = state.clone();
        let (controls, control_params) = no_controls(2);
        let measurements = DVector::from_vec(vec![1.0, 2.0]);
        let inputs = UpdateInputs {
            measurements: &measurements,
            controls: &controls,
            control_params: &control_params,
            loadings: &loadings,
            meas_sd: f64::INFINITY,
        };
        let ll = sqrt_linear_update(&mut state, &inputs);
        assert_eq!(ll, DVector::zeros(2));
        assert_eq!(state.components, before.components);
    }

    #[test]
    fn test_missing_measurement_passthrough() {
        let chol = DMatrix::from_element(1, 1, 1.0);
        let mut state = single_state(&[0.0], chol, 3);
        let (controls, control_params) = no_controls(3);
        let measurements = DVector::from_vec(vec![1.0, f64::NAN, -1.0]);
        let loadings = DVector::from_element(1, 1.0);
        let inputs = UpdateInputs {
            measurements: &measurements,
            controls: &controls,
            control_params: &control_params,
            loadings: &loadings,
            meas_sd: 1.0,
        };
        let ll = sqrt_linear_update(&mut state, &inputs);

        assert_eq!(ll[1], 0.0);
        assert!(ll[0].is_finite() && ll[0] < 0.0);
        assert!((ll[0] - ll[2]).abs() < 1e-12);
        assert_eq!(state.component(1, 0).mean[0], 0.0);
        assert_eq!(state.component(1, 0).chol[(0, 0)], 1.0);
        assert!((state.component(0, 0).mean[0] - 0.5).abs() < 1e-12);
        assert!((state.component(2, 0).mean[0] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_intercept_from_controls() {
        let chol = DMatrix::from_element(1, 1, 1.0);
        let mut state = single_state(&[0.0], chol, 1);
        let controls = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        let control_params = DVector::from_vec(vec![0.5, 0.25]);
        let measurements = DVector::from_element(1, 1.0);
        let loadings = DVector::from_element(1, 1.0);
        let inputs = UpdateInputs {
            measurements: &measurements,
            controls: &controls,
            control_params: &control_params,
            loadings: &loadings,
            meas_sd: 1.0,
        };
        let ll = sqrt_linear_update(&mut state, &inputs);
        // intercept = 0.5 + 0.5, residual = 0
        let expected = -0.5 * (2.0 * std::f64::consts::PI * 2.0).ln();
        assert!((ll[0] - expected).abs() < 1e-12);
        assert!(state.component(0, 0).mean[0].abs() < 1e-12);
    }

    #[test]
    fn test_mixture_reweighting() {
        let states = DMatrix::from_row_slice(2, 1, &[0.0, 2.0]);
        let chols = vec![DMatrix::from_element(1, 1, 1.0); 2];
        let weights = DVector::from_vec(vec![0.3, 0.7]);
        let mut state = FilterState::new(1, &states, &chols, &weights);

        let (controls, control_params) = no_controls(1);
        let measurements = DVector::from_element(1, 1.5);
        let loadings = DVector::from_element(1, 1.0);
        let inputs = UpdateInputs {
            measurements: &measurements,
            controls: &controls,
            control_params: &control_params,
            loadings: &loadings,
            meas_sd: 1.0,
        };
        let ll = sqrt_linear_update(&mut state, &inputs);

        let density = |m: f64| (-0.5 * (1.5 - m) * (1.5 - m) / 2.0).exp() / (2.0 * std::f64::consts::PI * 2.0).sqrt();
        let d0 = 0.3 * density(0.0);
        let d1 = 0.7 * density(2.0);
        assert!((ll[0] - (d0 + d1).ln()).abs() < 1e-12);

        let w0 = state.log_weights[(0, 0)].exp();
        let w1 = state.log_weights[(0, 1)].exp();
        assert!((w0 + w1 - 1.0).abs() < 1e-12);
        assert!((w0 - d0 / (d0 + d1)).abs() < 1e-12);
        // the component closer to the data gains weight
        assert!(w1 > 0.7);
    }

    #[test]
    fn test_zero_covariance_update_is_finite() {
        let mut comp = MixtureComponent {
            mean: DVector::from_element(1, 1.0),
            chol: DMatrix::zeros(1, 1),
        };
        let ll = sqrt_update_component(&mut comp, &DVector::from_element(1, 1.0), 0.5, 1.7);
        let expected = -0.5 * (2.0 * std::f64::consts::PI * 0.25).ln() - 0.5 * (0.7 / 0.5) * (0.7 / 0.5);
        assert!((ll - expected).abs() < 1e-12);
        assert_eq!(comp.mean[0], 1.0);
        assert_eq!(comp.chol[(0, 0)], 0.0);
        assert!(comp.chol.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_rank_one_update_and_downdate() {
        let l = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 0.0, 0.5, 1.5, 0.0, -0.3, 0.4, 1.1]);
        let v = DVector::from_vec(vec![0.3, -0.2, 0.5]);
        let p = &l * l.transpose();
        let vvt = &v * v.transpose();

        let mut up = l.clone();
        let mut work = v.clone();
        cholesky_rank_one_update(&mut up, &mut work, 1.0);
        assert_relative_eq!(&up * up.transpose(), &p + &vvt, epsilon = 1e-12);

        let mut down = l.clone();
        let mut work = v.clone();
        cholesky_rank_one_update(&mut down, &mut work, -1.0);
        assert_relative_eq!(&down * down.transpose(), &p - &vvt, epsilon = 1e-12);
    }

    fn linear_2d() -> (TransitionFunction, Vec<Vec<f64>>) {
        let func = TransitionFunction::new(vec![TransitionKind::Linear, TransitionKind::Linear], 2);
        // x0' = 0.9 x0 + 0.2 x1 + 0.1, x1' = -0.3 x0 + 1.1 x1 - 0.5
        let params = vec![vec![0.9, 0.2, 0.1], vec![-0.3, 1.1, -0.5]];
        (func, params)
    }

    fn run_linear_predict(kappa: f64) {
        let (func, params) = linear_2d();
        let a = DMatrix::from_row_slice(2, 2, &[0.9, 0.2, -0.3, 1.1]);
        let b = DVector::from_vec(vec![0.1, -0.5]);
        let shock = DVector::from_vec(vec![0.3, 0.2]);

        let states = DMatrix::from_row_slice(1, 2, &[0.4, -1.0]);
        let chol = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.6, 0.8]);
        let mut state = FilterState::new(2, &states, &[chol.clone()], &DVector::from_element(1, 1.0));
        state.components[1].mean = DVector::from_vec(vec![2.0, 0.5]);

        let sigma = SigmaWeights::new(2, kappa).unwrap();
        let observed = DMatrix::zeros(2, 0);
        let ones = DVector::from_element(2, 1.0);
        let zeros = DVector::zeros(2);
        let inputs = PredictInputs {
            transition: &func,
            transition_params: &params,
            shock_sds: &shock,
            observed_factors: &observed,
            sigma: &sigma,
            anchoring_scaling: (&ones, &ones),
            anchoring_constants: (&zeros, &zeros),
        };
        let means_before: Vec<DVector<f64>> = state.components.iter().map(|c| c.mean.clone()).collect();
        sqrt_unscented_predict(&mut state, &inputs).unwrap();

        let p = &chol * chol.transpose();
        let q = DMatrix::from_diagonal(&shock.component_mul(&shock));
        let expected_cov = &a * &p * a.transpose() + q;
        for (comp, m) in state.components.iter().zip(means_before.iter()) {
            let expected_mean = &a * m + &b;
            assert_relative_eq!(comp.mean, expected_mean, epsilon = 1e-12);
            assert_relative_eq!(comp.covariance(), expected_cov, epsilon = 1e-12);
            for j in 0..2 {
                assert!(comp.chol[(j, j)] >= 0.0);
            }
        }
    }

    #[test]
    fn test_predict_linear_matches_closed_form() {
        run_linear_predict(2.0);
    }

    #[test]
    fn test_predict_negative_center_weight() {
        run_linear_predict(-0.5);
    }

    #[test]
    fn test_predict_zero_covariance_no_nan() {
        let func = TransitionFunction::new(vec![TransitionKind::Constant], 1);
        let params = vec![vec![]];
        let states = DMatrix::from_element(1, 1, 1.3);
        let mut state = FilterState::new(1, &states, &[DMatrix::zeros(1, 1)], &DVector::from_element(1, 1.0));
        let sigma = SigmaWeights::new(1, 2.0).unwrap();
        let observed = DMatrix::zeros(1, 0);
        let ones = DVector::from_element(1, 1.0);
        let zeros = DVector::zeros(1);
        let inputs = PredictInputs {
            transition: &func,
            transition_params: &params,
            shock_sds: &zeros,
            observed_factors: &observed,
            sigma: &sigma,
            anchoring_scaling: (&ones, &ones),
            anchoring_constants: (&zeros, &zeros),
        };
        sqrt_unscented_predict(&mut state, &inputs).unwrap();
        let comp = state.component(0, 0);
        assert!((comp.mean[0] - 1.3).abs() < 1e-14);
        // the weighted mean of identical points carries rounding error
        let l = comp.chol[(0, 0)];
        assert!(l.is_finite() && l.abs() < 1e-12, "chol = {}", l);
    }

    #[test]
    fn test_transform_sigma_points_with_anchoring() {
        let fake1 = CustomTransition::new("fake1", &["c"], |pts: &DMatrix<f64>, p: &[f64]| {
            pts.column(0).add_scalar(p[0])
        })
        .unwrap();
        let fake2 = CustomTransition::new("fake2", &["c"], |pts: &DMatrix<f64>, p: &[f64]| {
            (pts.column(0) + pts.column(1)).add_scalar(-2.0 * p[0])
        })
        .unwrap();
        let func = TransitionFunction::new(
            vec![TransitionKind::Custom(fake1), TransitionKind::Custom(fake2)],
            2,
        );
        let params = vec![vec![1.0], vec![0.1]];
        let points = DMatrix::from_fn(10, 2, |i, j| (10 * j + i) as f64);

        let scaling = DVector::from_vec(vec![1.0, 2.0]);
        let zeros = DVector::zeros(2);
        let out = transform_sigma_points(&points, &func, &params, (&scaling, &scaling), (&zeros, &zeros)).unwrap();

        for i in 0..10 {
            let x = i as f64;
            assert!((out[(i, 0)] - (x + 1.0)).abs() < 1e-12);
            assert!((out[(i, 1)] - (10.0 + x + 0.5 * x - 0.1)).abs() < 1e-12);
        }

        let ones = DVector::from_element(2, 1.0);
        let plain = transform_sigma_points(&points, &func, &params, (&ones, &ones), (&zeros, &zeros)).unwrap();
        for i in 0..10 {
            let x = i as f64;
            assert!((plain[(i, 1)] - (10.0 + 2.0 * x - 0.2)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_transform_sigma_points_zero_scaling_stays_finite() {
        let func = TransitionFunction::new(vec![TransitionKind::Linear], 1);
        let params = vec![vec![0.5, 0.2]];
        let points = DMatrix::from_column_slice(3, 1, &[-1.0, 0.0, 1.0]);
        let ones = DVector::from_element(1, 1.0);
        let zero = DVector::zeros(1);
        let out = transform_sigma_points(&points, &func, &params, (&ones, &zero), (&zero, &zero)).unwrap();
        assert!(out.iter().all(|v| v.is_finite()));
        // divided by the smallest admissible scaling factor
        assert!((out[(2, 0)] - 0.7 / MIN_ABS_SCALING).abs() < 1e-3);

        let negative = DVector::from_element(1, -1e-14);
        let flipped = transform_sigma_points(&points, &func, &params, (&ones, &negative), (&zero, &zero)).unwrap();
        assert!((flipped[(2, 0)] + 0.7 / MIN_ABS_SCALING).abs() < 1e-3);
    }

    #[test]
    fn test_anchoring_update_uses_scaling() {
        let chol = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let mut anchored = single_state(&[0.0, 0.0], chol.clone(), 1);
        let mut plain = single_state(&[0.0, 0.0], chol, 1);

        let (controls, control_params) = no_controls(1);
        let measurements = DVector::from_element(1, 2.0);
        let ignored = DVector::from_vec(vec![9.0, 9.0]);
        let inputs = UpdateInputs {
            measurements: &measurements,
            controls: &controls,
            control_params: &control_params,
            loadings: &ignored,
            meas_sd: 1.0,
        };
        let scaling = DVector::from_vec(vec![3.0, 0.5]);
        let ll_anchor = sqrt_linear_anchoring_update(&mut anchored, &inputs, &scaling, &[false, true]);

        let loadings = DVector::from_vec(vec![0.0, 0.5]);
        let plain_inputs = UpdateInputs {
            loadings: &loadings,
            ..inputs
        };
        let ll_plain = sqrt_linear_update(&mut plain, &plain_inputs);

        assert!((ll_anchor[0] - ll_plain[0]).abs() < 1e-14);
        assert_relative_eq!(anchored.components[0].mean, plain.components[0].mean, epsilon = 1e-14);
    }
}
