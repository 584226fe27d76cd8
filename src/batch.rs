//! Rayon-based parallel evaluation of many parameter vectors.
//!
//! Every evaluation owns its filter state, so results are independent of
//! scheduling and come back in input order.

use rayon::prelude::*;

use crate::error::Result;
use crate::likelihood::{LikelihoodContributions, LikelihoodProblem};

/// Log-likelihood of each free parameter vector in parallel.
pub fn batch_loglike(problem: &LikelihoodProblem, params_list: &[Vec<f64>]) -> Vec<Result<f64>> {
    params_list
        .par_iter()
        .map(|params| problem.log_likelihood(params))
        .collect()
}

/// Contributions of each free parameter vector in parallel.
pub fn batch_contributions(
    problem: &LikelihoodProblem,
    params_list: &[Vec<f64>],
) -> Vec<Result<LikelihoodContributions>> {
    params_list
        .par_iter()
        .map(|params| problem.log_likelihood_contributions(params))
        .collect()
}

/// Forward-difference gradient of `f` at `x`, one evaluation per coordinate in parallel.
///
/// `f0` is `f(x)`. Coordinates whose forward difference is not finite are
/// retried with a central difference and set to zero if that fails too.
pub fn numerical_gradient<F>(f: F, x: &[f64], f0: f64) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    let eps = f64::EPSILON.sqrt();
    (0..x.len())
        .into_par_iter()
        .map(|i| {
            let h = eps * x[i].abs().max(1.0);
            let mut work = x.to_vec();
            work[i] = x[i] + h;
            let f_plus = f(&work);
            let g = (f_plus - f0) / h;
            if g.is_finite() {
                return g;
            }
            work[i] = x[i] - h;
            let f_minus = f(&work);
            let g = (f_plus - f_minus) / (2.0 * h);
            if g.is_finite() {
                g
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PanelData;
    use crate::process_model::ProcessedModel;
    use crate::types::ModelSpec;

    fn problem() -> LikelihoodProblem {
        let spec = ModelSpec::from_json(
            r#"{"factors": {"fac1": {"measurements": [["y1", "y2"], ["y1"]], "transition_function": "linear"}}}"#,
        )
        .unwrap();
        let model = ProcessedModel::from_spec(&spec).unwrap();
        let data = PanelData::from_json(
            r#"[
                {"id": 1, "period": 0, "y1": 0.3, "y2": 1.2},
                {"id": 1, "period": 1, "y1": 0.8},
                {"id": 2, "period": 0, "y1": -0.4, "y2": 0.1},
                {"id": 2, "period": 1, "y1": -0.2}
            ]"#,
            &model,
        )
        .unwrap();
        LikelihoodProblem::new(model, data).unwrap()
    }

    #[test]
    fn test_batch_matches_single() {
        let p = problem();
        let start = p.template.start_values();
        let mut shifted = start.clone();
        shifted[0] = 0.4;
        let params_list = vec![start.clone(), shifted.clone(), vec![1.0]];

        let results = batch_loglike(&p, &params_list);
        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), p.log_likelihood(&start).unwrap());
        assert_eq!(*results[1].as_ref().unwrap(), p.log_likelihood(&shifted).unwrap());
        assert!(results[2].is_err());

        let contribs = batch_contributions(&p, &params_list[..2]);
        assert_eq!(
            contribs[1].as_ref().unwrap(),
            &p.log_likelihood_contributions(&shifted).unwrap()
        );
    }

    #[test]
    fn test_numerical_gradient_quadratic() {
        let f = |x: &[f64]| x[0] * x[0] + 3.0 * x[1];
        let x = [2.0, -1.0];
        let g = numerical_gradient(f, &x, f(&x));
        assert!((g[0] - 4.0).abs() < 1e-5, "g[0]={}", g[0]);
        assert!((g[1] - 3.0).abs() < 1e-5, "g[1]={}", g[1]);
    }

    #[test]
    fn test_numerical_gradient_non_finite_is_zero() {
        let f = |x: &[f64]| if x[0] > 0.0 { f64::INFINITY } else { x[0] };
        let g = numerical_gradient(f, &[0.0], 0.0);
        assert_eq!(g, vec![0.0]);
    }
}
