//! Maximum likelihood estimation via L-BFGS with Nelder-Mead fallback.
//!
//! The objective is the negative soft-clipped log-likelihood over the free
//! parameters. Points outside the box bounds are evaluated at their
//! projection plus a quadratic penalty on the distance.

use argmin::core::{CostFunction, Executor, Gradient, IterState, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use log::{debug, warn};

use crate::batch::numerical_gradient;
use crate::error::{Result, SkillModelError};
use crate::likelihood::LikelihoodProblem;
use crate::types::FitResult;

const BOUND_PENALTY: f64 = 1e4;
const SIMPLEX_STEP: f64 = 0.1;

// ---------------------------------------------------------------------------
// Objective function for argmin
// ---------------------------------------------------------------------------

/// Negative log-likelihood objective for optimizer.
#[derive(Clone)]
pub struct SkillObjective<'a> {
    problem: &'a LikelihoodProblem,
}

impl<'a> SkillObjective<'a> {
    pub fn new(problem: &'a LikelihoodProblem) -> Self {
        Self { problem }
    }

    /// Clipped log-likelihood at the projection of `free` onto the bounds.
    fn eval_loglike(&self, free: &[f64]) -> std::result::Result<f64, String> {
        let projected = self.problem.template.project(free);
        let contribs = self
            .problem
            .log_likelihood_contributions(&projected)
            .map_err(|e| e.to_string())?;
        let ll = contribs.clipped_sum(&self.problem.model.options);
        if ll.is_finite() {
            Ok(ll)
        } else {
            Err("non-finite log-likelihood".to_string())
        }
    }

    fn penalty(&self, free: &[f64]) -> f64 {
        let projected = self.problem.template.project(free);
        BOUND_PENALTY
            * free
                .iter()
                .zip(projected.iter())
                .map(|(x, p)| (x - p) * (x - p))
                .sum::<f64>()
    }

    fn value(&self, free: &[f64]) -> f64 {
        match self.eval_loglike(free) {
            Ok(ll) => -ll + self.penalty(free),
            Err(_) => f64::MAX / 2.0, // penalty for invalid parameters
        }
    }
}

impl CostFunction for SkillObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Vec<f64>) -> std::result::Result<f64, argmin::core::Error> {
        Ok(self.value(param))
    }
}

impl Gradient for SkillObjective<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Vec<f64>) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        let f0 = self.value(param);
        Ok(numerical_gradient(|x| self.value(x), param, f0))
    }
}

// ---------------------------------------------------------------------------
// Solvers
// ---------------------------------------------------------------------------

type SolverOutput = (Vec<f64>, f64, u64, bool);

/// Best point, its cost, iteration count and convergence flag of a finished run.
fn best_of<G>(
    state: &IterState<Vec<f64>, G, (), (), (), f64>,
    solver: &str,
) -> std::result::Result<SolverOutput, String> {
    let best_param = state
        .get_best_param()
        .ok_or_else(|| format!("{}: no best parameter found", solver))?
        .clone();
    let converged = matches!(
        state.get_termination_reason(),
        Some(TerminationReason::SolverConverged) | Some(TerminationReason::TargetCostReached)
    );
    Ok((best_param, state.get_best_cost(), state.get_iter(), converged))
}

fn run_lbfgs(
    objective: SkillObjective<'_>,
    init_params: Vec<f64>,
    maxiter: u64,
) -> std::result::Result<SolverOutput, String> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, 10)
        .with_tolerance_grad(1e-5)
        .map_err(|e| e.to_string())?
        .with_tolerance_cost(1e-9)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(objective, solver)
        .configure(
            |state: IterState<Vec<f64>, Vec<f64>, (), (), (), f64>| {
                state.param(init_params).max_iters(maxiter)
            },
        )
        .run()
        .map_err(|e| format!("L-BFGS failed: {}", e))?;

    best_of(result.state(), "L-BFGS")
}

/// Start point plus one vertex per coordinate. Each step goes up unless
/// that would leave the box, so no vertex starts in the penalty region.
fn initial_simplex(start: &[f64], bounds: &[(Option<f64>, Option<f64>)]) -> Vec<Vec<f64>> {
    let mut simplex = Vec::with_capacity(start.len() + 1);
    simplex.push(start.to_vec());
    for (i, &(_, upper)) in bounds.iter().enumerate() {
        let step = SIMPLEX_STEP * start[i].abs().max(SIMPLEX_STEP);
        let mut vertex = start.to_vec();
        vertex[i] = match upper {
            Some(u) if start[i] + step > u => start[i] - step,
            _ => start[i] + step,
        };
        simplex.push(vertex);
    }
    simplex
}

fn run_nelder_mead(
    objective: SkillObjective<'_>,
    init_params: Vec<f64>,
    maxiter: u64,
) -> std::result::Result<SolverOutput, String> {
    let simplex = initial_simplex(&init_params, &objective.problem.template.bounds());
    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(1e-6)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(objective, solver)
        .configure(|state: IterState<Vec<f64>, (), (), (), (), f64>| state.max_iters(maxiter))
        .run()
        .map_err(|e| format!("Nelder-Mead failed: {}", e))?;

    best_of(result.state(), "Nelder-Mead")
}

// ---------------------------------------------------------------------------
// Fit
// ---------------------------------------------------------------------------

/// Estimate the free parameters by maximum likelihood.
///
/// # Arguments
/// * `problem`: Compiled model and data
/// * `start_params`: Optional free start values (default: naive start values)
/// * `method`: "lbfgs" (default, falls back to Nelder-Mead) or "nelder-mead"
/// * `maxiter`: Maximum iterations (default: 500)
pub fn fit(
    problem: &LikelihoodProblem,
    start_params: Option<&[f64]>,
    method: Option<&str>,
    maxiter: Option<u64>,
) -> Result<FitResult> {
    let maxiter = maxiter.unwrap_or(500);
    let method = method.unwrap_or("lbfgs");
    let n_free = problem.n_free_params();

    let start = match start_params {
        Some(sp) => {
            if sp.len() != n_free {
                return Err(SkillModelError::ParamLengthMismatch {
                    expected: n_free,
                    got: sp.len(),
                });
            }
            problem.template.project(sp)
        }
        None => problem.template.start_values(),
    };
    debug!("fit: {} free parameters, method {}", n_free, method);

    let objective = SkillObjective::new(problem);
    let (params, n_iter, converged, used) = match method {
        "lbfgs" => match run_lbfgs(objective.clone(), start.clone(), maxiter) {
            Ok((p, cost, it, conv)) if cost.is_finite() && cost < f64::MAX / 2.0 => (p, it, conv, "lbfgs"),
            Ok(_) => {
                warn!("L-BFGS ended at an invalid point, falling back to Nelder-Mead");
                let (p, _, it, conv) =
                    run_nelder_mead(objective, start, maxiter).map_err(SkillModelError::OptimizationFailed)?;
                (p, it, conv, "nelder-mead")
            }
            Err(e) => {
                warn!("{}; falling back to Nelder-Mead", e);
                let (p, _, it, conv) =
                    run_nelder_mead(objective, start, maxiter).map_err(SkillModelError::OptimizationFailed)?;
                (p, it, conv, "nelder-mead")
            }
        },
        "nelder-mead" => {
            let (p, _, it, conv) =
                run_nelder_mead(objective, start, maxiter).map_err(SkillModelError::OptimizationFailed)?;
            (p, it, conv, "nelder-mead")
        }
        other => {
            return Err(SkillModelError::OptimizationFailed(format!(
                "unknown method '{}': expected 'lbfgs' or 'nelder-mead'",
                other
            )))
        }
    };

    let params = problem.template.project(&params);
    let loglike = problem.log_likelihood(&params)?;
    debug!(
        "fit: {} after {} iterations, loglike {:.6}, converged {}",
        used, n_iter, loglike, converged
    );

    Ok(FitResult {
        params,
        loglike,
        n_obs: problem.n_obs(),
        n_params: n_free,
        n_iter,
        converged,
        method: used.to_string(),
    })
}
