//! Transition functions of the latent factors.
//!
//! Every function maps a batch of points (one row per individual, mixture
//! component and sigma point; one column per factor, latent factors first)
//! to the next-period value of one latent factor. Built-ins are evaluated
//! column by column so the cost is a handful of vector operations over the
//! whole batch.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SkillModelError};

/// Signature of a user-registered transition function: `(points, params) -> next values`.
pub type TransitionFn = dyn Fn(&DMatrix<f64>, &[f64]) -> DVector<f64> + Send + Sync;

const BUILTIN_NAMES: [&str; 4] = ["linear", "constant", "log_ces", "translog"];

/// Smallest |phi| used by `log_ces`.
const MIN_ABS_PHI: f64 = 1e-10;

/// A user-defined transition function with its ordered parameter names.
#[derive(Clone)]
pub struct CustomTransition {
    name: String,
    param_names: Vec<String>,
    func: Arc<TransitionFn>,
}

impl CustomTransition {
    /// Register metadata for a custom function.
    ///
    /// The name must be non-empty and parameter names must be non-empty and unique.
    pub fn new<F>(name: impl Into<String>, param_names: &[&str], func: F) -> Result<Self>
    where
        F: Fn(&DMatrix<f64>, &[f64]) -> DVector<f64> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SkillModelError::Transition(
                "custom transition functions must have a name".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for p in param_names {
            if p.trim().is_empty() {
                return Err(SkillModelError::Transition(format!(
                    "custom transition function '{}' has an empty parameter name",
                    name
                )));
            }
            if !seen.insert(*p) {
                return Err(SkillModelError::Transition(format!(
                    "custom transition function '{}' registers parameter '{}' twice",
                    name, p
                )));
            }
        }
        Ok(Self {
            name,
            param_names: param_names.iter().map(|s| s.to_string()).collect(),
            func: Arc::new(func),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }
}

impl fmt::Debug for CustomTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomTransition")
            .field("name", &self.name)
            .field("param_names", &self.param_names)
            .finish()
    }
}

/// Transition function of one latent factor, resolved at compile time.
#[derive(Debug, Clone)]
pub enum TransitionKind {
    Linear,
    Constant,
    LogCes,
    Translog,
    Custom(CustomTransition),
}

impl TransitionKind {
    pub fn name(&self) -> &str {
        match self {
            TransitionKind::Linear => "linear",
            TransitionKind::Constant => "constant",
            TransitionKind::LogCes => "log_ces",
            TransitionKind::Translog => "translog",
            TransitionKind::Custom(c) => c.name(),
        }
    }

    fn builtin(name: &str) -> Option<Self> {
        match name {
            "linear" => Some(TransitionKind::Linear),
            "constant" => Some(TransitionKind::Constant),
            "log_ces" => Some(TransitionKind::LogCes),
            "translog" => Some(TransitionKind::Translog),
            _ => None,
        }
    }

    /// Ordered parameter names given all factors (latent then observed).
    pub fn param_names(&self, all_factors: &[String]) -> Vec<String> {
        match self {
            TransitionKind::Linear => {
                let mut names = all_factors.to_vec();
                names.push("constant".into());
                names
            }
            TransitionKind::Constant => vec![],
            TransitionKind::LogCes => {
                let mut names = all_factors.to_vec();
                names.push("phi".into());
                names
            }
            TransitionKind::Translog => {
                let mut names = all_factors.to_vec();
                for f in all_factors {
                    names.push(format!("{} ** 2", f));
                }
                for (i, a) in all_factors.iter().enumerate() {
                    for b in &all_factors[i + 1..] {
                        names.push(format!("{} * {}", a, b));
                    }
                }
                names.push("constant".into());
                names
            }
            TransitionKind::Custom(c) => c.param_names().to_vec(),
        }
    }

    fn n_params(&self, n_all: usize) -> usize {
        match self {
            TransitionKind::Linear | TransitionKind::LogCes => n_all + 1,
            TransitionKind::Constant => 0,
            TransitionKind::Translog => n_all + n_all * (n_all + 1) / 2 + 1,
            TransitionKind::Custom(c) => c.param_names.len(),
        }
    }

    /// Evaluate on a batch. `position` is the column of the factor itself.
    pub fn evaluate(
        &self,
        points: &DMatrix<f64>,
        params: &[f64],
        position: usize,
    ) -> Result<DVector<f64>> {
        let expected = self.n_params(points.ncols());
        if params.len() != expected {
            return Err(SkillModelError::Transition(format!(
                "{} expects {} parameters, got {}",
                self.name(),
                expected,
                params.len()
            )));
        }
        let out = match self {
            TransitionKind::Linear => linear(points, params),
            TransitionKind::Constant => constant(points, position),
            TransitionKind::LogCes => log_ces(points, params),
            TransitionKind::Translog => translog(points, params),
            TransitionKind::Custom(c) => (c.func)(points, params),
        };
        if out.len() != points.nrows() {
            return Err(SkillModelError::Transition(format!(
                "{} returned {} values for {} points",
                self.name(),
                out.len(),
                points.nrows()
            )));
        }
        Ok(out)
    }
}

/// `sum_i beta_i x_i + constant`
pub fn linear(points: &DMatrix<f64>, params: &[f64]) -> DVector<f64> {
    let n = points.ncols();
    let beta = DVector::from_column_slice(&params[..n]);
    (points * beta).add_scalar(params[n])
}

/// Identity on the factor in column `position`.
pub fn constant(points: &DMatrix<f64>, position: usize) -> DVector<f64> {
    points.column(position).clone_owned()
}

/// `(1 / phi) * ln(sum_i gamma_i exp(phi x_i))`, evaluated as a log-sum-exp.
pub fn log_ces(points: &DMatrix<f64>, params: &[f64]) -> DVector<f64> {
    let n = points.ncols();
    let gammas = &params[..n];
    let raw_phi = params[n];
    let phi = if raw_phi.abs() < MIN_ABS_PHI {
        MIN_ABS_PHI.copysign(raw_phi)
    } else {
        raw_phi
    };

    let scaled = points * phi;
    let mut row_max = scaled.column(0).clone_owned();
    for j in 1..n {
        row_max = row_max.zip_map(&scaled.column(j), f64::max);
    }

    let mut acc = DVector::<f64>::zeros(points.nrows());
    for (j, gamma) in gammas.iter().enumerate() {
        acc += (scaled.column(j) - &row_max).map(f64::exp) * *gamma;
    }

    (row_max + acc.map(|s| s.max(f64::MIN_POSITIVE).ln())) / phi
}

/// Linear, squared and pairwise interaction terms plus a constant.
///
/// Parameter layout: `[x_1..x_n, x_1^2..x_n^2, x_1 x_2, x_1 x_3, ..., x_{n-1} x_n, constant]`.
pub fn translog(points: &DMatrix<f64>, params: &[f64]) -> DVector<f64> {
    let n = points.ncols();
    let linear_coeffs = DVector::from_column_slice(&params[..n]);
    let square_coeffs = DVector::from_column_slice(&params[n..2 * n]);

    let mut out = points * linear_coeffs;
    out += points.component_mul(points) * square_coeffs;

    let mut idx = 2 * n;
    for i in 0..n {
        for j in (i + 1)..n {
            out += points.column(i).component_mul(&points.column(j)) * params[idx];
            idx += 1;
        }
    }
    out.add_scalar_mut(params[idx]);
    out
}

/// Named custom transition functions available to the model compiler.
#[derive(Debug, Clone, Default)]
pub struct TransitionRegistry {
    functions: BTreeMap<String, CustomTransition>,
}

impl TransitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, custom: CustomTransition) -> Result<()> {
        if BUILTIN_NAMES.contains(&custom.name()) {
            return Err(SkillModelError::Transition(format!(
                "'{}' is the name of a built-in transition function",
                custom.name()
            )));
        }
        if self.functions.contains_key(custom.name()) {
            return Err(SkillModelError::Transition(format!(
                "transition function '{}' is already registered",
                custom.name()
            )));
        }
        self.functions.insert(custom.name().to_string(), custom);
        Ok(())
    }

    pub fn with(mut self, custom: CustomTransition) -> Result<Self> {
        self.register(custom)?;
        Ok(self)
    }

    /// Resolve a name to a built-in or registered function.
    pub fn resolve(&self, name: &str) -> Result<TransitionKind> {
        if let Some(kind) = TransitionKind::builtin(name) {
            return Ok(kind);
        }
        self.functions
            .get(name)
            .map(|c| TransitionKind::Custom(c.clone()))
            .ok_or_else(|| {
                SkillModelError::Transition(format!(
                    "unknown transition function '{}': not a built-in and not registered",
                    name
                ))
            })
    }
}

/// All latent factors' transitions composed into one batch function.
#[derive(Debug, Clone)]
pub struct TransitionFunction {
    kinds: Vec<TransitionKind>,
    /// Column of each latent factor in the batch.
    positions: Vec<usize>,
    n_all_factors: usize,
}

impl TransitionFunction {
    pub fn new(kinds: Vec<TransitionKind>, n_all_factors: usize) -> Self {
        let positions = (0..kinds.len()).collect();
        Self {
            kinds,
            positions,
            n_all_factors,
        }
    }

    pub fn n_latent_factors(&self) -> usize {
        self.kinds.len()
    }

    pub fn kinds(&self) -> &[TransitionKind] {
        &self.kinds
    }

    /// Next-period latent factors for every row of `points`.
    ///
    /// `params[f]` holds the parameters of latent factor `f`.
    pub fn apply(&self, points: &DMatrix<f64>, params: &[Vec<f64>]) -> Result<DMatrix<f64>> {
        if points.ncols() != self.n_all_factors {
            return Err(SkillModelError::Transition(format!(
                "points have {} columns, model has {} factors",
                points.ncols(),
                self.n_all_factors
            )));
        }
        if params.len() != self.kinds.len() {
            return Err(SkillModelError::Transition(format!(
                "got parameters for {} factors, model has {} latent factors",
                params.len(),
                self.kinds.len()
            )));
        }

        let mut out = DMatrix::<f64>::zeros(points.nrows(), self.kinds.len());
        for (f, kind) in self.kinds.iter().enumerate() {
            let next = kind.evaluate(points, &params[f], self.positions[f])?;
            out.set_column(f, &next);
        }
        Ok(out)
    }
}

/// Everything the compiler knows about transitions.
#[derive(Debug, Clone)]
pub struct TransitionInfo {
    pub function_names: Vec<String>,
    /// Parameter names per latent factor.
    pub param_names: Vec<Vec<String>>,
    pub func: TransitionFunction,
}

impl TransitionInfo {
    pub fn new(
        latent_factors: &[String],
        all_factors: &[String],
        specs: &[&str],
        registry: &TransitionRegistry,
    ) -> Result<Self> {
        debug_assert_eq!(latent_factors.len(), specs.len());
        let kinds = specs
            .iter()
            .map(|name| registry.resolve(name))
            .collect::<Result<Vec<_>>>()?;

        let function_names = kinds.iter().map(|k| k.name().to_string()).collect();
        let param_names = kinds.iter().map(|k| k.param_names(all_factors)).collect();

        Ok(Self {
            function_names,
            param_names,
            func: TransitionFunction::new(kinds, all_factors.len()),
        })
    }
}
