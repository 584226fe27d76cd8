use std::fmt;

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SkillModelError};
use crate::process_model::{ProcessedModel, Purpose};
use crate::transition::TransitionKind;

/// Parameter groups, in the order they appear in the flat vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamCategory {
    Controls,
    Loadings,
    MeasSds,
    ShockSds,
    InitialStates,
    MixtureWeights,
    InitialCholcovs,
    Transition,
}

impl ParamCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamCategory::Controls => "controls",
            ParamCategory::Loadings => "loadings",
            ParamCategory::MeasSds => "meas_sds",
            ParamCategory::ShockSds => "shock_sds",
            ParamCategory::InitialStates => "initial_states",
            ParamCategory::MixtureWeights => "mixture_weights",
            ParamCategory::InitialCholcovs => "initial_cholcovs",
            ParamCategory::Transition => "transition",
        }
    }
}

/// Label of one parameter: `(category, period, name1, name2)`.
///
/// For transition parameters `period` is the stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLabel {
    pub category: ParamCategory,
    pub period: usize,
    pub name1: String,
    pub name2: String,
}

impl ParamLabel {
    fn new(category: ParamCategory, period: usize, name1: impl Into<String>, name2: impl Into<String>) -> Self {
        Self {
            category,
            period,
            name1: name1.into(),
            name2: name2.into(),
        }
    }
}

impl fmt::Display for ParamLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.category.as_str(),
            self.period,
            self.name1,
            self.name2
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Bound {
    Free,
    Positive,
    Weight,
}

/// Every parameter of a model with fixed values, bounds and start values.
///
/// The optimizer only sees the free entries; [`expand`](Self::expand)
/// inserts the fixed ones.
#[derive(Debug, Clone)]
pub struct ParamsTemplate {
    labels: Vec<ParamLabel>,
    fixed: Vec<Option<f64>>,
    bounds: Vec<Bound>,
    start: Vec<f64>,
    free_index: Vec<usize>,
    bounds_distance: f64,
}

impl ParamsTemplate {
    pub fn new(model: &ProcessedModel) -> Self {
        let mut b = TemplateBuilder::default();
        let labels = &model.labels;
        let n_latent = model.dimensions.n_latent_factors;
        let n_mix = model.dimensions.n_mixtures;
        let anchoring = &model.anchoring;

        // controls
        for row in model.update_info.rows() {
            for (c, control) in labels.controls.iter().enumerate() {
                let fixed = match row.purpose {
                    Purpose::Measurement if c == 0 => fixed_intercept(model, row.period, &row.variable, &row.loads_on),
                    Purpose::Measurement => None,
                    Purpose::Anchoring if c == 0 && !anchoring.free_constant => Some(0.0),
                    Purpose::Anchoring if c > 0 && !anchoring.free_controls => Some(0.0),
                    Purpose::Anchoring => None,
                };
                b.push(
                    ParamLabel::new(ParamCategory::Controls, row.period, &row.variable, control),
                    fixed,
                    Bound::Free,
                    0.0,
                );
            }
        }

        // loadings
        for row in model.update_info.rows() {
            for (f, factor) in labels.latent_factors.iter().enumerate() {
                if !row.loads_on[f] {
                    continue;
                }
                let fixed = match row.purpose {
                    Purpose::Measurement => model.normalizations[f].loadings[row.period]
                        .get(&row.variable)
                        .copied(),
                    Purpose::Anchoring if !anchoring.free_loadings => Some(1.0),
                    Purpose::Anchoring => None,
                };
                b.push(
                    ParamLabel::new(ParamCategory::Loadings, row.period, &row.variable, factor),
                    fixed,
                    Bound::Free,
                    1.0,
                );
            }
        }

        for row in model.update_info.rows() {
            b.push(
                ParamLabel::new(ParamCategory::MeasSds, row.period, &row.variable, "-"),
                None,
                Bound::Positive,
                1.0,
            );
        }

        let kinds = model.transition_info.func.kinds();
        for period in 0..model.dimensions.n_periods.saturating_sub(1) {
            for (f, factor) in labels.latent_factors.iter().enumerate() {
                let fixed = match kinds[f] {
                    TransitionKind::Constant => Some(0.0),
                    _ => None,
                };
                b.push(
                    ParamLabel::new(ParamCategory::ShockSds, period, factor, "-"),
                    fixed,
                    Bound::Positive,
                    0.5,
                );
            }
        }

        for j in 0..n_mix {
            let offset = j as f64 - (n_mix as f64 - 1.0) / 2.0;
            for factor in &labels.latent_factors {
                b.push(
                    ParamLabel::new(ParamCategory::InitialStates, 0, format!("mixture_{}", j), factor),
                    None,
                    Bound::Free,
                    0.5 * offset,
                );
            }
        }

        for j in 0..n_mix {
            let fixed = if n_mix == 1 { Some(1.0) } else { None };
            b.push(
                ParamLabel::new(ParamCategory::MixtureWeights, 0, format!("mixture_{}", j), "-"),
                fixed,
                Bound::Weight,
                1.0 / n_mix as f64,
            );
        }

        for j in 0..n_mix {
            for row in 0..n_latent {
                for col in 0..=row {
                    let (bound, start) = if row == col {
                        (Bound::Positive, 1.0)
                    } else {
                        (Bound::Free, 0.0)
                    };
                    b.push(
                        ParamLabel::new(
                            ParamCategory::InitialCholcovs,
                            0,
                            format!("mixture_{}", j),
                            format!("{}-{}", labels.latent_factors[row], labels.latent_factors[col]),
                        ),
                        None,
                        bound,
                        start,
                    );
                }
            }
        }

        let all_factors = &labels.all_factors;
        for &stage in &labels.stages {
            for (f, factor) in labels.latent_factors.iter().enumerate() {
                let names = &model.transition_info.param_names[f];
                let starts = transition_start_values(&kinds[f], f, all_factors.len(), names.len());
                for (name, start) in names.iter().zip(starts) {
                    b.push(
                        ParamLabel::new(ParamCategory::Transition, stage, factor, name),
                        None,
                        Bound::Free,
                        start,
                    );
                }
            }
        }

        b.finish(model.options.bounds_distance)
    }

    /// Number of parameters including fixed ones.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_free(&self) -> usize {
        self.free_index.len()
    }

    pub fn free_labels(&self) -> Vec<&ParamLabel> {
        self.free_index.iter().map(|&i| &self.labels[i]).collect()
    }

    /// Insert the fixed values into a vector of free parameters.
    pub fn expand(&self, free: &[f64]) -> Result<Vec<f64>> {
        if free.len() != self.n_free() {
            return Err(SkillModelError::ParamLengthMismatch {
                expected: self.n_free(),
                got: free.len(),
            });
        }
        let mut full: Vec<f64> = self.fixed.iter().map(|v| v.unwrap_or(f64::NAN)).collect();
        for (&i, &v) in self.free_index.iter().zip(free.iter()) {
            full[i] = v;
        }
        Ok(full)
    }

    /// Free entries of a full parameter vector.
    pub fn reduce(&self, full: &[f64]) -> Result<Vec<f64>> {
        if full.len() != self.len() {
            return Err(SkillModelError::ParamLengthMismatch {
                expected: self.len(),
                got: full.len(),
            });
        }
        Ok(self.free_index.iter().map(|&i| full[i]).collect())
    }

    fn full_position(&self, category: ParamCategory, period: usize, name1: &str, name2: &str) -> Option<usize> {
        self.labels.iter().position(|l| {
            l.category == category && l.period == period && l.name1 == name1 && l.name2 == name2
        })
    }

    /// Index of a parameter among the free parameters.
    pub fn position(&self, category: ParamCategory, period: usize, name1: &str, name2: &str) -> Option<usize> {
        let full = self.full_position(category, period, name1, name2)?;
        self.free_index.iter().position(|&i| i == full)
    }

    /// `(lower, upper)` of each free parameter.
    pub fn bounds(&self) -> Vec<(Option<f64>, Option<f64>)> {
        let bd = self.bounds_distance;
        self.free_index
            .iter()
            .map(|&i| match self.bounds[i] {
                Bound::Free => (None, None),
                Bound::Positive => (Some(bd), None),
                Bound::Weight => (Some(bd), Some(1.0)),
            })
            .collect()
    }

    /// Clamp free parameters into their bounds.
    pub fn project(&self, free: &[f64]) -> Vec<f64> {
        free.iter()
            .zip(self.bounds())
            .map(|(&x, (lo, hi))| {
                let x = lo.map_or(x, |l| x.max(l));
                hi.map_or(x, |h| x.min(h))
            })
            .collect()
    }

    /// Naive start values of the free parameters.
    pub fn start_values(&self) -> Vec<f64> {
        self.free_index.iter().map(|&i| self.start[i]).collect()
    }
}

#[derive(Default)]
struct TemplateBuilder {
    labels: Vec<ParamLabel>,
    fixed: Vec<Option<f64>>,
    bounds: Vec<Bound>,
    start: Vec<f64>,
}

impl TemplateBuilder {
    fn push(&mut self, label: ParamLabel, fixed: Option<f64>, bound: Bound, start: f64) {
        self.labels.push(label);
        self.start.push(fixed.unwrap_or(start));
        self.fixed.push(fixed);
        self.bounds.push(bound);
    }

    fn finish(self, bounds_distance: f64) -> ParamsTemplate {
        let free_index = self
            .fixed
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| i)
            .collect();
        ParamsTemplate {
            labels: self.labels,
            fixed: self.fixed,
            bounds: self.bounds,
            start: self.start,
            free_index,
            bounds_distance,
        }
    }
}

fn fixed_intercept(model: &ProcessedModel, period: usize, variable: &str, loads_on: &[bool]) -> Option<f64> {
    loads_on
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .find_map(|(f, _)| model.normalizations[f].intercepts[period].get(variable).copied())
}

fn transition_start_values(kind: &TransitionKind, own: usize, n_all: usize, n_params: usize) -> Vec<f64> {
    match kind {
        TransitionKind::Linear | TransitionKind::Translog => {
            let mut v = vec![0.0; n_params];
            v[own] = 1.0;
            v
        }
        TransitionKind::LogCes => {
            let mut v = vec![1.0 / n_all as f64; n_params];
            v[n_params - 1] = 1.0;
            v
        }
        TransitionKind::Constant | TransitionKind::Custom(_) => vec![0.0; n_params],
    }
}

/// Total number of parameters (free and fixed) of a model.
pub fn n_params(model: &ProcessedModel) -> usize {
    let dims = &model.dimensions;
    let rows = model.update_info.rows();
    let n_loadings: usize = rows
        .iter()
        .map(|r| r.loads_on.iter().filter(|&&on| on).count())
        .sum();
    let n_transition: usize = model.transition_info.param_names.iter().map(|p| p.len()).sum();
    let k = dims.n_latent_factors;

    rows.len() * dims.n_controls
        + n_loadings
        + rows.len()
        + dims.n_periods.saturating_sub(1) * k
        + dims.n_mixtures * k
        + dims.n_mixtures
        + dims.n_mixtures * k * (k + 1) / 2
        + model.labels.stages.len() * n_transition
}

/// Parameters parsed into the arrays the filter consumes.
#[derive(Debug, Clone)]
pub struct ParsedParams {
    /// Control coefficients per update row, constant first.
    pub controls: Vec<DVector<f64>>,
    /// n_updates × n_latent, zero where a row does not load on a factor.
    pub loadings: DMatrix<f64>,
    pub meas_sds: DVector<f64>,
    /// (n_periods - 1) × n_latent
    pub shock_sds: DMatrix<f64>,
    /// n_mixtures × n_latent
    pub initial_states: DMatrix<f64>,
    /// Normalized to sum to one.
    pub mixture_weights: DVector<f64>,
    /// Lower Cholesky factor per mixture component.
    pub initial_cholcovs: Vec<DMatrix<f64>>,
    /// Parameters per stage and latent factor.
    pub transition: Vec<Vec<Vec<f64>>>,
    /// n_periods × n_latent, 1 for factors without anchoring.
    pub anchoring_scaling_factors: DMatrix<f64>,
    /// n_periods × n_latent, 0 for factors without anchoring.
    pub anchoring_constants: DMatrix<f64>,
}

struct Cursor<'a> {
    values: &'a [f64],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> &'a [f64] {
        let out = &self.values[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn next_value(&mut self) -> f64 {
        self.take(1)[0]
    }
}

impl ParsedParams {
    /// Parse a full parameter vector (free and fixed entries).
    pub fn from_flat(full: &[f64], model: &ProcessedModel) -> Result<Self> {
        let expected = n_params(model);
        if full.len() != expected {
            return Err(SkillModelError::ParamLengthMismatch {
                expected,
                got: full.len(),
            });
        }

        let dims = &model.dimensions;
        let rows = model.update_info.rows();
        let n_latent = dims.n_latent_factors;
        let n_mix = dims.n_mixtures;
        let mut cur = Cursor { values: full, pos: 0 };

        let controls = rows
            .iter()
            .map(|_| DVector::from_column_slice(cur.take(dims.n_controls)))
            .collect::<Vec<_>>();

        let mut loadings = DMatrix::<f64>::zeros(rows.len(), n_latent);
        for (i, row) in rows.iter().enumerate() {
            for f in 0..n_latent {
                if row.loads_on[f] {
                    loadings[(i, f)] = cur.next_value();
                }
            }
        }

        let meas_sds = DVector::from_column_slice(cur.take(rows.len()));
        let n_transitions = dims.n_periods.saturating_sub(1);
        let shock_sds = DMatrix::from_row_slice(n_transitions, n_latent, cur.take(n_transitions * n_latent));
        let initial_states = DMatrix::from_row_slice(n_mix, n_latent, cur.take(n_mix * n_latent));

        let raw_weights = DVector::from_column_slice(cur.take(n_mix));
        let total = raw_weights.sum();
        let mixture_weights = raw_weights / total;

        let mut initial_cholcovs = Vec::with_capacity(n_mix);
        for _ in 0..n_mix {
            let mut chol = DMatrix::<f64>::zeros(n_latent, n_latent);
            for r in 0..n_latent {
                for c in 0..=r {
                    chol[(r, c)] = cur.next_value();
                }
            }
            initial_cholcovs.push(chol);
        }

        let transition = model
            .labels
            .stages
            .iter()
            .map(|_| {
                model
                    .transition_info
                    .param_names
                    .iter()
                    .map(|names| cur.take(names.len()).to_vec())
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut anchoring_scaling_factors = DMatrix::from_element(dims.n_periods, n_latent, 1.0);
        let mut anchoring_constants = DMatrix::<f64>::zeros(dims.n_periods, n_latent);
        for (i, row) in rows.iter().enumerate() {
            if row.purpose != Purpose::Anchoring {
                continue;
            }
            for f in (0..n_latent).filter(|&f| row.loads_on[f]) {
                anchoring_scaling_factors[(row.period, f)] = loadings[(i, f)];
                if !model.anchoring.ignore_constant_when_anchoring {
                    anchoring_constants[(row.period, f)] = controls[i][0];
                }
            }
        }

        Ok(Self {
            controls,
            loadings,
            meas_sds,
            shock_sds,
            initial_states,
            mixture_weights,
            initial_cholcovs,
            transition,
            anchoring_scaling_factors,
            anchoring_constants,
        })
    }
}
