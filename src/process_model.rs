//! Compile a declarative [`ModelSpec`] into the frozen tables the filter runs on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use log::debug;

use crate::error::{Result, SkillModelError};
use crate::transition::{TransitionInfo, TransitionRegistry};
use crate::types::{AnchoringInfo, Dimensions, EstimationOptions, Labels, ModelSpec};

/// What an update row does to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Measurement,
    Anchoring,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Measurement => "measurement",
            Purpose::Anchoring => "anchoring",
        }
    }
}

impl FromStr for Purpose {
    type Err = SkillModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "measurement" => Ok(Purpose::Measurement),
            "anchoring" => Ok(Purpose::Anchoring),
            other => Err(SkillModelError::UnknownPurpose(other.to_string())),
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One Kalman update: a measurement or anchoring outcome in one period.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRow {
    pub period: usize,
    pub variable: String,
    /// One flag per latent factor.
    pub loads_on: Vec<bool>,
    pub purpose: Purpose,
}

/// Ordered update rows with per-period ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInfo {
    rows: Vec<UpdateRow>,
    period_ranges: Vec<Range<usize>>,
}

impl UpdateInfo {
    /// Rows must be sorted by period.
    pub fn new(rows: Vec<UpdateRow>, n_periods: usize) -> Result<Self> {
        let mut period_ranges = Vec::with_capacity(n_periods);
        let mut start = 0;
        for period in 0..n_periods {
            let mut end = start;
            while end < rows.len() && rows[end].period == period {
                end += 1;
            }
            period_ranges.push(start..end);
            start = end;
        }
        if start != rows.len() {
            return Err(SkillModelError::ModelSpec(format!(
                "update row '{}' is out of period order or beyond period {}",
                rows[start].variable,
                n_periods.saturating_sub(1)
            )));
        }
        Ok(Self {
            rows,
            period_ranges,
        })
    }

    pub fn rows(&self) -> &[UpdateRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index range of the rows of `period` in [`rows`](Self::rows).
    pub fn period_range(&self, period: usize) -> Range<usize> {
        self.period_ranges.get(period).cloned().unwrap_or(0..0)
    }

    pub fn rows_for_period(&self, period: usize) -> &[UpdateRow] {
        &self.rows[self.period_range(period)]
    }

    pub fn period_variables(&self, period: usize) -> Vec<&str> {
        self.rows_for_period(period)
            .iter()
            .map(|r| r.variable.as_str())
            .collect()
    }
}

/// Fixed loadings and intercepts of one latent factor, one map per period.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactorNormalizations {
    pub loadings: Vec<BTreeMap<String, f64>>,
    pub intercepts: Vec<BTreeMap<String, f64>>,
}

/// Extend `short` to `length` with copies of `fill`.
pub fn fill_list<T: Clone>(short: &[T], fill: T, length: usize) -> Result<Vec<T>> {
    if short.len() > length {
        return Err(SkillModelError::FillList {
            len: short.len(),
            target: length,
        });
    }
    let mut out = short.to_vec();
    out.resize(length, fill);
    Ok(out)
}

/// Everything derived from a model specification. Read-only after construction.
#[derive(Debug, Clone)]
pub struct ProcessedModel {
    pub dimensions: Dimensions,
    pub labels: Labels,
    pub anchoring: AnchoringInfo,
    pub options: EstimationOptions,
    pub transition_info: TransitionInfo,
    pub update_info: UpdateInfo,
    /// Indexed like `labels.latent_factors`.
    pub normalizations: Vec<FactorNormalizations>,
    /// Measurement names per latent factor and period, padded to `n_periods`.
    pub measurements: Vec<Vec<Vec<String>>>,
}

impl ProcessedModel {
    pub fn new(spec: &ModelSpec, registry: &TransitionRegistry) -> Result<Self> {
        if spec.factors.is_empty() {
            return Err(SkillModelError::ModelSpec(
                "the model needs at least one latent factor".into(),
            ));
        }
        for (name, factor) in &spec.factors {
            if factor.measurements.iter().all(|m| m.is_empty()) {
                return Err(SkillModelError::ModelSpec(format!(
                    "latent factor '{}' has no measurements",
                    name
                )));
            }
        }

        let options = spec.estimation_options.clone().processed();
        if options.n_mixtures == 0 {
            return Err(SkillModelError::ModelSpec(
                "n_mixtures must be at least 1".into(),
            ));
        }

        let n_periods = spec
            .factors
            .values()
            .map(|f| f.measurements.len())
            .max()
            .unwrap_or(0);

        let labels = build_labels(spec, n_periods)?;
        let dimensions = Dimensions {
            n_latent_factors: labels.latent_factors.len(),
            n_observed_factors: labels.observed_factors.len(),
            n_all_factors: labels.all_factors.len(),
            n_periods,
            n_controls: labels.controls.len(),
            n_mixtures: options.n_mixtures,
        };

        let anchoring = process_anchoring(spec)?;

        let specs: Vec<&str> = labels
            .latent_factors
            .iter()
            .map(|f| spec.factors[f].transition_function.as_str())
            .collect();
        let transition_info =
            TransitionInfo::new(&labels.latent_factors, &labels.all_factors, &specs, registry)?;
        let mut labels = labels;
        labels.transition_names = transition_info.function_names.clone();

        let measurements = labels
            .latent_factors
            .iter()
            .map(|f| fill_list(&spec.factors[f].measurements, Vec::new(), n_periods))
            .collect::<Result<Vec<_>>>()?;

        let update_info = build_update_info(&labels, &measurements, &anchoring, n_periods)?;
        let normalizations = process_normalizations(spec, &labels, &measurements, n_periods)?;

        debug!(
            "processed model: {} latent, {} observed factors, {} periods, {} update rows, {} mixtures",
            dimensions.n_latent_factors,
            dimensions.n_observed_factors,
            dimensions.n_periods,
            update_info.len(),
            dimensions.n_mixtures
        );

        Ok(Self {
            dimensions,
            labels,
            anchoring,
            options,
            transition_info,
            update_info,
            normalizations,
            measurements,
        })
    }

    /// Compile with the built-in transition functions only.
    pub fn from_spec(spec: &ModelSpec) -> Result<Self> {
        Self::new(spec, &TransitionRegistry::new())
    }

    /// Position of the stage of transition `period → period + 1` in `labels.stages`.
    pub fn stage_index(&self, period: usize) -> usize {
        let stage = self.labels.stagemap[period];
        self.labels
            .stages
            .iter()
            .position(|&s| s == stage)
            .unwrap_or(0)
    }
}

fn build_labels(spec: &ModelSpec, n_periods: usize) -> Result<Labels> {
    if n_periods == 0 {
        return Err(SkillModelError::ModelSpec(
            "the model needs at least one period".into(),
        ));
    }

    let latent_factors: Vec<String> = spec.factors.keys().cloned().collect();
    let mut observed_factors = spec.observed_factors.clone();
    observed_factors.sort();
    let mut sorted_controls = spec.controls.clone();
    sorted_controls.sort();

    let mut seen = BTreeSet::new();
    seen.insert("constant");
    for name in latent_factors
        .iter()
        .chain(observed_factors.iter())
        .chain(sorted_controls.iter())
    {
        if !seen.insert(name.as_str()) {
            return Err(SkillModelError::ModelSpec(format!(
                "name '{}' is used more than once among factors and controls",
                name
            )));
        }
    }

    let stagemap = match &spec.stagemap {
        Some(s) => s.clone(),
        None => (0..n_periods - 1).collect(),
    };
    if stagemap.len() != n_periods - 1 {
        return Err(SkillModelError::ModelSpec(format!(
            "stagemap has length {}, expected n_periods - 1 = {}",
            stagemap.len(),
            n_periods - 1
        )));
    }
    if stagemap.windows(2).any(|w| w[1] < w[0]) {
        return Err(SkillModelError::ModelSpec(
            "stagemap must be non-decreasing".into(),
        ));
    }
    let stages: Vec<usize> = stagemap
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut controls = vec!["constant".to_string()];
    controls.extend(sorted_controls);
    let mut all_factors = latent_factors.clone();
    all_factors.extend(observed_factors.iter().cloned());

    Ok(Labels {
        latent_factors,
        observed_factors,
        all_factors,
        controls,
        periods: (0..n_periods).collect(),
        stagemap,
        stages,
        transition_names: Vec::new(),
    })
}

fn process_anchoring(spec: &ModelSpec) -> Result<AnchoringInfo> {
    let anchoring = match &spec.anchoring {
        Some(a) if !a.outcomes.is_empty() => a,
        _ => return Ok(AnchoringInfo::default()),
    };

    for factor in anchoring.outcomes.keys() {
        if !spec.factors.contains_key(factor) {
            return Err(SkillModelError::ModelSpec(format!(
                "anchoring references '{}', which is not a latent factor",
                factor
            )));
        }
    }

    Ok(AnchoringInfo {
        enabled: true,
        outcomes: anchoring.outcomes.clone(),
        factors: anchoring.outcomes.keys().cloned().collect(),
        free_controls: anchoring.free_controls,
        free_constant: anchoring.free_constant,
        free_loadings: anchoring.free_loadings,
        ignore_constant_when_anchoring: anchoring.ignore_constant_when_anchoring,
    })
}

fn build_update_info(
    labels: &Labels,
    measurements: &[Vec<Vec<String>>],
    anchoring: &AnchoringInfo,
    n_periods: usize,
) -> Result<UpdateInfo> {
    let n_latent = labels.latent_factors.len();
    let mut rows: Vec<UpdateRow> = Vec::new();

    for period in 0..n_periods {
        let period_start = rows.len();
        for (f, factor_meas) in measurements.iter().enumerate() {
            for meas in &factor_meas[period] {
                // a measurement of several factors is a single update
                let existing = rows[period_start..]
                    .iter()
                    .position(|r| &r.variable == meas);
                match existing {
                    Some(pos) => rows[period_start + pos].loads_on[f] = true,
                    None => {
                        let mut loads_on = vec![false; n_latent];
                        loads_on[f] = true;
                        rows.push(UpdateRow {
                            period,
                            variable: meas.clone(),
                            loads_on,
                            purpose: Purpose::Measurement,
                        });
                    }
                }
            }
        }

        for factor in &anchoring.factors {
            let f = labels
                .latent_factors
                .iter()
                .position(|l| l == factor)
                .ok_or_else(|| {
                    SkillModelError::ModelSpec(format!("unknown anchored factor '{}'", factor))
                })?;
            let mut loads_on = vec![false; n_latent];
            loads_on[f] = true;
            rows.push(UpdateRow {
                period,
                variable: format!("{}_{}", anchoring.outcomes[factor], factor),
                loads_on,
                purpose: Purpose::Anchoring,
            });
        }
    }

    UpdateInfo::new(rows, n_periods)
}

fn process_normalizations(
    spec: &ModelSpec,
    labels: &Labels,
    measurements: &[Vec<Vec<String>>],
    n_periods: usize,
) -> Result<Vec<FactorNormalizations>> {
    labels
        .latent_factors
        .iter()
        .zip(measurements.iter())
        .map(|(factor, factor_meas)| {
            let norm = &spec.factors[factor].normalizations;
            let loadings = fill_list(&norm.loadings, BTreeMap::new(), n_periods)?;
            let intercepts = fill_list(&norm.intercepts, BTreeMap::new(), n_periods)?;

            for (kind, per_period) in [("loading", &loadings), ("intercept", &intercepts)] {
                for (period, fixed) in per_period.iter().enumerate() {
                    for meas in fixed.keys() {
                        if !factor_meas[period].contains(meas) {
                            return Err(SkillModelError::ModelSpec(format!(
                                "normalized {} of '{}' in period {}: '{}' is not a measurement of this factor in this period",
                                kind, factor, period, meas
                            )));
                        }
                    }
                }
            }

            Ok(FactorNormalizations {
                loadings,
                intercepts,
            })
        })
        .collect()
}
