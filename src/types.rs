use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::Result;

/// Declarative description of a latent factor model.
///
/// Latent factors are keyed by name; a `BTreeMap` keeps them sorted, which
/// fixes the factor order used by every table derived from the spec.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelSpec {
    pub factors: BTreeMap<String, FactorSpec>,
    #[serde(default)]
    pub observed_factors: Vec<String>,
    #[serde(default)]
    pub controls: Vec<String>,
    /// Stage of each transition (period `t` → `t + 1`). Defaults to one stage per period.
    #[serde(default)]
    pub stagemap: Option<Vec<usize>>,
    #[serde(default)]
    pub anchoring: Option<AnchoringSpec>,
    #[serde(default)]
    pub estimation_options: EstimationOptions,
}

impl ModelSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Specification of one latent factor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactorSpec {
    /// Measurement names per period. Shorter lists are padded with empty periods.
    pub measurements: Vec<Vec<String>>,
    /// Built-in name (`linear`, `constant`, `log_ces`, `translog`) or the name
    /// of a function in the transition registry.
    pub transition_function: String,
    #[serde(default)]
    pub normalizations: NormalizationSpec,
}

/// Fixed loadings and intercepts per period: `measurement -> value`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NormalizationSpec {
    #[serde(default)]
    pub loadings: Vec<BTreeMap<String, f64>>,
    #[serde(default)]
    pub intercepts: Vec<BTreeMap<String, f64>>,
}

/// Anchoring of latent factors to outcome variables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnchoringSpec {
    /// factor -> outcome variable
    pub outcomes: BTreeMap<String, String>,
    pub free_controls: bool,
    pub free_constant: bool,
    pub free_loadings: bool,
    pub ignore_constant_when_anchoring: bool,
}

/// Tuning options for the estimation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EstimationOptions {
    pub n_mixtures: usize,
    /// κ of the sigma point scaling.
    pub sigma_points_scale: f64,
    pub robust_bounds: bool,
    pub bounds_distance: f64,
    pub clipping_lower_bound: Option<f64>,
    pub clipping_upper_bound: Option<f64>,
    pub clipping_lower_hardness: f64,
    pub clipping_upper_hardness: f64,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            n_mixtures: 1,
            sigma_points_scale: 2.0,
            robust_bounds: true,
            bounds_distance: 1e-3,
            clipping_lower_bound: Some(-1e250),
            clipping_upper_bound: None,
            clipping_lower_hardness: 1.0,
            clipping_upper_hardness: 1.0,
        }
    }
}

impl EstimationOptions {
    /// Apply the dependencies between options.
    pub fn processed(mut self) -> Self {
        if !self.robust_bounds {
            self.bounds_distance = 0.0;
        }
        self
    }
}

/// Dimensional information of a processed model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimensions {
    pub n_latent_factors: usize,
    pub n_observed_factors: usize,
    pub n_all_factors: usize,
    pub n_periods: usize,
    /// Includes the constant.
    pub n_controls: usize,
    pub n_mixtures: usize,
}

/// Ordered labels of the model quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct Labels {
    pub latent_factors: Vec<String>,
    pub observed_factors: Vec<String>,
    /// Latent factors followed by observed factors.
    pub all_factors: Vec<String>,
    /// `"constant"` followed by the sorted controls.
    pub controls: Vec<String>,
    pub periods: Vec<usize>,
    pub stagemap: Vec<usize>,
    pub stages: Vec<usize>,
    pub transition_names: Vec<String>,
}

/// Processed anchoring information.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchoringInfo {
    pub enabled: bool,
    pub outcomes: BTreeMap<String, String>,
    /// Sorted anchored factors.
    pub factors: Vec<String>,
    pub free_controls: bool,
    pub free_constant: bool,
    pub free_loadings: bool,
    pub ignore_constant_when_anchoring: bool,
}

/// Fit result returned by the optimizer.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Free parameters at the optimum.
    pub params: Vec<f64>,
    pub loglike: f64,
    pub n_obs: usize,
    pub n_params: usize,
    pub n_iter: u64,
    pub converged: bool,
    pub method: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = EstimationOptions::default();
        assert_eq!(options.n_mixtures, 1);
        assert!((options.sigma_points_scale - 2.0).abs() < 1e-15);
        assert!(options.robust_bounds);
        assert!((options.bounds_distance - 1e-3).abs() < 1e-15);
        assert_eq!(options.clipping_lower_bound, Some(-1e250));
        assert!(options.clipping_upper_bound.is_none());
    }

    #[test]
    fn test_bounds_distance_zero_without_robust_bounds() {
        let options = EstimationOptions {
            robust_bounds: false,
            ..Default::default()
        }
        .processed();
        assert_eq!(options.bounds_distance, 0.0);

        let kept = EstimationOptions::default().processed();
        assert!((kept.bounds_distance - 1e-3).abs() < 1e-15);
    }

    #[test]
    fn test_model_spec_from_json_defaults() {
        let json = r#"{
            "factors": {
                "fac2": {"measurements": [["y3"]], "transition_function": "linear"},
                "fac1": {"measurements": [["y1", "y2"], ["y1"]], "transition_function": "log_ces"}
            },
            "estimation_options": {"sigma_points_scale": 3.0}
        }"#;
        let spec = ModelSpec::from_json(json).unwrap();
        let names: Vec<&String> = spec.factors.keys().collect();
        assert_eq!(names, vec!["fac1", "fac2"]);
        assert!(spec.controls.is_empty());
        assert!(spec.anchoring.is_none());
        assert!((spec.estimation_options.sigma_points_scale - 3.0).abs() < 1e-15);
        assert_eq!(spec.estimation_options.n_mixtures, 1);
        assert!(spec.factors["fac1"].normalizations.loadings.is_empty());
    }
}
