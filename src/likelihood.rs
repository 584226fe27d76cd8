//! Log-likelihood of a skill formation model via the square-root UKF.
//!
//! Each period applies every update row of that period in table order and,
//! unless it is the last period, predicts the state into the next period.

use nalgebra::{DMatrix, DVector};

use crate::clipping::soft_clipping;
use crate::data::PanelData;
use crate::error::{Result, SkillModelError};
use crate::kalman::{
    sqrt_linear_anchoring_update, sqrt_linear_update, sqrt_unscented_predict, FilterState,
    PredictInputs, UpdateInputs,
};
use crate::params::{ParamsTemplate, ParsedParams};
use crate::process_model::{ProcessedModel, Purpose};
use crate::sigma_points::SigmaWeights;
use crate::types::EstimationOptions;

/// Log-likelihood contribution of every (update row, individual).
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodContributions {
    /// n_updates × n_obs, rows in update-table order.
    pub values: DMatrix<f64>,
}

impl LikelihoodContributions {
    /// Row-major: period, then update row, then individual.
    pub fn to_flat(&self) -> Vec<f64> {
        self.values.transpose().as_slice().to_vec()
    }

    pub fn sum(&self) -> f64 {
        self.values.sum()
    }

    /// Contributions after soft clipping with the bounds of `options`.
    pub fn clipped(&self, options: &EstimationOptions) -> Vec<f64> {
        soft_clipping(
            &self.to_flat(),
            options.clipping_lower_bound,
            options.clipping_upper_bound,
            options.clipping_lower_hardness,
            options.clipping_upper_hardness,
        )
    }

    /// Sum of the soft-clipped contributions.
    pub fn clipped_sum(&self, options: &EstimationOptions) -> f64 {
        self.clipped(options).iter().sum()
    }
}

/// A compiled model together with its data.
#[derive(Debug, Clone)]
pub struct LikelihoodProblem {
    pub model: ProcessedModel,
    pub template: ParamsTemplate,
    pub data: PanelData,
    sigma: SigmaWeights,
}

impl LikelihoodProblem {
    pub fn new(model: ProcessedModel, data: PanelData) -> Result<Self> {
        if data.measurements.len() != model.update_info.len() {
            return Err(SkillModelError::DataError(format!(
                "data has {} measurement rows, model has {} updates",
                data.measurements.len(),
                model.update_info.len()
            )));
        }
        let sigma = SigmaWeights::new(
            model.dimensions.n_latent_factors,
            model.options.sigma_points_scale,
        )?;
        let template = ParamsTemplate::new(&model);
        Ok(Self {
            model,
            template,
            data,
            sigma,
        })
    }

    pub fn n_free_params(&self) -> usize {
        self.template.n_free()
    }

    pub fn n_obs(&self) -> usize {
        self.data.n_obs()
    }

    /// Contributions for a vector of free parameters.
    pub fn log_likelihood_contributions(&self, free: &[f64]) -> Result<LikelihoodContributions> {
        let full = self.template.expand(free)?;
        self.contributions_from_full(&full)
    }

    /// Contributions for a full parameter vector (free and fixed entries).
    pub fn contributions_from_full(&self, full: &[f64]) -> Result<LikelihoodContributions> {
        let parsed = ParsedParams::from_flat(full, &self.model)?;
        let n_obs = self.data.n_obs();
        let n_periods = self.model.dimensions.n_periods;

        let mut values = DMatrix::<f64>::zeros(self.model.update_info.len(), n_obs);
        let mut state = FilterState::new(
            n_obs,
            &parsed.initial_states,
            &parsed.initial_cholcovs,
            &parsed.mixture_weights,
        );

        for period in 0..n_periods {
            state = self.update_period(state, &parsed, period, &mut values);
            if period + 1 < n_periods {
                state = self.predict(state, &parsed, period)?;
            }
        }

        Ok(LikelihoodContributions { values })
    }

    /// Sum of all contributions.
    pub fn log_likelihood(&self, free: &[f64]) -> Result<f64> {
        Ok(self.log_likelihood_contributions(free)?.sum())
    }

    fn update_period(
        &self,
        mut state: FilterState,
        parsed: &ParsedParams,
        period: usize,
        values: &mut DMatrix<f64>,
    ) -> FilterState {
        let rows = self.model.update_info.rows();
        for k in self.model.update_info.period_range(period) {
            let row = &rows[k];
            let loadings: DVector<f64> = parsed.loadings.row(k).transpose();
            let inputs = UpdateInputs {
                measurements: &self.data.measurements[k],
                controls: &self.data.controls[period],
                control_params: &parsed.controls[k],
                loadings: &loadings,
                meas_sd: parsed.meas_sds[k],
            };
            let loglikes = match row.purpose {
                Purpose::Measurement => sqrt_linear_update(&mut state, &inputs),
                Purpose::Anchoring => {
                    let scaling = parsed.anchoring_scaling_factors.row(period).transpose();
                    sqrt_linear_anchoring_update(&mut state, &inputs, &scaling, &row.loads_on)
                }
            };
            values.set_row(k, &loglikes.transpose());
        }
        state
    }

    fn predict(&self, mut state: FilterState, parsed: &ParsedParams, period: usize) -> Result<FilterState> {
        let stage = self.model.stage_index(period);
        let shock_sds = parsed.shock_sds.row(period).transpose();
        let scale_t = parsed.anchoring_scaling_factors.row(period).transpose();
        let scale_next = parsed.anchoring_scaling_factors.row(period + 1).transpose();
        let const_t = parsed.anchoring_constants.row(period).transpose();
        let const_next = parsed.anchoring_constants.row(period + 1).transpose();

        let inputs = PredictInputs {
            transition: &self.model.transition_info.func,
            transition_params: &parsed.transition[stage],
            shock_sds: &shock_sds,
            observed_factors: &self.data.observed_factors[period],
            sigma: &self.sigma,
            anchoring_scaling: (&scale_t, &scale_next),
            anchoring_constants: (&const_t, &const_next),
        };
        sqrt_unscented_predict(&mut state, &inputs)?;
        Ok(state)
    }
}
