use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SkillModelError};

/// Julier sigma point weights and the scaling factor `sqrt(k + kappa)`.
///
/// - w_0 = kappa / (k + kappa)
/// - w_i = 1 / (2 (k + kappa)) for i = 1..2k
#[derive(Debug, Clone)]
pub struct SigmaWeights {
    pub weights: DVector<f64>,
    pub scaling_factor: f64,
}

impl SigmaWeights {
    pub fn new(n_states: usize, kappa: f64) -> Result<Self> {
        let total = n_states as f64 + kappa;
        if n_states == 0 || !(total > 0.0) {
            return Err(SkillModelError::SigmaPointConfig {
                n_states,
                scale: kappa,
            });
        }

        let n_sigma = 2 * n_states + 1;
        let mut weights = DVector::from_element(n_sigma, 1.0 / (2.0 * total));
        weights[0] = kappa / total;

        Ok(Self {
            weights,
            scaling_factor: total.sqrt(),
        })
    }

    pub fn n_sigma_points(&self) -> usize {
        self.weights.len()
    }
}

/// Sigma points of one mixture component, one point per row.
///
/// Row 0 is the mean, rows `1..=k` add `scaling_factor * L[:, i]`, rows
/// `k+1..=2k` subtract it. `chol` is the lower Cholesky factor (`P = L Lᵀ`).
pub fn calculate_sigma_points(
    mean: &DVector<f64>,
    chol: &DMatrix<f64>,
    scaling_factor: f64,
) -> DMatrix<f64> {
    let k = mean.len();
    let mut points = DMatrix::<f64>::zeros(2 * k + 1, k);

    points.row_mut(0).copy_from(&mean.transpose());
    for i in 0..k {
        let offset = chol.column(i) * scaling_factor;
        let plus = mean + &offset;
        let minus = mean - &offset;
        points.row_mut(i + 1).copy_from(&plus.transpose());
        points.row_mut(k + i + 1).copy_from(&minus.transpose());
    }
    points
}
