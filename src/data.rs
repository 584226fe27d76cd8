use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Deserializer};

use crate::error::{Result, SkillModelError};
use crate::process_model::{ProcessedModel, Purpose};

/// One row of a long-format panel: an individual in a period.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PanelRecord {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub period: usize,
    /// Measurements, controls and observed factors; `null` is missing.
    #[serde(flatten)]
    pub values: BTreeMap<String, Option<f64>>,
}

fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Int(i64),
        Str(String),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Int(i) => i.to_string(),
        Id::Str(s) => s,
    })
}

/// Panel data arranged for the filter.
#[derive(Debug, Clone)]
pub struct PanelData {
    /// Sorted individual ids; column order of every array below.
    pub ids: Vec<String>,
    /// One vector per update row, NaN where missing.
    pub measurements: Vec<DVector<f64>>,
    /// Per period: n_obs × n_controls, constant column first.
    pub controls: Vec<DMatrix<f64>>,
    /// Per period: n_obs × n_observed_factors.
    pub observed_factors: Vec<DMatrix<f64>>,
}

impl PanelData {
    pub fn from_records(records: &[PanelRecord], model: &ProcessedModel) -> Result<Self> {
        let n_periods = model.dimensions.n_periods;
        let ids: Vec<String> = records
            .iter()
            .map(|r| r.id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Err(SkillModelError::DataError("the dataset has no records".into()));
        }
        let n_obs = ids.len();
        let id_pos: BTreeMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

        // (period, individual) -> record
        let mut grid: Vec<Vec<Option<&PanelRecord>>> = vec![vec![None; n_obs]; n_periods];
        let mut skipped = 0usize;
        for record in records {
            if record.period >= n_periods {
                skipped += 1;
                continue;
            }
            let i = id_pos[record.id.as_str()];
            if grid[record.period][i].is_some() {
                return Err(SkillModelError::DataError(format!(
                    "duplicate record for id '{}' in period {}",
                    record.id, record.period
                )));
            }
            grid[record.period][i] = Some(record);
        }
        if skipped > 0 {
            debug!("skipped {} records of periods beyond the model", skipped);
        }

        let value = |period: usize, i: usize, column: &str| -> Option<f64> {
            grid[period][i].and_then(|r| r.values.get(column).copied().flatten())
        };

        let mut measurements = Vec::with_capacity(model.update_info.len());
        for row in model.update_info.rows() {
            let column = match row.purpose {
                Purpose::Measurement => row.variable.clone(),
                Purpose::Anchoring => anchoring_outcome(model, &row.loads_on)?,
            };
            let values = DVector::from_fn(n_obs, |i, _| value(row.period, i, &column).unwrap_or(f64::NAN));
            if values.iter().all(|v| v.is_nan()) {
                warn!(
                    "measurement '{}' is missing for every individual in period {}",
                    column, row.period
                );
            }
            measurements.push(values);
        }

        let labels = &model.labels;
        let controls = (0..n_periods)
            .map(|t| {
                DMatrix::from_fn(n_obs, labels.controls.len(), |i, c| {
                    if c == 0 {
                        1.0
                    } else {
                        value(t, i, &labels.controls[c]).unwrap_or(f64::NAN)
                    }
                })
            })
            .collect();

        let mut observed_factors = Vec::with_capacity(n_periods);
        for t in 0..n_periods {
            let mut matrix = DMatrix::<f64>::zeros(n_obs, labels.observed_factors.len());
            for (o, name) in labels.observed_factors.iter().enumerate() {
                for i in 0..n_obs {
                    match value(t, i, name) {
                        Some(v) => matrix[(i, o)] = v,
                        // only the transitions use observed factors
                        None if t + 1 == n_periods => matrix[(i, o)] = f64::NAN,
                        None => {
                            return Err(SkillModelError::DataError(format!(
                                "observed factor '{}' is missing for id '{}' in period {}",
                                name, ids[i], t
                            )))
                        }
                    }
                }
            }
            observed_factors.push(matrix);
        }

        debug!("panel data: {} individuals, {} periods", n_obs, n_periods);

        Ok(Self {
            ids,
            measurements,
            controls,
            observed_factors,
        })
    }

    /// Parse a JSON array of records.
    pub fn from_json(json: &str, model: &ProcessedModel) -> Result<Self> {
        let records: Vec<PanelRecord> = serde_json::from_str(json)?;
        Self::from_records(&records, model)
    }

    pub fn n_obs(&self) -> usize {
        self.ids.len()
    }
}

fn anchoring_outcome(model: &ProcessedModel, loads_on: &[bool]) -> Result<String> {
    let factor = loads_on
        .iter()
        .position(|&on| on)
        .map(|f| &model.labels.latent_factors[f])
        .ok_or_else(|| SkillModelError::DataError("anchoring row loads on no factor".into()))?;
    model
        .anchoring
        .outcomes
        .get(factor)
        .cloned()
        .ok_or_else(|| SkillModelError::DataError(format!("no anchoring outcome for factor '{}'", factor)))
}
