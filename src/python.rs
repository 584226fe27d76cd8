//! Python extension module. Models and data are passed as JSON strings.

use numpy::ndarray::Array2;
use numpy::{IntoPyArray, PyArray1, PyArray2, PyReadonlyArray1};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::data::PanelData;
use crate::error::SkillModelError;
use crate::likelihood::LikelihoodProblem;
use crate::optimizer;
use crate::params::ParamsTemplate;
use crate::process_model::ProcessedModel;
use crate::types::ModelSpec;

fn to_py_err(e: SkillModelError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn build_problem(model_json: &str, data_json: &str) -> PyResult<LikelihoodProblem> {
    let spec = ModelSpec::from_json(model_json).map_err(to_py_err)?;
    let model = ProcessedModel::from_spec(&spec).map_err(to_py_err)?;
    let data = PanelData::from_json(data_json, &model).map_err(to_py_err)?;
    LikelihoodProblem::new(model, data).map_err(to_py_err)
}

/// Smoke-test function: returns the version string.
#[pyfunction]
fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Log-likelihood contributions, one row per update and one column per individual.
#[pyfunction]
fn loglike_contributions<'py>(
    py: Python<'py>,
    model_json: &str,
    data_json: &str,
    params: PyReadonlyArray1<'py, f64>,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let problem = build_problem(model_json, data_json)?;
    let contribs = problem
        .log_likelihood_contributions(params.as_slice()?)
        .map_err(to_py_err)?;
    let shape = (contribs.values.nrows(), contribs.values.ncols());
    let array = Array2::from_shape_vec(shape, contribs.to_flat())
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(array.into_pyarray(py))
}

/// Total log-likelihood.
#[pyfunction]
fn loglike<'py>(model_json: &str, data_json: &str, params: PyReadonlyArray1<'py, f64>) -> PyResult<f64> {
    let problem = build_problem(model_json, data_json)?;
    problem.log_likelihood(params.as_slice()?).map_err(to_py_err)
}

/// Labels `category/period/name1/name2` of the free parameters.
#[pyfunction]
fn free_param_labels(model_json: &str) -> PyResult<Vec<String>> {
    let spec = ModelSpec::from_json(model_json).map_err(to_py_err)?;
    let model = ProcessedModel::from_spec(&spec).map_err(to_py_err)?;
    let template = ParamsTemplate::new(&model);
    Ok(template.free_labels().iter().map(|l| l.to_string()).collect())
}

/// Naive start values of the free parameters.
#[pyfunction]
fn start_params<'py>(py: Python<'py>, model_json: &str) -> PyResult<Bound<'py, PyArray1<f64>>> {
    let spec = ModelSpec::from_json(model_json).map_err(to_py_err)?;
    let model = ProcessedModel::from_spec(&spec).map_err(to_py_err)?;
    Ok(ParamsTemplate::new(&model).start_values().into_pyarray(py))
}

/// Fit the model by maximum likelihood.
///
/// Returns a dict with: params, loglike, n_obs, n_params, n_iter, converged, method.
#[pyfunction]
#[pyo3(signature = (model_json, data_json, start_params=None, method=None, maxiter=None))]
fn fit<'py>(
    py: Python<'py>,
    model_json: &str,
    data_json: &str,
    start_params: Option<PyReadonlyArray1<'py, f64>>,
    method: Option<&str>,
    maxiter: Option<u64>,
) -> PyResult<PyObject> {
    let problem = build_problem(model_json, data_json)?;
    let sp = start_params
        .as_ref()
        .map(|a| a.as_slice())
        .transpose()?;

    let result = optimizer::fit(&problem, sp, method, maxiter).map_err(to_py_err)?;

    let dict = PyDict::new(py);
    dict.set_item("params", result.params)?;
    dict.set_item("loglike", result.loglike)?;
    dict.set_item("n_obs", result.n_obs)?;
    dict.set_item("n_params", result.n_params)?;
    dict.set_item("n_iter", result.n_iter)?;
    dict.set_item("converged", result.converged)?;
    dict.set_item("method", result.method)?;

    Ok(dict.into())
}

#[pymodule]
fn skillmodels_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(version, m)?)?;
    m.add_function(wrap_pyfunction!(loglike_contributions, m)?)?;
    m.add_function(wrap_pyfunction!(loglike, m)?)?;
    m.add_function(wrap_pyfunction!(free_param_labels, m)?)?;
    m.add_function(wrap_pyfunction!(start_params, m)?)?;
    m.add_function(wrap_pyfunction!(fit, m)?)?;
    Ok(())
}
