use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkillModelError {
    #[error("parameter length mismatch: expected {expected}, got {got}")]
    ParamLengthMismatch { expected: usize, got: usize },

    #[error("invalid model specification: {0}")]
    ModelSpec(String),

    #[error("transition function error: {0}")]
    Transition(String),

    #[error("invalid sigma point configuration: n_states={n_states}, scale={scale} (n_states + scale must be positive)")]
    SigmaPointConfig { n_states: usize, scale: f64 },

    #[error("unknown update purpose '{0}': expected 'measurement' or 'anchoring'")]
    UnknownPurpose(String),

    #[error("fill_list: list of length {len} is longer than target length {target}")]
    FillList { len: usize, target: usize },

    #[error("data error: {0}")]
    DataError(String),

    #[error("optimization failed: {0}")]
    OptimizationFailed(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SkillModelError>;
