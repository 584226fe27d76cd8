pub mod error;
pub mod types;
pub mod sigma_points;
pub mod transition;
pub mod process_model;
pub mod params;
pub mod data;
pub mod kalman;
pub mod clipping;
pub mod likelihood;
pub mod batch;
pub mod optimizer;

#[cfg(feature = "python")]
mod python;

pub use error::{Result, SkillModelError};
pub use likelihood::{LikelihoodContributions, LikelihoodProblem};
pub use process_model::ProcessedModel;
pub use transition::{CustomTransition, TransitionRegistry};
pub use types::{EstimationOptions, ModelSpec};
