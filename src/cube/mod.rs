//! Dense simulation output stores: the NPV cube and the aggregation
//! scenario data that accompanies it.

mod npv_cube;
mod scenario_data;

pub use npv_cube::{NpvCube, CUBE_MAGIC};
pub use scenario_data::{AggregationScenarioData, ScenarioKey};

use thiserror::Error;

/// Errors raised by cube construction, access, and (de)serialization.
#[derive(Debug, Error)]
pub enum CubeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("unknown id '{0}'")]
    UnknownId(String),

    #[error("corrupt cube payload: {0}")]
    Corrupt(String),
}
