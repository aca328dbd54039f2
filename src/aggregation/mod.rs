//! Exposure aggregation and XVA: netting, collateral, exposure profiles,
//! valuation adjustments, and allocation back to trade level.

pub mod allocators;
pub mod collateral;
pub mod dim;
pub mod postprocess;

pub use allocators::AllocationMethod;
pub use collateral::{CollateralAccount, CollateralExposureHelper};
pub use dim::DimCalculator;
pub use postprocess::{PostProcess, PostProcessConfig};

use thiserror::Error;

/// Errors raised while aggregating cube data into exposures and XVAs.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("unknown netting set '{0}'")]
    UnknownNettingSet(String),

    #[error("unknown trade '{0}'")]
    UnknownTrade(String),

    #[error("allocation denominator is zero for netting set '{0}'")]
    ZeroAllocationDenominator(String),

    #[error("market data error: {0}")]
    MarketData(String),

    #[error("cube error: {0}")]
    Cube(#[from] crate::cube::CubeError),
}
