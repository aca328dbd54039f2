//! Scenario simulation and cube generation: the simulation market, the
//! per-trade calculators, and the valuation driver that fills the NPV cube.

pub mod calculators;
pub mod market;
pub mod valuation;

pub use calculators::{CashflowCalculator, NpvCalculator, SampleBuffer, ValuationCalculator};
pub use market::{DeterministicSimMarket, ScenarioMarket, SimMarket};
pub use valuation::{monthly_grid, ValuationEngine};
