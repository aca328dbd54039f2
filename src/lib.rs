//! FerroXVA is a derivative-pricing and counterparty-risk analytics library
//! built around two subsystems:
//!
//! - a **scripted payoff engine** ([`lang`]): a typed expression-tree
//!   interpreter evaluating trade payoff scripts over an entire Monte-Carlo
//!   simulation in a vectorized, path-wise manner, driving a pricing model
//!   through a small primitive set (`pay`, `npv`, `discount`, `fwdComp`,
//!   barrier probabilities, index evaluation);
//! - an **aggregation and XVA post-processor** ([`aggregation`]): given a
//!   filled NPV cube and collateral rules it produces netted exposures,
//!   expected-exposure profiles, regulatory measures, and the valuation
//!   adjustments (CVA, DVA, FVA, MVA, COLVA, KVA), with optional allocation
//!   of netting-set figures back to trades.
//!
//! Around the core sit the [`simulation`] driver filling the
//! [`cube::NpvCube`], CSV [`loader`]s and [`report`] writers, the grouped
//! [`config`] parameters, and a pipeline binary.
//!
//! # Quick start
//!
//! Value a discount bond through the payoff engine:
//!
//! ```rust
//! use chrono::NaiveDate;
//! use ferroxva::lang::model::FlatForwardModel;
//! use ferroxva::lang::value::{Context, Value};
//! use ferroxva::lang::ScriptEngine;
//!
//! let asof = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
//! let model = FlatForwardModel::new(1, asof, 0.05).with_rate("USD", 0.05);
//! let mut context = Context::new();
//! context.bind_constant("Today", Value::Event(asof));
//! context.bind_constant(
//!     "Maturity",
//!     Value::Event(NaiveDate::from_ymd_opt(2027, 8, 1).unwrap()),
//! );
//! context.bind_constant("Ccy", Value::Currency("USD".into()));
//! ScriptEngine::new(&model, &mut context)
//!     .run("{ NUMBER Value; Value = pay(1.0, Today, Maturity, Ccy); }")
//!     .unwrap();
//! ```

pub mod aggregation;
pub mod config;
pub mod cube;
pub mod lang;
pub mod loader;
pub mod market;
pub mod math;
pub mod portfolio;
pub mod report;
pub mod simulation;

/// Common imports for ergonomic usage.
pub mod prelude {
    pub use crate::aggregation::{AllocationMethod, DimCalculator, PostProcess, PostProcessConfig};
    pub use crate::cube::{AggregationScenarioData, NpvCube, ScenarioKey};
    pub use crate::lang::{
        Context, Filter, FixingStore, Model, PayLog, RandomVariable, ScriptEngine, Value,
    };
    pub use crate::market::{Market, SurvivalCurve, YieldCurve};
    pub use crate::portfolio::{NettingSetManager, Portfolio, Trade};
    pub use crate::simulation::{
        CashflowCalculator, DeterministicSimMarket, NpvCalculator, ValuationEngine,
    };
}
