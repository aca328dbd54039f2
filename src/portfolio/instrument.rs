//! Priceable instruments. The scripted instrument wraps a parsed payoff
//! script and values it against the current scenario-market state.

use std::fmt;

use crate::lang::ast::Stmt;
use crate::lang::model::FlatForwardModel;
use crate::lang::parser::parse;
use crate::lang::value::{Context, Value};
use crate::lang::{RandomVariable, ScriptEngine};
use crate::portfolio::Binding;
use crate::simulation::ScenarioMarket;

/// Common interface of every priceable instrument: present value in the
/// instrument's own currency under the market's current scenario state.
pub trait Instrument: Send + Sync + fmt::Debug {
    fn npv(&self, market: &dyn ScenarioMarket) -> Result<f64, String>;
}

/// Payoff script plus injected trade terms, parsed once at construction.
///
/// On each valuation the script runs against a fresh context built from the
/// bindings; `Today` is bound to the market's current evaluation date. The
/// trade value is read from the configured result variable.
pub struct ScriptedInstrument {
    source: String,
    ast: Stmt,
    result_variable: String,
    bindings: Vec<Binding>,
}

impl fmt::Debug for ScriptedInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedInstrument")
            .field("result_variable", &self.result_variable)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl ScriptedInstrument {
    pub fn new(
        source: &str,
        result_variable: String,
        bindings: Vec<Binding>,
    ) -> Result<Self, String> {
        let ast = parse(source).map_err(|e| e.to_string())?;
        Ok(Self {
            source: source.to_string(),
            ast,
            result_variable,
            bindings,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn build_context(&self, market: &dyn ScenarioMarket) -> Context {
        let mut context = Context::new();
        context.bind_constant("Today", Value::Event(market.asof()));
        for binding in &self.bindings {
            match binding {
                Binding::Number { name, value } => context
                    .bind_constant(name.clone(), Value::Number(RandomVariable::new(1, *value))),
                Binding::Event { name, value } => {
                    context.bind_constant(name.clone(), Value::Event(*value))
                }
                Binding::Currency { name, value } => {
                    context.bind_constant(name.clone(), Value::Currency(value.clone()))
                }
                Binding::Index { name, value } => {
                    context.bind_constant(name.clone(), Value::Index(value.clone()))
                }
                Binding::DayCounter { name, value } => {
                    context.bind_constant(name.clone(), Value::DayCounter(value.clone()))
                }
                Binding::EventArray { name, values } => context.bind_constant_array(
                    name.clone(),
                    values.iter().map(|d| Value::Event(*d)).collect(),
                ),
                Binding::NumberArray { name, values } => context.bind_constant_array(
                    name.clone(),
                    values
                        .iter()
                        .map(|v| Value::Number(RandomVariable::new(1, *v)))
                        .collect(),
                ),
            }
        }
        context
    }

    fn build_model(&self, market: &dyn ScenarioMarket) -> Result<FlatForwardModel, String> {
        let base_rate = market.discount_rate(market.base_currency())?;
        let mut model = FlatForwardModel::new(1, market.asof(), base_rate);
        for binding in &self.bindings {
            match binding {
                Binding::Currency { value, .. } => {
                    model = model.with_rate(value.clone(), market.discount_rate(value)?);
                }
                Binding::Index { value, .. } => {
                    model = model.with_index_spot(value.clone(), market.index_value(value)?);
                }
                _ => {}
            }
        }
        Ok(model)
    }
}

impl Instrument for ScriptedInstrument {
    fn npv(&self, market: &dyn ScenarioMarket) -> Result<f64, String> {
        let model = self.build_model(market)?;
        let mut context = self.build_context(market);
        ScriptEngine::new(&model, &mut context)
            .run_ast(&self.source, &self.ast)
            .map_err(|e| e.to_string())?;
        match context.scalars.get(&self.result_variable) {
            Some(Value::Number(rv)) => Ok(rv.expectation()),
            Some(other) => Err(format!(
                "result variable '{}' is {} rather than NUMBER",
                self.result_variable,
                other.kind()
            )),
            None => Err(format!(
                "result variable '{}' not set by script",
                self.result_variable
            )),
        }
    }
}
