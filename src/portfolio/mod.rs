//! Trade portfolio, netting-set definitions, and CSA terms.
//!
//! Trades carry a priceable instrument (typically a scripted payoff) plus
//! the static data the aggregator needs: netting-set assignment,
//! counterparty, currency, and maturity. Payload types are stable serde
//! structures; `Portfolio::build` turns payloads into priced trades.

mod instrument;

pub use instrument::{Instrument, ScriptedInstrument};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One leg of dated flows; `payer` legs contribute with negative sign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub currency: String,
    pub payer: bool,
    /// Flows as `(payment date, amount)`.
    pub flows: Vec<(NaiveDate, f64)>,
}

/// Serialized trade payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePayload {
    pub trade_id: String,
    pub netting_set_id: String,
    pub counterparty: String,
    pub currency: String,
    pub maturity: NaiveDate,
    /// Payoff script source.
    pub script: String,
    /// Name of the script variable holding the trade value.
    #[serde(default = "default_result_variable")]
    pub result_variable: String,
    /// Scalar bindings injected into the script context as constants.
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub legs: Vec<Leg>,
    #[serde(default)]
    pub option: Option<OptionTerms>,
}

fn default_result_variable() -> String {
    "Value".to_string()
}

/// Externally injected script binding (trade terms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Binding {
    Number { name: String, value: f64 },
    Event { name: String, value: NaiveDate },
    Currency { name: String, value: String },
    Index { name: String, value: String },
    DayCounter { name: String, value: String },
    EventArray { name: String, values: Vec<NaiveDate> },
    NumberArray { name: String, values: Vec<f64> },
}

impl Binding {
    pub fn name(&self) -> &str {
        match self {
            Binding::Number { name, .. }
            | Binding::Event { name, .. }
            | Binding::Currency { name, .. }
            | Binding::Index { name, .. }
            | Binding::DayCounter { name, .. }
            | Binding::EventArray { name, .. }
            | Binding::NumberArray { name, .. } => name,
        }
    }
}

/// Option wrapper terms for physically-settled exercise handling in the
/// cashflow calculator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptionTerms {
    pub long: bool,
    pub physical_delivery: bool,
    pub exercised: bool,
}

/// Priceable trade held by the valuation driver.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: String,
    pub netting_set_id: String,
    pub counterparty: String,
    pub currency: String,
    pub maturity: NaiveDate,
    pub legs: Vec<Leg>,
    pub option: Option<OptionTerms>,
    pub instrument: Arc<dyn Instrument>,
}

/// Serialized portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPayload {
    pub portfolio_id: String,
    pub trades: Vec<TradePayload>,
}

/// Built portfolio: ordered trades with constructed instruments.
#[derive(Debug, Clone, Default)]
pub struct Portfolio {
    trades: Vec<Trade>,
}

impl Portfolio {
    pub fn new(trades: Vec<Trade>) -> Self {
        Self { trades }
    }

    /// Builds trades from a payload, parsing each script once.
    pub fn build(payload: &PortfolioPayload) -> Result<Self, String> {
        let mut trades = Vec::with_capacity(payload.trades.len());
        for t in &payload.trades {
            let instrument = ScriptedInstrument::new(
                &t.script,
                t.result_variable.clone(),
                t.bindings.clone(),
            )
            .map_err(|e| format!("trade {}: {e}", t.trade_id))?;
            trades.push(Trade {
                id: t.trade_id.clone(),
                netting_set_id: t.netting_set_id.clone(),
                counterparty: t.counterparty.clone(),
                currency: t.currency.clone(),
                maturity: t.maturity,
                legs: t.legs.clone(),
                option: t.option,
                instrument: Arc::new(instrument),
            });
        }
        Ok(Self { trades })
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn size(&self) -> usize {
        self.trades.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.trades.iter().map(|t| t.id.clone()).collect()
    }

    /// Trade id -> netting set id.
    pub fn netting_set_map(&self) -> BTreeMap<String, String> {
        self.trades
            .iter()
            .map(|t| (t.id.clone(), t.netting_set_id.clone()))
            .collect()
    }

    pub fn netting_set_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        for t in &self.trades {
            if !out.contains(&t.netting_set_id) {
                out.push(t.netting_set_id.clone());
            }
        }
        out
    }
}

/// Collateral calculation flavour, controlling how the MTM driving a margin
/// call is lagged relative to the exposure observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollateralCalculationType {
    Symmetric,
    AsymmetricCVA,
    AsymmetricDVA,
    NoLag,
}

impl std::str::FromStr for CollateralCalculationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Symmetric" => Ok(Self::Symmetric),
            "AsymmetricCVA" => Ok(Self::AsymmetricCVA),
            "AsymmetricDVA" => Ok(Self::AsymmetricDVA),
            "NoLag" => Ok(Self::NoLag),
            other => Err(format!("unknown collateral calculation type '{other}'")),
        }
    }
}

/// CSA terms of a netting agreement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CsaDetails {
    /// Counterparty posts above this exposure level.
    pub threshold_receive: f64,
    /// We post above this exposure level.
    pub threshold_pay: f64,
    /// Minimum transfer amount for margin calls in either direction.
    pub min_transfer_amount: f64,
    /// Independent amount added to the collateral balance.
    pub independent_amount: f64,
    /// Margining frequency in calendar days.
    pub margin_call_frequency_days: u32,
    /// Margin period of risk in calendar days.
    pub margin_period_of_risk_days: u32,
    /// Spread received on posted collateral vs the risk-free rate.
    pub collateral_spread: f64,
    /// Floor on the collateral rate (0 models an EONIA floor).
    pub collateral_floor: f64,
}

impl Default for CsaDetails {
    fn default() -> Self {
        Self {
            threshold_receive: 0.0,
            threshold_pay: 0.0,
            min_transfer_amount: 0.0,
            independent_amount: 0.0,
            margin_call_frequency_days: 1,
            margin_period_of_risk_days: 14,
            collateral_spread: 0.0,
            collateral_floor: 0.0,
        }
    }
}

/// Netting-set definition: identity plus optional active CSA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NettingSetDefinition {
    pub netting_set_id: String,
    pub counterparty: String,
    #[serde(default)]
    pub csa: Option<CsaDetails>,
}

/// Lookup of netting-set definitions keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NettingSetManager {
    netting_sets: BTreeMap<String, NettingSetDefinition>,
}

impl NettingSetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, definition: NettingSetDefinition) {
        self.netting_sets
            .insert(definition.netting_set_id.clone(), definition);
    }

    pub fn get(&self, netting_set_id: &str) -> Result<&NettingSetDefinition, String> {
        self.netting_sets
            .get(netting_set_id)
            .ok_or_else(|| format!("unknown netting set '{netting_set_id}'"))
    }

    pub fn has(&self, netting_set_id: &str) -> bool {
        self.netting_sets.contains_key(netting_set_id)
    }

    pub fn from_definitions(definitions: Vec<NettingSetDefinition>) -> Self {
        let mut manager = Self::new();
        for d in definitions {
            manager.add(d);
        }
        manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_through_json() {
        let payload = PortfolioPayload {
            portfolio_id: "PF-1".into(),
            trades: vec![TradePayload {
                trade_id: "TRD-1".into(),
                netting_set_id: "NS-1".into(),
                counterparty: "CPTY-A".into(),
                currency: "USD".into(),
                maturity: NaiveDate::from_ymd_opt(2027, 8, 1).unwrap(),
                script: "{ NUMBER Value; Value = pay(1, Today, Maturity, Ccy); }".into(),
                result_variable: "Value".into(),
                bindings: vec![Binding::Currency {
                    name: "Ccy".into(),
                    value: "USD".into(),
                }],
                legs: vec![],
                option: None,
            }],
        };
        let json = serde_json::to_string_pretty(&payload).unwrap();
        let decoded: PortfolioPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn build_rejects_malformed_scripts() {
        let payload = PortfolioPayload {
            portfolio_id: "PF-1".into(),
            trades: vec![TradePayload {
                trade_id: "TRD-BAD".into(),
                netting_set_id: "NS-1".into(),
                counterparty: "CPTY-A".into(),
                currency: "USD".into(),
                maturity: NaiveDate::from_ymd_opt(2027, 8, 1).unwrap(),
                script: "{ NUMBER Value".into(),
                result_variable: "Value".into(),
                bindings: vec![],
                legs: vec![],
                option: None,
            }],
        };
        let err = Portfolio::build(&payload).unwrap_err();
        assert!(err.contains("TRD-BAD"));
    }

    #[test]
    fn netting_set_manager_lookups() {
        let manager = NettingSetManager::from_definitions(vec![NettingSetDefinition {
            netting_set_id: "NS-1".into(),
            counterparty: "CPTY-A".into(),
            csa: Some(CsaDetails::default()),
        }]);
        assert!(manager.get("NS-1").is_ok());
        assert!(manager.get("NS-2").is_err());
    }

    #[test]
    fn calculation_type_parses() {
        assert_eq!(
            "AsymmetricCVA".parse::<CollateralCalculationType>().unwrap(),
            CollateralCalculationType::AsymmetricCVA
        );
        assert!("Sym".parse::<CollateralCalculationType>().is_err());
    }
}
