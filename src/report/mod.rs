//! CSV report writers: exposure evolutions, XVA summary, COLVA increments,
//! NPV/cashflow listings, and raw cube dumps.

use std::collections::BTreeMap;
use std::io::Write;

use chrono::NaiveDate;
use thiserror::Error;

use crate::aggregation::{AggregationError, PostProcess};
use crate::cube::{CubeError, NpvCube};
use crate::market::{year_fraction, DayCountConvention};
use crate::portfolio::Portfolio;
use crate::simulation::ScenarioMarket;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("cube error: {0}")]
    Cube(#[from] CubeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

fn time_of(asof: NaiveDate, date: NaiveDate) -> f64 {
    year_fraction(asof, date, DayCountConvention::Act365Fixed)
}

/// One row per time grid point (t=0 included) with the exposure evolution
/// of a single trade.
pub fn write_trade_exposures<W: Write>(
    post_process: &PostProcess,
    trade_id: &str,
    writer: &mut csv::Writer<W>,
) -> Result<(), ReportError> {
    writer.write_record([
        "tradeId",
        "time",
        "date",
        "EPE",
        "ENE",
        "EE_B",
        "EEE_B",
        "PFE",
        "allocatedEPE",
        "allocatedENE",
    ])?;
    let asof = post_process.net_cube().asof();
    let dates = post_process.net_cube().dates().to_vec();
    let epe = post_process.trade_epe(trade_id)?;
    let ene = post_process.trade_ene(trade_id)?;
    let ee_b = post_process.trade_ee_b(trade_id)?;
    let eee_b = post_process.trade_eee_b(trade_id)?;
    let pfe = post_process.trade_pfe(trade_id)?;
    let alloc_epe = post_process.allocated_trade_epe(trade_id)?;
    let alloc_ene = post_process.allocated_trade_ene(trade_id)?;
    for k in 0..epe.len() {
        let (time, date) = if k == 0 {
            (0.0, asof)
        } else {
            (time_of(asof, dates[k - 1]), dates[k - 1])
        };
        writer.write_record([
            trade_id.to_string(),
            format!("{time:.6}"),
            date.to_string(),
            format!("{:.6}", epe[k]),
            format!("{:.6}", ene[k]),
            format!("{:.6}", ee_b[k]),
            format!("{:.6}", eee_b[k]),
            format!("{:.6}", pfe[k]),
            format!("{:.6}", alloc_epe[k]),
            format!("{:.6}", alloc_ene[k]),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// One row per time grid point with the netted, collateralised exposure
/// evolution of a netting set.
pub fn write_netting_set_exposures<W: Write>(
    post_process: &PostProcess,
    netting_set_id: &str,
    writer: &mut csv::Writer<W>,
) -> Result<(), ReportError> {
    writer.write_record([
        "nettingSetId",
        "time",
        "date",
        "EPE",
        "ENE",
        "EE_B",
        "EEE_B",
        "PFE",
        "expectedCollateral",
    ])?;
    let asof = post_process.net_cube().asof();
    let dates = post_process.net_cube().dates().to_vec();
    let epe = post_process.net_epe(netting_set_id)?;
    let ene = post_process.net_ene(netting_set_id)?;
    let ee_b = post_process.net_ee_b(netting_set_id)?;
    let eee_b = post_process.net_eee_b(netting_set_id)?;
    let pfe = post_process.net_pfe(netting_set_id)?;
    let collateral = post_process.expected_collateral(netting_set_id)?;
    for k in 0..epe.len() {
        let (time, date) = if k == 0 {
            (0.0, asof)
        } else {
            (time_of(asof, dates[k - 1]), dates[k - 1])
        };
        let expected_collateral = if k == 0 { 0.0 } else { collateral[k - 1] };
        writer.write_record([
            netting_set_id.to_string(),
            format!("{time:.6}"),
            date.to_string(),
            format!("{:.6}", epe[k]),
            format!("{:.6}", ene[k]),
            format!("{:.6}", ee_b[k]),
            format!("{:.6}", eee_b[k]),
            format!("{:.6}", pfe[k]),
            format!("{expected_collateral:.6}"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// COLVA and collateral-floor increments through time for a netting set.
pub fn write_netting_set_colva<W: Write>(
    post_process: &PostProcess,
    netting_set_id: &str,
    writer: &mut csv::Writer<W>,
) -> Result<(), ReportError> {
    writer.write_record([
        "nettingSetId",
        "time",
        "date",
        "colvaIncrement",
        "collateralFloorIncrement",
    ])?;
    let asof = post_process.net_cube().asof();
    let dates = post_process.net_cube().dates().to_vec();
    let colva = post_process.colva_increments(netting_set_id)?;
    let floor = post_process.collateral_floor_increments(netting_set_id)?;
    for k in 0..colva.len() {
        let (time, date) = if k == 0 {
            (0.0, asof)
        } else {
            (time_of(asof, dates[k - 1]), dates[k - 1])
        };
        writer.write_record([
            netting_set_id.to_string(),
            format!("{time:.6}"),
            date.to_string(),
            format!("{:.6}", colva[k]),
            format!("{:.6}", floor[k]),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// XVA summary: one row per trade and one per netting set.
pub fn write_xva<W: Write>(
    post_process: &PostProcess,
    netting_set_map: &BTreeMap<String, String>,
    writer: &mut csv::Writer<W>,
) -> Result<(), ReportError> {
    writer.write_record([
        "tradeId",
        "nettingSetId",
        "CVA",
        "DVA",
        "FBA",
        "FCA",
        "MVA",
        "COLVA",
        "collateralFloor",
        "allocatedCVA",
        "allocatedDVA",
        "KVACCR",
        "KVACVA",
    ])?;
    for ns in post_process.netting_set_ids() {
        writer.write_record([
            String::new(),
            ns.clone(),
            format!("{:.6}", post_process.netting_set_cva(ns)?),
            format!("{:.6}", post_process.netting_set_dva(ns)?),
            format!("{:.6}", post_process.netting_set_fba(ns)?),
            format!("{:.6}", post_process.netting_set_fca(ns)?),
            format!("{:.6}", post_process.netting_set_mva(ns)?),
            format!("{:.6}", post_process.netting_set_colva(ns)?),
            format!("{:.6}", post_process.netting_set_collateral_floor(ns)?),
            format!("{:.6}", post_process.netting_set_cva(ns)?),
            format!("{:.6}", post_process.netting_set_dva(ns)?),
            format!("{:.6}", post_process.netting_set_our_kva_ccr(ns)?),
            format!("{:.6}", post_process.netting_set_our_kva_cva(ns)?),
        ])?;
        for trade_id in post_process.trade_ids() {
            if netting_set_map.get(trade_id) != Some(ns) {
                continue;
            }
            writer.write_record([
                trade_id.clone(),
                ns.clone(),
                format!("{:.6}", post_process.trade_cva(trade_id)?),
                format!("{:.6}", post_process.trade_dva(trade_id)?),
                format!("{:.6}", post_process.trade_fba(trade_id)?),
                format!("{:.6}", post_process.trade_fca(trade_id)?),
                "0.000000".to_string(),
                "0.000000".to_string(),
                "0.000000".to_string(),
                format!("{:.6}", post_process.allocated_trade_cva(trade_id)?),
                format!("{:.6}", post_process.allocated_trade_dva(trade_id)?),
                "0.000000".to_string(),
                "0.000000".to_string(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// T0 valuation listing: one row per trade.
pub fn write_npv<W: Write>(
    portfolio: &Portfolio,
    market: &dyn ScenarioMarket,
    writer: &mut csv::Writer<W>,
) -> Result<(), ReportError> {
    writer.write_record(["tradeId", "nettingSetId", "counterparty", "currency", "npv"])?;
    for trade in portfolio.trades() {
        let npv = trade
            .instrument
            .npv(market)
            .map_err(ReportError::Other)?;
        writer.write_record([
            trade.id.clone(),
            trade.netting_set_id.clone(),
            trade.counterparty.clone(),
            trade.currency.clone(),
            format!("{npv:.6}"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Contractual cashflow listing from the trades' legs.
pub fn write_cashflows<W: Write>(
    portfolio: &Portfolio,
    writer: &mut csv::Writer<W>,
) -> Result<(), ReportError> {
    writer.write_record(["tradeId", "legNo", "payDate", "currency", "amount"])?;
    for trade in portfolio.trades() {
        for (leg_no, leg) in trade.legs.iter().enumerate() {
            let sign = if leg.payer { -1.0 } else { 1.0 };
            for &(pay_date, amount) in &leg.flows {
                writer.write_record([
                    trade.id.clone(),
                    leg_no.to_string(),
                    pay_date.to_string(),
                    leg.currency.clone(),
                    format!("{:.6}", amount * sign),
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Raw cube dump: one row per (id, date, sample, depth) cell.
pub fn write_cube<W: Write>(
    cube: &NpvCube,
    netting_set_map: &BTreeMap<String, String>,
    writer: &mut csv::Writer<W>,
) -> Result<(), ReportError> {
    writer.write_record(["id", "nettingSetId", "date", "sample", "depth", "value"])?;
    for (i, id) in cube.ids().iter().enumerate() {
        let ns = netting_set_map.get(id).cloned().unwrap_or_else(|| id.clone());
        for (d, date) in cube.dates().iter().enumerate() {
            for s in 0..cube.samples() {
                for k in 0..cube.depth() {
                    writer.write_record([
                        id.clone(),
                        ns.clone(),
                        date.to_string(),
                        s.to_string(),
                        k.to_string(),
                        format!("{:.6}", cube.get(i, d, s, k)?),
                    ])?;
                }
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Average DIM evolution per netting set.
pub fn write_dim_evolution<W: Write>(
    post_process: &PostProcess,
    writer: &mut csv::Writer<W>,
) -> Result<(), ReportError> {
    writer.write_record(["nettingSetId", "time", "date", "expectedDIM"])?;
    let asof = post_process.net_cube().asof();
    let dates = post_process.net_cube().dates().to_vec();
    for ns in post_process.netting_set_ids() {
        let Some(evolution) = post_process.dim_evolution(ns) else {
            continue;
        };
        for (d, &dim) in evolution.iter().enumerate() {
            writer.write_record([
                ns.clone(),
                format!("{:.6}", time_of(asof, dates[d])),
                dates[d].to_string(),
                format!("{dim:.6}"),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cashflow_report_lists_signed_flows() {
        use std::sync::Arc;

        use crate::portfolio::{Instrument, Leg, Trade};

        #[derive(Debug)]
        struct Zero;
        impl Instrument for Zero {
            fn npv(&self, _m: &dyn ScenarioMarket) -> Result<f64, String> {
                Ok(0.0)
            }
        }

        let portfolio = Portfolio::new(vec![Trade {
            id: "TRD-1".into(),
            netting_set_id: "NS-1".into(),
            counterparty: "CPTY".into(),
            currency: "USD".into(),
            maturity: NaiveDate::from_ymd_opt(2027, 8, 1).unwrap(),
            legs: vec![Leg {
                currency: "USD".into(),
                payer: true,
                flows: vec![(NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(), 100.0)],
            }],
            option: None,
            instrument: Arc::new(Zero),
        }]);

        let mut writer = csv::Writer::from_writer(Vec::new());
        write_cashflows(&portfolio, &mut writer).unwrap();
        let payload = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert!(payload.contains("TRD-1,0,2026-09-01,USD,-100.000000"));
    }
}
