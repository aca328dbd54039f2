//! Pipeline driver: load configuration, market data and portfolio, value
//! the portfolio into an NPV cube under simulated scenarios, post-process
//! exposures and XVAs, and write the CSV reports.
//!
//! Invocation: `ferroxva <path/to/config.json>`. Stage markers (`OK` /
//! `SKIP`) are printed as the pipeline progresses so an operator can see
//! how far a run got.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::NaiveDate;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ferroxva::aggregation::{AllocationMethod, DimCalculator, PostProcess, PostProcessConfig};
use ferroxva::config::Parameters;
use ferroxva::cube::{AggregationScenarioData, NpvCube};
use ferroxva::loader::CsvLoader;
use ferroxva::market::{Market, SurvivalCurve, YieldCurve};
use ferroxva::portfolio::{
    CollateralCalculationType, NettingSetDefinition, NettingSetManager, Portfolio,
    PortfolioPayload,
};
use ferroxva::report;
use ferroxva::simulation::{
    monthly_grid, CashflowCalculator, DeterministicSimMarket, NpvCalculator, ValuationCalculator,
    ValuationEngine,
};

#[derive(Parser)]
#[command(name = "ferroxva", disable_version_flag = true)]
struct Cli {
    /// Path to the pipeline configuration file.
    config: Option<PathBuf>,

    /// Print version and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,
}

const TAB: usize = 40;

/// Prints a left-aligned stage marker and flushes so the label shows while
/// the stage runs.
fn stage(label: &str) {
    use std::io::Write as _;
    print!("{label:<TAB$}");
    let _ = std::io::stdout().flush();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(-1);
        }
    };
    if cli.version {
        println!("ferroxva version {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }
    let Some(config_path) = cli.config else {
        println!("\nusage: ferroxva path/to/config.json\n");
        std::process::exit(-1);
    };

    println!("ferroxva starting");
    let timer = Instant::now();
    let exit = match run(&config_path) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    println!("run time: {:.2} sec", timer.elapsed().as_secs_f64());
    println!("ferroxva done.");
    std::process::exit(exit);
}

fn run(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let params = Parameters::from_file(config_path)?;

    let input_path = PathBuf::from(params.get("setup", "inputPath")?);
    let output_path = PathBuf::from(params.get("setup", "outputPath")?);
    std::fs::create_dir_all(&output_path)?;

    let log_mask: i64 = params
        .get_integer("setup", "logMask")
        .unwrap_or(15)
        .clamp(0, 15);
    let level = match log_mask {
        0..=1 => "error",
        2..=3 => "warn",
        4..=7 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ferroxva={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    info!("ferroxva starting");

    let asof: NaiveDate = params.get("setup", "asofDate")?.parse()?;

    // Market and fixing data.
    stage("Market data loader... ");
    let market_file = input_path.join(params.get("setup", "marketDataFile")?);
    let fixing_file = params
        .has("setup", "fixingDataFile")
        .then(|| input_path.join(params.get_or("setup", "fixingDataFile", "")));
    let imply_todays_fixings = params
        .get_bool("setup", "implyTodaysFixings")
        .unwrap_or(false);
    let loader = CsvLoader::from_files(
        &market_file,
        fixing_file.as_deref(),
        asof,
        imply_todays_fixings,
    )?;
    let base_currency = params.get_or("markets", "baseCurrency", "USD").to_string();
    let market = build_market(&loader, &base_currency)?;
    println!("OK");

    // Portfolio.
    stage("Portfolio... ");
    let portfolio_file = input_path.join(params.get("setup", "portfolioFile")?);
    let payload: PortfolioPayload = serde_json::from_reader(File::open(portfolio_file)?)?;
    let portfolio = Portfolio::build(&payload)?;
    println!("OK");

    // Simulation market shared by the valuation stages.
    let sim_market = build_sim_market(&loader, &market, asof, &base_currency, &params)?;

    // Portfolio valuation report.
    stage("NPV Report... ");
    if params.stage_active("npv") {
        let file = output_path.join(params.get_or("npv", "outputFileName", "npv.csv"));
        let mut writer = csv::Writer::from_path(file)?;
        report::write_npv(&portfolio, &sim_market, &mut writer)?;
        println!("OK");
    } else {
        info!("skip portfolio valuation");
        println!("SKIP");
    }

    // Cashflow report.
    stage("Cashflow Report... ");
    if params.stage_active("cashflow") {
        let file = output_path.join(params.get_or("cashflow", "outputFileName", "cashflow.csv"));
        let mut writer = csv::Writer::from_path(file)?;
        report::write_cashflows(&portfolio, &mut writer)?;
        println!("OK");
    } else {
        info!("skip cashflow generation");
        println!("SKIP");
    }

    // Simulation: scenario and cube generation.
    let mut in_memory_cube: Option<NpvCube> = None;
    let mut in_memory_scenario_data: Option<AggregationScenarioData> = None;
    if params.stage_active("simulation") {
        let samples = params.get_integer("simulation", "samples")? as usize;
        let grid_points = params.get_integer("simulation", "gridPoints")? as usize;
        let grid_step_months = params.get_integer("simulation", "gridStepMonths").unwrap_or(1);
        let store_flows = params.get_or("simulation", "storeFlows", "N") == "Y";
        let depth = if store_flows { 2 } else { 1 };
        let grid = monthly_grid(asof, grid_points, grid_step_months as u32);

        stage(&format!(
            "Build Cube {} x {} x {}... ",
            portfolio.size(),
            grid.len(),
            samples
        ));
        let mut cube = NpvCube::new(asof, portfolio.ids(), grid.clone(), samples, depth);
        let mut scenario_data = AggregationScenarioData::new(grid.len(), samples);
        let mut calculators: Vec<Box<dyn ValuationCalculator>> =
            vec![Box::new(NpvCalculator::new(0))];
        if depth > 1 {
            calculators.push(Box::new(CashflowCalculator::new(grid.clone(), 1)));
        }
        let engine = ValuationEngine::new(asof, grid, sim_market.clone());
        engine.build_cube(&portfolio, &mut cube, &calculators, &mut scenario_data)?;
        println!("OK");

        stage("Write Cube... ");
        if params.has("simulation", "cubeFile") {
            let file = output_path.join(params.get("simulation", "cubeFile")?);
            let mut out = File::create(file)?;
            cube.save(&mut out)?;
            println!("OK");
        } else {
            println!("SKIP");
        }

        in_memory_cube = Some(cube);
        in_memory_scenario_data = Some(scenario_data);
    } else {
        info!("skip simulation");
        stage("Simulation... ");
        println!("SKIP");
    }

    // Aggregation and XVA.
    stage("Aggregation and XVA Reports... ");
    if params.stage_active("xva") {
        let csa_file = input_path.join(params.get("xva", "csaFile")?);
        let definitions: Vec<NettingSetDefinition> =
            serde_json::from_reader(File::open(csa_file)?)?;
        let netting_manager = NettingSetManager::from_definitions(definitions);

        let cube = match in_memory_cube {
            Some(cube) => cube,
            None => {
                let file = output_path.join(params.get("xva", "cubeFile")?);
                NpvCube::load(&mut File::open(file)?)?
            }
        };
        // Without an in-memory simulation run the scenario data store is
        // rebuilt empty with the cube's dimensions.
        let scenario_data = match in_memory_scenario_data {
            Some(data) => data,
            None => AggregationScenarioData::new(cube.num_dates(), cube.samples()),
        };

        let mut analytics = BTreeMap::new();
        for key in [
            "exposureProfiles",
            "cva",
            "dva",
            "fva",
            "colva",
            "collateralFloor",
            "mva",
            "dim",
            "kva",
        ] {
            let active = params.has("xva", key) && params.get_bool("xva", key)?;
            analytics.insert(key.to_string(), active);
        }
        let dim_calculator = analytics
            .get("mva")
            .copied()
            .unwrap_or(false)
            .then(|| DimCalculator {
                quantile: params.get_real("xva", "dimQuantile").unwrap_or(0.99),
                horizon_calendar_days: params
                    .get_integer("xva", "dimHorizonCalendarDays")
                    .unwrap_or(14) as u32,
                regression_order: params.get_integer("xva", "dimRegressionOrder").unwrap_or(2)
                    as usize,
                scaling: params.get_real("xva", "dimScaling").unwrap_or(1.0),
            });

        let config = PostProcessConfig {
            analytics,
            base_currency: params.get_or("xva", "baseCurrency", &base_currency).to_string(),
            allocation_method: params
                .get_or("xva", "allocationMethod", "None")
                .parse::<AllocationMethod>()?,
            marginal_allocation_limit: params
                .get_real("xva", "marginalAllocationLimit")
                .unwrap_or(1.0),
            quantile: params.get_real("xva", "quantile").unwrap_or(0.95),
            calculation_type: params
                .get_or("xva", "calculationType", "Symmetric")
                .parse::<CollateralCalculationType>()?,
            dva_name: params.get_or("xva", "dvaName", "").to_string(),
            fva_borrowing_curve: params.get_or("xva", "fvaBorrowingCurve", "").to_string(),
            fva_lending_curve: params.get_or("xva", "fvaLendingCurve", "").to_string(),
            dim_calculator,
            full_initial_collateralisation: params
                .get_bool("xva", "fullInitialCollateralisation")
                .unwrap_or(false),
            ..PostProcessConfig::default()
        };

        let post_process = PostProcess::new(
            &portfolio,
            &netting_manager,
            &market,
            &cube,
            &scenario_data,
            config,
        )?;

        let netting_set_map = portfolio.netting_set_map();
        for trade_id in post_process.trade_ids().to_vec() {
            let file = output_path.join(format!("exposure_trade_{trade_id}.csv"));
            let mut writer = csv::Writer::from_path(file)?;
            report::write_trade_exposures(&post_process, &trade_id, &mut writer)?;
        }
        for ns in post_process.netting_set_ids().to_vec() {
            let mut writer =
                csv::Writer::from_path(output_path.join(format!("exposure_nettingset_{ns}.csv")))?;
            report::write_netting_set_exposures(&post_process, &ns, &mut writer)?;
            let mut writer =
                csv::Writer::from_path(output_path.join(format!("colva_nettingset_{ns}.csv")))?;
            report::write_netting_set_colva(&post_process, &ns, &mut writer)?;
        }
        let mut writer = csv::Writer::from_path(output_path.join("xva.csv"))?;
        report::write_xva(&post_process, &netting_set_map, &mut writer)?;

        if params.has("xva", "rawCubeOutputFile") {
            let file = output_path.join(params.get("xva", "rawCubeOutputFile")?);
            let mut writer = csv::Writer::from_path(file)?;
            report::write_cube(&cube, &netting_set_map, &mut writer)?;
        }
        if params.has("xva", "netCubeOutputFile") {
            let file = output_path.join(params.get("xva", "netCubeOutputFile")?);
            let mut writer = csv::Writer::from_path(file)?;
            report::write_cube(post_process.net_cube(), &netting_set_map, &mut writer)?;
        }
        if params.has("xva", "dimEvolutionFile") {
            let file = output_path.join(params.get("xva", "dimEvolutionFile")?);
            let mut writer = csv::Writer::from_path(file)?;
            report::write_dim_evolution(&post_process, &mut writer)?;
        }
        println!("OK");
    } else {
        info!("skip XVA reports");
        println!("SKIP");
    }

    info!("ferroxva done");
    Ok(())
}

/// Tenor suffix like `6M` or `10Y` to a year fraction.
fn parse_tenor(tenor: &str) -> Option<f64> {
    let (digits, unit) = tenor.split_at(tenor.len().checked_sub(1)?);
    let n: f64 = digits.parse().ok()?;
    match unit {
        "Y" => Some(n),
        "M" => Some(n / 12.0),
        "W" => Some(n * 7.0 / 365.0),
        "D" => Some(n / 365.0),
        _ => None,
    }
}

/// Builds deterministic market curves from the loaded quotes.
///
/// Quote conventions: `DISCOUNT/RATE/<CCY>/<TENOR>` zero rates,
/// `CREDIT/DEFAULT_PROB/<NAME>/<TENOR>` survival probabilities,
/// `RECOVERY_RATE/<NAME>` recoveries, `FX/RATE/<CCY><BASE>` spots, and
/// `SPREAD/RATE/<NAME>/<TENOR>` funding or collateral spreads.
fn build_market(loader: &CsvLoader, base_currency: &str) -> Result<Market, String> {
    let mut market = Market::new(base_currency.to_string());

    let mut discount: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    let mut survival: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    let mut spreads: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();

    for quote in loader.quotes_with_prefix("DISCOUNT/RATE/") {
        let mut parts = quote.key.split('/').skip(2);
        if let (Some(ccy), Some(tenor)) = (parts.next(), parts.next()) {
            if let Some(t) = parse_tenor(tenor) {
                discount
                    .entry(ccy.to_string())
                    .or_default()
                    .push((t, (-quote.value * t).exp()));
            }
        }
    }
    for (ccy, nodes) in discount {
        market.add_discount_curve(ccy, YieldCurve::new(nodes));
    }

    for quote in loader.quotes_with_prefix("CREDIT/DEFAULT_PROB/") {
        let mut parts = quote.key.split('/').skip(2);
        if let (Some(name), Some(tenor)) = (parts.next(), parts.next()) {
            if let Some(t) = parse_tenor(tenor) {
                survival
                    .entry(name.to_string())
                    .or_default()
                    .push((t, quote.value));
            }
        }
    }
    for (name, nodes) in survival {
        let recovery = loader
            .quote(&format!("RECOVERY_RATE/{name}"))
            .map_or(0.4, |q| q.value);
        market.add_survival_curve(name, SurvivalCurve::new(nodes), recovery);
    }

    for quote in loader.quotes_with_prefix("FX/RATE/") {
        if let Some(pair) = quote.key.split('/').nth(2) {
            if let Some(foreign) = pair.strip_suffix(base_currency) {
                market.add_fx_spot(foreign.to_string(), quote.value);
            }
        }
    }

    for quote in loader.quotes_with_prefix("SPREAD/RATE/") {
        let mut parts = quote.key.split('/').skip(2);
        if let (Some(name), Some(tenor)) = (parts.next(), parts.next()) {
            if let Some(t) = parse_tenor(tenor) {
                spreads
                    .entry(name.to_string())
                    .or_default()
                    .push((t, (-quote.value * t).exp()));
            }
        }
    }
    for (name, nodes) in spreads {
        market.add_spread_curve(name, YieldCurve::new(nodes));
    }

    Ok(market)
}

/// Builds the scenario simulation market from the same quote set.
fn build_sim_market(
    loader: &CsvLoader,
    market: &Market,
    asof: NaiveDate,
    base_currency: &str,
    params: &Parameters,
) -> Result<DeterministicSimMarket, String> {
    let base_rate = market
        .discount_curve(base_currency)
        .map(|c| c.zero_rate(1.0))
        .unwrap_or(0.0);
    let seed = params
        .get_integer("simulation", "seed")
        .unwrap_or(42)
        .unsigned_abs();
    let mut sim = DeterministicSimMarket::new(asof, base_currency.to_string(), base_rate)
        .with_seed(seed);

    for quote in loader.quotes_with_prefix("DISCOUNT/RATE/") {
        if let Some(ccy) = quote.key.split('/').nth(2) {
            if let Ok(curve) = market.discount_curve(ccy) {
                sim.add_currency(ccy.to_string(), curve.zero_rate(1.0));
            }
        }
    }
    for quote in loader.quotes_with_prefix("FX/RATE/") {
        if let Some(pair) = quote.key.split('/').nth(2) {
            if let Some(foreign) = pair.strip_suffix(base_currency) {
                let vol = loader
                    .quote(&format!("FX_VOL/RATE_LNVOL/{pair}"))
                    .map_or(0.10, |q| q.value);
                sim.add_fx(foreign.to_string(), quote.value, vol);
            }
        }
    }
    for quote in loader.quotes_with_prefix("EQUITY/PRICE/") {
        if let Some(name) = quote.key.split('/').nth(2) {
            let vol = loader
                .quote(&format!("EQUITY_VOL/RATE_LNVOL/{name}"))
                .map_or(0.20, |q| q.value);
            sim.add_index(name.to_string(), quote.value, vol);
        }
    }
    Ok(sim)
}
