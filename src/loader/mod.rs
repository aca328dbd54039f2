//! CSV loaders for market quotes and historical fixings.
//!
//! Both files share one layout: `date,key,value` per line. Quote keys
//! follow the `CATEGORY/SUBCATEGORY/CURVE/CCY/...` convention; the fixing
//! file's keys are index names.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::info;

use crate::lang::FixingStore;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed quote line {line}: {message}")]
    Malformed { line: usize, message: String },
}

/// One market quote.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub date: NaiveDate,
    pub key: String,
    pub value: f64,
}

/// Loaded market snapshot: quotes keyed by quote string, plus historical
/// fixings.
#[derive(Debug, Default)]
pub struct CsvLoader {
    quotes: BTreeMap<String, Quote>,
    fixings: FixingStore,
}

impl CsvLoader {
    /// Reads the quote file and, optionally, the fixing file. With
    /// `imply_todays_fixings`, fixings dated on the as-of date are kept
    /// even though they may be implied rather than observed.
    pub fn from_files(
        market_file: impl AsRef<Path>,
        fixing_file: Option<&Path>,
        asof: NaiveDate,
        imply_todays_fixings: bool,
    ) -> Result<Self, LoaderError> {
        let mut loader = Self::default();
        let market = std::fs::File::open(market_file)?;
        loader.read_quotes(market)?;
        if let Some(path) = fixing_file {
            let fixings = std::fs::File::open(path)?;
            loader.read_fixings(fixings, asof, imply_todays_fixings)?;
        }
        info!(
            quotes = loader.quotes.len(),
            fixings = loader.fixings.len(),
            "market data loaded"
        );
        Ok(loader)
    }

    pub fn read_quotes<R: Read>(&mut self, reader: R) -> Result<(), LoaderError> {
        for (line, record) in parse_lines(reader)?.into_iter().enumerate() {
            let (date, key, value) = record.map_err(|message| LoaderError::Malformed {
                line: line + 1,
                message,
            })?;
            self.quotes.insert(key.clone(), Quote { date, key, value });
        }
        Ok(())
    }

    pub fn read_fixings<R: Read>(
        &mut self,
        reader: R,
        asof: NaiveDate,
        imply_todays_fixings: bool,
    ) -> Result<(), LoaderError> {
        for (line, record) in parse_lines(reader)?.into_iter().enumerate() {
            let (date, key, value) = record.map_err(|message| LoaderError::Malformed {
                line: line + 1,
                message,
            })?;
            if date > asof || (date == asof && !imply_todays_fixings) {
                continue;
            }
            self.fixings.add(key, date, value);
        }
        Ok(())
    }

    pub fn quote(&self, key: &str) -> Option<&Quote> {
        self.quotes.get(key)
    }

    pub fn quotes_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Quote> {
        self.quotes
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(_, q)| q)
    }

    pub fn fixings(&self) -> &FixingStore {
        &self.fixings
    }

    pub fn num_quotes(&self) -> usize {
        self.quotes.len()
    }
}

type ParsedLine = Result<(NaiveDate, String, f64), String>;

fn parse_lines<R: Read>(reader: R) -> Result<Vec<ParsedLine>, LoaderError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut out = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        if record.len() == 0 || record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        out.push(parse_record(&record));
    }
    Ok(out)
}

fn parse_record(record: &csv::StringRecord) -> ParsedLine {
    if record.len() != 3 {
        return Err(format!("expected 3 fields, got {}", record.len()));
    }
    let date = NaiveDate::parse_from_str(record[0].trim(), "%Y-%m-%d")
        .map_err(|e| format!("bad date '{}': {e}", &record[0]))?;
    let key = record[1].trim().to_string();
    if key.is_empty() {
        return Err("empty quote key".to_string());
    }
    let value = record[2]
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad value '{}': {e}", &record[2]))?;
    Ok((date, key, value))
}
