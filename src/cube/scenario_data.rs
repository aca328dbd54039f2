//! Simulated market data recorded alongside the NPV cube: FX spots,
//! numeraire values, and named index fixings per (date, sample).

use std::collections::BTreeMap;

use crate::cube::CubeError;

/// Key into the scenario data store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScenarioKey {
    /// FX spot of a currency against the base currency.
    FxSpot(String),
    /// Numeraire value of the simulation measure.
    Numeraire,
    /// Fixing of a named index.
    IndexFixing(String),
}

/// Dense per-key (date, sample) matrices. Dimensions are fixed at
/// construction and must match the cube the data accompanies.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationScenarioData {
    dim_dates: usize,
    dim_samples: usize,
    series: BTreeMap<ScenarioKey, Vec<f64>>,
}

impl AggregationScenarioData {
    pub fn new(dim_dates: usize, dim_samples: usize) -> Self {
        Self {
            dim_dates,
            dim_samples,
            series: BTreeMap::new(),
        }
    }

    pub fn dim_dates(&self) -> usize {
        self.dim_dates
    }

    pub fn dim_samples(&self) -> usize {
        self.dim_samples
    }

    fn offset(&self, date: usize, sample: usize) -> Result<usize, CubeError> {
        if date >= self.dim_dates || sample >= self.dim_samples {
            return Err(CubeError::IndexOutOfRange(format!(
                "(date {date}, sample {sample}) vs dims ({}, {})",
                self.dim_dates, self.dim_samples
            )));
        }
        Ok(date * self.dim_samples + sample)
    }

    pub fn set(
        &mut self,
        value: f64,
        date: usize,
        sample: usize,
        key: ScenarioKey,
    ) -> Result<(), CubeError> {
        let offset = self.offset(date, sample)?;
        let len = self.dim_dates * self.dim_samples;
        self.series.entry(key).or_insert_with(|| vec![0.0; len])[offset] = value;
        Ok(())
    }

    pub fn get(&self, date: usize, sample: usize, key: &ScenarioKey) -> Result<f64, CubeError> {
        let offset = self.offset(date, sample)?;
        let series = self
            .series
            .get(key)
            .ok_or_else(|| CubeError::UnknownId(format!("{key:?}")))?;
        Ok(series[offset])
    }

    pub fn has(&self, key: &ScenarioKey) -> bool {
        self.series.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ScenarioKey> {
        self.series.keys()
    }
}
