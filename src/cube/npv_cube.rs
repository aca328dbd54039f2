//! In-memory NPV cube: a dense single-precision array indexed by
//! (trade, date, sample, depth) plus a T0 row per trade.
//!
//! Depth slot 0 holds NPVs; slot 1 (when present) holds path-wise
//! cashflows; higher slots are reserved. Dimensions are fixed at
//! construction. The binary layout is:
//!
//! ```text
//! magic  u32          "FXVC"
//! header u64 x 4      trade-count, date-count, sample-count, depth
//!        i32          asof date (days from CE)
//! ids    (u32 len + utf-8 bytes) x trade-count
//! dates  i32 x date-count
//! data   f32 x trade-count*date-count*sample-count*depth, C-order
//! t0     f32 x trade-count*depth
//! ```

use std::io::{Read, Write};

use chrono::{Datelike, NaiveDate};

use crate::cube::CubeError;

/// File magic for cube payloads.
pub const CUBE_MAGIC: u32 = 0x4658_5643; // "FXVC"

#[derive(Debug, Clone, PartialEq)]
pub struct NpvCube {
    asof: NaiveDate,
    ids: Vec<String>,
    dates: Vec<NaiveDate>,
    samples: usize,
    depth: usize,
    data: Vec<f32>,
    t0: Vec<f32>,
}

impl NpvCube {
    pub fn new(
        asof: NaiveDate,
        ids: Vec<String>,
        dates: Vec<NaiveDate>,
        samples: usize,
        depth: usize,
    ) -> Self {
        assert!(depth >= 1, "cube depth must be >= 1");
        assert!(samples >= 1, "cube sample count must be >= 1");
        let data = vec![0.0; ids.len() * dates.len() * samples * depth];
        let t0 = vec![0.0; ids.len() * depth];
        Self {
            asof,
            ids,
            dates,
            samples,
            depth,
            data,
            t0,
        }
    }

    pub fn asof(&self) -> NaiveDate {
        self.asof
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn num_ids(&self) -> usize {
        self.ids.len()
    }

    pub fn num_dates(&self) -> usize {
        self.dates.len()
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn index_of_id(&self, id: &str) -> Result<usize, CubeError> {
        self.ids
            .iter()
            .position(|x| x == id)
            .ok_or_else(|| CubeError::UnknownId(id.to_string()))
    }

    #[inline]
    fn offset(
        &self,
        id: usize,
        date: usize,
        sample: usize,
        depth: usize,
    ) -> Result<usize, CubeError> {
        if id >= self.ids.len()
            || date >= self.dates.len()
            || sample >= self.samples
            || depth >= self.depth
        {
            return Err(CubeError::IndexOutOfRange(format!(
                "(id {id}, date {date}, sample {sample}, depth {depth}) vs dims ({}, {}, {}, {})",
                self.ids.len(),
                self.dates.len(),
                self.samples,
                self.depth
            )));
        }
        Ok(((id * self.dates.len() + date) * self.samples + sample) * self.depth + depth)
    }

    pub fn get(
        &self,
        id: usize,
        date: usize,
        sample: usize,
        depth: usize,
    ) -> Result<f64, CubeError> {
        Ok(self.data[self.offset(id, date, sample, depth)?] as f64)
    }

    pub fn set(
        &mut self,
        value: f64,
        id: usize,
        date: usize,
        sample: usize,
        depth: usize,
    ) -> Result<(), CubeError> {
        let offset = self.offset(id, date, sample, depth)?;
        self.data[offset] = value as f32;
        Ok(())
    }

    pub fn get_t0(&self, id: usize, depth: usize) -> Result<f64, CubeError> {
        if id >= self.ids.len() || depth >= self.depth {
            return Err(CubeError::IndexOutOfRange(format!(
                "t0 (id {id}, depth {depth})"
            )));
        }
        Ok(self.t0[id * self.depth + depth] as f64)
    }

    pub fn set_t0(&mut self, value: f64, id: usize, depth: usize) -> Result<(), CubeError> {
        if id >= self.ids.len() || depth >= self.depth {
            return Err(CubeError::IndexOutOfRange(format!(
                "t0 (id {id}, depth {depth})"
            )));
        }
        self.t0[id * self.depth + depth] = value as f32;
        Ok(())
    }

    /// Copies one sample's (date x depth) block for a trade in, used by the
    /// valuation driver to merge per-sample worker buffers.
    pub(crate) fn write_sample_block(
        &mut self,
        id: usize,
        sample: usize,
        block: &[f32],
    ) -> Result<(), CubeError> {
        if block.len() != self.dates.len() * self.depth {
            return Err(CubeError::IndexOutOfRange(
                "sample block size mismatch".to_string(),
            ));
        }
        for date in 0..self.dates.len() {
            for depth in 0..self.depth {
                let offset = self.offset(id, date, sample, depth)?;
                self.data[offset] = block[date * self.depth + depth];
            }
        }
        Ok(())
    }

    // ---- serialization ---------------------------------------------------

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), CubeError> {
        writer.write_all(&CUBE_MAGIC.to_le_bytes())?;
        for dim in [
            self.ids.len() as u64,
            self.dates.len() as u64,
            self.samples as u64,
            self.depth as u64,
        ] {
            writer.write_all(&dim.to_le_bytes())?;
        }
        writer.write_all(&self.asof.num_days_from_ce().to_le_bytes())?;
        for id in &self.ids {
            let bytes = id.as_bytes();
            writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
            writer.write_all(bytes)?;
        }
        for date in &self.dates {
            writer.write_all(&date.num_days_from_ce().to_le_bytes())?;
        }
        for v in &self.data {
            writer.write_all(&v.to_le_bytes())?;
        }
        for v in &self.t0 {
            writer.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self, CubeError> {
        let magic = read_u32(reader)?;
        if magic != CUBE_MAGIC {
            return Err(CubeError::Corrupt(format!(
                "bad magic 0x{magic:08x}, expected 0x{CUBE_MAGIC:08x}"
            )));
        }
        let num_ids = read_u64(reader)? as usize;
        let num_dates = read_u64(reader)? as usize;
        let samples = read_u64(reader)? as usize;
        let depth = read_u64(reader)? as usize;
        if depth == 0 || samples == 0 {
            return Err(CubeError::Corrupt("zero depth or sample count".to_string()));
        }
        let asof = read_date(reader)?;
        let mut ids = Vec::with_capacity(num_ids);
        for _ in 0..num_ids {
            let len = read_u32(reader)? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            let id = String::from_utf8(buf)
                .map_err(|_| CubeError::Corrupt("non-utf8 trade id".to_string()))?;
            ids.push(id);
        }
        let mut dates = Vec::with_capacity(num_dates);
        for _ in 0..num_dates {
            dates.push(read_date(reader)?);
        }
        let total = num_ids * num_dates * samples * depth;
        let mut data = Vec::with_capacity(total);
        for _ in 0..total {
            data.push(read_f32(reader)?);
        }
        let mut t0 = Vec::with_capacity(num_ids * depth);
        for _ in 0..num_ids * depth {
            t0.push(read_f32(reader)?);
        }
        Ok(Self {
            asof,
            ids,
            dates,
            samples,
            depth,
            data,
            t0,
        })
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, CubeError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, CubeError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32, CubeError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_date<R: Read>(reader: &mut R) -> Result<NaiveDate, CubeError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    let days = i32::from_le_bytes(buf);
    NaiveDate::from_num_days_from_ce_opt(days)
        .ok_or_else(|| CubeError::Corrupt(format!("invalid date serial {days}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample_cube() -> NpvCube {
        let ids = (0..10).map(|i| format!("TRD-{i:03}")).collect();
        let dates = (1..=5).map(|m| date(2026, 8, m)).collect();
        let mut cube = NpvCube::new(date(2026, 8, 1), ids, dates, 100, 2);
        for id in 0..10 {
            for d in 0..5 {
                for s in 0..100 {
                    for k in 0..2 {
                        let sentinel = (id * 100_000 + d * 10_000 + s * 10 + k) as f64;
                        cube.set(sentinel, id, d, s, k).unwrap();
                    }
                }
            }
            cube.set_t0(id as f64 + 0.5, id, 0).unwrap();
        }
        cube
    }

    #[test]
    fn get_returns_what_set_stored() {
        let cube = sample_cube();
        assert_eq!(cube.get(3, 2, 47, 1).unwrap(), 320_471.0);
        assert_eq!(cube.get_t0(7, 0).unwrap(), 7.5);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let cube = sample_cube();
        assert!(cube.get(10, 0, 0, 0).is_err());
        assert!(cube.get(0, 5, 0, 0).is_err());
        assert!(cube.get(0, 0, 100, 0).is_err());
        assert!(cube.get(0, 0, 0, 2).is_err());
    }

    #[test]
    fn save_load_round_trip_is_exact() {
        let cube = sample_cube();
        let mut payload = Vec::new();
        cube.save(&mut payload).unwrap();
        let loaded = NpvCube::load(&mut payload.as_slice()).unwrap();
        assert_eq!(loaded, cube);
    }

    #[test]
    fn load_rejects_bad_magic() {
        let mut payload = Vec::new();
        sample_cube().save(&mut payload).unwrap();
        payload[0] ^= 0xFF;
        assert!(matches!(
            NpvCube::load(&mut payload.as_slice()),
            Err(CubeError::Corrupt(_))
        ));
    }

    #[test]
    fn load_rejects_truncated_payload() {
        let mut payload = Vec::new();
        sample_cube().save(&mut payload).unwrap();
        payload.truncate(payload.len() / 2);
        assert!(NpvCube::load(&mut payload.as_slice()).is_err());
    }
}
