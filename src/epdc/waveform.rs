//! Waveform/temperature table
//!
//! Maps a logical transition and the panel temperature onto the hardware
//! waveform index. The table is loaded once and never changes afterwards.
//! On disk it is a `bincode` encoding of [`WaveformFile`].

use serde::{Deserialize, Serialize};

use crate::epdc::error::Error;
use crate::epdc::types::WaveformMode;

const MAGIC: [u8; 4] = *b"EPWF";
const VERSION: u16 = 1;

/// Index the hardware understands: waveform mode number plus temperature range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalWaveform {
    pub mode: u8,
    pub temperature_range: u8,
}

/// Logical mode to hardware mode number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeEntry {
    pub mode: WaveformMode,
    pub number: u8,
}

/// Serialized table layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveformFile {
    pub magic: [u8; 4],
    pub version: u16,
    /// Ascending range boundaries in °C; range `i` is `[b[i], b[i + 1])`
    pub temperature_bounds: Vec<i8>,
    pub modes: Vec<ModeEntry>,
    /// Range used when the temperature is outside every known range
    pub fallback_range: u8,
}

#[derive(Debug, Clone)]
pub struct WaveformTable {
    file: WaveformFile,
    full_grey: u8,
}

impl WaveformTable {
    /// Decode and validate a table
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let file: WaveformFile = bincode::deserialize(bytes)
            .map_err(|e| Error::WaveformTable(format!("decode failed: {}", e)))?;
        Self::from_file(file)
    }

    pub fn from_file(file: WaveformFile) -> Result<Self, Error> {
        if file.magic != MAGIC {
            return Err(Error::WaveformTable("bad magic".into()));
        }
        if file.version != VERSION {
            return Err(Error::WaveformTable(format!(
                "unsupported version {}",
                file.version
            )));
        }
        if file.temperature_bounds.len() < 2 {
            return Err(Error::WaveformTable("needs at least one temperature range".into()));
        }
        if file.temperature_bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::WaveformTable("temperature bounds must ascend".into()));
        }
        let ranges = file.temperature_bounds.len() - 1;
        if file.fallback_range as usize >= ranges {
            return Err(Error::WaveformTable(format!(
                "fallback range {} out of {} ranges",
                file.fallback_range, ranges
            )));
        }
        let full_grey = file
            .modes
            .iter()
            .find(|entry| entry.mode == WaveformMode::FullGrey)
            .map(|entry| entry.number)
            .ok_or_else(|| Error::WaveformTable("full greyscale mode missing".into()))?;

        log::info!(
            "Waveform table: {} modes, {} temperature ranges ({}..{} °C)",
            file.modes.len(),
            ranges,
            file.temperature_bounds[0],
            file.temperature_bounds[ranges]
        );
        Ok(Self { file, full_grey })
    }

    /// Table matching the stock waveforms of the reference panels
    pub fn builtin() -> Self {
        let modes = [
            (WaveformMode::FullGrey, 2),
            (WaveformMode::FastFullGrey, 3),
            (WaveformMode::Refined, 4),
            (WaveformMode::RefinedDithered, 5),
            (WaveformMode::FastPartialGrey, 6),
            (WaveformMode::FourLevel, 7),
            (WaveformMode::DirectUpdate, 1),
            (WaveformMode::FastFlash, 8),
        ]
        .into_iter()
        .map(|(mode, number)| ModeEntry { mode, number })
        .collect();

        let file = WaveformFile {
            magic: MAGIC,
            version: VERSION,
            temperature_bounds: vec![0, 5, 10, 15, 20, 25, 30, 40, 50],
            modes,
            fallback_range: 4,
        };
        let full_grey = 2;
        Self { file, full_grey }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // serializing plain vectors and integers into memory cannot fail
        bincode::serialize(&self.file).unwrap_or_default()
    }

    pub fn file(&self) -> &WaveformFile {
        &self.file
    }

    pub fn temperature_ranges(&self) -> usize {
        self.file.temperature_bounds.len() - 1
    }

    /// Temperature range index, `None` outside every range
    pub fn temperature_range(&self, celsius: i32) -> Option<u8> {
        self.file
            .temperature_bounds
            .windows(2)
            .position(|w| celsius >= w[0] as i32 && celsius < w[1] as i32)
            .map(|i| i as u8)
    }

    /// Hardware mode number; unknown modes and `Auto` use full greyscale
    pub fn mode_number(&self, mode: WaveformMode) -> u8 {
        self.file
            .modes
            .iter()
            .find(|entry| entry.mode == mode)
            .map_or(self.full_grey, |entry| entry.number)
    }

    /// Resolve a logical mode at a temperature.
    ///
    /// Fails closed: an out-of-range temperature selects the fallback range.
    pub fn resolve(&self, mode: WaveformMode, celsius: i32) -> PhysicalWaveform {
        let temperature_range = self.temperature_range(celsius).unwrap_or_else(|| {
            log::warn!(
                "Temperature {} °C outside waveform ranges, using range {}",
                celsius,
                self.file.fallback_range
            );
            self.file.fallback_range
        });
        PhysicalWaveform {
            mode: self.mode_number(mode),
            temperature_range,
        }
    }
}

impl Default for WaveformTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_inside_ranges() {
        let table = WaveformTable::builtin();
        let w = table.resolve(WaveformMode::DirectUpdate, 22);
        assert_eq!(w, PhysicalWaveform { mode: 1, temperature_range: 4 });
        assert_eq!(table.resolve(WaveformMode::FullGrey, 0).temperature_range, 0);
        assert_eq!(table.resolve(WaveformMode::FullGrey, 49).temperature_range, 7);
    }

    #[test]
    fn out_of_range_fails_closed() {
        let table = WaveformTable::builtin();
        assert_eq!(table.temperature_range(-20), None);
        assert_eq!(table.resolve(WaveformMode::FourLevel, -20).temperature_range, 4);
        assert_eq!(table.resolve(WaveformMode::FourLevel, 50).temperature_range, 4);
    }

    #[test]
    fn auto_maps_to_full_grey() {
        let table = WaveformTable::builtin();
        assert_eq!(table.mode_number(WaveformMode::Auto), 2);
    }

    #[test]
    fn bincode_round_trip_keeps_lookups() {
        let bytes = WaveformTable::builtin().to_bytes();
        let table = WaveformTable::from_bytes(&bytes).unwrap();
        assert_eq!(table.temperature_ranges(), 8);
        assert_eq!(table.mode_number(WaveformMode::FastFlash), 8);
    }

    #[test]
    fn rejects_broken_tables() {
        let mut file = WaveformTable::builtin().file().clone();
        file.temperature_bounds = vec![10, 5];
        assert!(WaveformTable::from_file(file.clone()).is_err());

        file.temperature_bounds = vec![0, 50];
        file.fallback_range = 3;
        assert!(WaveformTable::from_file(file.clone()).is_err());

        file.fallback_range = 0;
        file.modes.retain(|entry| entry.mode != WaveformMode::FullGrey);
        assert!(matches!(
            WaveformTable::from_file(file),
            Err(Error::WaveformTable(_))
        ));

        assert!(WaveformTable::from_bytes(&[1, 2, 3]).is_err());
    }
}
