//! Spectrum samples and the fixed wavenumber axis.
//!
//! The instrument only transmits intensities. The matching wavenumber axis
//! (cm⁻¹) is read once from a reference table and shared by every sample.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Column holding the axis in the reference table and in per-scan files.
pub const WAVENUMBER_COLUMN: &str = "Wavenumbercm-1";

/// Which feed a spectrum came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectrumKind {
    Raw,
    Treated,
    Background,
}

impl SpectrumKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpectrumKind::Raw => "raw",
            SpectrumKind::Treated => "treated",
            SpectrumKind::Background => "background",
        }
    }
}

impl std::fmt::Display for SpectrumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scan
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub kind: SpectrumKind,
    /// Arrival order within the feed, starting at 0
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub wavenumbers: Arc<[f64]>,
    pub intensities: Vec<f64>,
}

impl Spectrum {
    pub fn new(
        kind: SpectrumKind,
        sequence: u64,
        wavenumbers: Arc<[f64]>,
        intensities: Vec<f64>,
    ) -> Self {
        Self {
            kind,
            sequence,
            timestamp: Utc::now(),
            wavenumbers,
            intensities,
        }
    }

    /// Whether intensities line up index-for-index with the axis
    pub fn is_aligned(&self) -> bool {
        self.wavenumbers.len() == self.intensities.len()
    }

    /// `(wavenumber, intensity)` pairs, up to the shorter of the two series
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.wavenumbers
            .iter()
            .copied()
            .zip(self.intensities.iter().copied())
    }
}

/// Load the wavenumber axis from a CSV table with a `Wavenumbercm-1` column.
pub fn load_wavenumbers<P: AsRef<Path>>(path: P) -> AppResult<Arc<[f64]>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)?;
    read_wavenumbers(&mut reader, &path.display().to_string())
}

/// Same as [`load_wavenumbers`] for an already-open reader.
pub fn read_wavenumbers<R: std::io::Read>(
    reader: &mut csv::Reader<R>,
    source: &str,
) -> AppResult<Arc<[f64]>> {
    let column = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == WAVENUMBER_COLUMN)
        .ok_or_else(|| {
            DaqError::Configuration(format!(
                "{} has no '{}' column",
                source, WAVENUMBER_COLUMN
            ))
        })?;

    let mut axis = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let cell = record.get(column).unwrap_or("").trim();
        let value: f64 = cell.parse().map_err(|_| {
            DaqError::Configuration(format!(
                "{} row {}: '{}' is not a wavenumber",
                source,
                row + 2,
                cell
            ))
        })?;
        axis.push(value);
    }

    if axis.is_empty() {
        return Err(DaqError::Configuration(format!(
            "{} contains no wavenumbers",
            source
        )));
    }
    Ok(axis.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_wavenumbers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Index,Wavenumbercm-1").unwrap();
        writeln!(file, "0,649.9").unwrap();
        writeln!(file, "1,651.8").unwrap();
        writeln!(file, "2,653.7").unwrap();

        let axis = load_wavenumbers(file.path()).unwrap();
        assert_eq!(&axis[..], &[649.9, 651.8, 653.7]);
    }

    #[test]
    fn test_missing_column_rejected() {
        let data = "Wavelength\n1.0\n";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let err = read_wavenumbers(&mut reader, "inline").unwrap_err();
        assert!(err.to_string().contains("Wavenumbercm-1"));
    }

    #[test]
    fn test_bad_cell_names_row() {
        let data = "Wavenumbercm-1\n1.0\nabc\n";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let err = read_wavenumbers(&mut reader, "inline").unwrap_err();
        assert!(err.to_string().contains("row 3"));
    }

    #[test]
    fn test_alignment() {
        let axis: Arc<[f64]> = vec![1.0, 2.0].into();
        let ok = Spectrum::new(SpectrumKind::Raw, 0, axis.clone(), vec![0.1, 0.2]);
        let short = Spectrum::new(SpectrumKind::Raw, 1, axis, vec![0.1]);
        assert!(ok.is_aligned());
        assert!(!short.is_aligned());
        assert_eq!(short.points().count(), 1);
    }
}
