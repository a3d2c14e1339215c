//! Matching downloaded archives back to planned batches
//!
//! The portal names every waveform file after its station, time window and
//! channel family, so the expected member names of a batch can be computed
//! up front. A batch is covered by the first archive that contains any of
//! them; each archive covers at most one batch.

use chrono::NaiveDateTime;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::batch::Batch;
use crate::catalog::SelectedStation;
use crate::error::DlTdvmsError;
use crate::selection::{DataFormat, RequestConfig, Selection};

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// File name the portal uses for one station's data in an archive
pub fn expected_member(
    station: &SelectedStation,
    format: DataFormat,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> String {
    format!(
        "{}_{}_{}_{}_H{}.{}",
        station.network,
        station.code,
        start.format("%d%m%Y_%H%M%S"),
        end.format("%d%m%Y_%H%M%S"),
        station.device,
        format
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchCoverage {
    pub index: usize,
    pub archive: Option<PathBuf>,
    /// Expected members absent from the archive
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageReport {
    pub batches: Vec<BatchCoverage>,
    /// Archives that no batch claimed
    pub odd: Vec<PathBuf>,
    /// Inventory batches, whose archive contents are not predictable
    pub unchecked: Vec<usize>,
}

impl CoverageReport {
    /// Batches without any archive
    pub fn missing_batches(&self) -> Vec<usize> {
        self.batches
            .iter()
            .filter(|b| b.archive.is_none())
            .map(|b| b.index)
            .collect()
    }
}

/// Map batches to archives given as `(path, member names)`
pub fn check(
    batches: &[Batch],
    archives: &[(PathBuf, Vec<String>)],
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> CoverageReport {
    let mut unclaimed: Vec<(&PathBuf, BTreeSet<&str>)> = archives
        .iter()
        .map(|(path, names)| (path, names.iter().map(String::as_str).collect()))
        .collect();
    let mut report = CoverageReport::default();

    for batch in batches {
        if batch.data_format == DataFormat::Inventory {
            report.unchecked.push(batch.index);
            continue;
        }
        let expected: BTreeSet<String> = batch
            .stations
            .iter()
            .map(|s| expected_member(s, batch.data_format, start, end))
            .collect();

        let found = unclaimed
            .iter()
            .position(|(_, names)| expected.iter().any(|e| names.contains(e.as_str())));

        let coverage = match found {
            Some(pos) => {
                let (path, names) = unclaimed.remove(pos);
                let missing: Vec<String> = expected
                    .iter()
                    .filter(|e| !names.contains(e.as_str()))
                    .cloned()
                    .collect();
                tracing::debug!(batch = batch.index, missing = missing.len(), "Batch -> {}", path.display());
                BatchCoverage {
                    index: batch.index,
                    archive: Some(path.clone()),
                    missing,
                }
            }
            None => BatchCoverage {
                index: batch.index,
                archive: None,
                missing: expected.into_iter().collect(),
            },
        };
        report.batches.push(coverage);
    }

    report.odd = unclaimed.into_iter().map(|(path, _)| path.clone()).collect();
    report
}

/// Write one request config per uncovered batch, selecting exactly that
/// batch's stations by name. Files are named `<stem>_missing_<n>.yml`.
pub fn write_missing_configs(
    report: &CoverageReport,
    batches: &[Batch],
    request: &RequestConfig,
    stem: &str,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for (n, index) in report.missing_batches().into_iter().enumerate() {
        let Some(batch) = batches.iter().find(|b| b.index == index) else {
            continue;
        };
        let networks: BTreeSet<String> = batch.stations.iter().map(|s| s.network.clone()).collect();
        let missing = RequestConfig {
            start: request.start,
            end: request.end,
            networks: networks.into_iter().collect(),
            selection: Selection {
                name: Some(batch.station_ids()),
                ..Default::default()
            },
            data_formats: vec![batch.data_format],
            batch_size: request.batch_size,
        };

        let path = out_dir.join(format!("{}_missing_{}.yml", stem, n));
        std::fs::write(&path, missing.to_yaml()?)?;
        tracing::info!(batch = index, "Wrote request config for missing data: {}", path.display());
        written.push(path);
    }
    Ok(written)
}
