//! Batch planning
//!
//! Cuts the resolved station list into fixed-size slices. Slicing is purely
//! positional so the same station list always yields the same batches, which is
//! what makes resuming an interrupted campaign safe.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalog::SelectedStation;
use crate::selection::DataFormat;

/// A group of stations requested together in one portal submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// 0-based position in the plan
    pub index: usize,
    pub data_format: DataFormat,
    pub stations: Vec<SelectedStation>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn station_ids(&self) -> Vec<String> {
        self.stations.iter().map(SelectedStation::id).collect()
    }
}

/// Split stations into batches of at most `batch_size`.
///
/// With several data formats the same slices are repeated for each format in
/// the order given, since the portal takes one data type per request.
pub fn plan(stations: &[SelectedStation], batch_size: usize, formats: &[DataFormat]) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(formats.len() * stations.len().div_ceil(batch_size));

    for &data_format in formats {
        for chunk in stations.chunks(batch_size) {
            batches.push(Batch {
                index: batches.len(),
                data_format,
                stations: chunk.to_vec(),
            });
        }
    }

    batches
}

/// Digest over the ordered `NET.CODE:device` list. Two runs with the same
/// fingerprint produce identical batch contents.
pub fn station_fingerprint(stations: &[SelectedStation]) -> String {
    let mut hasher = Sha256::new();
    for station in stations {
        hasher.update(station.id().as_bytes());
        hasher.update(b":");
        hasher.update(station.device.as_str().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DeviceType;

    fn stations(n: usize) -> Vec<SelectedStation> {
        (0..n)
            .map(|i| SelectedStation {
                network: "TK".into(),
                code: format!("{:04}", i),
                latitude: 38.0,
                longitude: 30.0,
                device: DeviceType::N,
            })
            .collect()
    }

    #[test]
    fn test_120_stations_in_batches_of_50() {
        let batches = plan(&stations(120), 50, &[DataFormat::Mseed]);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(
            batches.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(batches[1].stations[0].code, "0050");
    }

    #[test]
    fn test_exact_multiple() {
        let batches = plan(&stations(100), 50, &[DataFormat::Mseed]);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 50));
    }

    #[test]
    fn test_formats_repeat_slices() {
        let batches = plan(&stations(7), 5, &[DataFormat::Mseed, DataFormat::Inventory]);
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].data_format, DataFormat::Mseed);
        assert_eq!(batches[2].data_format, DataFormat::Inventory);
        assert_eq!(batches[0].stations, batches[2].stations);
        assert_eq!(batches[3].index, 3);
    }

    #[test]
    fn test_plan_is_stable() {
        let list = stations(33);
        assert_eq!(
            plan(&list, 10, &[DataFormat::Fseed]),
            plan(&list, 10, &[DataFormat::Fseed])
        );
        assert_eq!(station_fingerprint(&list), station_fingerprint(&list.clone()));
    }

    #[test]
    fn test_fingerprint_tracks_device_choice() {
        let list = stations(3);
        let mut changed = list.clone();
        changed[1].device = DeviceType::H;
        assert_ne!(station_fingerprint(&list), station_fingerprint(&changed));
    }
}
