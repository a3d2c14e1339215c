//! Fixtures shared by unit tests across modules

use chrono::NaiveDate;

use crate::catalog::{InventoryStation, SelectedStation};
use crate::selection::{DataFormat, RequestConfig, Selection};

/// Inventory row; `devices` is any combination of `H`, `L`, `N`
pub(crate) fn station(net: &str, code: &str, lat: f64, lon: f64, devices: &str) -> InventoryStation {
    InventoryStation {
        network: net.to_string(),
        code: code.to_string(),
        latitude: lat,
        longitude: lon,
        device_h: devices.contains('H'),
        device_l: devices.contains('L'),
        device_n: devices.contains('N'),
    }
}

/// Request for 2023-02-06 00:00:00 to 06:00:00, mseed only
pub(crate) fn request(networks: &[&str], selection: Selection, batch_size: usize) -> RequestConfig {
    let day = NaiveDate::from_ymd_opt(2023, 2, 6).unwrap();
    RequestConfig {
        start: day.and_hms_opt(0, 0, 0).unwrap(),
        end: day.and_hms_opt(6, 0, 0).unwrap(),
        networks: networks.iter().map(|n| n.to_string()).collect(),
        selection,
        data_formats: vec![DataFormat::Mseed],
        batch_size,
    }
}

/// `n` high-gain stations `TK.0000`, `TK.0001`, ...
pub(crate) fn selected(n: usize) -> Vec<SelectedStation> {
    (0..n)
        .map(|i| SelectedStation {
            network: "TK".into(),
            code: format!("{:04}", i),
            latitude: 38.0,
            longitude: 30.0,
            device: crate::catalog::DeviceType::H,
        })
        .collect()
}

/// Write a zip with stored (uncompressed) members
pub(crate) fn write_zip(path: &std::path::Path, members: &[(&str, &[u8])]) {
    use std::io::Write;

    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in members {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// A 512-byte record with a plausible miniSEED fixed header
pub(crate) fn mseed_record() -> Vec<u8> {
    let mut record = b"000001D KO DKL  HHZ".to_vec();
    record.resize(512, 0);
    record
}
