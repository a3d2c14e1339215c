use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Instrument type offered by a station.
///
/// Declaration order is the selection priority for hybrid stations:
/// a station offering several types is requested with the smallest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// High gain seismometer
    H,
    /// Low gain seismometer
    L,
    /// Accelerometer
    N,
}

impl DeviceType {
    pub const ALL: [DeviceType; 3] = [DeviceType::H, DeviceType::L, DeviceType::N];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::H => "H",
            DeviceType::L => "L",
            DeviceType::N => "N",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "H" => Ok(DeviceType::H),
            "L" => Ok(DeviceType::L),
            "N" => Ok(DeviceType::N),
            other => Err(ConfigError::UnknownDeviceType(other.to_string())),
        }
    }
}

/// One station row as returned by the portal's `GetStations` endpoint.
///
/// Only the fields used for selection are kept; everything else in the
/// payload is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryStation {
    pub network: String,
    pub code: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "deviceH", default)]
    pub device_h: bool,
    #[serde(rename = "deviceL", default)]
    pub device_l: bool,
    #[serde(rename = "deviceN", default)]
    pub device_n: bool,
}

impl InventoryStation {
    /// `NET.CODE` identifier
    pub fn id(&self) -> String {
        format!("{}.{}", self.network, self.code)
    }

    pub fn devices(&self) -> BTreeSet<DeviceType> {
        let mut devices = BTreeSet::new();
        if self.device_h {
            devices.insert(DeviceType::H);
        }
        if self.device_l {
            devices.insert(DeviceType::L);
        }
        if self.device_n {
            devices.insert(DeviceType::N);
        }
        devices
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let malformed = |reason: String| ConfigError::MalformedInventory {
            station: self.id(),
            reason,
        };

        if self.network.trim().is_empty() || self.code.trim().is_empty() {
            return Err(malformed("empty network or station code".to_string()));
        }
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(malformed(format!("latitude {} out of range", self.latitude)));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(malformed(format!(
                "longitude {} out of range",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// A resolved station with exactly one device type chosen for the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedStation {
    pub network: String,
    pub code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub device: DeviceType,
}

impl SelectedStation {
    pub fn id(&self) -> String {
        format!("{}.{}", self.network, self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_priority_order() {
        let mut devices = vec![DeviceType::N, DeviceType::H, DeviceType::L];
        devices.sort();
        assert_eq!(devices, DeviceType::ALL.to_vec());
    }

    #[test]
    fn test_parse_portal_row() {
        let json = r#"{
            "network": "TK", "code": "3126", "latitude": 37.5, "longitude": 36.9,
            "deviceH": false, "deviceL": false, "deviceN": true,
            "deviceNZ": true, "name": "Pazarcik"
        }"#;
        let station: InventoryStation = serde_json::from_str(json).unwrap();
        assert_eq!(station.id(), "TK.3126");
        assert_eq!(station.devices().into_iter().collect::<Vec<_>>(), vec![DeviceType::N]);
        assert!(station.validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_coordinates() {
        let station = InventoryStation {
            network: "KO".into(),
            code: "DKL".into(),
            latitude: 123.0,
            longitude: 30.0,
            device_h: true,
            device_l: false,
            device_n: false,
        };
        assert!(matches!(
            station.validate(),
            Err(ConfigError::MalformedInventory { .. })
        ));
    }

    #[test]
    fn test_unknown_device_type() {
        assert!("H".parse::<DeviceType>().is_ok());
        assert!(matches!(
            "X".parse::<DeviceType>(),
            Err(ConfigError::UnknownDeviceType(_))
        ));
    }
}
