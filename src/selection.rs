//! Request configuration: what to download
//!
//! A request config is a small YAML document describing the time window,
//! networks, station selection and batching of one download campaign:
//!
//! ```yaml
//! starttime: 2023-02-06 00:00:00
//! endtime: 2023-02-06 06:00:00
//! data_format: mseed,inventory
//! networks: [KO, TK]
//! selection:
//!   circle:
//!     latitude: 37.2
//!     longitude: 37.0
//!     min_dist_km: 0
//!     max_dist_km: 150
//!   device_type: [H, N]
//! batch_size: 50
//! ```

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::catalog::DeviceType;
use crate::error::{ConfigError, DlTdvmsError};

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// Time format used in request configs and by the portal
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Data products the portal can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Mseed,
    Fseed,
    Inventory,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Mseed => "mseed",
            DataFormat::Fseed => "fseed",
            DataFormat::Inventory => "inventory",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "mseed" => Ok(DataFormat::Mseed),
            "fseed" => Ok(DataFormat::Fseed),
            "inventory" => Ok(DataFormat::Inventory),
            other => Err(ConfigError::UnknownDataFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub latitude: f64,
    pub longitude: f64,
    pub min_dist_km: f64,
    pub max_dist_km: f64,
}

/// Bounding box given by its north-west and south-east corners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    pub north_latitude: f64,
    pub west_longitude: f64,
    pub south_latitude: f64,
    pub east_longitude: f64,
}

/// Station selection predicates. Every declared predicate must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Selection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circle: Option<Circle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rectangle: Option<Rectangle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<Vec<DeviceType>>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.circle.is_none()
            && self.rectangle.is_none()
            && self.name.is_none()
            && self.device_type.is_none()
    }

    fn from_map(map: BTreeMap<String, serde_yaml::Value>) -> Result<Self> {
        let mut selection = Selection::default();

        for (kind, args) in map {
            match kind.as_str() {
                "circle" => {
                    let circle: Circle = typed_arg("selection.circle", args)?;
                    validate_circle(&circle)?;
                    selection.circle = Some(circle);
                }
                "rectangle" => {
                    let rect: Rectangle = typed_arg("selection.rectangle", args)?;
                    validate_rectangle(&rect)?;
                    selection.rectangle = Some(rect);
                }
                "name" => {
                    let names: Vec<String> = typed_arg("selection.name", args)?;
                    if names.is_empty() {
                        return Err(invalid("selection.name", "should be a non-empty list of names"));
                    }
                    if let Some(bad) = names.iter().find(|n| !is_station_id(n)) {
                        return Err(invalid(
                            "selection.name",
                            format!("'{}' is not of the form NETWORK.STATION", bad),
                        ));
                    }
                    selection.name = Some(names);
                }
                "device_type" => {
                    let codes: Vec<String> = typed_arg("selection.device_type", args)?;
                    if codes.is_empty() {
                        return Err(invalid("selection.device_type", "should be a non-empty list"));
                    }
                    let mut devices = codes
                        .iter()
                        .map(|c| c.parse::<DeviceType>())
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    devices.sort();
                    devices.dedup();
                    selection.device_type = Some(devices);
                }
                other => return Err(ConfigError::UnknownSelection(other.to_string()).into()),
            }
        }

        if selection.is_empty() {
            return Err(invalid("selection", "at least one selection type is required"));
        }
        Ok(selection)
    }
}

/// A validated download request. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub networks: Vec<String>,
    pub selection: Selection,
    pub data_formats: Vec<DataFormat>,
    pub batch_size: usize,
}

/// On-disk shape of a request config
#[derive(Debug, Serialize, Deserialize)]
struct RequestDocument {
    starttime: String,
    endtime: String,
    data_format: DataFormatField,
    networks: Vec<String>,
    selection: serde_yaml::Value,
    batch_size: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum DataFormatField {
    Joined(String),
    List(Vec<String>),
}

impl RequestConfig {
    /// Load and validate a request config from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()).into());
        }
        let content = std::fs::read_to_string(path)?;
        tracing::debug!("Loaded request config from: {}", path.display());
        content.parse()
    }

    fn from_document(doc: RequestDocument) -> Result<Self> {
        let start = parse_time("starttime", &doc.starttime)?;
        let end = parse_time("endtime", &doc.endtime)?;
        if start >= end {
            return Err(invalid("endtime", "must be after starttime"));
        }

        let raw_formats = match doc.data_format {
            DataFormatField::Joined(s) => s.split(',').map(str::to_string).collect::<Vec<_>>(),
            DataFormatField::List(v) => v,
        };
        let mut data_formats = Vec::with_capacity(raw_formats.len());
        for raw in raw_formats {
            let format: DataFormat = raw.parse()?;
            if data_formats.contains(&format) {
                return Err(invalid("data_format", format!("'{}' is listed twice", format)));
            }
            data_formats.push(format);
        }
        if data_formats.is_empty() {
            return Err(invalid("data_format", "at least one format is required"));
        }

        if doc.networks.is_empty() {
            return Err(invalid("networks", "at least one network is required"));
        }
        let networks: Vec<String> = doc.networks.iter().map(|n| n.trim().to_string()).collect();
        if networks.iter().any(|n| n.is_empty()) {
            return Err(invalid("networks", "network codes cannot be empty"));
        }

        let selection_map: BTreeMap<String, serde_yaml::Value> = match doc.selection {
            serde_yaml::Value::Mapping(_) => typed_arg("selection", doc.selection)?,
            _ => return Err(invalid("selection", "Malformed selection argument")),
        };
        let selection = Selection::from_map(selection_map)?;

        if doc.batch_size <= 0 {
            return Err(invalid(
                "batch_size",
                format!("must be a positive integer, got {}", doc.batch_size),
            ));
        }

        Ok(Self {
            start,
            end,
            networks,
            selection,
            data_formats,
            batch_size: doc.batch_size as usize,
        })
    }

    /// Render this request back to YAML, in the same shape it is read from
    pub fn to_yaml(&self) -> Result<String> {
        let selection = serde_yaml::to_value(&self.selection)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize selection: {}", e)))?;
        let doc = RequestDocument {
            starttime: self.start.format(TIME_FORMAT).to_string(),
            endtime: self.end.format(TIME_FORMAT).to_string(),
            data_format: DataFormatField::Joined(
                self.data_formats
                    .iter()
                    .map(DataFormat::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            networks: self.networks.clone(),
            selection,
            batch_size: self.batch_size as i64,
        };
        serde_yaml::to_string(&doc)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize request: {}", e)).into())
    }
}

impl FromStr for RequestConfig {
    type Err = DlTdvmsError;

    fn from_str(s: &str) -> Result<Self> {
        let doc: RequestDocument = serde_yaml::from_str(s)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse request config: {}", e)))?;
        Self::from_document(doc)
    }
}

fn parse_time(field: &str, value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| invalid(field, format!("couldn't be parsed as date: {}", value)))
}

fn typed_arg<T: serde::de::DeserializeOwned>(field: &str, value: serde_yaml::Value) -> Result<T> {
    serde_yaml::from_value(value).map_err(|e| invalid(field, e.to_string()))
}

fn validate_circle(c: &Circle) -> Result<()> {
    check_latitude("selection.circle.latitude", c.latitude)?;
    check_longitude("selection.circle.longitude", c.longitude)?;
    if !c.min_dist_km.is_finite() || !c.max_dist_km.is_finite() || c.min_dist_km < 0.0 {
        return Err(invalid("selection.circle", "distances must be finite and non-negative"));
    }
    if c.min_dist_km > c.max_dist_km {
        return Err(invalid("selection.circle", "min_dist_km is larger than max_dist_km"));
    }
    Ok(())
}

fn validate_rectangle(r: &Rectangle) -> Result<()> {
    check_latitude("selection.rectangle.north_latitude", r.north_latitude)?;
    check_latitude("selection.rectangle.south_latitude", r.south_latitude)?;
    check_longitude("selection.rectangle.west_longitude", r.west_longitude)?;
    check_longitude("selection.rectangle.east_longitude", r.east_longitude)?;
    if r.south_latitude > r.north_latitude {
        return Err(invalid("selection.rectangle", "south_latitude is north of north_latitude"));
    }
    if r.west_longitude > r.east_longitude {
        return Err(invalid("selection.rectangle", "west_longitude is east of east_longitude"));
    }
    Ok(())
}

fn check_latitude(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (-90.0..=90.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{} is not a valid latitude", value)))
    }
}

fn check_longitude(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (-180.0..=180.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{} is not a valid longitude", value)))
    }
}

fn is_station_id(name: &str) -> bool {
    matches!(name.split_once('.'), Some((net, sta)) if !net.is_empty() && !sta.is_empty() && !sta.contains('.'))
}

fn invalid(field: &str, reason: impl Into<String>) -> DlTdvmsError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
starttime: 2023-02-06 00:00:00
endtime: 2023-02-06 06:00:00
data_format: mseed,inventory
networks: [KO, TK]
selection:
  circle:
    latitude: 37.2
    longitude: 37.0
    min_dist_km: 0
    max_dist_km: 150
  device_type: [N, H]
batch_size: 50
"#;

    fn with_selection(selection: &str) -> String {
        format!(
            "starttime: 2023-01-01 00:00:00\nendtime: 2023-01-02 00:00:00\ndata_format: mseed\nnetworks: [TK]\nbatch_size: 10\nselection:\n{}",
            selection
        )
    }

    #[test]
    fn test_parse_sample() {
        let config: RequestConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.networks, vec!["KO", "TK"]);
        assert_eq!(config.data_formats, vec![DataFormat::Mseed, DataFormat::Inventory]);
        assert_eq!(config.batch_size, 50);
        assert_eq!(
            config.selection.device_type,
            Some(vec![DeviceType::H, DeviceType::N])
        );
        assert_eq!(config.selection.circle.as_ref().unwrap().max_dist_km, 150.0);
        assert_eq!(config.start.format(TIME_FORMAT).to_string(), "2023-02-06 00:00:00");
    }

    #[test]
    fn test_data_format_as_list() {
        let yaml = SAMPLE.replace("data_format: mseed,inventory", "data_format: [fseed]");
        let config: RequestConfig = yaml.parse().unwrap();
        assert_eq!(config.data_formats, vec![DataFormat::Fseed]);
    }

    #[test]
    fn test_unknown_data_format() {
        let yaml = SAMPLE.replace("mseed,inventory", "mseed,sac");
        let err = yaml.parse::<RequestConfig>().unwrap_err();
        assert!(matches!(err, DlTdvmsError::Config(ConfigError::UnknownDataFormat(ref f)) if f == "sac"));
    }

    #[test]
    fn test_unknown_selection_type() {
        let err = with_selection("  polygon: [1, 2]\n")
            .parse::<RequestConfig>()
            .unwrap_err();
        assert!(matches!(err, DlTdvmsError::Config(ConfigError::UnknownSelection(_))));
    }

    #[test]
    fn test_circle_missing_argument() {
        let err = with_selection("  circle:\n    latitude: 37\n    longitude: 37\n    max_dist_km: 100\n")
            .parse::<RequestConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("min_dist_km"), "{}", err);
    }

    #[test]
    fn test_inverted_rectangle() {
        let err = with_selection(
            "  rectangle:\n    north_latitude: 36\n    south_latitude: 40\n    west_longitude: 26\n    east_longitude: 30\n",
        )
        .parse::<RequestConfig>()
        .unwrap_err();
        assert!(matches!(err, DlTdvmsError::Config(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_bad_device_type() {
        let err = with_selection("  device_type: [H, X]\n")
            .parse::<RequestConfig>()
            .unwrap_err();
        assert!(matches!(err, DlTdvmsError::Config(ConfigError::UnknownDeviceType(_))));
    }

    #[test]
    fn test_name_requires_network_prefix() {
        assert!(with_selection("  name: [TK.3126, KO.DKL]\n")
            .parse::<RequestConfig>()
            .is_ok());
        assert!(with_selection("  name: [DKL]\n").parse::<RequestConfig>().is_err());
        assert!(with_selection("  name: []\n").parse::<RequestConfig>().is_err());
    }

    #[test]
    fn test_non_positive_batch_size() {
        let yaml = SAMPLE.replace("batch_size: 50", "batch_size: 0");
        assert!(yaml.parse::<RequestConfig>().is_err());
        let yaml = SAMPLE.replace("batch_size: 50", "batch_size: -3");
        assert!(yaml.parse::<RequestConfig>().is_err());
    }

    #[test]
    fn test_reversed_time_range() {
        let yaml = SAMPLE.replace("endtime: 2023-02-06 06:00:00", "endtime: 2023-02-05 06:00:00");
        assert!(yaml.parse::<RequestConfig>().is_err());
    }

    #[test]
    fn test_selection_must_be_mapping() {
        let err = with_selection("  - circle\n").parse::<RequestConfig>().unwrap_err();
        assert!(err.to_string().contains("Malformed selection"));
    }

    #[test]
    fn test_yaml_output_reloads() {
        let config: RequestConfig = SAMPLE.parse().unwrap();
        let reloaded: RequestConfig = config.to_yaml().unwrap().parse().unwrap();
        assert_eq!(config, reloaded);
    }
}
