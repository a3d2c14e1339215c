use std::collections::{BTreeMap, BTreeSet};

use super::geo::great_circle_km;
use super::station::{DeviceType, InventoryStation, SelectedStation};
use crate::error::{ConfigError, DlTdvmsError};
use crate::selection::{Circle, Rectangle, RequestConfig};

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// Resolve a request's selection against the full station inventory.
///
/// Predicates are AND-combined. Duplicate rows for the same `NET.CODE` are
/// merged, hybrid stations are reduced to a single device type by `H > L > N`,
/// and the result is sorted by network then station code so batch indices
/// stay stable between runs.
pub fn resolve(
    config: &RequestConfig,
    known_networks: &[String],
    inventory: &[InventoryStation],
) -> Result<Vec<SelectedStation>> {
    for network in &config.networks {
        if !known_networks.iter().any(|known| known == network) {
            return Err(ConfigError::UnknownNetwork(network.clone()).into());
        }
    }

    let selection = &config.selection;
    let allowed_devices: Option<BTreeSet<DeviceType>> = selection
        .device_type
        .as_ref()
        .map(|devices| devices.iter().copied().collect());

    // keyed by (network, code) so iteration order is the output order
    let mut matched: BTreeMap<(String, String), (InventoryStation, BTreeSet<DeviceType>)> =
        BTreeMap::new();

    for station in inventory {
        if !config.networks.contains(&station.network) {
            continue;
        }
        station.validate()?;

        if let Some(circle) = &selection.circle {
            if !in_circle(circle, station) {
                continue;
            }
        }
        if let Some(rect) = &selection.rectangle {
            if !in_rectangle(rect, station) {
                continue;
            }
        }
        if let Some(names) = &selection.name {
            let id = station.id();
            if !names.iter().any(|n| *n == id) {
                continue;
            }
        }

        let mut devices = station.devices();
        if let Some(allowed) = &allowed_devices {
            devices.retain(|d| allowed.contains(d));
            if devices.is_empty() {
                continue;
            }
        }

        matched
            .entry((station.network.clone(), station.code.clone()))
            .and_modify(|(_, existing)| existing.extend(devices.iter().copied()))
            .or_insert_with(|| (station.clone(), devices));
    }

    let resolved: Vec<SelectedStation> = matched
        .into_values()
        .filter_map(|(station, devices)| {
            let Some(device) = devices.iter().next().copied() else {
                tracing::debug!(station = %station.id(), "Skipping station without a device type");
                return None;
            };
            if devices.len() > 1 {
                tracing::debug!(
                    station = %station.id(),
                    offered = ?devices,
                    chosen = %device,
                    "Hybrid station reduced to one device type"
                );
            }
            Some(SelectedStation {
                network: station.network,
                code: station.code,
                latitude: station.latitude,
                longitude: station.longitude,
                device,
            })
        })
        .collect();

    if resolved.is_empty() {
        return Err(ConfigError::NoStations.into());
    }

    tracing::info!(stations = resolved.len(), "Resolved station selection");
    Ok(resolved)
}

fn in_circle(circle: &Circle, station: &InventoryStation) -> bool {
    let distance = great_circle_km(
        circle.latitude,
        circle.longitude,
        station.latitude,
        station.longitude,
    );
    circle.min_dist_km <= distance && distance <= circle.max_dist_km
}

fn in_rectangle(rect: &Rectangle, station: &InventoryStation) -> bool {
    (rect.west_longitude..=rect.east_longitude).contains(&station.longitude)
        && (rect.south_latitude..=rect.north_latitude).contains(&station.latitude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::Selection;
    use crate::test_support::{request, station};

    fn known() -> Vec<String> {
        vec!["KO".into(), "TK".into(), "TU".into()]
    }

    fn ids(stations: &[SelectedStation]) -> Vec<String> {
        stations.iter().map(|s| s.id()).collect()
    }

    fn rect_all() -> Selection {
        Selection {
            rectangle: Some(Rectangle {
                north_latitude: 90.0,
                west_longitude: -180.0,
                south_latitude: -90.0,
                east_longitude: 180.0,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_network_is_config_error() {
        let config = request(&["XX"], rect_all(), 10);
        let err = resolve(&config, &known(), &[]).unwrap_err();
        assert!(matches!(err, DlTdvmsError::Config(ConfigError::UnknownNetwork(ref n)) if n == "XX"));
    }

    #[test]
    fn test_empty_result_is_config_error() {
        let config = request(&["TK"], rect_all(), 10);
        let inventory = vec![station("KO", "DKL", 38.0, 27.0, "H")];
        let err = resolve(&config, &known(), &inventory).unwrap_err();
        assert!(matches!(err, DlTdvmsError::Config(ConfigError::NoStations)));
    }

    #[test]
    fn test_filters_networks_and_sorts() {
        let config = request(&["TK", "KO"], rect_all(), 10);
        let inventory = vec![
            station("TK", "3126", 37.5, 36.9, "N"),
            station("TU", "ANK", 39.9, 32.8, "H"),
            station("KO", "DKL", 38.0, 27.0, "H"),
            station("TK", "0101", 39.0, 30.0, "N"),
        ];
        let resolved = resolve(&config, &known(), &inventory).unwrap();
        assert_eq!(ids(&resolved), vec!["KO.DKL", "TK.0101", "TK.3126"]);
    }

    #[test]
    fn test_circle_band() {
        let selection = Selection {
            circle: Some(Circle {
                latitude: 0.0,
                longitude: 30.0,
                min_dist_km: 100.0,
                max_dist_km: 250.0,
            }),
            ..Default::default()
        };
        let config = request(&["TK"], selection, 10);
        let inventory = vec![
            station("TK", "NEAR", 0.5, 30.0, "H"),  // ~56 km
            station("TK", "MID", 1.5, 30.0, "H"),   // ~167 km
            station("TK", "FAR", 3.0, 30.0, "H"),   // ~334 km
        ];
        let resolved = resolve(&config, &known(), &inventory).unwrap();
        assert_eq!(ids(&resolved), vec!["TK.MID"]);
    }

    #[test]
    fn test_predicates_are_and_combined() {
        let selection = Selection {
            rectangle: Some(Rectangle {
                north_latitude: 40.0,
                west_longitude: 26.0,
                south_latitude: 36.0,
                east_longitude: 30.0,
            }),
            name: Some(vec!["KO.DKL".into(), "TK.3126".into()]),
            ..Default::default()
        };
        let config = request(&["KO", "TK"], selection, 10);
        let inventory = vec![
            station("KO", "DKL", 38.0, 27.0, "H"),
            station("TK", "3126", 37.5, 36.9, "N"), // named, outside box
            station("KO", "BALB", 39.6, 27.9, "H"), // in box, not named
        ];
        let resolved = resolve(&config, &known(), &inventory).unwrap();
        assert_eq!(ids(&resolved), vec!["KO.DKL"]);
    }

    #[test]
    fn test_hybrid_station_priority() {
        let config = request(&["TK"], rect_all(), 10);
        let inventory = vec![
            station("TK", "A", 38.0, 30.0, "HLN"),
            station("TK", "B", 38.0, 30.0, "LN"),
            station("TK", "C", 38.0, 30.0, "N"),
        ];
        let resolved = resolve(&config, &known(), &inventory).unwrap();
        let devices: Vec<DeviceType> = resolved.iter().map(|s| s.device).collect();
        assert_eq!(devices, vec![DeviceType::H, DeviceType::L, DeviceType::N]);
    }

    #[test]
    fn test_device_type_filter_narrows_hybrid_choice() {
        let selection = Selection {
            device_type: Some(vec![DeviceType::N]),
            ..Default::default()
        };
        let config = request(&["TK"], selection, 10);
        let inventory = vec![
            station("TK", "A", 38.0, 30.0, "HN"),
            station("TK", "B", 38.0, 30.0, "H"),
        ];
        let resolved = resolve(&config, &known(), &inventory).unwrap();
        assert_eq!(ids(&resolved), vec!["TK.A"]);
        assert_eq!(resolved[0].device, DeviceType::N);
    }

    #[test]
    fn test_duplicate_rows_collapse_to_one_station() {
        // the portal can list a hybrid site once per device type
        let config = request(&["TK"], rect_all(), 10);
        let inventory = vec![
            station("TK", "A", 38.0, 30.0, "N"),
            station("TK", "A", 38.0, 30.0, "H"),
            station("TK", "A", 38.0, 30.0, "L"),
        ];
        let resolved = resolve(&config, &known(), &inventory).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].device, DeviceType::H);
    }

    #[test]
    fn test_no_duplicate_ids() {
        let config = request(&["KO", "TK"], rect_all(), 10);
        let mut inventory = Vec::new();
        for i in 0..30 {
            let net = if i % 2 == 0 { "KO" } else { "TK" };
            let code = format!("S{:02}", i % 7);
            inventory.push(station(net, &code, 38.0, 30.0, ["H", "L", "N", "HN"][i % 4]));
        }
        let resolved = resolve(&config, &known(), &inventory).unwrap();
        let unique: BTreeSet<String> = resolved.iter().map(|s| s.id()).collect();
        assert_eq!(unique.len(), resolved.len());
    }

    #[test]
    fn test_malformed_inventory_row() {
        let config = request(&["TK"], rect_all(), 10);
        let inventory = vec![station("TK", "BAD", f64::NAN, 30.0, "H")];
        let err = resolve(&config, &known(), &inventory).unwrap_err();
        assert!(matches!(
            err,
            DlTdvmsError::Config(ConfigError::MalformedInventory { .. })
        ));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let config = request(&["KO", "TK"], rect_all(), 10);
        let inventory = vec![
            station("TK", "3126", 37.5, 36.9, "N"),
            station("KO", "DKL", 38.0, 27.0, "HN"),
            station("TK", "0101", 39.0, 30.0, "L"),
        ];
        let first = resolve(&config, &known(), &inventory).unwrap();
        let mut reversed = inventory.clone();
        reversed.reverse();
        let second = resolve(&config, &known(), &reversed).unwrap();
        assert_eq!(first, second);
    }
}
