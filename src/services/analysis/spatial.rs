use h3o::{CellIndex, LatLng, Resolution};

pub const DEFAULT_H3_RESOLUTION: u8 = 9;
pub const MAX_H3_RESOLUTION: u8 = 15;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SpatialError {
    #[error("h3 resolution {0} is outside 0..=15")]
    InvalidResolution(u8),
    #[error("invalid coordinate ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },
}

pub fn resolution(value: u8) -> Result<Resolution, SpatialError> {
    Resolution::try_from(value).map_err(|_| SpatialError::InvalidResolution(value))
}

/// Maps a point to the H3 cell containing it. Pure and deterministic.
pub fn cell_for(lat: f64, lon: f64, resolution_value: u8) -> Result<CellIndex, SpatialError> {
    let res = resolution(resolution_value)?;
    let point = LatLng::new(lat, lon).map_err(|_| SpatialError::InvalidCoordinate { lat, lon })?;
    Ok(point.to_cell(res))
}

pub fn cell_center(cell: CellIndex) -> (f64, f64) {
    let center = LatLng::from(cell);
    (center.lat(), center.lng())
}

pub fn parse_cell(value: &str) -> Option<CellIndex> {
    value.trim().parse::<CellIndex>().ok()
}

/// Range check plus the `(0, 0)` / `(-1, -1)` placeholders that geocoders emit for
/// unknown locations.
pub fn is_plausible_coordinate(lat: f64, lon: f64) -> bool {
    if !lat.is_finite() || !lon.is_finite() {
        return false;
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return false;
    }
    !((lat == 0.0 && lon == 0.0) || (lat == -1.0 && lon == -1.0))
}
