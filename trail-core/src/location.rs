//! Location payload carried inside a marker-delimited record.
//!
//! The text form is a JSON object, `{"latitude":..,"longitude":..}`, in decimal
//! degrees on WGS-84.

use serde::{Deserialize, Serialize};

use crate::frame::encode_location_record;
use crate::geo;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("malformed location text: {0}")]
    Json(#[from] serde_json::Error),
    #[error("coordinate out of range: latitude {latitude}, longitude {longitude}")]
    OutOfRange { latitude: f64, longitude: f64 },
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Rejects non-finite values and anything off the globe.
    pub fn validate(&self) -> Result<(), LocationError> {
        let ok = self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude);
        if ok {
            Ok(())
        } else {
            Err(LocationError::OutOfRange {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }

    pub fn to_text(&self) -> Result<String, LocationError> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self, LocationError> {
        let coord: Coordinate = serde_json::from_str(text.trim())?;
        coord.validate()?;
        Ok(coord)
    }

    /// Text form wrapped in record markers.
    pub fn to_record(&self) -> Result<Vec<u8>, LocationError> {
        Ok(encode_location_record(&self.to_text()?))
    }

    /// Geodesic distance in metres.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        geo::distance(self, other)
    }
}
