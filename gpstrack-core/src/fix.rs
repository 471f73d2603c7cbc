//! Fix model: one timestamped GPS observation, validated and rounded before storage.

use serde::{Deserialize, Serialize};

/// Coordinates are stored with 5 decimals (~1.1 m).
pub const COORD_SCALE: f64 = 1e5;

/// One `(timestamp, latitude, longitude)` observation. Timestamp is unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
}

impl Fix {
    pub fn new(timestamp: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
        }
    }

    /// Round to 5 decimals and check ranges. Used by the update engine on every incoming fix.
    pub fn validated(self) -> Result<Fix, FixValidationError> {
        if self.timestamp <= 0 {
            return Err(FixValidationError::Timestamp(self.timestamp));
        }
        let latitude = round5(self.latitude);
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(FixValidationError::Latitude(self.latitude));
        }
        let longitude = round5(self.longitude);
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(FixValidationError::Longitude(self.longitude));
        }
        Ok(Fix {
            timestamp: self.timestamp,
            latitude,
            longitude,
        })
    }

    /// Integer fields as fed to the delta encoder: seconds, lat×1e5, lon×1e5.
    pub(crate) fn scaled(&self) -> [i64; 3] {
        [
            self.timestamp,
            (self.latitude * COORD_SCALE).round() as i64,
            (self.longitude * COORD_SCALE).round() as i64,
        ]
    }

    pub(crate) fn from_scaled(values: [i64; 3]) -> Self {
        Fix {
            timestamp: values[0],
            latitude: values[1] as f64 / COORD_SCALE,
            longitude: values[2] as f64 / COORD_SCALE,
        }
    }
}

/// Round a coordinate to 5 decimals.
pub fn round5(value: f64) -> f64 {
    (value * COORD_SCALE).round() / COORD_SCALE
}

/// A single fix rejected by validation. Fix-level: the rest of the batch continues.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FixValidationError {
    #[error("timestamp {0} is not a positive unix time")]
    Timestamp(i64),
    #[error("latitude {0} out of range")]
    Latitude(f64),
    #[error("longitude {0} out of range")]
    Longitude(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validated_rounds_to_five_decimals() {
        let fix = Fix::new(1000, 60.123456, 24.987654).validated().unwrap();
        assert_eq!(fix.latitude, 60.12346);
        assert_eq!(fix.longitude, 24.98765);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(matches!(
            Fix::new(0, 0.0, 0.0).validated(),
            Err(FixValidationError::Timestamp(0))
        ));
        assert!(matches!(
            Fix::new(1, 90.5, 0.0).validated(),
            Err(FixValidationError::Latitude(_))
        ));
        assert!(matches!(
            Fix::new(1, 0.0, -180.01).validated(),
            Err(FixValidationError::Longitude(_))
        ));
        assert!(Fix::new(1, f64::NAN, 0.0).validated().is_err());
        assert!(Fix::new(1, 0.0, f64::INFINITY).validated().is_err());
    }

    #[test]
    fn accepts_bounds() {
        assert!(Fix::new(1, -90.0, 180.0).validated().is_ok());
        assert!(Fix::new(1, 90.0, -180.0).validated().is_ok());
    }

    #[test]
    fn scaled_roundtrip() {
        let fix = Fix::new(1005, 60.0001, 24.0002);
        assert_eq!(fix.scaled(), [1005, 6_000_010, 2_400_020]);
        assert_eq!(Fix::from_scaled(fix.scaled()), fix);
    }
}
