//! Fixed-point coordinates and bounding boxes.
//!
//! Map coordinates are stored as signed 64-bit nanodegrees so that encode /
//! decode round trips are exact. Conversion to `f64` degrees is provided for
//! query boundaries and the text format; nine decimal places survive the
//! round trip for the whole WGS84 range.

use geo::{Coord, Rect};
use thiserror::Error;

/// Number of nanodegrees in one degree.
pub const NANOS_PER_DEGREE: i64 = 1_000_000_000;

/// A fixed-point angle in nanodegrees.
///
/// # Examples
///
/// ```
/// use meridian_core::NanoDegrees;
///
/// let lat = NanoDegrees::from_degrees(50.7360206);
/// assert_eq!(lat.nanos(), 50_736_020_600);
/// assert_eq!(lat.degrees(), 50.7360206);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NanoDegrees(i64);

impl NanoDegrees {
    /// Construct from a raw nanodegree count.
    #[must_use]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Construct from degrees, rounding to the nearest nanodegree.
    ///
    /// WGS84 degrees scaled to nanodegrees stay well below 2^53, so the
    /// conversion is exact for nine decimal places.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_degrees(degrees: f64) -> Self {
        Self((degrees * NANOS_PER_DEGREE as f64).round() as i64)
    }

    /// The raw nanodegree count.
    #[must_use]
    pub const fn nanos(self) -> i64 {
        self.0
    }

    /// The value in degrees.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn degrees(self) -> f64 {
        self.0 as f64 / NANOS_PER_DEGREE as f64
    }
}

/// Errors raised when validating a [`BoundingBox`].
#[derive(Debug, Error, PartialEq)]
pub enum BoundingBoxError {
    /// A longitude bound was outside [-180, 180].
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    /// A latitude bound was outside [-90, 90].
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    /// The minimum corner exceeded the maximum corner on an axis.
    #[error("bounding box minimum ({min}) exceeds maximum ({max})")]
    Inverted {
        /// Minimum bound on the offending axis.
        min: f64,
        /// Maximum bound on the offending axis.
        max: f64,
    },
}

/// An axis-aligned lon/lat rectangle.
///
/// Used as a spatial query predicate and as an optional payload marker in the
/// interchange formats. Axis order follows the usual
/// (min-lon, min-lat, max-lon, max-lat) convention. Regions crossing the
/// antimeridian are not modelled; callers split those into two boxes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundingBox {
    /// Western bound in degrees.
    pub min_lon: f64,
    /// Southern bound in degrees.
    pub min_lat: f64,
    /// Eastern bound in degrees.
    pub max_lon: f64,
    /// Northern bound in degrees.
    pub max_lat: f64,
}

impl BoundingBox {
    /// Validates and constructs a [`BoundingBox`].
    pub fn new(
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    ) -> Result<Self, BoundingBoxError> {
        for lon in [min_lon, max_lon] {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(BoundingBoxError::LongitudeOutOfRange(lon));
            }
        }
        for lat in [min_lat, max_lat] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(BoundingBoxError::LatitudeOutOfRange(lat));
            }
        }
        if min_lon > max_lon {
            return Err(BoundingBoxError::Inverted {
                min: min_lon,
                max: max_lon,
            });
        }
        if min_lat > max_lat {
            return Err(BoundingBoxError::Inverted {
                min: min_lat,
                max: max_lat,
            });
        }
        Ok(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    /// Whether the given fixed-point position lies inside the box.
    ///
    /// Containment includes boundary points, matching the store's bbox
    /// predicate.
    #[must_use]
    pub fn contains(&self, lon: NanoDegrees, lat: NanoDegrees) -> bool {
        let lon = lon.degrees();
        let lat = lat.degrees();
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    /// The box as a `geo` rectangle with `x = longitude`, `y = latitude`.
    #[must_use]
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.min_lon,
                y: self.min_lat,
            },
            Coord {
                x: self.max_lon,
                y: self.max_lat,
            },
        )
    }

    /// Build a box from a `geo` rectangle.
    pub fn from_rect(rect: &Rect<f64>) -> Result<Self, BoundingBoxError> {
        Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 0)]
    #[case(50.7360206, 50_736_020_600)]
    #[case(-0.9901428, -990_142_800)]
    #[case(180.0, 180_000_000_000)]
    fn nanodegrees_round_trip(#[case] degrees: f64, #[case] nanos: i64) {
        let fixed = NanoDegrees::from_degrees(degrees);
        assert_eq!(fixed.nanos(), nanos);
        assert_eq!(fixed.degrees(), degrees);
    }

    #[rstest]
    fn bbox_rejects_inverted_bounds() {
        let result = BoundingBox::new(1.0, 0.0, -1.0, 1.0);
        assert!(matches!(result, Err(BoundingBoxError::Inverted { .. })));
    }

    #[rstest]
    #[case(-181.0)]
    #[case(181.0)]
    fn bbox_rejects_out_of_range_longitude(#[case] lon: f64) {
        let result = BoundingBox::new(lon, 0.0, 0.0, 1.0);
        assert!(matches!(
            result,
            Err(BoundingBoxError::LongitudeOutOfRange(_))
        ));
    }

    #[rstest]
    fn bbox_contains_boundary_points() {
        let bbox = BoundingBox::new(-1.0, -1.0, 1.0, 1.0).unwrap();
        assert!(bbox.contains(
            NanoDegrees::from_degrees(-1.0),
            NanoDegrees::from_degrees(0.0)
        ));
        assert!(!bbox.contains(
            NanoDegrees::from_degrees(-1.0000001),
            NanoDegrees::from_degrees(0.0)
        ));
    }

    #[rstest]
    fn bbox_rect_round_trip() {
        let bbox = BoundingBox::new(-1.1473846, 50.7360206, -0.9901428, 50.8649113).unwrap();
        let rect = bbox.to_rect();
        assert_eq!(BoundingBox::from_rect(&rect).unwrap(), bbox);
    }
}
