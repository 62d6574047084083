//! Geographic primitives used to bias priority toward the viewpoint.
//!
//! Points and envelopes are WGS84 degrees. Envelopes do not wrap the
//! antimeridian; callers split such extents before submitting.

use std::f64::consts::PI;

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A geographic point in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    /// Latitude in degrees (-90.0 to 90.0)
    pub lat: f64,
    /// Longitude in degrees (-180.0 to 180.0)
    pub lon: f64,
}

impl GeoPoint {
    /// Creates a point from latitude and longitude in degrees.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Returns true if both coordinates are within their valid ranges.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance to another point in meters.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        haversine_distance(self, other)
    }
}

/// An axis-aligned geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Envelope {
    /// An envelope with no known extent.
    ///
    /// Never contains the viewpoint and has no distance to it, so requests
    /// using it rank behind every request with known bounds in the
    /// geographic tie-breaks.
    pub const UNKNOWN: Envelope = Envelope {
        min_lon: f64::NAN,
        min_lat: f64::NAN,
        max_lon: f64::NAN,
        max_lat: f64::NAN,
    };

    /// Creates an envelope from its bounds.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Creates the smallest envelope covering two corner points.
    pub fn from_corners(a: GeoPoint, b: GeoPoint) -> Self {
        Self {
            min_lon: a.lon.min(b.lon),
            min_lat: a.lat.min(b.lat),
            max_lon: a.lon.max(b.lon),
            max_lat: a.lat.max(b.lat),
        }
    }

    /// Returns true if all bounds are finite and min <= max on both axes.
    pub fn is_valid(&self) -> bool {
        self.min_lon.is_finite()
            && self.min_lat.is_finite()
            && self.max_lon.is_finite()
            && self.max_lat.is_finite()
            && self.min_lon <= self.max_lon
            && self.min_lat <= self.max_lat
    }

    /// Returns true if the point lies inside or on the boundary.
    pub fn contains(&self, point: &GeoPoint) -> bool {
        self.is_valid()
            && point.is_valid()
            && (self.min_lon..=self.max_lon).contains(&point.lon)
            && (self.min_lat..=self.max_lat).contains(&point.lat)
    }

    /// Returns the point of the envelope closest to `point`.
    ///
    /// `None` if either the envelope or the point is not valid.
    pub fn nearest_point(&self, point: &GeoPoint) -> Option<GeoPoint> {
        if !self.is_valid() || !point.is_valid() {
            return None;
        }
        Some(GeoPoint {
            lat: point.lat.clamp(self.min_lat, self.max_lat),
            lon: point.lon.clamp(self.min_lon, self.max_lon),
        })
    }

    /// Distance in meters from `point` to the nearest point of the envelope.
    ///
    /// Zero when the envelope contains the point; `None` when it cannot be
    /// computed.
    pub fn distance_to(&self, point: &GeoPoint) -> Option<f64> {
        self.nearest_point(point)
            .map(|nearest| haversine_distance(&nearest, point))
    }

    /// Returns the center of the envelope.
    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lat: (self.min_lat + self.max_lat) / 2.0,
            lon: (self.min_lon + self.max_lon) / 2.0,
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Great-circle distance between two points in meters.
#[inline]
pub fn haversine_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let to_rad = PI / 180.0;
    let lat1 = a.lat * to_rad;
    let lat2 = b.lat * to_rad;
    let dlat = (b.lat - a.lat) * to_rad;
    let dlon = (b.lon - a.lon) * to_rad;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}
