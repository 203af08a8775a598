// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Great-circle distance helpers.

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Calculate distance between two lat/lng points using the Haversine formula (in meters).
///
/// Spherical model only; no ellipsoid correction is applied.
#[must_use]
pub fn distance_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lng = (lng2 - lng1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Latitude offset in degrees for a northward displacement of `meters`.
///
/// Handy for placing a point at a known distance due north of another.
#[must_use]
pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    (meters / EARTH_RADIUS_METERS).to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to_self_is_zero() {
        assert!(distance_meters(25.0330, 121.5654, 25.0330, 121.5654).abs() < f64::EPSILON);
        assert!(distance_meters(-33.8688, 151.2093, -33.8688, 151.2093).abs() < f64::EPSILON);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let points = [
            (25.0330, 121.5654),
            (33.9425, -118.4081),
            (40.6413, -73.7781),
            (-33.8688, 151.2093),
        ];
        for &(lat1, lng1) in &points {
            for &(lat2, lng2) in &points {
                let ab = distance_meters(lat1, lng1, lat2, lng2);
                let ba = distance_meters(lat2, lng2, lat1, lng1);
                assert!((ab - ba).abs() < 1e-6, "{ab} != {ba}");
            }
        }
    }

    #[test]
    fn test_lax_to_jfk() {
        // LAX to JFK is approximately 3,983 km
        let distance = distance_meters(33.9425, -118.4081, 40.6413, -73.7781);
        assert!((distance - 3_983_000.0).abs() < 15_000.0);
    }

    #[test]
    fn test_meters_to_lat_degrees_round_trip() {
        let lat = 25.0330;
        let north = lat + meters_to_lat_degrees(150.0);
        let distance = distance_meters(lat, 121.5654, north, 121.5654);
        assert!((distance - 150.0).abs() < 0.01);
    }
}
