//! Local tangent-plane helpers (equirectangular approximation around an origin).

use std::f64::consts::PI;

const R: f64 = 6_371_000.0;

/// Latitude/longitude to (east, north) meters relative to the origin.
pub fn latlon_to_meters(lat: f64, lon: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let d_lat = (lat - origin_lat).to_radians();
    let d_lon = (lon - origin_lon).to_radians();
    let x = R * d_lon * origin_lat.to_radians().cos();
    let y = R * d_lat;
    (x, y)
}

pub fn meters_to_latlon(x: f64, y: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let d_lat = y / R;
    let d_lon = x / (R * origin_lat.to_radians().cos());
    let lat = origin_lat + d_lat.to_degrees();
    let lon = origin_lon + d_lon.to_degrees();
    (lat, lon)
}

pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    R * c
}

/// Wrap an angle to (-π, π].
pub fn wrap_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

/// Ground speed + course (degrees, clockwise from north) to (v_east, v_north).
pub fn course_to_velocity(speed: f64, course_deg: f64) -> (f64, f64) {
    let course = course_deg.to_radians();
    (speed * course.sin(), speed * course.cos())
}
