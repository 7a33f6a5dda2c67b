use crate::models::delivery::GeoPoint;
use crate::models::driver::VehicleType;

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Average speed in km/h per vehicle category.
pub fn vehicle_speed_kmh(vehicle: VehicleType) -> f64 {
    match vehicle {
        VehicleType::Bike => 20.0,
        VehicleType::Scooter => 30.0,
        VehicleType::Car => 40.0,
        VehicleType::Truck => 25.0,
        // unrecognized vehicles pace like bikes
        VehicleType::Other => 20.0,
    }
}

/// Travel estimate in whole minutes, rounded up. Computed once at assignment
/// and stored on the delivery, never recomputed.
pub fn estimate_minutes(distance_km: f64, vehicle: VehicleType) -> u32 {
    (distance_km / vehicle_speed_kmh(vehicle) * 60.0).ceil() as u32
}
