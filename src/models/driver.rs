use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::delivery::GeoPoint;

/// Vehicle categories with distinct average speeds. Unrecognized values
/// deserialize to `Other`, which is estimated like a bike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Bike,
    Scooter,
    Car,
    Truck,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub vehicle: VehicleType,
    pub location: GeoPoint,
    pub is_available: bool,
    pub updated_at: DateTime<Utc>,
}
