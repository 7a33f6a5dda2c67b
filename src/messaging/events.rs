//! Wire schemas for broker payloads. Every payload crossing the broker is one
//! of these explicit shapes; the dispatch consumer validates before any
//! business logic runs, and invalid shapes take the discard path.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::delivery::{DeliveryStatus, GeoPoint};

/// GeoJSON-style position: `[longitude, latitude]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePoint {
    pub coordinates: Vec<f64>,
}

impl WirePoint {
    fn to_point(&self) -> Option<GeoPoint> {
        match self.coordinates.as_slice() {
            [lng, lat] if lng.is_finite() && lat.is_finite() => {
                Some(GeoPoint { lat: *lat, lng: *lng })
            }
            _ => None,
        }
    }
}

/// Event notifying the delivery subsystem that an order is ready for driver
/// assignment. Both locations are optional at the wire level so that a
/// malformed publish still decodes far enough to be recognized as poison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    pub order_id: String,
    #[serde(default)]
    pub restaurant_location: Option<WirePoint>,
    #[serde(default)]
    pub delivery_location: Option<WirePoint>,
}

/// A fully validated dispatch request, safe to hand to the assignment logic.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub order_id: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
}

impl DispatchMessage {
    pub fn validate(self) -> Result<DispatchRequest, &'static str> {
        let pickup = self
            .restaurant_location
            .as_ref()
            .and_then(WirePoint::to_point)
            .ok_or("missing or invalid restaurantLocation coordinates")?;

        let dropoff = self
            .delivery_location
            .as_ref()
            .and_then(WirePoint::to_point)
            .ok_or("missing or invalid deliveryLocation coordinates")?;

        Ok(DispatchRequest {
            order_id: self.order_id,
            pickup,
            dropoff,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAssigned {
    pub delivery_id: Uuid,
    pub order_id: String,
    pub driver_id: Uuid,
    pub estimated_time: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatusChanged {
    pub delivery_id: Uuid,
    pub order_id: String,
    pub status: DeliveryStatus,
}

/// Broadcast fan-out of delivery lifecycle events for watch streams.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    Assigned(DeliveryAssigned),
    StatusChanged(DeliveryStatusChanged),
}
