use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Lifecycle states of a delivery. Serialized kebab-case to match the
/// external contract (`"picked-up"`, `"in-transit"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Assigned => "assigned",
            DeliveryStatus::PickedUp => "picked-up",
            DeliveryStatus::InTransit => "in-transit",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Cancelled)
    }

    /// Transition table: forward-only along
    /// `assigned -> picked-up -> in-transit -> delivered`, with `cancelled`
    /// reachable from any non-terminal state. Terminal states accept nothing.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        if next == DeliveryStatus::Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (DeliveryStatus::Assigned, DeliveryStatus::PickedUp)
                | (DeliveryStatus::PickedUp, DeliveryStatus::InTransit)
                | (DeliveryStatus::InTransit, DeliveryStatus::Delivered)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: Uuid,
    pub order_id: String,
    pub driver_id: Uuid,
    pub status: DeliveryStatus,
    pub pickup_location: GeoPoint,
    pub delivery_location: GeoPoint,
    pub current_location: Option<GeoPoint>,
    pub estimated_time: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}
