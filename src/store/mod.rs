use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::delivery::{Delivery, DeliveryStatus, GeoPoint};

/// In-memory delivery record store. Deliveries are created once by the
/// dispatch consumer, mutated through `transition` and `update_location`, and
/// never deleted.
pub struct DeliveryStore {
    deliveries: DashMap<Uuid, Delivery>,
}

impl DeliveryStore {
    pub fn new() -> Self {
        Self {
            deliveries: DashMap::new(),
        }
    }

    pub fn insert(&self, delivery: Delivery) {
        self.deliveries.insert(delivery.id, delivery);
    }

    pub fn get(&self, id: Uuid) -> Option<Delivery> {
        self.deliveries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Delivery> {
        self.deliveries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn find_by_order(&self, order_id: &str) -> Option<Delivery> {
        self.deliveries
            .iter()
            .find(|entry| entry.value().order_id == order_id)
            .map(|entry| entry.value().clone())
    }

    /// Applies a driver-initiated status transition, enforcing the transition
    /// table. Stamps `started_at` on pickup and `delivered_at` on delivery,
    /// and persists the optional location attached to the status call.
    pub fn transition(
        &self,
        id: Uuid,
        next: DeliveryStatus,
        location: Option<GeoPoint>,
    ) -> Result<Delivery, AppError> {
        let mut delivery = self
            .deliveries
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("delivery {id} not found")))?;

        if !delivery.status.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "invalid status transition {:?} -> {:?} for delivery {id}",
                delivery.status, next
            )));
        }

        delivery.status = next;
        match next {
            DeliveryStatus::PickedUp => delivery.started_at = Some(Utc::now()),
            DeliveryStatus::Delivered => delivery.delivered_at = Some(Utc::now()),
            _ => {}
        }
        if let Some(point) = location {
            delivery.current_location = Some(point);
        }

        Ok(delivery.clone())
    }

    /// Relay ingestion path: overwrite the live location. Terminal deliveries
    /// accept no further reports.
    pub fn update_location(&self, id: Uuid, point: GeoPoint) -> Result<Delivery, AppError> {
        let mut delivery = self
            .deliveries
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("delivery {id} not found")))?;

        if delivery.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "delivery {id} is {:?}; location reports are closed",
                delivery.status
            )));
        }

        delivery.current_location = Some(point);
        Ok(delivery.clone())
    }

    pub fn active_count(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|entry| !entry.value().status.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }
}
