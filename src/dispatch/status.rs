//! Driver-initiated status updates, shared by the REST and gRPC surfaces.

use std::sync::Arc;

use tracing::{error, warn};

use crate::error::AppError;
use crate::messaging::events::{DeliveryEvent, DeliveryStatusChanged};
use crate::messaging::topology::{DELIVERY_EXCHANGE, DELIVERY_STATUS_KEY};
use crate::models::delivery::{Delivery, DeliveryStatus, GeoPoint};
use crate::relay::LocationUpdate;
use crate::state::AppState;

/// Validates and applies one status transition, then runs its side effects:
/// publish `delivery.status_changed` for the order subsystem, fan the attached
/// location out to the delivery's room, and release the driver when the
/// delivery reaches a terminal state.
pub async fn apply_status_update(
    state: &Arc<AppState>,
    id: uuid::Uuid,
    next: DeliveryStatus,
    location: Option<LocationUpdate>,
) -> Result<Delivery, AppError> {
    let point = location.map(|update| GeoPoint {
        lat: update.latitude,
        lng: update.longitude,
    });

    let delivery = state.store.transition(id, next, point)?;

    if let Some(update) = location {
        state.rooms.publish(id, update);
    }

    if delivery.status.is_terminal() {
        state.metrics.deliveries_active.dec();
        // the driver goes back into the pool; a failed release leaves them
        // parked unavailable until the next manual availability update
        if let Err(err) = state.locator.set_available(delivery.driver_id, true).await {
            warn!(
                delivery_id = %delivery.id,
                driver_id = %delivery.driver_id,
                error = %err,
                "failed to release driver after terminal transition"
            );
        }
    }

    let event = DeliveryStatusChanged {
        delivery_id: delivery.id,
        order_id: delivery.order_id.clone(),
        status: delivery.status,
    };

    match serde_json::to_vec(&event) {
        Ok(payload) => {
            if let Err(err) =
                state
                    .broker
                    .publish(DELIVERY_EXCHANGE, DELIVERY_STATUS_KEY, &payload, true)
            {
                error!(error = %err, delivery_id = %delivery.id, "failed to publish status event");
            }
        }
        Err(err) => {
            error!(error = %err, delivery_id = %delivery.id, "failed to serialize status event");
        }
    }

    let _ = state
        .delivery_events_tx
        .send(DeliveryEvent::StatusChanged(event));

    Ok(delivery)
}
