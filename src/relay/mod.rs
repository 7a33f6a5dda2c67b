//! Realtime location relay: ingestion of periodic driver position reports and
//! room-scoped fan-out to tracking subscribers. Fan-out is best effort — no
//! replay for late joiners, no ordering guarantee between racing updates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::delivery::{Delivery, GeoPoint};
use crate::state::AppState;

/// Default sampling period for a driver client reporting its position.
pub const DEFAULT_REPORT_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Broadcast rooms keyed by delivery id. Rooms are created lazily on first
/// subscribe and dropped once their last subscriber is gone.
pub struct RelayRooms {
    rooms: DashMap<Uuid, broadcast::Sender<LocationUpdate>>,
    buffer: usize,
}

impl RelayRooms {
    pub fn new(buffer: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            buffer,
        }
    }

    pub fn subscribe(&self, delivery_id: Uuid) -> broadcast::Receiver<LocationUpdate> {
        self.rooms
            .entry(delivery_id)
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe()
    }

    /// Pushes an update to everyone currently in the room. Returns how many
    /// subscribers were reached; an empty room swallows the update.
    pub fn publish(&self, delivery_id: Uuid, update: LocationUpdate) -> usize {
        let reached = match self.rooms.get(&delivery_id) {
            Some(tx) => tx.send(update).unwrap_or(0),
            None => return 0,
        };

        if reached == 0 {
            self.rooms
                .remove_if(&delivery_id, |_, tx| tx.receiver_count() == 0);
        }

        reached
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Persists a reported position to the delivery record and fans it out to the
/// delivery's room.
pub fn record_location(
    state: &AppState,
    delivery_id: Uuid,
    update: LocationUpdate,
) -> Result<Delivery, AppError> {
    let delivery = state.store.update_location(
        delivery_id,
        GeoPoint {
            lat: update.latitude,
            lng: update.longitude,
        },
    )?;

    state.metrics.location_updates_total.inc();
    state.rooms.publish(delivery_id, update);

    Ok(delivery)
}

/// Source of position samples for an active driver, typically the device
/// geolocation behind the driver's client.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn sample(&self) -> Result<LocationUpdate, AppError>;
}

/// Ingestion loop for one delivery: sample the source every `period` and push
/// the latest position. Failures are logged and dropped — the next tick
/// supersedes. The loop ends when the delivery reaches a terminal state.
pub async fn run_location_reporter(
    state: Arc<AppState>,
    delivery_id: Uuid,
    source: Arc<dyn LocationSource>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match state.store.get(delivery_id) {
            Some(delivery) if delivery.status.is_terminal() => {
                info!(%delivery_id, "delivery closed; stopping location reports");
                break;
            }
            Some(_) => {}
            None => {
                warn!(%delivery_id, "delivery not found; stopping location reports");
                break;
            }
        }

        match source.sample().await {
            Ok(update) => {
                if let Err(err) = record_location(&state, delivery_id, update) {
                    warn!(%delivery_id, error = %err, "dropping location report");
                }
            }
            Err(err) => {
                warn!(%delivery_id, error = %err, "location sample failed; dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{LocationUpdate, RelayRooms};

    #[tokio::test]
    async fn subscribers_receive_published_updates() {
        let rooms = RelayRooms::new(16);
        let delivery_id = Uuid::from_u128(1);

        let mut first = rooms.subscribe(delivery_id);
        let mut second = rooms.subscribe(delivery_id);

        let update = LocationUpdate {
            latitude: 6.93,
            longitude: 79.87,
        };
        assert_eq!(rooms.publish(delivery_id, update), 2);

        assert!((first.recv().await.unwrap().latitude - 6.93).abs() < 1e-9);
        assert!((second.recv().await.unwrap().longitude - 79.87).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rooms_are_isolated_by_delivery() {
        let rooms = RelayRooms::new(16);
        let mut other = rooms.subscribe(Uuid::from_u128(2));

        rooms.publish(
            Uuid::from_u128(1),
            LocationUpdate {
                latitude: 1.0,
                longitude: 2.0,
            },
        );

        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_room_is_garbage_collected() {
        let rooms = RelayRooms::new(16);
        let delivery_id = Uuid::from_u128(1);

        let rx = rooms.subscribe(delivery_id);
        assert_eq!(rooms.room_count(), 1);
        drop(rx);

        let update = LocationUpdate {
            latitude: 1.0,
            longitude: 2.0,
        };
        assert_eq!(rooms.publish(delivery_id, update), 0);
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn publish_to_unknown_room_reaches_nobody() {
        let rooms = RelayRooms::new(16);
        let update = LocationUpdate {
            latitude: 1.0,
            longitude: 2.0,
        };
        assert_eq!(rooms.publish(Uuid::from_u128(9), update), 0);
    }
}
