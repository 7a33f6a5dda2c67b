use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::geo::{estimate_minutes, haversine_km};
use crate::messaging::broker::{QueueMessage, DEFAULT_EXCHANGE};
use crate::messaging::events::{DeliveryAssigned, DeliveryEvent, DispatchMessage, DispatchRequest};
use crate::messaging::topology::{
    DELIVERY_ASSIGNED_KEY, DELIVERY_EXCHANGE, DISPATCH_DEAD_LETTER_QUEUE, DISPATCH_QUEUE,
};
use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::state::AppState;

/// Retry behavior for dispatch messages that could not be assigned.
/// `max_attempts: None` preserves retry-forever; with a bound, exhausted
/// messages move to the dead-letter queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub requeue_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded(requeue_delay: Duration) -> Self {
        Self {
            requeue_delay,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Assigned,
    Requeued,
    Discarded,
    DeadLettered,
}

impl DispatchOutcome {
    fn label(self) -> &'static str {
        match self {
            DispatchOutcome::Assigned => "assigned",
            DispatchOutcome::Requeued => "requeued",
            DispatchOutcome::Discarded => "discarded",
            DispatchOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Consumes the dispatch queue one message at a time, turning each message
/// into a delivery or deferring it.
pub async fn run_dispatch_consumer(state: Arc<AppState>) {
    let mut consumer = match state.broker.consume(DISPATCH_QUEUE) {
        Ok(consumer) => consumer,
        Err(err) => {
            error!(error = %err, "dispatch consumer failed to attach");
            return;
        }
    };

    info!("dispatch consumer started");

    while let Some(message) = consumer.recv().await {
        state
            .metrics
            .dispatch_queue_depth
            .set(state.broker.depth(DISPATCH_QUEUE) as i64);

        let start = Instant::now();
        let outcome = process_message(&state, message).await;
        let elapsed = start.elapsed().as_secs_f64();

        state
            .metrics
            .dispatch_latency_seconds
            .with_label_values(&[outcome.label()])
            .observe(elapsed);
        state
            .metrics
            .dispatch_attempts_total
            .with_label_values(&[outcome.label()])
            .inc();
    }

    warn!("dispatch consumer stopped: queue closed");
}

async fn process_message(state: &Arc<AppState>, message: QueueMessage) -> DispatchOutcome {
    let request = match decode(message.payload()) {
        Ok(request) => request,
        Err(reason) => {
            // poison message: dropping it beats an unbounded retry storm
            warn!(reason, "discarding malformed dispatch message");
            message.ack();
            return DispatchOutcome::Discarded;
        }
    };

    if let Some(max_attempts) = state.retry.max_attempts {
        if message.attempt() > max_attempts {
            error!(
                order_id = %request.order_id,
                attempts = message.attempt(),
                "dispatch retries exhausted; dead-lettering"
            );
            if let Err(err) = state.broker.publish(
                DEFAULT_EXCHANGE,
                DISPATCH_DEAD_LETTER_QUEUE,
                message.payload(),
                true,
            ) {
                error!(error = %err, "dead-letter publish failed; dropping message");
            }
            message.ack();
            return DispatchOutcome::DeadLettered;
        }
    }

    let driver = match state.locator.claim_nearest(&request.pickup).await {
        Ok(Some(driver)) => driver,
        Ok(None) => {
            warn!(order_id = %request.order_id, "no available driver; requeueing");
            message.nack_requeue(state.retry.requeue_delay);
            return DispatchOutcome::Requeued;
        }
        // a failing locator is indistinguishable from an empty driver pool
        Err(err) => {
            warn!(order_id = %request.order_id, error = %err, "driver lookup failed; requeueing");
            message.nack_requeue(state.retry.requeue_delay);
            return DispatchOutcome::Requeued;
        }
    };

    let distance_km = haversine_km(&request.pickup, &request.dropoff);
    let estimated_time = estimate_minutes(distance_km, driver.vehicle);

    let delivery = Delivery {
        id: Uuid::new_v4(),
        order_id: request.order_id.clone(),
        driver_id: driver.id,
        status: DeliveryStatus::Assigned,
        pickup_location: request.pickup,
        delivery_location: request.dropoff,
        current_location: None,
        estimated_time,
        created_at: Utc::now(),
        started_at: None,
        delivered_at: None,
    };

    state.store.insert(delivery.clone());
    state.metrics.deliveries_active.inc();

    let event = DeliveryAssigned {
        delivery_id: delivery.id,
        order_id: delivery.order_id.clone(),
        driver_id: driver.id,
        estimated_time,
    };

    match serde_json::to_vec(&event) {
        Ok(payload) => {
            if let Err(err) =
                state
                    .broker
                    .publish(DELIVERY_EXCHANGE, DELIVERY_ASSIGNED_KEY, &payload, true)
            {
                error!(error = %err, delivery_id = %delivery.id, "failed to publish assignment event");
            }
        }
        Err(err) => {
            error!(error = %err, delivery_id = %delivery.id, "failed to serialize assignment event");
        }
    }

    let _ = state.delivery_events_tx.send(DeliveryEvent::Assigned(event));

    info!(
        order_id = %delivery.order_id,
        delivery_id = %delivery.id,
        driver_id = %driver.id,
        eta_minutes = estimated_time,
        "delivery assigned"
    );

    message.ack();
    DispatchOutcome::Assigned
}

fn decode(payload: &[u8]) -> Result<DispatchRequest, &'static str> {
    let message: DispatchMessage =
        serde_json::from_slice(payload).map_err(|_| "payload is not a dispatch message")?;
    message.validate()
}
