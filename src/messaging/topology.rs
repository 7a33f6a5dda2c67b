//! Durable topology wiring order placement to dispatch. Declared once at
//! startup, before any message is published.

use crate::error::AppError;
use crate::messaging::broker::Broker;

/// Topic exchange for order lifecycle events.
pub const ORDER_EXCHANGE: &str = "orders";
/// Topic exchange for delivery lifecycle events.
pub const DELIVERY_EXCHANGE: &str = "deliveries";

/// Queue feeding the dispatch consumer.
pub const DISPATCH_QUEUE: &str = "delivery.dispatch";
/// Queue collecting messages whose retry budget is exhausted.
pub const DISPATCH_DEAD_LETTER_QUEUE: &str = "delivery.dispatch.dead_letter";

pub const ORDER_READY_KEY: &str = "order.ready_for_delivery";
pub const DELIVERY_ASSIGNED_KEY: &str = "delivery.assigned";
pub const DELIVERY_STATUS_KEY: &str = "delivery.status_changed";

pub fn declare_topology(broker: &Broker) -> Result<(), AppError> {
    broker.declare_exchange(ORDER_EXCHANGE);
    broker.declare_exchange(DELIVERY_EXCHANGE);

    broker.declare_queue(DISPATCH_QUEUE, true);
    broker.declare_queue(DISPATCH_DEAD_LETTER_QUEUE, true);

    broker.bind(DISPATCH_QUEUE, ORDER_EXCHANGE, ORDER_READY_KEY)?;

    Ok(())
}
