use std::sync::Arc;

use tokio::sync::broadcast;

use crate::dispatch::consumer::RetryPolicy;
use crate::dispatch::locator::{DriverLocator, DriverRegistry};
use crate::messaging::broker::Broker;
use crate::messaging::events::DeliveryEvent;
use crate::messaging::topology::declare_topology;
use crate::observability::metrics::Metrics;
use crate::relay::RelayRooms;
use crate::store::DeliveryStore;

pub struct AppState {
    pub broker: Broker,
    pub store: DeliveryStore,
    pub drivers: Arc<DriverRegistry>,
    pub locator: Arc<dyn DriverLocator>,
    pub rooms: RelayRooms,
    pub delivery_events_tx: broadcast::Sender<DeliveryEvent>,
    pub retry: RetryPolicy,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(retry: RetryPolicy, event_buffer_size: usize) -> Self {
        let drivers = Arc::new(DriverRegistry::new());
        let locator = drivers.clone();
        Self::with_locator(retry, event_buffer_size, drivers, locator)
    }

    /// Construction seam for injecting a non-default locator, e.g. a failing
    /// one in tests.
    pub fn with_locator(
        retry: RetryPolicy,
        event_buffer_size: usize,
        drivers: Arc<DriverRegistry>,
        locator: Arc<dyn DriverLocator>,
    ) -> Self {
        let broker = Broker::new();
        declare_topology(&broker).expect("declare dispatch topology");

        let (delivery_events_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        Self {
            broker,
            store: DeliveryStore::new(),
            drivers,
            locator,
            rooms: RelayRooms::new(event_buffer_size),
            delivery_events_tx,
            retry,
            metrics: Metrics::new(),
        }
    }
}
