use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::dispatch::status::apply_status_update;
use crate::messaging::events::DeliveryEvent;
use crate::models::delivery::{Delivery, DeliveryStatus, GeoPoint};
use crate::relay::LocationUpdate;
use crate::state::AppState;

pub mod pb {
    tonic::include_proto!("delivery");
}

use pb::delivery_service_server::DeliveryService;
use pb::{
    DeliveryEventMessage, DeliveryResponse, GetDeliveryRequest, LatLng, ListDeliveriesRequest,
    ListDeliveriesResponse, UpdateDeliveryStatusRequest, WatchDeliveryEventsRequest,
};

pub struct GrpcDeliveryService {
    state: Arc<AppState>,
}

impl GrpcDeliveryService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

fn point_to_proto(point: &GeoPoint) -> LatLng {
    LatLng {
        latitude: point.lat,
        longitude: point.lng,
    }
}

fn delivery_to_proto(delivery: &Delivery) -> DeliveryResponse {
    DeliveryResponse {
        id: delivery.id.to_string(),
        order_id: delivery.order_id.clone(),
        driver_id: delivery.driver_id.to_string(),
        status: delivery.status.as_str().to_string(),
        pickup_location: Some(point_to_proto(&delivery.pickup_location)),
        delivery_location: Some(point_to_proto(&delivery.delivery_location)),
        current_location: delivery.current_location.as_ref().map(point_to_proto),
        estimated_time: delivery.estimated_time,
        created_at: delivery.created_at.to_rfc3339(),
        started_at: delivery.started_at.map(|at| at.to_rfc3339()),
        delivered_at: delivery.delivered_at.map(|at| at.to_rfc3339()),
    }
}

fn event_to_proto(event: &DeliveryEvent) -> DeliveryEventMessage {
    match event {
        DeliveryEvent::Assigned(assigned) => DeliveryEventMessage {
            kind: "assigned".to_string(),
            delivery_id: assigned.delivery_id.to_string(),
            order_id: assigned.order_id.clone(),
            driver_id: assigned.driver_id.to_string(),
            estimated_time: assigned.estimated_time,
            status: String::new(),
        },
        DeliveryEvent::StatusChanged(changed) => DeliveryEventMessage {
            kind: "status_changed".to_string(),
            delivery_id: changed.delivery_id.to_string(),
            order_id: changed.order_id.clone(),
            driver_id: String::new(),
            estimated_time: 0,
            status: changed.status.as_str().to_string(),
        },
    }
}

fn parse_id(raw: &str) -> Result<Uuid, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument(format!("invalid delivery id: {raw}")))
}

fn parse_status(raw: &str) -> Result<DeliveryStatus, Status> {
    match raw {
        "assigned" => Ok(DeliveryStatus::Assigned),
        "picked-up" => Ok(DeliveryStatus::PickedUp),
        "in-transit" => Ok(DeliveryStatus::InTransit),
        "delivered" => Ok(DeliveryStatus::Delivered),
        "cancelled" => Ok(DeliveryStatus::Cancelled),
        other => Err(Status::invalid_argument(format!(
            "unknown status: {other}, expected assigned/picked-up/in-transit/delivered/cancelled"
        ))),
    }
}

#[tonic::async_trait]
impl DeliveryService for GrpcDeliveryService {
    async fn get_delivery(
        &self,
        request: Request<GetDeliveryRequest>,
    ) -> Result<Response<DeliveryResponse>, Status> {
        let id = parse_id(&request.into_inner().id)?;

        let delivery = self
            .state
            .store
            .get(id)
            .ok_or_else(|| Status::not_found(format!("delivery {id} not found")))?;

        Ok(Response::new(delivery_to_proto(&delivery)))
    }

    async fn list_deliveries(
        &self,
        _request: Request<ListDeliveriesRequest>,
    ) -> Result<Response<ListDeliveriesResponse>, Status> {
        let deliveries = self
            .state
            .store
            .list()
            .iter()
            .map(delivery_to_proto)
            .collect();

        Ok(Response::new(ListDeliveriesResponse { deliveries }))
    }

    async fn update_delivery_status(
        &self,
        request: Request<UpdateDeliveryStatusRequest>,
    ) -> Result<Response<DeliveryResponse>, Status> {
        let req = request.into_inner();

        let id = parse_id(&req.id)?;
        let status = parse_status(&req.status)?;
        let location = req.location.map(|point| LocationUpdate {
            latitude: point.latitude,
            longitude: point.longitude,
        });

        let delivery = apply_status_update(&self.state, id, status, location)
            .await
            .map_err(|err| match err {
                crate::error::AppError::NotFound(msg) => Status::not_found(msg),
                crate::error::AppError::Conflict(msg) => Status::failed_precondition(msg),
                other => Status::internal(other.to_string()),
            })?;

        Ok(Response::new(delivery_to_proto(&delivery)))
    }

    type WatchDeliveryEventsStream =
        Pin<Box<dyn Stream<Item = Result<DeliveryEventMessage, Status>> + Send>>;

    async fn watch_delivery_events(
        &self,
        _request: Request<WatchDeliveryEventsRequest>,
    ) -> Result<Response<Self::WatchDeliveryEventsStream>, Status> {
        let rx = self.state.delivery_events_tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|result| match result {
            Ok(event) => Some(Ok(event_to_proto(&event))),
            Err(_) => None,
        });

        Ok(Response::new(Box::pin(stream)))
    }
}
