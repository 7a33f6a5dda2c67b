use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::delivery::GeoPoint;
use crate::models::driver::Driver;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("driver {0} not found")]
    DriverNotFound(Uuid),

    #[error("driver lookup failed: {0}")]
    Unavailable(String),
}

/// Port to the driver-lookup collaborator. `claim_nearest` is a
/// claim-exchange: the returned driver is already marked unavailable, so two
/// concurrent claims can never both win the same driver.
#[async_trait]
pub trait DriverLocator: Send + Sync {
    async fn claim_nearest(&self, pickup: &GeoPoint) -> Result<Option<Driver>, LocatorError>;

    async fn set_available(&self, driver_id: Uuid, available: bool) -> Result<(), LocatorError>;
}

/// In-memory driver registry backing the locator port and the drivers REST
/// surface.
pub struct DriverRegistry {
    drivers: DashMap<Uuid, Driver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: DashMap::new(),
        }
    }

    pub fn insert(&self, driver: Driver) {
        self.drivers.insert(driver.id, driver);
    }

    pub fn get(&self, id: Uuid) -> Option<Driver> {
        self.drivers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Driver> {
        self.drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn update_location(&self, id: Uuid, point: GeoPoint) -> Result<Driver, AppError> {
        let mut driver = self
            .drivers
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))?;

        driver.location = point;
        driver.updated_at = Utc::now();
        Ok(driver.clone())
    }

    pub fn set_availability(&self, id: Uuid, available: bool) -> Result<Driver, AppError> {
        let mut driver = self
            .drivers
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))?;

        driver.is_available = available;
        driver.updated_at = Utc::now();
        Ok(driver.clone())
    }
}

#[async_trait]
impl DriverLocator for DriverRegistry {
    async fn claim_nearest(&self, pickup: &GeoPoint) -> Result<Option<Driver>, LocatorError> {
        loop {
            // Equidistant candidates tie-break on the lower driver id so
            // selection is deterministic.
            let nearest = self
                .drivers
                .iter()
                .filter(|entry| entry.value().is_available)
                .map(|entry| {
                    let driver = entry.value();
                    (haversine_km(&driver.location, pickup), driver.id)
                })
                .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            let Some((_, id)) = nearest else {
                return Ok(None);
            };

            if let Some(mut driver) = self.drivers.get_mut(&id) {
                if driver.is_available {
                    driver.is_available = false;
                    driver.updated_at = Utc::now();
                    return Ok(Some(driver.clone()));
                }
            }
            // lost the claim race, rescan
        }
    }

    async fn set_available(&self, driver_id: Uuid, available: bool) -> Result<(), LocatorError> {
        let mut driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or(LocatorError::DriverNotFound(driver_id))?;

        driver.is_available = available;
        driver.updated_at = Utc::now();
        Ok(())
    }
}
