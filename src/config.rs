use std::env;
use std::time::Duration;

use crate::dispatch::consumer::RetryPolicy;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub grpc_port: u16,
    pub log_level: String,
    pub requeue_delay_ms: u64,
    /// 0 keeps the retry-forever behavior; any other value bounds redelivery
    /// before the message is dead-lettered.
    pub max_dispatch_attempts: u32,
    pub event_buffer_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            grpc_port: parse_or_default("GRPC_PORT", 50051)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            requeue_delay_ms: parse_or_default("REQUEUE_DELAY_MS", 5_000)?,
            max_dispatch_attempts: parse_or_default("MAX_DISPATCH_ATTEMPTS", 0)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            requeue_delay: Duration::from_millis(self.requeue_delay_ms),
            max_attempts: (self.max_dispatch_attempts > 0).then_some(self.max_dispatch_attempts),
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
