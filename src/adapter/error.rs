//! Tipos de erro de transporte dos adaptadores de ferramentas.
//!
//! Define [`AdapterError`] com variantes para rate limiting, status de erro da
//! ferramenta, falhas de rede, estouro do prazo por chamada e respostas
//! inutilizáveis. [`AdapterError::class`] mapeia cada variante para um
//! [`ErrorClass`] do motor.

use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorClass;

#[derive(Debug, Error)]
pub enum AdapterError {
    /// HTTP 429. `retry_after_ms` comes from the `retry-after` header.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success status, with the response body as message.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AdapterError::RateLimited { .. } => ErrorClass::RateLimited,
            AdapterError::Api { status, message } => match status {
                429 => ErrorClass::RateLimited,
                401 | 403 => ErrorClass::AuthFailed,
                400 | 422 => ErrorClass::InvalidInput,
                404 | 502 | 503 => ErrorClass::Unavailable,
                507 => ErrorClass::InsufficientResources,
                408 | 504 => ErrorClass::Timeout,
                _ => ErrorClass::classify(message),
            },
            AdapterError::Network(e) if e.is_timeout() => ErrorClass::Timeout,
            AdapterError::Network(e) if e.is_connect() => ErrorClass::Unavailable,
            AdapterError::Network(e) => ErrorClass::classify(&e.to_string()),
            AdapterError::Timeout(_) => ErrorClass::Timeout,
            AdapterError::InvalidResponse(_) => ErrorClass::Unknown,
            AdapterError::Other(message) => ErrorClass::classify(message),
        }
    }

    /// Wait the tool asked for before the next attempt, if it said.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::RateLimited { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}
