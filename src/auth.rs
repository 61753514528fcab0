use crate::error::{AppError, AppResult};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use std::sync::Arc;

/// Shared-secret check for the `/v1/*` routes.
#[derive(Clone)]
pub struct AuthState {
    expected_header: Arc<str>,
}

impl AuthState {
    pub fn new(api_key: &str) -> Self {
        Self {
            expected_header: Arc::from(format!("Bearer {api_key}")),
        }
    }

    /// Accepts only an exact `Authorization: Bearer <secret>` header.
    pub fn authorize(&self, headers: &HeaderMap) -> AppResult<()> {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(AppError::invalid_api_key)?;
        if !constant_time_eq(presented.as_bytes(), self.expected_header.as_bytes()) {
            return Err(AppError::invalid_api_key());
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
