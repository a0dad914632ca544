//! Bearer token extraction.
//!
//! When `AUTH_TOKEN` is configured every request must carry it as a bearer
//! token. Without it the server accepts anonymous devices.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use stockcount_sync::remote::DEVICE_ID_HEADER;

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller, identified by its device id header.
#[derive(Debug, Clone)]
pub struct AuthDevice {
    pub device_id: Option<String>,
}

impl FromRequestParts<AppState> for AuthDevice {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let device_id = parts
            .headers
            .get(DEVICE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let Some(expected) = state.config.auth_token.as_deref() else {
            return Ok(AuthDevice { device_id });
        };

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match auth_header.and_then(|header| header.strip_prefix("Bearer ")) {
            Some(token) if token == expected => Ok(AuthDevice { device_id }),
            Some(_) => Err(AppError::Unauthorized("invalid bearer token")),
            None => Err(AppError::Unauthorized("missing bearer token")),
        }
    }
}
