//! Request-scoped context extracted from HTTP requests.
//!
//! Caller identity is verified upstream by the auth gateway, which forwards
//! it in `X-Owner-Id`. This service only parses it.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use kiln_id::{OwnerId, RequestId};

use crate::api::error::ApiError;

pub const OWNER_HEADER: &str = "x-owner-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub owner: Option<OwnerId>,
}

impl RequestContext {
    /// The verified caller, or 401.
    pub fn require_owner(&self) -> Result<OwnerId, ApiError> {
        self.owner.ok_or_else(|| {
            ApiError::unauthorized("missing_identity", "X-Owner-Id header is required")
                .with_request_id(self.request_id.clone())
        })
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());

        let owner = match header_string(&parts.headers, OWNER_HEADER) {
            None => None,
            Some(raw) => Some(raw.parse::<OwnerId>().map_err(|e| {
                ApiError::unauthorized("invalid_identity", format!("invalid X-Owner-Id: {e}"))
                    .with_request_id(request_id.clone())
            })?),
        };

        Ok(Self { request_id, owner })
    }
}
