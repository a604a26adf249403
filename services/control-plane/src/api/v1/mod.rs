//! API v1 routes.

mod agent;
mod console;
mod nodes;
mod servers;
mod telemetry;

use std::str::FromStr;

use axum::Router;
use kiln_id::IdError;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::ControlPlaneError;
use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/servers", servers::routes().merge(console::routes()))
        .nest("/nodes", nodes::routes())
        .nest("/agent", agent::routes())
        .nest("/telemetry", telemetry::routes())
}

/// Map a domain error onto the problem response for this request.
fn domain_error(ctx: &RequestContext) -> impl Fn(ControlPlaneError) -> ApiError + '_ {
    move |e| ApiError::from(e).with_request_id(ctx.request_id.clone())
}

/// Parse a typed id from a path segment.
fn parse_id<T>(raw: &str, code: &'static str, ctx: &RequestContext) -> Result<T, ApiError>
where
    T: FromStr<Err = IdError>,
{
    raw.parse().map_err(|e: IdError| {
        ApiError::bad_request(code, format!("invalid id '{raw}': {e}"))
            .with_request_id(ctx.request_id.clone())
    })
}
