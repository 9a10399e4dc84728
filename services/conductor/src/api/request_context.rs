//! Request context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use cirrus_id::RequestId;

use crate::api::error::ApiError;
use crate::context::RequestContext;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(REQUEST_ID_HEADER) else {
            return Ok(RequestContext::new());
        };
        let request_id = value
            .to_str()
            .ok()
            .and_then(|s| RequestId::parse(s.trim()).ok())
            .ok_or_else(|| {
                ApiError::bad_request(
                    "invalid_request_id",
                    "x-request-id must be a UUID",
                )
            })?;
        Ok(RequestContext::with_request_id(request_id))
    }
}
