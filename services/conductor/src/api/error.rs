//! RFC 7807 problem responses.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{ConductorError, ErrorKind};

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    /// Error family, see [`ErrorKind`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://cirrus.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            kind: None,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn unprocessable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNPROCESSABLE_ENTITY, code, message)
    }

    pub fn not_implemented(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_IMPLEMENTED, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.problem.kind = serde_json::to_value(kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
        self
    }

    fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }
}

/// Stable code for each error.
fn error_code(err: &ConductorError) -> &'static str {
    match err {
        ConductorError::NoValidHost { .. } => "no_valid_host",
        ConductorError::UnsupportedPolicy { .. } => "unsupported_policy",
        ConductorError::PreCheck(_) => "migration_precheck_failed",
        ConductorError::Migration { .. } => "migration_error",
        ConductorError::UnexpectedTaskState { .. } => "unexpected_task_state",
        ConductorError::InstanceNotFound(_) => "instance_not_found",
        ConductorError::ImageNotFound { .. } => "image_not_found",
        ConductorError::UnshelveFailed { .. } => "unshelve_failed",
        ConductorError::FlavorNotFound(_) => "flavor_not_found",
        ConductorError::GroupNotFound(_) => "instance_group_not_found",
        ConductorError::MigrationNotFound(_) => "migration_not_found",
        ConductorError::InvalidTransition(_) => "invalid_migration_transition",
        ConductorError::NotImplemented { .. } => "not_implemented",
        ConductorError::InvalidRequest(_) => "invalid_request",
        ConductorError::Scheduler(_) => "scheduler_error",
        ConductorError::Compute(_) => "compute_error",
        ConductorError::Store(_) => "store_error",
        ConductorError::Image(_) => "image_service_error",
    }
}

impl From<ConductorError> for ApiError {
    fn from(err: ConductorError) -> Self {
        let kind = err.kind();
        let code = error_code(&err);
        let detail = err.to_string();
        let api = match kind {
            ErrorKind::Placement => ApiError::conflict(code, detail).retryable(),
            ErrorKind::PreCheck => ApiError::unprocessable(code, detail),
            ErrorKind::Concurrency => match err {
                ConductorError::InstanceNotFound(_) => ApiError::not_found(code, detail),
                _ => ApiError::conflict(code, detail).retryable(),
            },
            ErrorKind::NotFound => ApiError::not_found(code, detail),
            ErrorKind::Invalid => ApiError::bad_request(code, detail),
            ErrorKind::NotImplemented => ApiError::not_implemented(code, detail),
            ErrorKind::Unexpected => ApiError::internal(code, detail),
        };
        api.with_kind(kind)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PreCheckError;

    #[test]
    fn test_placement_is_conflict() {
        let err = ApiError::from(ConductorError::no_valid_host("none"));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.problem.code, "no_valid_host");
        assert_eq!(err.problem.kind.as_deref(), Some("placement"));
        assert!(err.problem.retryable);
    }

    #[test]
    fn test_precheck_is_unprocessable() {
        let err = ApiError::from(ConductorError::PreCheck(PreCheckError::InvalidCpuInfo {
            reason: "x".into(),
        }));
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_not_implemented() {
        let err = ApiError::from(ConductorError::NotImplemented {
            live: true,
            rebuild: true,
            flavor: false,
        });
        assert_eq!(err.status, StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn test_problem_content_type() {
        let response = ApiError::bad_request("invalid_request", "nope")
            .with_request_id("req-1")
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
