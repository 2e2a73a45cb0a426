use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_framework::Error;
use serde_json::json;

/// Maps the framework's error taxonomy onto HTTP status codes for the
/// control-plane API. Operational error kinds that carry no HTTP status of
/// their own (allocation, routing, configuration, subgraph policy) get a
/// fixed mapping; transport-sourced kinds forward the status they carried.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Client { status, .. } | Error::Syntax { status, .. } => {
                status.and_then(|s| StatusCode::from_u16(s).ok()).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Error::Transient { .. } | Error::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Server { .. } | Error::RetriesExhausted { .. } => StatusCode::BAD_GATEWAY,
            Error::Allocation(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Routing(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Subgraph(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
