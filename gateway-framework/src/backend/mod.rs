//! The backend API client: HTTP+SSE protocol spoken to a single worker
//! process. Grounded on `graph_api/client/{base,client,config,exceptions}.py`.

pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod sse;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::BackendClient;
pub use config::ClientConfig;

use crate::errors::Error;

/// Patterns that mark a response as a permanent query error regardless of
/// the HTTP status that carried it (the source's `syntax_error_patterns`
/// list in `base.py::_handle_response_error`).
const SYNTAX_ERROR_PATTERNS: &[&str] = &[
    "Parser exception",
    "Binder exception",
    "Invalid input",
    "Cannot find property",
    "Table does not exist",
    "does not exist",
    "Query execution failed: Parser",
    "Query execution failed: Binder",
];

/// Map an HTTP status + response body to the crate's error taxonomy. Syntax
/// detection runs first and wins over status-based classification, since a
/// backend can surface a parser error behind a 422 or a 500 alike.
pub fn classify_response(status: u16, body: &str) -> Error {
    if SYNTAX_ERROR_PATTERNS.iter().any(|pattern| body.contains(pattern)) {
        return Error::syntax(body.to_string(), Some(status));
    }

    match status {
        502 | 503 | 504 => Error::transient(body.to_string(), Some(status)),
        400 | 401 | 403 | 404 | 422 => Error::client(body.to_string(), Some(status)),
        500..=599 => Error::server(body.to_string(), Some(status)),
        _ => Error::client(format!("unexpected status {status}: {body}"), Some(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_pattern_wins_over_server_status() {
        let err = classify_response(500, "Parser exception: unexpected token");
        assert!(matches!(err, Error::Syntax { .. }));
    }

    #[test]
    fn syntax_pattern_also_recognized_on_422() {
        let err = classify_response(422, "Cannot find property 'foo' on node");
        assert!(matches!(err, Error::Syntax { .. }));
    }

    #[test]
    fn syntax_pattern_recognized_regardless_of_status() {
        let err = classify_response(400, "Table does not exist: widgets");
        assert!(matches!(err, Error::Syntax { .. }));
        assert!(!err.is_retriable());
    }

    #[test]
    fn plain_500_is_server_error() {
        let err = classify_response(500, "internal error");
        assert!(matches!(err, Error::Server { .. }));
        assert!(err.is_retriable());
    }

    #[test]
    fn gateway_errors_are_transient() {
        for status in [502, 503, 504] {
            assert!(classify_response(status, "bad gateway").is_retriable());
        }
    }

    #[test]
    fn client_errors_are_not_retriable() {
        for status in [400, 401, 403, 404, 422] {
            assert!(!classify_response(status, "nope").is_retriable());
        }
    }
}
