use reqwest::StatusCode;
use serde::Serialize;
use tracing::error;

use crate::collector::{Collected, FailureRecord};
use crate::error::Error;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Status, content type and body, ready for any HTTP front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePayload {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl WirePayload {
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_TEXT,
            body: message.into().into_bytes(),
        }
    }

    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: CONTENT_TYPE_JSON,
                body,
            },
            Err(e) => {
                error!(error = %e, "failed to serialize response");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    content_type: CONTENT_TYPE_JSON,
                    body: br#"{"error":"internal server error"}"#.to_vec(),
                }
            }
        }
    }
}

#[derive(Serialize)]
pub struct Envelope<'a, T> {
    pub results: &'a [T],
    pub failures: &'a [FailureRecord],
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// 200 whenever anything succeeded or nothing was attempted; 500 when every
/// scope failed. Failures are always carried in the body.
pub fn serialize<T: Serialize>(collected: &Collected<T>) -> WirePayload {
    let status = if collected.results.is_empty() && !collected.failures.is_empty() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    WirePayload::json(
        status,
        &Envelope {
            results: &collected.results,
            failures: &collected.failures,
        },
    )
}

/// Request-level error: 400 plain text for a missing parameter, otherwise a
/// generic 500 with the error text attached only when `diagnostics` is set.
pub fn from_error(err: &Error, diagnostics: bool) -> WirePayload {
    match err {
        Error::MissingParameter(_) => WirePayload::text(StatusCode::BAD_REQUEST, err.to_string()),
        _ => {
            error!(kind = err.kind(), error = %err, "request failed");
            WirePayload::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ErrorBody {
                    error: "internal server error",
                    detail: diagnostics.then(|| err.to_string()),
                },
            )
        }
    }
}
