//! Axum route handlers. Each one extracts the [`Caller`](crate::types::Caller),
//! delegates to [`ResourceService`](crate::service::ResourceService) and maps the
//! result to a response.

pub mod access;
pub mod namespaces;
pub mod users;
pub mod volumes;

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;

use crate::errors::Error;

pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Stream items as newline-delimited JSON.
///
/// The status is sent before the first item, so an error part-way through is
/// written as a final `{"code", "message"}` line and ends the stream.
pub fn ndjson<T, S>(items: S) -> Response
where
    T: Serialize + Send + 'static,
    S: Stream<Item = Result<T, Error>> + Send + 'static,
{
    let lines = items
        .scan(false, |failed, item| {
            if *failed {
                return futures::future::ready(None);
            }
            let line = match item {
                Ok(value) => serde_json::to_string(&value).unwrap_or_else(|e| {
                    *failed = true;
                    error_line("internal", &format!("failed to serialize item: {e}"))
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "Stream ended with an error");
                    *failed = true;
                    error_line(e.code(), &e.user_message())
                }
            };
            futures::future::ready(Some(Ok::<_, Infallible>(format!("{line}\n"))))
        });

    let mut response = Response::new(Body::from_stream(lines));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_NDJSON));
    response
}

fn error_line(code: &str, message: &str) -> String {
    serde_json::json!({ "code": code, "message": message }).to_string()
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
