// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION, X_CONTENT_TYPE_OPTIONS};
use hyper::Response;
pub use hyper::StatusCode;

/// Type-erased HTTP response
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Return an empty 200 response.
pub fn empty() -> GenericResponse {
    with_status(StatusCode::OK, Empty::new().map_err(anyhow::Error::from).boxed())
}

/// Return an empty response with the given status.
pub fn empty_with_status(status: StatusCode) -> GenericResponse {
    with_status(status, Empty::new().map_err(anyhow::Error::from).boxed())
}

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    let body = Full::from(content.to_string())
        .map_err(anyhow::Error::from)
        .boxed();
    let mut response = with_status(status, body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
    response
}

/// Return relayed bytes under the content type they were accepted as.
///
/// `nosniff` is set so browsers don't second-guess the declared type.
pub fn relayed(content_type: HeaderValue, payload: Bytes) -> GenericResponse {
    let body = Full::new(payload).map_err(anyhow::Error::from).boxed();
    let mut response = with_status(StatusCode::OK, body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

/// Return a "301 Moved Permanently" response pointing at `location`.
pub fn moved_permanently(location: &'static str) -> GenericResponse {
    let mut response = empty_with_status(StatusCode::MOVED_PERMANENTLY);
    response
        .headers_mut()
        .insert(LOCATION, HeaderValue::from_static(location));
    response
}

/// Return a plain text "405 method not allowed" response.
pub fn method_not_allowed() -> GenericResponse {
    text(StatusCode::METHOD_NOT_ALLOWED, "405 method not allowed")
}

fn with_status(status: StatusCode, body: BoxBody<Bytes, anyhow::Error>) -> GenericResponse {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
