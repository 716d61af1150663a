// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Everything that can go wrong while relaying a single request.

use hyper::StatusCode;

/// Reasons a relay attempt ends without forwarding any remote content.
///
/// None of these are fatal to the process; each is logged and turned into a
/// response by the relay handler.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no url supplied")]
    MissingUrl,
    #[error("malformed url: {0}")]
    MalformedUrl(#[from] url::ParseError),
    #[error("url is {length} characters long, maximum is {limit}")]
    UrlTooLong { length: usize, limit: usize },
    #[error("scheme {0:?} is not allowed")]
    DisallowedScheme(String),
    #[error("destination {0} is not allowed")]
    DisallowedDestination(String),
    #[error("form rejected: {0}")]
    FormRejected(String),
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("client did not finish sending its request in time")]
    RequestTimeout,
    #[error("fetch failed: {source}")]
    Fetch {
        timed_out: bool,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("upstream answered {0}")]
    UpstreamStatus(StatusCode),
    #[error("content type {actual:?} rejected, expected {expected:?}")]
    ContentTypeRejected { actual: String, expected: String },
    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error),
}

impl RelayError {
    /// Status used when failures are reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingUrl
            | Self::MalformedUrl(_)
            | Self::UrlTooLong { .. }
            | Self::DisallowedScheme(_) => StatusCode::BAD_REQUEST,
            Self::DisallowedDestination(_) | Self::FormRejected(_) => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::Fetch {
                timed_out: true, ..
            } => StatusCode::GATEWAY_TIMEOUT,
            Self::Fetch { .. } | Self::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
            Self::ContentTypeRejected { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short, stable name of the failure, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingUrl => "MissingURL",
            Self::MalformedUrl(_) => "MalformedURL",
            Self::UrlTooLong { .. } => "URLTooLong",
            Self::DisallowedScheme(_) => "DisallowedScheme",
            Self::DisallowedDestination(_) => "DisallowedDestination",
            Self::FormRejected(_) => "FormRejected",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::RequestTimeout => "RequestTimeout",
            Self::Fetch { .. } => "FetchError",
            Self::UpstreamStatus(_) => "UpstreamStatus",
            Self::ContentTypeRejected { .. } => "ContentTypeRejected",
            Self::Io(_) => "Io",
        }
    }

    /// Whether the failure happened before any outbound connection was attempted.
    pub fn is_pre_network(&self) -> bool {
        matches!(
            self,
            Self::MissingUrl
                | Self::MalformedUrl(_)
                | Self::UrlTooLong { .. }
                | Self::DisallowedScheme(_)
                | Self::DisallowedDestination(_)
                | Self::FormRejected(_)
                | Self::PayloadTooLarge { .. }
                | Self::RequestTimeout
        )
    }
}

impl RelayError {
    /// Classify a failure while reading a fetched body.
    ///
    /// Body streams surface transport errors as [`std::io::Error`]s wrapping the client's error.
    pub fn from_body_read(err: std::io::Error) -> Self {
        let timed_out = err.kind() == std::io::ErrorKind::TimedOut
            || err
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(reqwest::Error::is_timeout);
        Self::Fetch {
            timed_out,
            source: Box::new(err),
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch {
            timed_out: err.is_timeout(),
            source: Box::new(err),
        }
    }
}
