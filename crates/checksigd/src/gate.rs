// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Content-Type gate for fetched responses.

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};

use crate::error::RelayError;

pub const DEFAULT_ALLOWED_CONTENT_TYPE: &str = "text/plain";

/// How a response's `Content-Type` is compared against the allowed value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// Compare `type/subtype` only; parameters such as `charset` are ignored.
    #[default]
    MediaType,
    /// Compare the whole header value, parameters included.
    Exact,
}

/// Accepts responses whose declared content type matches a single allowed value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentTypeGate {
    allowed: String,
    mode: MatchMode,
}

impl Default for ContentTypeGate {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_CONTENT_TYPE, MatchMode::default())
    }
}

impl ContentTypeGate {
    pub fn new(allowed: &str, mode: MatchMode) -> Self {
        let allowed = match mode {
            MatchMode::MediaType => media_type(allowed),
            MatchMode::Exact => allowed.trim(),
        };
        Self {
            allowed: allowed.to_ascii_lowercase(),
            mode,
        }
    }

    pub fn allowed(&self) -> &str {
        &self.allowed
    }

    /// Check every `Content-Type` header in `headers`, returning the first one.
    ///
    /// A missing header, a value that isn't visible ASCII, or any value that doesn't match
    /// is rejected.
    pub fn check(&self, headers: &HeaderMap) -> Result<HeaderValue, RelayError> {
        let mut values = headers.get_all(CONTENT_TYPE).iter();
        let Some(first) = values.next() else {
            return Err(self.rejected(""));
        };
        for value in std::iter::once(first).chain(values) {
            let Ok(value) = value.to_str() else {
                return Err(self.rejected(&String::from_utf8_lossy(value.as_bytes())));
            };
            if !self.matches(value) {
                return Err(self.rejected(value));
            }
        }
        Ok(first.clone())
    }

    fn matches(&self, value: &str) -> bool {
        let candidate = match self.mode {
            MatchMode::MediaType => media_type(value),
            MatchMode::Exact => value.trim(),
        };
        candidate.eq_ignore_ascii_case(&self.allowed)
    }

    fn rejected(&self, actual: &str) -> RelayError {
        RelayError::ContentTypeRejected {
            actual: actual.to_owned(),
            expected: self.allowed.clone(),
        }
    }
}

/// Whether `value` looks like `type/subtype`, optionally followed by parameters.
pub fn is_valid_media_type(value: &str) -> bool {
    let token = |s: &str| {
        !s.is_empty()
            && s.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$&-^_.+".contains(&b))
    };
    media_type(value)
        .split_once('/')
        .is_some_and(|(ty, subty)| token(ty) && token(subty))
}

fn media_type(value: &str) -> &str {
    value.split(';').next().unwrap_or_default().trim()
}
