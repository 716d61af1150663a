// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Form decoding for the relay endpoint, and the hook for form protection.

use http::header::CONTENT_TYPE;
use http::request::Parts;
use http::HeaderMap;

use crate::error::RelayError;

/// Name of the form field holding the URL to fetch.
pub const URL_FIELD: &str = "url";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Decoded `application/x-www-form-urlencoded` fields, in submission order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Form(Vec<(String, String)>);

impl Form {
    /// Decode `body` if `headers` declare it as a urlencoded form.
    ///
    /// Bodies of any other type decode to an empty form.
    pub fn from_body(headers: &HeaderMap, body: &[u8]) -> Self {
        let is_form = headers
            .get(CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE));
        if !is_form {
            return Self::default();
        }
        Self(form_urlencoded::parse(body).into_owned().collect())
    }

    /// First value of `name`, or `""` if absent.
    pub fn value(&self, name: &str) -> &str {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Form {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Protection against cross-site submission of the relay form.
///
/// Token issuance and session handling live outside this crate; an implementation only gets
/// to look at a submitted request and either admit it or refuse it. Refused requests never
/// reach URL validation.
pub trait FormGuard {
    fn verify(&self, request: &Parts, form: &Form) -> Result<(), String>;
}

/// [`FormGuard`] for deployments where a fronting component already verified the token.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdmitAll;

impl FormGuard for AdmitAll {
    fn verify(&self, _request: &Parts, _form: &Form) -> Result<(), String> {
        Ok(())
    }
}

/// Runs `guard` and maps a refusal onto [`RelayError::FormRejected`].
pub fn check_guard(
    guard: &(dyn FormGuard + Send + Sync),
    request: &Parts,
    form: &Form,
) -> Result<(), RelayError> {
    guard.verify(request, form).map_err(RelayError::FormRejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::HeaderValue;

    fn form_headers(ct: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
        headers
    }

    #[test]
    fn url_field_is_decoded() {
        let form = Form::from_body(
            &form_headers("application/x-www-form-urlencoded"),
            b"url=http%3A%2F%2Fexample.com%2Fsum.txt&gorilla.csrf.Token=abc",
        );
        assert_eq!(form.value(URL_FIELD), "http://example.com/sum.txt");
        assert_eq!(form.value("gorilla.csrf.Token"), "abc");
    }

    #[test]
    fn first_value_wins() {
        let form = Form::from_body(
            &form_headers("application/x-www-form-urlencoded; charset=utf-8"),
            b"url=first&url=second",
        );
        assert_eq!(form.value(URL_FIELD), "first");
    }

    #[test]
    fn missing_field_is_empty() {
        let form = Form::from_body(&form_headers("application/x-www-form-urlencoded"), b"x=1");
        assert_eq!(form.value(URL_FIELD), "");
    }

    #[test]
    fn other_content_types_are_not_parsed() {
        let form = Form::from_body(&form_headers("text/plain"), b"url=http://example.com/");
        assert_eq!(form, Form::default());
        let form = Form::from_body(&HeaderMap::new(), b"url=http://example.com/");
        assert_eq!(form, Form::default());
    }

    #[test]
    fn refusals_become_form_rejected() {
        struct DenyAll;
        impl FormGuard for DenyAll {
            fn verify(&self, _: &Parts, _: &Form) -> Result<(), String> {
                Err("CSRF token invalid".into())
            }
        }
        let (parts, ()) = http::Request::new(()).into_parts();
        let form: Form = [(URL_FIELD, "http://example.com/")].into_iter().collect();
        assert!(check_guard(&AdmitAll, &parts, &form).is_ok());
        assert!(matches!(
            check_guard(&DenyAll, &parts, &form),
            Err(RelayError::FormRejected(msg)) if msg == "CSRF token invalid"
        ));
    }
}
