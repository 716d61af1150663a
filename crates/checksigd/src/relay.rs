// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The relay endpoint.
//!
//! A request travels through a fixed sequence of stages. Each stage either hands over to the
//! next one or ends the request with a [`RelayError`]. Remote bytes only reach the client once
//! every stage has passed:
//!
//! 1. the request body is read (bounded) and decoded as a form, then the [`FormGuard`] runs
//! 2. the `url` field is validated into a [`TargetUrl`]
//! 3. exactly one outbound GET is issued through [`Fetch`]
//! 4. the response's `Content-Type` is checked by the [`ContentTypeGate`]
//! 5. at most `max_body_bytes` of the body are copied into the response

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HOST, USER_AGENT};
use http::{HeaderMap, Method, Request, StatusCode};
use hyper::body::Body;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::fetch::{Fetch, FetchPolicy, Fetcher};
use crate::form::{self, AdmitAll, Form, FormGuard, URL_FIELD};
use crate::gate::{ContentTypeGate, MatchMode};
use crate::limit;
use crate::opts::Config;
use crate::response::{self, GenericResponse};
use crate::sanitize;
use crate::target::{TargetPolicy, TargetUrl};

/// Default cap on both inbound request bodies and relayed payloads.
pub const DEFAULT_MAX_BYTES: u64 = 256;

/// Default time a client gets to deliver its whole request body.
pub const DEFAULT_INBOUND_TIMEOUT: Duration = Duration::from_secs(10);

const USAGE: &str = "POST an application/x-www-form-urlencoded form with a `url` field \
                     to receive the first bytes of that plain text file.\n";

/// Ceilings applied to each request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_inbound_bytes: u64,
    pub max_body_bytes: u64,
    /// Deadline for reading the inbound body. Header reads are bounded by the server.
    pub inbound_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_inbound_bytes: DEFAULT_MAX_BYTES,
            max_body_bytes: DEFAULT_MAX_BYTES,
            inbound_timeout: DEFAULT_INBOUND_TIMEOUT,
        }
    }
}

/// How failed relays are reported to the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// A status code per failure kind, with an empty body.
    #[default]
    Status,
    /// An empty 200 for every failure. Clients can't tell failures apart.
    Silent,
}

/// Stage a request was in when it failed, for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    ParsingForm,
    ValidatingUrl,
    Fetching,
    GatingContentType,
    Streaming,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ParsingForm => "parsing form",
            Self::ValidatingUrl => "validating url",
            Self::Fetching => "fetching",
            Self::GatingContentType => "gating content type",
            Self::Streaming => "streaming",
        })
    }
}

/// Progress of one relay attempt.
struct Attempt {
    stage: Stage,
    /// Sanitized target: as submitted, then canonical once validated.
    target: Option<String>,
}

/// Request handler for the relay service. Shared by every connection.
pub struct Relay {
    fetch: Arc<dyn Fetch + Send + Sync>,
    guard: Arc<dyn FormGuard + Send + Sync>,
    targets: TargetPolicy,
    gate: ContentTypeGate,
    limits: Limits,
    failure_mode: FailureMode,
}

impl Relay {
    /// Relay with default limits and policies that fetches through `fetch`.
    pub fn new(fetch: Arc<dyn Fetch + Send + Sync>) -> Self {
        Self {
            fetch,
            guard: Arc::new(AdmitAll),
            targets: TargetPolicy::default(),
            gate: ContentTypeGate::default(),
            limits: Limits::default(),
            failure_mode: FailureMode::default(),
        }
    }

    /// Relay backed by a real outbound client, configured from `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let targets = TargetPolicy {
            max_url_length: config.max_url_length,
            allow_any_scheme: config.allow_any_scheme,
            allow_private_targets: config.allow_private_targets,
        };
        let fetcher = Fetcher::new(FetchPolicy {
            timeout: config.fetch_timeout(),
            max_redirects: config.max_redirects,
            targets: targets.clone(),
        })?;
        let mode = if config.strict_content_type {
            MatchMode::Exact
        } else {
            MatchMode::MediaType
        };
        let failure_mode = if config.silent_failures {
            FailureMode::Silent
        } else {
            FailureMode::Status
        };

        Ok(Self::new(Arc::new(fetcher))
            .with_targets(targets)
            .with_gate(ContentTypeGate::new(&config.allowed_content_type, mode))
            .with_limits(Limits {
                max_inbound_bytes: config.max_inbound_bytes,
                max_body_bytes: config.max_body_bytes,
                ..Limits::default()
            })
            .with_failure_mode(failure_mode))
    }

    pub fn with_guard(self, guard: Arc<dyn FormGuard + Send + Sync>) -> Self {
        Self { guard, ..self }
    }

    pub fn with_targets(self, targets: TargetPolicy) -> Self {
        Self { targets, ..self }
    }

    pub fn with_gate(self, gate: ContentTypeGate) -> Self {
        Self { gate, ..self }
    }

    pub fn with_limits(self, limits: Limits) -> Self {
        Self { limits, ..self }
    }

    pub fn with_failure_mode(self, failure_mode: FailureMode) -> Self {
        Self {
            failure_mode,
            ..self
        }
    }

    /// Route a request.
    ///
    /// Only `/` is served: POST relays, GET and HEAD describe usage, OPTIONS is answered
    /// empty. Every other path is permanently redirected to `/`.
    pub async fn respond<B>(&self, request: Request<B>, peer: SocketAddr) -> GenericResponse
    where
        B: Body + Send + Unpin + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if request.uri().path() != "/" {
            info!(
                host = %header_for_log(request.headers(), HOST),
                path = %sanitize::for_log(request.uri().path()),
                "redirecting to /"
            );
            return response::moved_permanently("/");
        }

        let method = request.method().clone();
        match method {
            Method::POST => self.relay(request, peer).await,
            Method::GET | Method::HEAD => response::text(StatusCode::OK, USAGE),
            Method::OPTIONS => response::empty(),
            _ => response::method_not_allowed(),
        }
    }

    /// Handle a relay submission. Never fails; failures become responses.
    pub async fn relay<B>(&self, request: Request<B>, peer: SocketAddr) -> GenericResponse
    where
        B: Body + Send + Unpin + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut attempt = Attempt {
            stage: Stage::ParsingForm,
            target: None,
        };
        match self.try_relay(request, peer, &mut attempt).await {
            Ok(response) => response,
            Err(err) => self.failed(err, &attempt, peer),
        }
    }

    async fn try_relay<B>(
        &self,
        request: Request<B>,
        peer: SocketAddr,
        attempt: &mut Attempt,
    ) -> Result<GenericResponse, RelayError>
    where
        B: Body + Send + Unpin + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();

        let limit = self.limits.max_inbound_bytes;
        // Declared Content-Length is reflected in the lower bound.
        if body.size_hint().lower() > limit {
            return Err(RelayError::PayloadTooLarge { limit });
        }
        let raw = tokio::time::timeout(
            self.limits.inbound_timeout,
            limit::read_to_limit(limit::body_reader(body), limit),
        )
        .await
        .map_err(|_| RelayError::RequestTimeout)??;
        let form = Form::from_body(&parts.headers, &raw);
        form::check_guard(&*self.guard, &parts, &form)?;

        attempt.stage = Stage::ValidatingUrl;
        let submitted = form.value(URL_FIELD);
        attempt.target = Some(sanitize::for_log(submitted));
        let target = TargetUrl::parse(submitted, &self.targets)?;
        let logged_target = attempt.target.insert(sanitize::for_log(target.as_str()));
        info!(
            host = %header_for_log(&parts.headers, HOST),
            remote = %peer,
            user_agent = %header_for_log(&parts.headers, USER_AGENT),
            target = %logged_target,
            "relaying"
        );

        attempt.stage = Stage::Fetching;
        let fetched = self.fetch.fetch(&target).await?;
        if !fetched.status.is_success() {
            return Err(RelayError::UpstreamStatus(fetched.status));
        }

        attempt.stage = Stage::GatingContentType;
        let content_type = self.gate.check(&fetched.headers)?;

        attempt.stage = Stage::Streaming;
        let payload = limit::read_capped(fetched.body, self.limits.max_body_bytes)
            .await
            .map_err(RelayError::from_body_read)?;
        info!(bytes = payload.len(), "relayed");
        Ok(response::relayed(content_type, payload))
    }

    fn failed(&self, err: RelayError, attempt: &Attempt, peer: SocketAddr) -> GenericResponse {
        warn!(
            kind = err.kind(),
            stage = %attempt.stage,
            target = %attempt.target.as_deref().unwrap_or_default(),
            remote = %peer,
            "relay failed: {}",
            sanitize::for_log(&err.to_string())
        );
        match self.failure_mode {
            FailureMode::Silent => response::empty(),
            FailureMode::Status => response::empty_with_status(err.status()),
        }
    }
}

/// Sanitized value of a request header, or `""` if absent. `Host` loses its port.
fn header_for_log(headers: &HeaderMap, name: HeaderName) -> String {
    let Some(value) = headers.get(&name) else {
        return String::new();
    };
    let value = String::from_utf8_lossy(value.as_bytes());
    if name == HOST {
        sanitize::for_log(sanitize::host_without_port(&value))
    } else {
        sanitize::for_log(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;

    use bytes::Bytes;
    use futures::stream::{self, StreamExt};
    use http::header::{CONTENT_TYPE, LOCATION};
    use http::request::Parts;
    use http_body_util::{Full, StreamBody};
    use hyper::body::Frame;

    use crate::fetch::test_utils::{RefusingFetch, StaticFetch};
    use crate::response::tests::to_body;

    const FORM: &str = "application/x-www-form-urlencoded";

    fn peer() -> SocketAddr {
        SocketAddr::from(([203, 0, 113, 254], 12345))
    }

    fn encode(url: &str) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair(URL_FIELD, url)
            .finish()
    }

    fn post(body: impl Into<Bytes>) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(HOST, "relay.example:8080")
            .header(USER_AGENT, "test-client/1.0")
            .header(CONTENT_TYPE, FORM)
            .body(Full::new(body.into()))
            .unwrap()
    }

    fn relay_with(fetch: Arc<dyn Fetch + Send + Sync>) -> Relay {
        Relay::new(fetch)
    }

    #[tokio::test]
    async fn short_plain_text_is_relayed() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let relay = relay_with(fetch.clone());

        let response = relay
            .respond(post(encode("http://example.com/sum.txt")), peer())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(to_body(response).await, b"abcd1234");
        assert_eq!(fetch.calls(), 1);
    }

    #[tokio::test]
    async fn html_is_never_relayed() {
        let fetch = Arc::new(StaticFetch::ok("text/html", "<html>hi</html>"));
        let relay = relay_with(fetch.clone());

        let response = relay
            .respond(post(encode("http://example.com/")), peer())
            .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(to_body(response).await.is_empty());
    }

    #[tokio::test]
    async fn missing_content_type_is_rejected() {
        let fetch = Arc::new(StaticFetch::new(StatusCode::OK, None, "abcd1234"));
        let response = relay_with(fetch)
            .respond(post(encode("http://example.com/sum.txt")), peer())
            .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn overlong_urls_never_reach_the_network() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let relay = relay_with(fetch.clone());

        let url = format!("http://example.com/{}", "a".repeat(200 - 19));
        assert_eq!(url.len(), 200);
        let response = relay.respond(post(encode(&url)), peer()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn missing_and_malformed_urls_are_bad_requests() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let relay = relay_with(fetch.clone());

        for body in ["", "other=1", "url=", "url=not%20a%20url"] {
            let response = relay.respond(post(body), peer()).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn internal_destinations_are_forbidden() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "secret"));
        let relay = relay_with(fetch.clone());

        for url in ["http://127.0.0.1/", "http://169.254.169.254/latest", "file:///etc/passwd"] {
            let response = relay.respond(post(encode(url)), peer()).await;
            assert!(response.status().is_client_error(), "{url}");
        }
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn large_files_are_truncated() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", vec![b'x'; 10_000]));
        let response = relay_with(fetch)
            .respond(post(encode("http://example.com/big.txt")), peer())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(to_body(response).await, vec![b'x'; 256]);
    }

    #[tokio::test]
    async fn relayed_bytes_follow_the_configured_limit() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", vec![b'x'; 10_000]));
        let relay = relay_with(fetch).with_limits(Limits {
            max_body_bytes: 16,
            ..Limits::default()
        });
        let response = relay
            .respond(post(encode("http://example.com/big.txt")), peer())
            .await;
        assert_eq!(to_body(response).await.len(), 16);
    }

    #[tokio::test]
    async fn unreachable_hosts_are_bad_gateways() {
        let fetch = Arc::new(RefusingFetch::default());
        let relay = relay_with(fetch.clone());

        for _ in 0..2 {
            let response = relay
                .respond(post(encode("http://example.com/sum.txt")), peer())
                .await;
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            assert!(to_body(response).await.is_empty());
        }
        assert_eq!(fetch.calls(), 2);
    }

    #[tokio::test]
    async fn upstream_errors_are_not_relayed() {
        let fetch = Arc::new(StaticFetch::new(
            StatusCode::NOT_FOUND,
            Some("text/plain"),
            "not found",
        ));
        let response = relay_with(fetch.clone())
            .respond(post(encode("http://example.com/missing.txt")), peer())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(fetch.calls(), 1);
    }

    #[tokio::test]
    async fn silent_mode_answers_failures_with_empty_ok() {
        let fetch = Arc::new(StaticFetch::ok("text/html", "<html>hi</html>"));
        let relay = relay_with(fetch).with_failure_mode(FailureMode::Silent);

        let response = relay
            .respond(post(encode("http://example.com/")), peer())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(to_body(response).await.is_empty());

        let response = relay.respond(post("url="), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(to_body(response).await.is_empty());
    }

    #[tokio::test]
    async fn oversized_forms_are_rejected_before_fetching() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let relay = relay_with(fetch.clone());

        let padded = format!("{}&pad={}", encode("http://example.com/"), "p".repeat(1000));
        let response = relay.respond(post(padded), peer()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn declared_lengths_are_checked_up_front() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let relay = relay_with(fetch.clone()).with_limits(Limits {
            max_inbound_bytes: 8,
            ..Limits::default()
        });

        // Full declares its exact length, like a Content-Length header does.
        let request = post(encode("http://example.com/"));
        assert!(request.body().size_hint().lower() > 8);
        let response = relay.respond(request, peer()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_bodies_time_out() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let relay = relay_with(fetch.clone());

        let first = Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"url=http")));
        let stalled = stream::iter([first]).chain(stream::pending());
        let request = Request::post("/")
            .header(CONTENT_TYPE, FORM)
            .body(StreamBody::new(stalled))
            .unwrap();
        let response = relay.respond(request, peer()).await;
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(fetch.calls(), 0);
    }

    #[tracing_test::traced_test]
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn relays_are_logged_with_request_context() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let response = relay_with(fetch)
            .respond(post(encode("http://example.com/sum.txt")), peer())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        assert!(logs_contain("host=relay.example"));
        assert!(!logs_contain("host=relay.example:8080"));
        assert!(logs_contain("remote=203.0.113.254:12345"));
        assert!(logs_contain("user_agent=test-client/1.0"));
        assert!(logs_contain("target=http://example.com/sum.txt"));
    }

    #[tracing_test::traced_test]
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn rejected_urls_are_logged_as_submitted() {
        let relay = relay_with(Arc::new(StaticFetch::ok("text/plain", "abcd1234")));

        let response = relay.respond(post(encode("not a url")), peer()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(logs_contain("MalformedURL"));
        assert!(logs_contain("target=not a url"));

        let long = format!("http://example.com/{}", "b".repeat(181));
        let response = relay.respond(post(encode(&long)), peer()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(logs_contain("URLTooLong"));
        assert!(logs_contain(&format!("target=http://example.com/{}", "b".repeat(100))));
    }

    #[tokio::test]
    async fn refused_forms_never_reach_validation() {
        struct DenyAll;
        impl FormGuard for DenyAll {
            fn verify(&self, _: &Parts, _: &Form) -> Result<(), String> {
                Err("missing token".into())
            }
        }

        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let relay = relay_with(fetch.clone()).with_guard(Arc::new(DenyAll));
        let response = relay
            .respond(post(encode("http://example.com/sum.txt")), peer())
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn other_paths_redirect_home() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let relay = relay_with(fetch.clone());

        let request = Request::get("/index.html")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = relay.respond(request, peer()).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "/");
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn non_post_methods_do_not_relay() {
        let fetch = Arc::new(StaticFetch::ok("text/plain", "abcd1234"));
        let relay = relay_with(fetch.clone());

        let get = Request::get("/").body(Full::new(Bytes::new())).unwrap();
        let response = relay.respond(get, peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(to_body(response).await, USAGE.as_bytes());

        let options = Request::options("/").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(relay.respond(options, peer()).await.status(), StatusCode::OK);

        let put = Request::put("/").body(Full::new(Bytes::new())).unwrap();
        let response = relay.respond(put, peer()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(fetch.calls(), 0);
    }

    #[test]
    fn logged_headers_are_sanitized() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "relay.example:8080".parse().unwrap());
        headers.insert(USER_AGENT, "<b>agent</b>".parse().unwrap());
        assert_eq!(header_for_log(&headers, HOST), "relay.example");
        assert_eq!(header_for_log(&headers, USER_AGENT), "&lt;b&gt;agent&lt;/b&gt;");
        assert_eq!(header_for_log(&HeaderMap::new(), USER_AGENT), "");
    }
}
