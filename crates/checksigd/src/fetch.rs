// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outbound fetching of the remote resource.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http::header::{ACCEPT_ENCODING, USER_AGENT as USER_AGENT_HEADER};
use http::{HeaderMap, HeaderValue, StatusCode};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect;
use tokio::io::AsyncRead;
use tracing::debug;
use url::Url;

use crate::error::RelayError;
use crate::limit;
use crate::target::{is_public, TargetPolicy, TargetUrl};

/// Identity presented to remote hosts, on the first request and every redirect hop.
pub const USER_AGENT: &str = concat!("checksigd/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Response of a single outbound GET, with the body still unread.
pub struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Pin<Box<dyn AsyncRead + Send>>,
}

impl std::fmt::Debug for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetched")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Issues exactly one GET (plus any redirects) for a validated URL.
#[async_trait::async_trait]
pub trait Fetch {
    async fn fetch(&self, target: &TargetUrl) -> Result<Fetched, RelayError>;
}

/// Settings for the outbound client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Wall-clock deadline for the whole exchange, body included.
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Rules redirect targets have to satisfy; the length limit is not applied to them.
    pub targets: TargetPolicy,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            targets: TargetPolicy::default(),
        }
    }
}

/// [`Fetch`] implementation backed by a single shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client, // cheaply cloneable, shared by every request
    timeout: Duration,
}

impl Fetcher {
    pub fn new(policy: FetchPolicy) -> anyhow::Result<Self> {
        let FetchPolicy {
            timeout,
            max_redirects,
            targets,
        } = policy;

        let mut builder = reqwest::ClientBuilder::new()
            .user_agent(USER_AGENT)
            // Proxies would resolve names themselves, bypassing the destination checks.
            .no_proxy()
            .redirect(redirect_policy(max_redirects, targets.clone()))
            .connect_timeout(timeout)
            .timeout(timeout);
        if !targets.allow_private_targets {
            builder = builder.dns_resolver(Arc::new(PublicOnlyResolver));
        }
        let client = builder.build().context("building outbound http client")?;

        Ok(Self { client, timeout })
    }

    /// The only place outbound requests are built.
    fn request(&self, url: &Url) -> reqwest::RequestBuilder {
        self.client
            .get(url.clone())
            .header(USER_AGENT_HEADER, HeaderValue::from_static(USER_AGENT))
            .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"))
            .timeout(self.timeout)
    }
}

#[async_trait::async_trait]
impl Fetch for Fetcher {
    async fn fetch(&self, target: &TargetUrl) -> Result<Fetched, RelayError> {
        debug!("fetching {target}");
        let response = self.request(target.as_url()).send().await?;
        debug!("response from {}: {}", response.url(), response.status());

        let status = response.status();
        let headers = response.headers().clone();
        let body = limit::stream_reader(Box::pin(response.bytes_stream()));
        Ok(Fetched {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

/// Follows up to `max_redirects` hops, re-validating each destination.
///
/// Headers set on the original request, including the User-Agent, are carried to every hop.
fn redirect_policy(max_redirects: usize, targets: TargetPolicy) -> redirect::Policy {
    let targets = TargetPolicy {
        max_url_length: usize::MAX,
        ..targets
    };
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects {
            return attempt.error(format!("more than {max_redirects} redirects"));
        }
        match TargetUrl::parse(attempt.url().as_str(), &targets) {
            Ok(_) => attempt.follow(),
            Err(err) => attempt.error(err),
        }
    })
}

/// Resolver that drops every non-public address, so names pointing inside the network
/// can't be used to reach it.
struct PublicOnlyResolver;

impl Resolve for PublicOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_public(name.as_str().to_owned()))
    }
}

async fn resolve_public(host: String) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .filter(|addr| is_public(addr.ip()))
        .collect();
    if addrs.is_empty() {
        return Err(RelayError::DisallowedDestination(host).into());
    }
    Ok(Box::new(addrs.into_iter()))
}

/// Stand-ins for [`Fetcher`] in tests.
pub mod test_utils {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http::header::CONTENT_TYPE;

    /// [`Fetch`] that answers every request with the same canned response and counts calls.
    ///
    /// ```rust
    /// use checksigd::fetch::test_utils::StaticFetch;
    ///
    /// let fetch = StaticFetch::ok("text/plain", "abcd1234");
    /// assert_eq!(fetch.calls(), 0);
    /// ```
    pub struct StaticFetch {
        status: StatusCode,
        content_type: Option<&'static str>,
        body: Bytes,
        calls: AtomicUsize,
    }

    impl StaticFetch {
        pub fn new(
            status: StatusCode,
            content_type: Option<&'static str>,
            body: impl Into<Bytes>,
        ) -> Self {
            Self {
                status,
                content_type,
                body: body.into(),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn ok(content_type: &'static str, body: impl Into<Bytes>) -> Self {
            Self::new(StatusCode::OK, Some(content_type), body)
        }

        /// Number of fetches attempted so far.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Fetch for StaticFetch {
        async fn fetch(&self, _target: &TargetUrl) -> Result<Fetched, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut headers = HeaderMap::new();
            if let Some(ct) = self.content_type {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
            }
            Ok(Fetched {
                status: self.status,
                headers,
                body: Box::pin(std::io::Cursor::new(self.body.clone())),
            })
        }
    }

    /// [`Fetch`] that always fails as if the remote host refused the connection.
    #[derive(Default)]
    pub struct RefusingFetch {
        calls: AtomicUsize,
    }

    impl RefusingFetch {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Fetch for RefusingFetch {
        async fn fetch(&self, _target: &TargetUrl) -> Result<Fetched, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::Fetch {
                timed_out: false,
                source: Box::new(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                )),
            })
        }
    }
}
