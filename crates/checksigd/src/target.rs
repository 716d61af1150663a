// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Validation of the URL a client asks us to fetch.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::error::RelayError;

/// Longest canonical URL we are willing to dial.
pub const DEFAULT_MAX_URL_LENGTH: usize = 127;

/// Rules a candidate URL has to satisfy before any network I/O happens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetPolicy {
    pub max_url_length: usize,
    /// Permit schemes other than `http` and `https`.
    pub allow_any_scheme: bool,
    /// Permit loopback, private, link-local and similar destinations.
    pub allow_private_targets: bool,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            max_url_length: DEFAULT_MAX_URL_LENGTH,
            allow_any_scheme: false,
            allow_private_targets: false,
        }
    }
}

/// A URL that passed [`TargetUrl::parse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetUrl(Url);

impl TargetUrl {
    /// Validate a form-decoded URL string.
    ///
    /// Checks run in order: presence, syntax, canonical length, then scheme and literal
    /// destination address. Name-based destinations are checked again when they resolve,
    /// see [`crate::fetch`].
    pub fn parse(raw: &str, policy: &TargetPolicy) -> Result<Self, RelayError> {
        if raw.is_empty() {
            return Err(RelayError::MissingUrl);
        }
        let url = Url::parse(raw)?;

        let length = url.as_str().len();
        if length > policy.max_url_length {
            return Err(RelayError::UrlTooLong {
                length,
                limit: policy.max_url_length,
            });
        }

        if !policy.allow_any_scheme && !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::DisallowedScheme(url.scheme().to_owned()));
        }

        if !policy.allow_private_targets {
            let ip = match url.host() {
                Some(Host::Ipv4(ip)) => Some(IpAddr::V4(ip)),
                Some(Host::Ipv6(ip)) => Some(IpAddr::V6(ip)),
                Some(Host::Domain(domain)) if is_local_name(domain) => {
                    return Err(RelayError::DisallowedDestination(domain.to_owned()));
                }
                Some(Host::Domain(_)) | None => None,
            };
            if let Some(ip) = ip.filter(|ip| !is_public(*ip)) {
                return Err(RelayError::DisallowedDestination(ip.to_string()));
            }
        }

        Ok(Self(url))
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_local_name(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    domain.eq_ignore_ascii_case("localhost")
        || domain
            .rsplit_once('.')
            .is_some_and(|(_, tld)| tld.eq_ignore_ascii_case("localhost"))
}

/// Whether `ip` is a globally routable unicast address we may connect to.
pub fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_public_v4(ip),
        IpAddr::V6(ip) => match embedded_ipv4(ip) {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(ip),
        },
    }
}

/// IPv4 address carried inside an IPv6 one by a transition mechanism.
///
/// Covers IPv4-mapped `::ffff:0:0/96`, IPv4-compatible `::/96`, NAT64 `64:ff9b::/96` and
/// 6to4 `2002::/16`.
fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let [.., a, b, c, d] = ip.octets();
    match ip.segments() {
        [0, 0, 0, 0, 0, 0, ..] | [0x64, 0xff9b, 0, 0, 0, 0, ..] => {
            Some(Ipv4Addr::new(a, b, c, d))
        }
        [0x2002, high, low, ..] => Some(Ipv4Addr::from((u32::from(high) << 16) | u32::from(low))),
        _ => None,
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        // 0.0.0.0/8
        || a == 0
        // 100.64.0.0/10, shared address space
        || (a == 100 && (b & 0b1100_0000) == 64)
        // 192.0.0.0/24 and 198.18.0.0/15
        || (a == 192 && b == 0 && ip.octets()[2] == 0)
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4, reserved
        || a >= 240)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // fc00::/7, unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10, link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32, documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8))
}
