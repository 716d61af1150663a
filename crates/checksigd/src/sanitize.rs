// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cleaning of client-controlled strings before they reach a log line.
//!
//! Only ever applied to what we log (hosts, paths, user agents, URLs), never to relayed
//! content.

/// Longest string, in characters, we will write to a log line on a client's behalf.
pub const MAX_LOGGED_CHARS: usize = 160;

/// Escape control characters and markup, and cap the length.
pub fn for_log(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOGGED_CHARS));
    for (i, c) in input.chars().enumerate() {
        if i == MAX_LOGGED_CHARS {
            out.push('…');
            break;
        }
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c if c.is_control() => out.extend(c.escape_default()),
            c => out.push(c),
        }
    }
    out
}

/// Host portion of a `Host` header value, without any port.
pub fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host.split_inclusive(']').next().unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}
