// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded relay for short checksum and signature files
//!
//! Clients submit a URL; the service fetches it once and hands back the first few bytes,
//! provided the remote host declared them as plain text.

pub mod error;
pub mod fetch;
pub mod form;
pub mod gate;
pub mod limit;
pub mod opts;
pub mod relay;
pub mod response;
pub mod sanitize;
pub mod server;
pub mod signal;
pub mod target;

pub use error::RelayError;
pub use opts::{Config, Opts};
pub use relay::Relay;
pub use server::{run_server, Server};
