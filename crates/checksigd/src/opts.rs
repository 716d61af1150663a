// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{crate_version, Args, Parser};
use serde::Deserialize;

use crate::fetch::{DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_REDIRECTS};
use crate::gate::{is_valid_media_type, DEFAULT_ALLOWED_CONTENT_TYPE};
use crate::relay::DEFAULT_MAX_BYTES;
use crate::target::DEFAULT_MAX_URL_LENGTH;

#[derive(Debug, Parser)]
#[clap(
    name = "checksigd",
    about = "Fetches short checksum and signature files on behalf of clients",
    version = crate_version!()
)]
pub struct Opts {
    #[clap(
        long,
        env = "CHECKSIGD_CONFIG",
        help = "Path to a TOML config file. When given, no other options may be passed.",
        exclusive = true
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub settings: Config,
}

impl Opts {
    /// Produce the validated [`Config`], from the TOML file if one was given.
    pub fn load_config(self) -> anyhow::Result<Config> {
        let config = match self.config {
            Some(path) => Config::from_toml_file(&path)?,
            None => self.settings,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Debug, Args, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[clap(
        long,
        help = "Address to listen on",
        default_value_t = Config::default_bind(),
        env = "CHECKSIGD_BIND"
    )]
    #[serde(default = "Config::default_bind")]
    pub bind: IpAddr,

    #[clap(
        short,
        long,
        help = "Port to listen on",
        default_value_t = Config::default_port(),
        env = "CHECKSIGD_PORT"
    )]
    #[serde(default = "Config::default_port")]
    pub port: u16,

    #[clap(
        long,
        help = "Maximum simultaneously connected clients before connections are answered with 503",
        default_value_t = Config::default_max_clients(),
        env = "CHECKSIGD_MAX_CLIENTS"
    )]
    #[serde(default = "Config::default_max_clients")]
    pub max_clients: usize,

    #[clap(
        long,
        help = "Log to the terminal instead of --log-file",
        default_value_t = false,
        env = "CHECKSIGD_DEBUG"
    )]
    #[serde(default)]
    pub debug: bool,

    #[clap(
        long,
        help = "File logs are appended to unless --debug is set",
        default_value = "./debug.log",
        env = "CHECKSIGD_LOG_FILE"
    )]
    #[serde(default = "Config::default_log_file")]
    pub log_file: PathBuf,

    #[clap(
        long,
        help = "Longest URL (after canonicalization) that will be fetched",
        default_value_t = DEFAULT_MAX_URL_LENGTH,
        env = "CHECKSIGD_MAX_URL_LENGTH"
    )]
    #[serde(default = "Config::default_max_url_length")]
    pub max_url_length: usize,

    #[clap(
        long,
        help = "Largest accepted request body, in bytes",
        default_value_t = DEFAULT_MAX_BYTES,
        env = "CHECKSIGD_MAX_INBOUND_BYTES"
    )]
    #[serde(default = "Config::default_max_bytes")]
    pub max_inbound_bytes: u64,

    #[clap(
        long,
        help = "Number of bytes of the remote file relayed back to the client",
        default_value_t = DEFAULT_MAX_BYTES,
        env = "CHECKSIGD_MAX_BODY_BYTES"
    )]
    #[serde(default = "Config::default_max_bytes")]
    pub max_body_bytes: u64,

    #[clap(
        long,
        help = "Deadline for the whole outbound fetch, in seconds",
        default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs(),
        env = "CHECKSIGD_FETCH_TIMEOUT_SECS"
    )]
    #[serde(default = "Config::default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[clap(
        long,
        help = "Maximum number of redirects followed per fetch",
        default_value_t = DEFAULT_MAX_REDIRECTS,
        env = "CHECKSIGD_MAX_REDIRECTS"
    )]
    #[serde(default = "Config::default_max_redirects")]
    pub max_redirects: usize,

    #[clap(
        long,
        help = "The only content type relayed back to clients",
        default_value = DEFAULT_ALLOWED_CONTENT_TYPE,
        env = "CHECKSIGD_ALLOWED_CONTENT_TYPE"
    )]
    #[serde(default = "Config::default_allowed_content_type")]
    pub allowed_content_type: String,

    #[clap(
        long,
        help = "Require the content type to match exactly, parameters included",
        default_value_t = false,
        env = "CHECKSIGD_STRICT_CONTENT_TYPE"
    )]
    #[serde(default)]
    pub strict_content_type: bool,

    #[clap(
        long,
        help = "Answer every failed relay with an empty 200 instead of an error status",
        default_value_t = false,
        env = "CHECKSIGD_SILENT_FAILURES"
    )]
    #[serde(default)]
    pub silent_failures: bool,

    #[clap(
        long,
        help = "Fetch URLs with schemes other than http and https",
        default_value_t = false,
        env = "CHECKSIGD_ALLOW_ANY_SCHEME"
    )]
    #[serde(default)]
    pub allow_any_scheme: bool,

    #[clap(
        long,
        help = "Fetch from loopback, private and link-local addresses. Useful for local testing.",
        default_value_t = false,
        env = "CHECKSIGD_ALLOW_PRIVATE_TARGETS"
    )]
    #[serde(default)]
    pub allow_private_targets: bool,
}

impl Config {
    fn default_bind() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn default_port() -> u16 {
        8080
    }

    fn default_max_clients() -> usize {
        1024
    }

    fn default_log_file() -> PathBuf {
        PathBuf::from("./debug.log")
    }

    fn default_max_url_length() -> usize {
        DEFAULT_MAX_URL_LENGTH
    }

    fn default_max_bytes() -> u64 {
        DEFAULT_MAX_BYTES
    }

    fn default_fetch_timeout_secs() -> u64 {
        DEFAULT_FETCH_TIMEOUT.as_secs()
    }

    fn default_max_redirects() -> usize {
        DEFAULT_MAX_REDIRECTS
    }

    fn default_allowed_content_type() -> String {
        DEFAULT_ALLOWED_CONTENT_TYPE.to_owned()
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_url_length > 0, "max_url_length must be positive");
        anyhow::ensure!(self.max_inbound_bytes > 0, "max_inbound_bytes must be positive");
        anyhow::ensure!(self.max_body_bytes > 0, "max_body_bytes must be positive");
        anyhow::ensure!(self.fetch_timeout_secs > 0, "fetch_timeout_secs must be positive");
        anyhow::ensure!(
            is_valid_media_type(&self.allowed_content_type),
            "allowed_content_type {:?} is not a type/subtype media type",
            self.allowed_content_type
        );
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn parse(args: &[&str]) -> Opts {
        Opts::try_parse_from(std::iter::once("checksigd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_documented_limits() {
        let config = parse(&[]).load_config().unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.max_url_length, 127);
        assert_eq!(config.max_inbound_bytes, 256);
        assert_eq!(config.max_body_bytes, 256);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(3));
        assert_eq!(config.allowed_content_type, "text/plain");
        assert!(!config.debug);
        assert!(!config.silent_failures);
        assert!(!config.allow_private_targets);
    }

    #[test]
    fn cli_options_override_defaults() {
        let config = parse(&[
            "--bind",
            "0.0.0.0",
            "--port",
            "9000",
            "--debug",
            "--max-body-bytes",
            "512",
            "--strict-content-type",
        ])
        .load_config()
        .unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:9000".parse().unwrap());
        assert!(config.debug);
        assert_eq!(config.max_body_bytes, 512);
        assert!(config.strict_content_type);
    }

    #[test]
    fn toml_config_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9090\nsilent_failures = true").unwrap();
        let path = file.path().to_str().unwrap();

        let config = parse(&["--config", path]).load_config().unwrap();
        assert_eq!(config.port, 9090);
        assert!(config.silent_failures);
        assert_eq!(config.max_body_bytes, 256);
        assert_eq!(config.log_file, PathBuf::from("./debug.log"));
    }

    #[test]
    fn config_file_excludes_other_options() {
        let result = Opts::try_parse_from(["checksigd", "--config", "a.toml", "--port", "1"]);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_toml_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prot = 9090").unwrap();
        assert!(Config::from_toml_file(file.path()).is_err());
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let config = parse(&["--max-body-bytes", "0"]);
        assert!(config.load_config().is_err());
        let config = parse(&["--allowed-content-type", "plain"]);
        assert!(config.load_config().is_err());
    }
}
