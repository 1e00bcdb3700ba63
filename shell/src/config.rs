//! Configuration for the shell
//!
//! Connection parameters are layered, lowest precedence first: built-in
//! defaults, an optional config file, `MAPI_*` environment variables, a
//! `mapi:monetdb://` URL and finally individual command-line flags.

use std::path::Path;

use config::{Config, Environment, File};
use log::debug;
use mapi_core::error::{to_config_error, Result};
use mapi_core::{ConnectionParams, DigestAlgorithm, Language, MapiUrl};
use serde::Serialize;

/// Prefix of environment variables read by the shell
pub const ENV_PREFIX: &str = "MAPI";

/// Parameters given explicitly, on top of file and environment
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    /// Server host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Server port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// User name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Language mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,

    /// Login digest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<DigestAlgorithm>,

    /// Rows per result block
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_size: Option<i64>,

    /// Typed cell conversion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_cast: Option<bool>,

    /// Connect timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// Read timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
}

impl Overrides {
    /// Overrides carried by a connection URL
    pub fn from_url(url: &str) -> Result<Self> {
        let url = MapiUrl::parse(url)?;
        Ok(Self {
            host: url.host,
            port: url.port,
            database: url.database,
            user: url.user,
            password: url.password,
            ..Default::default()
        })
    }
}

/// Resolve connection parameters from every configuration layer
pub fn load_params(
    config_file: Option<&Path>,
    url: Option<&str>,
    flags: &Overrides,
) -> Result<ConnectionParams> {
    let mut builder = Config::builder();

    if let Some(path) = config_file {
        debug!("Loading configuration from {}", path.display());
        builder = builder.add_source(File::from(path));
    }
    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX));

    if let Some(url) = url {
        let from_url = Overrides::from_url(url)?;
        builder = builder.add_source(Config::try_from(&from_url).map_err(to_config_error)?);
    }
    builder = builder.add_source(Config::try_from(flags).map_err(to_config_error)?);

    let params: ConnectionParams = builder
        .build()
        .and_then(Config::try_deserialize)
        .map_err(to_config_error)?;
    params.validate()?;

    debug!("Resolved connection parameters: {:?}", params);
    Ok(params)
}
