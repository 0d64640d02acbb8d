// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection parameters for the lapin transport, loadable from the environment
//! (`RABBITMQ_*` variables) or from a JSON document. Missing values fall back to
//! the defaults of a local broker.

use crate::errors::AmqpError;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::env;
use tracing::error;

pub const RABBITMQ_HOST_ENV_KEY: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_KEY: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_KEY: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_KEY: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST_ENV_KEY: &str = "RABBITMQ_VHOST";
pub const RABBITMQ_CONNECTION_NAME_ENV_KEY: &str = "RABBITMQ_CONNECTION_NAME";
pub const RABBITMQ_HEARTBEAT_ENV_KEY: &str = "RABBITMQ_HEARTBEAT";

/// Broker connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
    /// Heartbeat interval in seconds; zero keeps the broker's proposal.
    pub heartbeat: u16,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        AmqpConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "rabbitmq-resilient".to_owned(),
            heartbeat: 0,
        }
    }
}

impl AmqpConfigs {
    /// Reads the `RABBITMQ_*` variables, keeping defaults for unset ones.
    pub fn from_env() -> Result<AmqpConfigs, AmqpError> {
        let mut cfg = AmqpConfigs::default();

        if let Ok(host) = env::var(RABBITMQ_HOST_ENV_KEY) {
            cfg.host = host;
        }
        if let Ok(port) = env::var(RABBITMQ_PORT_ENV_KEY) {
            cfg.port = parse_number(RABBITMQ_PORT_ENV_KEY, &port)?;
        }
        if let Ok(user) = env::var(RABBITMQ_USER_ENV_KEY) {
            cfg.user = user;
        }
        if let Ok(password) = env::var(RABBITMQ_PASSWORD_ENV_KEY) {
            cfg.password = password;
        }
        if let Ok(vhost) = env::var(RABBITMQ_VHOST_ENV_KEY) {
            cfg.vhost = vhost;
        }
        if let Ok(name) = env::var(RABBITMQ_CONNECTION_NAME_ENV_KEY) {
            cfg.connection_name = name;
        }
        if let Ok(heartbeat) = env::var(RABBITMQ_HEARTBEAT_ENV_KEY) {
            cfg.heartbeat = parse_number(RABBITMQ_HEARTBEAT_ENV_KEY, &heartbeat)?;
        }

        Ok(cfg)
    }

    pub fn from_json(json: &str) -> Result<AmqpConfigs, AmqpError> {
        serde_json::from_str(json).map_err(|err| {
            error!(error = err.to_string(), "failure to parse amqp configs");
            AmqpError::ConfigError(err.to_string())
        })
    }

    /// Renders the AMQP URI of the broker.
    ///
    /// User, password and vhost are percent-encoded; the default vhost `/`
    /// renders as `%2f`.
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "" | "/" => "%2f".to_owned(),
            vhost => utf8_percent_encode(vhost, URI_COMPONENT).to_string(),
        };

        let uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            utf8_percent_encode(&self.user, URI_COMPONENT),
            utf8_percent_encode(&self.password, URI_COMPONENT),
            self.host,
            self.port,
            vhost
        );

        if self.heartbeat > 0 {
            format!("{uri}?heartbeat={}", self.heartbeat)
        } else {
            uri
        }
    }
}

/// Everything but the unreserved characters of RFC 3986.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn parse_number(key: &str, value: &str) -> Result<u16, AmqpError> {
    value.trim().parse::<u16>().map_err(|err| {
        error!(key, value, error = err.to_string(), "invalid numeric configuration");
        AmqpError::ConfigError(format!("{key}: {err}"))
    })
}
