// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Credential Providers
//!
//! A [`SecretProvider`] is queried before every connection attempt, so rotating
//! credentials are picked up by the next reconnection without rebuilding the
//! connection supervisor.

use crate::errors::AmqpError;

/// Supplies the password used for the next connection attempt.
#[cfg_attr(test, mockall::automock)]
pub trait SecretProvider: Send + Sync {
    /// Returns the current password.
    fn password(&self) -> Result<String, AmqpError>;
}

/// A password that never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSecret(String);

impl StaticSecret {
    pub fn new(password: &str) -> StaticSecret {
        StaticSecret(password.to_owned())
    }
}

impl SecretProvider for StaticSecret {
    fn password(&self) -> Result<String, AmqpError> {
        Ok(self.0.clone())
    }
}

/// Reads the password from an environment variable on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSecret {
    var: String,
}

impl EnvSecret {
    pub fn new(var: &str) -> EnvSecret {
        EnvSecret {
            var: var.to_owned(),
        }
    }
}

impl SecretProvider for EnvSecret {
    fn password(&self) -> Result<String, AmqpError> {
        std::env::var(&self.var)
            .map_err(|err| AmqpError::SecretError(format!("{}: {err}", self.var)))
    }
}
