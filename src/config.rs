// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Broker connection parameters, loadable from serde sources or from the
//! process environment (with `.env` support).

use crate::errors::AmqpError;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::{env, str::FromStr};

pub const RABBITMQ_HOST_ENV_KEY: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_KEY: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_KEY: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_KEY: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST_ENV_KEY: &str = "RABBITMQ_VHOST";
pub const RABBITMQ_CONNECTION_NAME_ENV_KEY: &str = "RABBITMQ_CONNECTION_NAME";
pub const RABBITMQ_PREFETCH_COUNT_ENV_KEY: &str = "RABBITMQ_PREFETCH_COUNT";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Reported to the broker and used as the logging span name field
    pub connection_name: String,
    /// Initial consume prefetch; `None` keeps the broker default
    pub prefetch_count: Option<u16>,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "amqp-service".to_owned(),
            prefetch_count: None,
        }
    }
}

impl RabbitMQConfigs {
    /// Connection target for this configuration. Credentials and vhost are
    /// passed as structured fields, so reserved URI characters need no escaping.
    pub fn amqp_uri(&self) -> AMQPUri {
        let vhost = match self.vhost.as_str() {
            "/" | "" => "/",
            other => other.trim_start_matches('/'),
        };

        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: vhost.to_owned(),
            ..AMQPUri::default()
        }
    }

    /// Reads the configuration from `RABBITMQ_*` environment variables,
    /// loading a `.env` file first when one exists. Unset keys keep their defaults.
    pub fn from_env() -> Result<Self, AmqpError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfigs::default();

        if let Some(host) = lookup(RABBITMQ_HOST_ENV_KEY) {
            cfg.host = host;
        }
        if let Some(port) = lookup(RABBITMQ_PORT_ENV_KEY) {
            cfg.port = parse(RABBITMQ_PORT_ENV_KEY, &port)?;
        }
        if let Some(user) = lookup(RABBITMQ_USER_ENV_KEY) {
            cfg.user = user;
        }
        if let Some(password) = lookup(RABBITMQ_PASSWORD_ENV_KEY) {
            cfg.password = password;
        }
        if let Some(vhost) = lookup(RABBITMQ_VHOST_ENV_KEY) {
            cfg.vhost = vhost;
        }
        if let Some(name) = lookup(RABBITMQ_CONNECTION_NAME_ENV_KEY) {
            cfg.connection_name = name;
        }
        if let Some(count) = lookup(RABBITMQ_PREFETCH_COUNT_ENV_KEY) {
            cfg.prefetch_count = Some(parse(RABBITMQ_PREFETCH_COUNT_ENV_KEY, &count)?);
        }

        Ok(cfg)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, AmqpError> {
    value
        .trim()
        .parse()
        .map_err(|_| AmqpError::ConfigError(format!("{key} has an invalid value `{value}`")))
}
