// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Service
//!
//! This module provides the error types returned by the service layer. The
//! `AmqpError` enum is what application code sees; `BrokerError` is the raw
//! failure reported by the broker boundary before it is wrapped with the
//! operation, queue or channel role it belongs to.

use crate::channel::ChannelRole;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Every variant carries enough context (queue name, channel role) to be
/// logged once at the application boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error opening or using a channel of the given role
    #[error("failure to create the {role} channel: {reason}")]
    ChannelError { role: ChannelRole, reason: String },

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{name}`: {reason}")]
    DeclareQueueError { name: String, reason: String },

    /// The broker rejected a publish
    #[error("failure to publish to `{queue}`: {reason}")]
    PublishingError { queue: String, reason: String },

    /// The caller-supplied context was cancelled or its deadline passed
    #[error("publish to `{queue}` aborted: {reason}")]
    ContextError { queue: String, reason: String },

    /// Error starting a consumer on a queue
    #[error("failure to consume queue `{queue}`: {reason}")]
    ConsumerError { queue: String, reason: String },

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// A queue descriptor failed validation before reaching the broker
    #[error("invalid queue definition: {0}")]
    InvalidQueueDefinition(String),

    /// A configuration value could not be parsed
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl AmqpError {
    /// Returns true when the error comes from a cancelled or expired context.
    pub fn is_context_error(&self) -> bool {
        matches!(self, AmqpError::ContextError { .. })
    }
}

/// Failure reported by the broker boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl BrokerError {
    pub fn new(msg: impl Into<String>) -> Self {
        BrokerError(msg.into())
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError(err.to_string())
    }
}
