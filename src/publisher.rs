// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages straight to a queue through the default exchange over the
//! shared publish channel. Calls are serialized on the publish channel's lock
//! and bounded by a caller-supplied `PublishContext`.

use crate::{channel::ChannelManager, errors::AmqpError, otel};
use lapin::{options::BasicPublishOptions, types::ShortString, BasicProperties};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// An outgoing message.
#[derive(Debug, Clone, Default)]
pub struct Publishing {
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    /// Ask the broker to fail the publish instead of dropping an unroutable message
    pub mandatory: bool,
}

impl Publishing {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Publishing {
            properties: BasicProperties::default(),
            data: data.into(),
            mandatory: false,
        }
    }

    /// Serializes `payload` as the JSON body of the message.
    pub fn json<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_vec(payload)?;

        Ok(Publishing {
            properties: BasicProperties::default()
                .with_content_type(ShortString::from(JSON_CONTENT_TYPE)),
            data,
            mandatory: false,
        })
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Cancellation and deadline for a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl PublishContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        PublishContext::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        PublishContext::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        PublishContext {
            cancellation: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context cancelled together with `token`.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        PublishContext {
            cancellation: token,
            deadline: None,
        }
    }

    /// Same cancellation, bounded by `timeout` from now (or the existing
    /// deadline, whichever comes first).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails when the context is already cancelled or past its deadline.
    pub fn check(&self, queue: &str) -> Result<(), AmqpError> {
        if self.cancellation.is_cancelled() {
            return Err(context_error(queue, "context cancelled"));
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(context_error(queue, "deadline exceeded"));
        }
        Ok(())
    }

    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

fn context_error(queue: &str, reason: &str) -> AmqpError {
    AmqpError::ContextError {
        queue: queue.to_owned(),
        reason: reason.to_owned(),
    }
}

pub struct AmqpPublisher {
    channel: Arc<ChannelManager>,
}

impl AmqpPublisher {
    pub fn new(channel: Arc<ChannelManager>) -> AmqpPublisher {
        AmqpPublisher { channel }
    }

    /// Publishes `msg` to `queue` through the default exchange.
    ///
    /// Returns `ContextError` without touching the broker when `ctx` is
    /// already done, and abandons the send when `ctx` fires first. No retry is
    /// performed.
    pub async fn publish(
        &self,
        ctx: &PublishContext,
        queue: &str,
        msg: Publishing,
    ) -> Result<(), AmqpError> {
        ctx.check(queue)?;

        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => Err(context_error(queue, "context cancelled")),
            _ = ctx.expired() => Err(context_error(queue, "deadline exceeded")),
            result = self.send(queue, msg) => result,
        }
    }

    async fn send(&self, queue: &str, msg: Publishing) -> Result<(), AmqpError> {
        let mut channel = self.channel.acquire().await?;

        let headers = otel::inject_context(
            &opentelemetry::Context::current(),
            msg.properties.headers().as_ref(),
        );

        let mut properties = msg.properties.with_headers(headers);
        if properties.message_id().is_none() {
            properties = properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }

        let result = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: msg.mandatory,
                    immediate: false,
                },
                &msg.data,
                properties,
            )
            .await;

        match result {
            Err(err) if !channel.is_open() => {
                error!(error = err.to_string(), queue, "publish channel failed");
                channel.invalidate();
                Err(AmqpError::ChannelError {
                    role: self.channel.role(),
                    reason: err.to_string(),
                })
            }
            Err(err) => {
                error!(error = err.to_string(), queue, "error publishing message");
                Err(AmqpError::PublishingError {
                    queue: queue.to_owned(),
                    reason: err.to_string(),
                })
            }
            _ => {
                debug!(queue, "message published");
                Ok(())
            }
        }
    }
}
