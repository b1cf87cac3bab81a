// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumed Messages
//!
//! A `Delivery` is one message handed to a consumer together with the
//! capability to settle it. Deliveries reach application code through the
//! destination channel registered with `Service::consume`.

use crate::{broker::Acknowledger, errors::AmqpError, otel};
use lapin::{types::FieldTable, BasicProperties};
use std::{fmt, sync::Arc};
use tracing::error;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// One message received from a queue, paired with its acknowledgment handle.
pub struct Delivery {
    /// Queue the consumer was started on
    pub queue: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: String,
        delivery_tag: u64,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            queue,
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
        }
    }

    /// Acknowledges the message, removing it from the queue.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await.map_err(|err| {
            error!(error = err.to_string(), queue = self.queue, "failure to ack message");
            AmqpError::AckMessageError(err.to_string())
        })
    }

    /// Negative-acknowledges the message. Without `requeue` the broker
    /// dead-letters it to the queue's `.DL` companion.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await.map_err(|err| {
            error!(error = err.to_string(), queue = self.queue, "failure to nack message");
            AmqpError::NackMessageError(err.to_string())
        })
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await.map_err(|err| {
            error!(error = err.to_string(), queue = self.queue, "failure to reject message");
            AmqpError::RejectMessageError(err.to_string())
        })
    }

    /// The AMQP `type` property, or an empty string.
    pub fn kind(&self) -> String {
        match self.properties.kind() {
            Some(value) => value.to_string(),
            _ => "".to_owned(),
        }
    }

    /// How many times this message has been dead-lettered, read from the
    /// first entry of the `x-death` header.
    pub fn death_count(&self) -> i64 {
        x_death_count(&self.properties)
    }

    /// OpenTelemetry context propagated by the publisher, if any.
    pub fn trace_context(&self) -> opentelemetry::Context {
        otel::extract_context(&self.properties)
    }
}

pub(crate) fn x_death_count(props: &BasicProperties) -> i64 {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|value| value.as_long_long_int())
        .unwrap_or_default()
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data", &self.data)
            .finish()
    }
}
