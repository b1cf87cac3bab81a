// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability Boundary
//!
//! The service never talks to a protocol implementation directly. It goes
//! through the traits in this module, which expose exactly the primitives it
//! needs: open a connection, open a channel, declare a queue, set the prefetch,
//! publish and consume. `crate::amqp` binds them to lapin and
//! `crate::memory` provides a brokerless implementation.

use crate::{delivery::Delivery, errors::BrokerError};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties,
};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Lazy, unbounded, non-restartable sequence of deliveries for one queue.
///
/// The stream ends when the channel or the connection it was started on closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Opens connections to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection is still usable. A handle that returned true
    /// once may return false later.
    fn is_connected(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel multiplexed over a broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Puts the channel in publisher confirm mode. Publishes then wait for the
    /// broker's verdict, including returns of unroutable mandatory messages.
    async fn confirm_select(&self) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError>;

    /// Starts a manually acknowledged consumer on `queue`.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Stops the consumer `consumer_tag`. Its stream ends once deliveries
    /// already received are drained; they stay unacknowledged until settled.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles a single delivery with the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}
