// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Service
//!
//! `Service` is the capability set application code depends on; `AmqpService`
//! implements it over one shared connection with a dedicated publish channel,
//! a dedicated consume channel and a short-lived channel per provisioning call.
//!
//! ```no_run
//! use amqp_service::{
//!     config::RabbitMQConfigs,
//!     publisher::{PublishContext, Publishing},
//!     queue::Queue,
//!     service::{AmqpService, Service},
//! };
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), amqp_service::errors::AmqpError> {
//! let service = AmqpService::new(&RabbitMQConfigs::from_env()?).await?;
//!
//! service
//!     .declare_queues(&[Queue::new("orders").ttl(Duration::from_secs(5))])
//!     .await?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! service.consume(&["orders".to_owned()], tx).await?;
//!
//! let ctx = PublishContext::with_timeout(Duration::from_secs(1));
//! service.publish(&ctx, "orders", Publishing::new("order-1")).await?;
//!
//! if let Some(delivery) = rx.recv().await {
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::{
    amqp::LapinConnector,
    broker::Connector,
    channel::{ChannelManager, ChannelRole},
    config::RabbitMQConfigs,
    connection::ConnectionManager,
    dispatcher::{ConsumerRouter, DeliverySender},
    errors::AmqpError,
    publisher::{AmqpPublisher, PublishContext, Publishing},
    queue::{self, Queue},
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU16, Ordering},
    Arc,
};
use tracing::{debug, info, info_span, warn, Instrument, Span};

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

/// Queue provisioning, consumption and publishing against the broker.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait Service: Send + Sync {
    /// Declares every queue and its `.DL` dead-letter queue. Fails fast on the
    /// first rejected declaration.
    async fn declare_queues(&self, queues: &[Queue]) -> Result<(), AmqpError>;

    /// Forwards deliveries of every queue in `queues` to `destination`.
    async fn consume(&self, queues: &[String], destination: DeliverySender) -> Result<(), AmqpError>;

    /// Publishes one message to `queue` through the default exchange.
    async fn publish(&self, ctx: &PublishContext, queue: &str, msg: Publishing) -> Result<(), AmqpError>;

    /// Prefetch applied the next time the consume channel is opened. Zero
    /// keeps the broker default.
    fn set_consume_prefetch_count(&self, count: u16);
}

pub struct AmqpService {
    connection: Arc<ConnectionManager>,
    publish_channel: Arc<ChannelManager>,
    consume_channel: Arc<ChannelManager>,
    publisher: AmqpPublisher,
    router: ConsumerRouter,
    consume_prefetch_count: Arc<AtomicU16>,
    span: Span,
}

impl AmqpService {
    /// Connects to the broker described by `cfg`. Fails when the initial
    /// connection cannot be established.
    pub async fn new(cfg: &RabbitMQConfigs) -> Result<Self, AmqpError> {
        let span = info_span!("amqp", connection = %cfg.connection_name);
        let service = Self::with_connector(Arc::new(LapinConnector::new(cfg)), span).await?;

        if let Some(count) = cfg.prefetch_count {
            service.set_consume_prefetch_count(count);
        }

        Ok(service)
    }

    /// Builds the service on any broker implementation. All logging of the
    /// service and its consumer tasks happens within `span`.
    pub async fn with_connector(connector: Arc<dyn Connector>, span: Span) -> Result<Self, AmqpError> {
        let connection = Arc::new(ConnectionManager::new(connector));
        connection.get_connection().instrument(span.clone()).await?;

        let consume_prefetch_count = Arc::new(AtomicU16::new(0));
        let publish_channel = Arc::new(ChannelManager::new(
            ChannelRole::Publish,
            connection.clone(),
            consume_prefetch_count.clone(),
        ));
        let consume_channel = Arc::new(ChannelManager::new(
            ChannelRole::Consume,
            connection.clone(),
            consume_prefetch_count.clone(),
        ));

        span.in_scope(|| info!("amqp service connected"));

        Ok(AmqpService {
            publisher: AmqpPublisher::new(publish_channel.clone()),
            router: ConsumerRouter::new(consume_channel.clone(), connection.clone(), span.clone()),
            connection,
            publish_channel,
            consume_channel,
            consume_prefetch_count,
            span,
        })
    }

    /// Closes both channels and the connection. Running consumers stop as
    /// their delivery streams close.
    pub async fn close(&self) -> Result<(), AmqpError> {
        async {
            for channel in [&self.publish_channel, &self.consume_channel] {
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "ignoring channel close failure");
                }
            }
            self.connection.close().await?;
            info!("amqp service closed");
            Ok::<(), AmqpError>(())
        }
        .instrument(self.span.clone())
        .await
    }

    async fn provision(&self, queues: &[Queue]) -> Result<(), AmqpError> {
        queue::validate(queues)?;

        if queues.is_empty() {
            return Ok(());
        }

        let channel = self.connection.open_channel(ChannelRole::Declare).await?;

        let topology = queues
            .iter()
            .fold(AmqpTopology::new(), |topology, def| topology.queue(def));
        let result = topology.install(channel.as_ref()).await;

        if channel.is_open() {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close the declare channel");
            }
        }

        result
    }
}

#[async_trait]
impl Service for AmqpService {
    async fn declare_queues(&self, queues: &[Queue]) -> Result<(), AmqpError> {
        self.provision(queues).instrument(self.span.clone()).await
    }

    async fn consume(&self, queues: &[String], destination: DeliverySender) -> Result<(), AmqpError> {
        self.router
            .consume(queues, destination)
            .instrument(self.span.clone())
            .await
    }

    async fn publish(&self, ctx: &PublishContext, queue: &str, msg: Publishing) -> Result<(), AmqpError> {
        self.publisher
            .publish(ctx, queue, msg)
            .instrument(self.span.clone())
            .await
    }

    fn set_consume_prefetch_count(&self, count: u16) {
        self.span
            .in_scope(|| debug!(count, "consume prefetch updated"));
        self.consume_prefetch_count.store(count, Ordering::SeqCst);
    }
}
