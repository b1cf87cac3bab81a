// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Binding
//!
//! Implements the broker capability traits on top of lapin connections and
//! channels.

use crate::{
    broker::{Acknowledger, BrokerChannel, BrokerConnection, Connector, DeliveryStream},
    config::RabbitMQConfigs,
    delivery::Delivery,
    errors::BrokerError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::debug;

/// Reply code sent when closing connections and channels normally
const REPLY_SUCCESS: u16 = 200;

pub struct LapinConnector {
    uri: AMQPUri,
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new(cfg: &RabbitMQConfigs) -> Self {
        LapinConnector {
            uri: cfg.amqp_uri(),
            properties: ConnectionProperties::default()
                .with_connection_name(LongString::from(cfg.connection_name.clone())),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let conn = Connection::connect_uri(self.uri.clone(), self.properties.clone()).await?;
        Ok(Arc::new(LapinConnection(conn)))
    }
}

struct LapinConnection(Connection);

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.0.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.0.create_channel().await?;
        Ok(Arc::new(LapinChannel(channel)))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.0.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

struct LapinChannel(Channel);

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.0.queue_declare(name, options, arguments).await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.0
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .0
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?
            .await?;

        confirmation_result(confirm)
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.0
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .0
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        debug!(queue, consumer_tag, "lapin consumer created");

        let queue = queue.to_owned();
        Ok(consumer
            .map(move |result| {
                result
                    .map(|delivery| {
                        Delivery::new(
                            queue.clone(),
                            delivery.delivery_tag,
                            delivery.exchange.to_string(),
                            delivery.routing_key.to_string(),
                            delivery.redelivered,
                            delivery.properties,
                            delivery.data,
                            Arc::new(LapinAcker(delivery.acker)),
                        )
                    })
                    .map_err(BrokerError::from)
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.0
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.0.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

/// Maps a publisher confirm to the publish outcome. A returned message means
/// the broker could not route a mandatory publish.
fn confirmation_result(confirm: Confirmation) -> Result<(), BrokerError> {
    match confirm {
        Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
            Err(BrokerError::new(format!(
                "{} - {}",
                returned.reply_code,
                returned.reply_text.as_str()
            )))
        }
        Confirmation::Nack(None) => Err(BrokerError::new("publish not acknowledged by the broker")),
        Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_ack_is_success() {
        assert!(confirmation_result(Confirmation::Ack(None)).is_ok());
        assert!(confirmation_result(Confirmation::NotRequested).is_ok());
    }

    #[test]
    fn broker_nack_is_rejection() {
        assert_eq!(
            confirmation_result(Confirmation::Nack(None)),
            Err(BrokerError::new("publish not acknowledged by the broker"))
        );
    }
}
