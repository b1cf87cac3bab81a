// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Topology
//!
//! Declares the primary queues and their paired dead-letter queues. For every
//! `Queue` the topology creates:
//!
//! - `<name>`: durable, dead-lettering through the default exchange into
//!   `<name>.DL`, with `x-message-ttl` when the queue has a TTL
//! - `<name>.DL`: durable, with a fixed 7 day `x-message-ttl` and no further
//!   dead-lettering
//!
//! Redeclaring identical queues is a no-op for the broker. Redeclaring with
//! different arguments is rejected and surfaces as `DeclareQueueError`.

use crate::{broker::BrokerChannel, errors::AmqpError, queue::Queue};
use async_trait::async_trait;
use lapin::{options::QueueDeclareOptions, types::FieldTable};
use tracing::{debug, error};

/// Trait defining the interface for topology installation.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp Queue) -> Self;

    /// Declares every registered queue on `channel`, in registration order.
    ///
    /// The first failure aborts the remaining declarations. Queues declared
    /// before it are left in place.
    async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError>;
}

#[derive(Default)]
pub struct AmqpTopology<'tp> {
    pub(crate) queues: Vec<&'tp Queue>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new() -> AmqpTopology<'tp> {
        AmqpTopology { queues: vec![] }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn queue(mut self, def: &'tp Queue) -> Self {
        self.queues.push(def);
        self
    }

    async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            declare(channel, &def.name, def.arguments()).await?;

            let dlq_name = def.dead_letter_queue_name();
            debug!("creating dead letter queue: {}", dlq_name);
            declare(channel, &dlq_name, def.dead_letter_arguments()).await?;
        }

        Ok(())
    }
}

async fn declare(
    channel: &dyn BrokerChannel,
    name: &str,
    arguments: FieldTable,
) -> Result<(), AmqpError> {
    match channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            arguments,
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to declare the queue");
            Err(AmqpError::DeclareQueueError {
                name: name.to_owned(),
                reason: err.to_string(),
            })
        }
        _ => {
            debug!("queue: {} was created", name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBrokerChannel, errors::BrokerError};
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    #[tokio::test]
    async fn declares_primary_then_dead_letter_queue() {
        let declared = Arc::new(Mutex::new(vec![]));
        let log = declared.clone();

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_queue_declare()
            .withf(|_, options, _| options.durable && !options.exclusive && !options.auto_delete)
            .returning(move |name, _, _| {
                log.lock().unwrap().push(name.to_owned());
                Ok(())
            });

        let orders = Queue::new("orders").ttl(Duration::from_secs(5));
        let payments = Queue::new("payments");

        AmqpTopology::new()
            .queue(&orders)
            .queue(&payments)
            .install(&channel)
            .await
            .unwrap();

        assert_eq!(
            *declared.lock().unwrap(),
            ["orders", "orders.DL", "payments", "payments.DL"]
        );
    }

    #[tokio::test]
    async fn first_failure_aborts_the_batch() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_queue_declare()
            .withf(|name, _, _| name == "orders")
            .times(1)
            .returning(|_, _, _| Err(BrokerError::new("PRECONDITION_FAILED")));

        let orders = Queue::new("orders");
        let payments = Queue::new("payments");

        let err = AmqpTopology::new()
            .queue(&orders)
            .queue(&payments)
            .install(&channel)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::DeclareQueueError {
                name: "orders".to_owned(),
                reason: "PRECONDITION_FAILED".to_owned(),
            }
        );
    }
}
