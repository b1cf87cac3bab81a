// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Router
//!
//! Starts one broker-level consumer per queue on the shared consume channel
//! and forwards every delivery to the destination channel registered for that
//! queue. Each queue is served by its own task, so deliveries of one queue
//! keep broker order while different queues sharing a destination interleave.
//!
//! A consumer lives until its delivery stream closes (channel or connection
//! loss, queue deletion). It is not resubscribed automatically: calling
//! `consume` again for the queue name restarts it. A consumer still running
//! for that name is cancelled, so each queue has at most one consumer.

use crate::{
    broker::DeliveryStream,
    channel::{ChannelManager, ChannelRole},
    connection::ConnectionManager,
    delivery::Delivery,
    errors::AmqpError,
};
use futures_util::StreamExt;
use lapin::{options::QueueDeclareOptions, types::FieldTable};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn, Instrument, Span};
use uuid::Uuid;

/// Where deliveries of a queue are sent. Bounded senders push backpressure
/// onto the broker channel.
pub type DeliverySender = mpsc::Sender<Delivery>;

#[derive(Clone)]
pub(crate) struct Route {
    destination: DeliverySender,
    consumer_tag: String,
}

/// Queue name to destination channel and the consumer feeding it. Last
/// registration wins.
#[derive(Clone, Default)]
pub(crate) struct Routes {
    inner: Arc<Mutex<HashMap<String, Route>>>,
}

impl Routes {
    /// Returns the route it replaces.
    fn register(&self, queue: &str, route: Route) -> Option<Route> {
        self.lock().insert(queue.to_owned(), route)
    }

    /// Puts back `previous`, or removes the name when there was none.
    fn restore(&self, queue: &str, previous: Option<Route>) {
        let mut routes = self.lock();
        match previous {
            Some(route) => routes.insert(queue.to_owned(), route),
            None => routes.remove(queue),
        };
    }

    fn destination(&self, queue: &str) -> Option<DeliverySender> {
        self.lock().get(queue).map(|route| route.destination.clone())
    }

    fn is_current(&self, queue: &str, consumer_tag: &str) -> bool {
        self.lock()
            .get(queue)
            .is_some_and(|route| route.consumer_tag == consumer_tag)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Route>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ConsumerRouter {
    channel: Arc<ChannelManager>,
    connection: Arc<ConnectionManager>,
    routes: Routes,
    span: Span,
}

impl ConsumerRouter {
    /// Consumers run on `channel`; queue existence is checked on short-lived
    /// channels of `connection`. Forwarding tasks run instrumented with `span`.
    pub fn new(channel: Arc<ChannelManager>, connection: Arc<ConnectionManager>, span: Span) -> Self {
        ConsumerRouter {
            channel,
            connection,
            routes: Routes::default(),
            span,
        }
    }

    /// Starts consuming every queue in `queues`, forwarding deliveries to
    /// `destination`.
    ///
    /// Each name is checked to exist before its consumer starts, so a missing
    /// queue fails only that name and leaves the shared consume channel open.
    /// The route is registered before the broker-level consume so no delivery
    /// can arrive unrouted. The first failure stops the batch; consumers
    /// already started keep running.
    ///
    /// Consuming a name again replaces its destination and cancels the
    /// previous consumer once the new one runs.
    pub async fn consume(
        &self,
        queues: &[String],
        destination: DeliverySender,
    ) -> Result<(), AmqpError> {
        if queues.is_empty() {
            return Err(AmqpError::ConsumerError {
                queue: "".to_owned(),
                reason: "no queue to consume".to_owned(),
            });
        }

        for queue in queues {
            self.ensure_exists(queue).await?;

            let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
            let previous = self.routes.register(
                queue,
                Route {
                    destination: destination.clone(),
                    consumer_tag: consumer_tag.clone(),
                },
            );

            let stream = match self.start(queue, &consumer_tag).await {
                Ok(stream) => stream,
                Err(err) => {
                    self.routes.restore(queue, previous);
                    return Err(err);
                }
            };

            tokio::spawn(
                forward(queue.clone(), consumer_tag, stream, self.routes.clone())
                    .instrument(self.span.clone()),
            );

            if let Some(previous) = previous {
                self.cancel(queue, &previous.consumer_tag).await;
            }
        }

        Ok(())
    }

    /// Passive declare on a throwaway channel. The broker closes a channel
    /// that asks for a missing queue, so this never runs on the consume channel.
    async fn ensure_exists(&self, queue: &str) -> Result<(), AmqpError> {
        let channel = self
            .connection
            .open_channel(ChannelRole::Declare)
            .await
            .map_err(|err| AmqpError::ConsumerError {
                queue: queue.to_owned(),
                reason: err.to_string(),
            })?;

        let result = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        if channel.is_open() {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "failure to close the declare channel");
            }
        }

        result.map_err(|err| {
            error!(error = err.to_string(), queue, "queue to consume does not exist");
            AmqpError::ConsumerError {
                queue: queue.to_owned(),
                reason: err.to_string(),
            }
        })
    }

    async fn start(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let channel = self.channel.get_channel().await?;

        match channel.basic_consume(queue, consumer_tag).await {
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to create the consumer");
                if !channel.is_open() {
                    self.channel.invalidate(&channel).await;
                }
                Err(AmqpError::ConsumerError {
                    queue: queue.to_owned(),
                    reason: err.to_string(),
                })
            }
            Ok(stream) => {
                debug!(queue, consumer_tag, "consumer started");
                Ok(stream)
            }
        }
    }

    /// Stops a replaced consumer. Deliveries it already received still reach
    /// the queue's current destination.
    async fn cancel(&self, queue: &str, consumer_tag: &str) {
        let channel = match self.channel.get_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(error = err.to_string(), queue, "failure to cancel the replaced consumer");
                return;
            }
        };

        match channel.basic_cancel(consumer_tag).await {
            Ok(()) => debug!(queue, consumer_tag, "replaced consumer cancelled"),
            Err(err) => {
                warn!(error = err.to_string(), queue, consumer_tag, "failure to cancel the replaced consumer")
            }
        }
    }
}

/// Sends each delivery of `queue` to its registered destination until the
/// stream closes.
async fn forward(queue: String, consumer_tag: String, mut stream: DeliveryStream, routes: Routes) {
    while let Some(result) = stream.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), queue, "errors consume msg");
                continue;
            }
        };

        let Some(destination) = routes.destination(&queue) else {
            warn!(queue, "no destination registered, requeuing message");
            requeue(&delivery).await;
            continue;
        };

        if let Err(mpsc::error::SendError(delivery)) = destination.send(delivery).await {
            warn!(queue, "destination channel is closed, stop forwarding");
            drop(stream);
            requeue(&delivery).await;
            return;
        }
    }

    if routes.is_current(&queue, &consumer_tag) {
        warn!(queue, "delivery stream closed, consumer is not resubscribed");
    } else {
        debug!(queue, consumer_tag, "replaced consumer stopped");
    }
}

async fn requeue(delivery: &Delivery) {
    if let Err(err) = delivery.nack(true).await {
        error!(error = err.to_string(), "failure to requeue undelivered message");
    }
}
