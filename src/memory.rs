// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A brokerless implementation of the capability traits in `crate::broker`.
//! It follows broker semantics for the primitives the service uses (durable
//! queues, argument equivalence on redeclare, default-exchange routing,
//! dead-lettering on reject, channel exceptions, requeue of unsettled
//! deliveries when their channel closes, returns of mandatory messages in
//! confirm mode) so the service can be exercised end to end without a
//! RabbitMQ server.
//!
//! Message TTL expiry and prefetch throttling are not simulated.
//!
//! ```
//! use amqp_service::{memory::MemoryBroker, service::AmqpService};
//!
//! # async fn example() -> Result<(), amqp_service::errors::AmqpError> {
//! let broker = MemoryBroker::new();
//! let service = AmqpService::with_connector(broker.connector(), tracing::Span::none()).await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    broker::{Acknowledger, BrokerChannel, BrokerConnection, Connector, DeliveryStream},
    delivery::{self, Delivery, AMQP_HEADERS_COUNT, AMQP_HEADERS_X_DEATH},
    errors::BrokerError,
    queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldArray, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::debug;

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    available: bool,
    queues: HashMap<String, MemoryQueue>,
    connections: Vec<Arc<AtomicBool>>,
    connects: usize,
    publishes: usize,
    prefetch_history: Vec<u16>,
    next_id: u64,
}

struct MemoryQueue {
    durable: bool,
    arguments: FieldTable,
    ready: VecDeque<Message>,
    consumers: Vec<Subscription>,
    /// Cancelled consumers whose deliveries are not settled yet
    cancelled: Vec<Cancelled>,
    next_consumer: usize,
}

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: BasicProperties,
    data: Vec<u8>,
}

/// Delivered but unsettled messages of one consumer, by delivery tag.
type Outstanding = Arc<Mutex<BTreeMap<u64, Message>>>;

#[derive(Clone, Copy)]
struct Owner {
    connection_id: u64,
    channel_id: u64,
}

struct Subscription {
    owner: Owner,
    tag: String,
    delivery_tags: Arc<AtomicU64>,
    outstanding: Outstanding,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

struct Cancelled {
    owner: Owner,
    outstanding: Outstanding,
}

fn lock_outstanding(outstanding: &Outstanding) -> MutexGuard<'_, BTreeMap<u64, Message>> {
    outstanding.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Takes every unsettled message back, flagged as redelivered, in delivery order.
fn take_unsettled(outstanding: &Outstanding) -> Vec<Message> {
    std::mem::take(&mut *lock_outstanding(outstanding))
        .into_values()
        .map(|mut message| {
            message.redelivered = true;
            message
        })
        .collect()
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                queues: HashMap::default(),
                connections: vec![],
                connects: 0,
                publishes: 0,
                prefetch_history: vec![],
                next_id: 0,
            })),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// While unavailable, every connection attempt is refused.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Closes every live connection, ending all consumer streams. Unsettled
    /// deliveries go back to their queues.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        for conn in state.connections.drain(..) {
            conn.store(false, Ordering::SeqCst);
        }
        self.drop_consumers(&mut state, |_| true);
    }

    /// Deletes a queue together with its messages and consumers.
    pub fn delete_queue(&self, name: &str) -> bool {
        self.lock().queues.remove(name).is_some()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_durable(&self, name: &str) -> Option<bool> {
        self.lock().queues.get(name).map(|q| q.durable)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.lock().queues.get(name).map(|q| q.arguments.clone())
    }

    /// Messages waiting in the queue for a consumer.
    pub fn message_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.ready.len())
    }

    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.consumers.len())
    }

    /// Number of connections opened since the broker was created.
    pub fn connection_count(&self) -> usize {
        self.lock().connects
    }

    /// Number of publishes the broker accepted, routed or not.
    pub fn publish_count(&self) -> usize {
        self.lock().publishes
    }

    /// Prefetch values applied by `basic_qos`, oldest first.
    pub fn prefetch_history(&self) -> Vec<u16> {
        self.lock().prefetch_history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands `message` to the next consumer of `queue_name` or keeps it ready.
    fn dispatch(&self, state: &mut BrokerState, queue_name: &str, message: Message) {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let idx = queue.next_consumer % queue.consumers.len();
            let delivery = self.delivery(queue_name, &queue.consumers[idx], message.clone());
            let tag = delivery.delivery_tag;

            if queue.consumers[idx].sender.send(Ok(delivery)).is_ok() {
                queue.next_consumer = idx + 1;
                return;
            }

            let gone = queue.consumers.remove(idx);
            debug!(queue = queue_name, tag = gone.tag, "dropping gone consumer");
            lock_outstanding(&gone.outstanding).remove(&tag);
            for unsettled in take_unsettled(&gone.outstanding).into_iter().rev() {
                queue.ready.push_front(unsettled);
            }
        }

        queue.ready.push_back(message);
    }

    /// Removes the consumers owned by matching channels or connections and
    /// returns their unsettled deliveries to the queues.
    fn drop_consumers<F>(&self, state: &mut BrokerState, owned: F)
    where
        F: Fn(Owner) -> bool,
    {
        let mut redeliver = vec![];

        for (name, queue) in state.queues.iter_mut() {
            let mut unsettled = vec![];

            queue.consumers.retain(|s| {
                if owned(s.owner) {
                    unsettled.extend(take_unsettled(&s.outstanding));
                    false
                } else {
                    true
                }
            });
            queue.cancelled.retain(|c| {
                if owned(c.owner) {
                    unsettled.extend(take_unsettled(&c.outstanding));
                    false
                } else {
                    true
                }
            });

            if unsettled.is_empty() {
                continue;
            }

            if queue.consumers.is_empty() {
                for message in unsettled.into_iter().rev() {
                    queue.ready.push_front(message);
                }
            } else {
                redeliver.push((name.clone(), unsettled));
            }
        }

        for (name, messages) in redeliver {
            for message in messages {
                self.dispatch(state, &name, message);
            }
        }
    }

    fn delivery(&self, queue: &str, subscription: &Subscription, message: Message) -> Delivery {
        let tag = subscription.delivery_tags.fetch_add(1, Ordering::SeqCst) + 1;
        lock_outstanding(&subscription.outstanding).insert(tag, message.clone());

        let Message {
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
        } = message;

        Delivery::new(
            queue.to_owned(),
            tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
            Arc::new(MemoryAcker {
                broker: self.clone(),
                queue: queue.to_owned(),
                tag,
                outstanding: subscription.outstanding.clone(),
            }),
        )
    }

    fn requeue(&self, queue_name: &str, mut message: Message) {
        let mut state = self.lock();
        message.redelivered = true;
        self.dispatch(&mut state, queue_name, message);
    }

    /// Routes a rejected message following the queue's dead-letter arguments.
    fn dead_letter(&self, queue_name: &str, mut message: Message) {
        let mut state = self.lock();

        let Some(queue) = state.queues.get(queue_name) else {
            return;
        };

        let target = |key: &str| {
            queue
                .arguments
                .inner()
                .get(key)
                .and_then(|v| v.as_long_string())
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        };

        let (Some(exchange), Some(routing_key)) = (
            target(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            target(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        ) else {
            debug!(queue = queue_name, "no dead letter target, dropping message");
            return;
        };

        if !exchange.is_empty() {
            debug!(queue = queue_name, exchange, "only the default exchange is routed, dropping message");
            return;
        }

        message.properties = with_x_death(message.properties, queue_name);
        message.exchange = exchange;
        message.routing_key = routing_key.clone();
        message.redelivered = false;

        self.dispatch(&mut state, &routing_key, message);
    }
}

fn with_x_death(properties: BasicProperties, queue: &str) -> BasicProperties {
    let count = delivery::x_death_count(&properties) + 1;
    let mut headers = properties.headers().clone().unwrap_or_default();

    let mut entry = FieldTable::default();
    entry.insert(
        ShortString::from(AMQP_HEADERS_COUNT),
        AMQPValue::LongLongInt(LongLongInt::from(count)),
    );
    entry.insert(
        ShortString::from("queue"),
        AMQPValue::LongString(LongString::from(queue)),
    );
    entry.insert(
        ShortString::from("reason"),
        AMQPValue::LongString(LongString::from("rejected")),
    );

    headers.insert(
        ShortString::from(AMQP_HEADERS_X_DEATH),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(entry)])),
    );

    properties.with_headers(headers)
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.broker.lock();

        if !state.available {
            return Err(BrokerError::new("connection refused"));
        }

        state.next_id += 1;
        state.connects += 1;
        let open = Arc::new(AtomicBool::new(true));
        state.connections.push(open.clone());

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id: state.next_id,
            open,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::new("connection is closed"));
        }

        let mut state = self.broker.lock();
        state.next_id += 1;

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            connection_open: self.open.clone(),
            id: state.next_id,
            open: AtomicBool::new(true),
            confirms: AtomicBool::new(false),
            delivery_tags: Arc::new(AtomicU64::new(0)),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open.store(false, Ordering::SeqCst);
        let id = self.id;
        let mut state = self.broker.lock();
        state.connections.retain(|c| !Arc::ptr_eq(c, &self.open));
        self.broker
            .drop_consumers(&mut state, |owner| owner.connection_id == id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection_id: u64,
    connection_open: Arc<AtomicBool>,
    id: u64,
    open: AtomicBool,
    confirms: AtomicBool,
    delivery_tags: Arc<AtomicU64>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::new("channel is closed"))
        }
    }

    /// Channel exception: the broker closes the channel and reports `reason`.
    fn fail(&self, state: &mut BrokerState, reason: String) -> BrokerError {
        self.open.store(false, Ordering::SeqCst);
        let id = self.id;
        self.broker
            .drop_consumers(state, |owner| owner.channel_id == id);
        BrokerError::new(reason)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        match state.queues.get(name) {
            Some(queue) if options.passive => {
                debug!(queue = name, ready = queue.ready.len(), "queue exists");
                Ok(())
            }
            Some(queue) => {
                if queue.durable != options.durable || queue.arguments != arguments {
                    let reason = format!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{name}'"
                    );
                    return Err(self.fail(&mut state, reason));
                }
                Ok(())
            }
            None if options.passive => {
                let reason = format!("NOT_FOUND - no queue '{name}'");
                Err(self.fail(&mut state, reason))
            }
            None => {
                state.queues.insert(
                    name.to_owned(),
                    MemoryQueue {
                        durable: options.durable,
                        arguments,
                        ready: VecDeque::new(),
                        consumers: vec![],
                        cancelled: vec![],
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.lock().prefetch_history.push(prefetch_count);
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.confirms.store(true, Ordering::SeqCst);
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
        self.ensure_open()?;
        let mut state = self.broker.lock();

        if !exchange.is_empty() {
            let reason = format!("NOT_FOUND - no exchange '{exchange}'");
            return Err(self.fail(&mut state, reason));
        }

        if !state.queues.contains_key(routing_key) {
            // returns of mandatory messages only surface to a confirming publisher
            if options.mandatory && self.confirms.load(Ordering::SeqCst) {
                return Err(BrokerError::new(format!("NO_ROUTE - no queue '{routing_key}'")));
            }
            debug!(routing_key, "unroutable message dropped");
            state.publishes += 1;
            return Ok(());
        }

        state.publishes += 1;
        let message = Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties,
            data: payload.to_vec(),
        };
        self.broker.dispatch(&mut state, routing_key, message);

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        if !state.queues.contains_key(queue) {
            let reason = format!("NOT_FOUND - no queue '{queue}'");
            return Err(self.fail(&mut state, reason));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = Subscription {
            owner: Owner {
                connection_id: self.connection_id,
                channel_id: self.id,
            },
            tag: consumer_tag.to_owned(),
            delivery_tags: self.delivery_tags.clone(),
            outstanding: Outstanding::default(),
            sender,
        };

        if let Some(memory_queue) = state.queues.get_mut(queue) {
            for message in memory_queue.ready.drain(..) {
                let delivery = self.broker.delivery(queue, &subscription, message);
                // the receiver is still held locally, the send cannot fail
                let _ = subscription.sender.send(Ok(delivery));
            }
            memory_queue.consumers.push(subscription);
        }

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });

        Ok(deliveries.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        for queue in state.queues.values_mut() {
            queue
                .cancelled
                .retain(|c| !lock_outstanding(&c.outstanding).is_empty());

            let Some(idx) = queue
                .consumers
                .iter()
                .position(|s| s.owner.channel_id == self.id && s.tag == consumer_tag)
            else {
                continue;
            };

            // dropping the sender ends the stream once it is drained
            let subscription = queue.consumers.remove(idx);
            queue.cancelled.push(Cancelled {
                owner: subscription.owner,
                outstanding: subscription.outstanding,
            });
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open.store(false, Ordering::SeqCst);
        let id = self.id;
        let mut state = self.broker.lock();
        self.broker
            .drop_consumers(&mut state, |owner| owner.channel_id == id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
    outstanding: Outstanding,
}

impl MemoryAcker {
    /// Fails when the delivery was already settled or went back to the queue
    /// with its channel.
    fn settle(&self) -> Result<Message, BrokerError> {
        lock_outstanding(&self.outstanding)
            .remove(&self.tag)
            .ok_or_else(|| {
                BrokerError::new(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    self.tag
                ))
            })
    }

    fn settle_negative(&self, requeue: bool) -> Result<(), BrokerError> {
        let message = self.settle()?;
        if requeue {
            self.broker.requeue(&self.queue, message);
        } else {
            self.broker.dead_letter(&self.queue, message);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle().map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle_negative(requeue)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle_negative(requeue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn durable() -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        }
    }

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let conn = broker.connector().connect().await.unwrap();
        conn.open_channel().await.unwrap()
    }

    async fn publish(channel: &Arc<dyn BrokerChannel>, queue: &str, body: &str) {
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body.as_bytes(),
                BasicProperties::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn redeclare_with_other_arguments_closes_channel() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;

        ch.queue_declare("orders", durable(), FieldTable::default())
            .await
            .unwrap();
        ch.queue_declare("orders", durable(), FieldTable::default())
            .await
            .unwrap();

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(LongLongInt::from(10)),
        );
        let err = ch.queue_declare("orders", durable(), args).await.unwrap_err();

        assert!(err.0.starts_with("PRECONDITION_FAILED"));
        assert!(!ch.is_open());
    }

    #[tokio::test]
    async fn unroutable_mandatory_publish_fails_only_in_confirm_mode() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        let mandatory = || BasicPublishOptions {
            mandatory: true,
            immediate: false,
        };

        publish(&ch, "missing", "lost").await;
        ch.basic_publish("", "missing", mandatory(), b"lost", BasicProperties::default())
            .await
            .unwrap();

        ch.confirm_select().await.unwrap();
        let err = ch
            .basic_publish("", "missing", mandatory(), b"lost", BasicProperties::default())
            .await
            .unwrap_err();

        assert!(err.0.starts_with("NO_ROUTE"));
        assert!(ch.is_open());
        assert_eq!(broker.publish_count(), 2);
    }

    #[tokio::test]
    async fn ready_messages_are_consumed_in_order() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.queue_declare("orders", durable(), FieldTable::default())
            .await
            .unwrap();

        for body in ["1", "2", "3"] {
            publish(&ch, "orders", body).await;
        }
        assert_eq!(broker.message_count("orders"), Some(3));

        let mut stream = ch.basic_consume("orders", "c1").await.unwrap();
        publish(&ch, "orders", "4").await;

        let mut bodies = vec![];
        for _ in 0..4 {
            let delivery = stream.next().await.unwrap().unwrap();
            bodies.push(String::from_utf8(delivery.data.clone()).unwrap());
            delivery.ack().await.unwrap();
        }

        assert_eq!(bodies, ["1", "2", "3", "4"]);
        assert_eq!(broker.message_count("orders"), Some(0));
    }

    #[tokio::test]
    async fn rejected_message_is_dead_lettered_with_x_death() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from("orders.DL")),
        );
        ch.queue_declare("orders", durable(), args).await.unwrap();
        ch.queue_declare("orders.DL", durable(), FieldTable::default())
            .await
            .unwrap();

        publish(&ch, "orders", "poison").await;

        let mut stream = ch.basic_consume("orders", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.nack(false).await.unwrap();
        assert!(delivery.ack().await.is_err());

        let mut dead = ch.basic_consume("orders.DL", "c2").await.unwrap();
        let dead_letter = dead.next().await.unwrap().unwrap();

        assert_eq!(dead_letter.data, b"poison");
        assert_eq!(dead_letter.routing_key, "orders.DL");
        assert_eq!(dead_letter.death_count(), 1);
    }

    #[tokio::test]
    async fn requeued_message_is_redelivered() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.queue_declare("orders", durable(), FieldTable::default())
            .await
            .unwrap();

        let mut stream = ch.basic_consume("orders", "c1").await.unwrap();
        publish(&ch, "orders", "retry-me").await;

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.reject(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.data, b"retry-me");
    }

    #[tokio::test]
    async fn consuming_missing_queue_closes_channel() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;

        let err = match ch.basic_consume("missing", "c1").await {
            Err(err) => err,
            Ok(_) => panic!("consume on a missing queue must fail"),
        };

        assert!(err.0.starts_with("NOT_FOUND"));
        assert!(!ch.is_open());
    }

    #[tokio::test]
    async fn disconnect_ends_streams_and_refuses_when_unavailable() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.queue_declare("orders", durable(), FieldTable::default())
            .await
            .unwrap();
        let mut stream = ch.basic_consume("orders", "c1").await.unwrap();

        broker.disconnect_all();
        broker.set_available(false);

        assert!(stream.next().await.is_none());
        assert!(!ch.is_open());
        assert!(broker.connector().connect().await.is_err());
        assert_eq!(broker.connection_count(), 1);
    }

    async fn declared(broker: &MemoryBroker, queue: &str) -> Arc<dyn BrokerChannel> {
        let ch = channel(broker).await;
        ch.queue_declare(queue, durable(), FieldTable::default())
            .await
            .unwrap();
        ch
    }

    #[tokio::test]
    async fn unsettled_deliveries_return_to_the_queue_on_disconnect() {
        let broker = MemoryBroker::new();
        let ch = declared(&broker, "orders").await;
        let mut stream = ch.basic_consume("orders", "c1").await.unwrap();

        publish(&ch, "orders", "1").await;
        publish(&ch, "orders", "2").await;
        let first = stream.next().await.unwrap().unwrap();
        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();

        broker.disconnect_all();

        assert_eq!(broker.message_count("orders"), Some(1));
        assert!(second.ack().await.is_err());

        let ch = channel(&broker).await;
        let mut stream = ch.basic_consume("orders", "c2").await.unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();

        assert!(redelivered.redelivered);
        assert_eq!(redelivered.data, b"2");
    }

    #[tokio::test]
    async fn closing_a_channel_hands_unsettled_deliveries_to_other_consumers() {
        let broker = MemoryBroker::new();
        let first = declared(&broker, "orders").await;
        let second = channel(&broker).await;

        let mut stream = first.basic_consume("orders", "c1").await.unwrap();
        let mut other = second.basic_consume("orders", "c2").await.unwrap();

        publish(&first, "orders", "order-1").await;
        let pending = stream.next().await.unwrap().unwrap();
        assert!(!pending.redelivered);

        first.close().await.unwrap();

        let redelivered = other.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.data, b"order-1");
        assert_eq!(broker.consumer_count("orders"), Some(1));
    }

    #[tokio::test]
    async fn cancelled_consumer_drains_and_keeps_deliveries_settleable() {
        let broker = MemoryBroker::new();
        let ch = declared(&broker, "orders").await;
        let mut stream = ch.basic_consume("orders", "c1").await.unwrap();

        publish(&ch, "orders", "order-1").await;
        ch.basic_cancel("c1").await.unwrap();

        assert_eq!(broker.consumer_count("orders"), Some(0));

        let buffered = stream.next().await.unwrap().unwrap();
        assert!(stream.next().await.is_none());
        buffered.ack().await.unwrap();

        publish(&ch, "orders", "order-2").await;
        assert_eq!(broker.message_count("orders"), Some(1));
    }
}
