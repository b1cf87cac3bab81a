// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Descriptors
//!
//! This module defines the logical queue descriptor handed to
//! `Service::declare_queues` and derives the broker arguments for the primary
//! queue and its paired dead-letter queue.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::{collections::HashSet, time::Duration};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Suffix appended to a queue name to build its dead-letter queue name
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".DL";
/// Message TTL of every dead-letter queue: 7 days in milliseconds
pub const DEAD_LETTER_QUEUE_TTL: i64 = 604_800_000;

/// Definition of a durable queue with an optional message TTL.
///
/// Every queue is provisioned together with a dead-letter queue named
/// `<name>.DL` that receives rejected and expired messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    /// Zero or `None` means no message TTL on the primary queue
    pub ttl: Option<Duration>,
}

impl Queue {
    pub fn new(name: &str) -> Queue {
        Queue {
            name: name.to_owned(),
            ttl: None,
        }
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn dead_letter_queue_name(&self) -> String {
        format!("{}{}", self.name, DEAD_LETTER_QUEUE_SUFFIX)
    }

    fn ttl_millis(&self) -> Option<i64> {
        self.ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
    }

    /// Arguments of the primary queue: dead-letter through the default
    /// exchange into `<name>.DL`, plus the message TTL when set.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();

        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(self.dead_letter_queue_name())),
        );

        if let Some(ttl) = self.ttl_millis() {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongLongInt(LongLongInt::from(ttl)),
            );
        }

        args
    }

    /// Arguments of the dead-letter queue. Messages expiring there are dropped.
    pub(crate) fn dead_letter_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongLongInt(LongLongInt::from(DEAD_LETTER_QUEUE_TTL)),
        );
        args
    }
}

/// Checks a provisioning batch: names must be non-empty and unique.
pub(crate) fn validate(queues: &[Queue]) -> Result<(), AmqpError> {
    let mut seen = HashSet::with_capacity(queues.len());

    for queue in queues {
        if queue.name.is_empty() {
            return Err(AmqpError::InvalidQueueDefinition(
                "queue name must not be empty".to_owned(),
            ));
        }

        if !seen.insert(queue.name.as_str()) {
            return Err(AmqpError::InvalidQueueDefinition(format!(
                "queue `{}` is declared more than once",
                queue.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl_of(args: &FieldTable) -> Option<&AMQPValue> {
        args.inner().get(AMQP_HEADERS_MESSAGE_TTL)
    }

    #[test]
    fn dead_letter_name_has_suffix() {
        assert_eq!(Queue::new("orders").dead_letter_queue_name(), "orders.DL");
    }

    #[test]
    fn primary_arguments_route_to_dead_letter_queue() {
        let args = Queue::new("orders").arguments();

        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("orders.DL")))
        );
        assert_eq!(ttl_of(&args), None);
    }

    #[test]
    fn zero_ttl_sets_no_message_ttl() {
        let args = Queue::new("orders").ttl(Duration::ZERO).arguments();
        assert_eq!(ttl_of(&args), None);
    }

    #[test]
    fn ttl_is_set_in_milliseconds() {
        let args = Queue::new("orders")
            .ttl(Duration::from_secs(5))
            .arguments();

        assert_eq!(
            ttl_of(&args),
            Some(&AMQPValue::LongLongInt(LongLongInt::from(5000)))
        );
    }

    #[test]
    fn dead_letter_ttl_ignores_primary_ttl() {
        let args = Queue::new("orders")
            .ttl(Duration::from_millis(10))
            .dead_letter_arguments();

        assert_eq!(
            ttl_of(&args),
            Some(&AMQPValue::LongLongInt(LongLongInt::from(604_800_000)))
        );
        assert_eq!(args.inner().len(), 1);
    }

    #[test]
    fn validate_rejects_empty_and_duplicate_names() {
        assert!(validate(&[Queue::new("a"), Queue::new("b")]).is_ok());
        assert!(matches!(
            validate(&[Queue::new("")]),
            Err(AmqpError::InvalidQueueDefinition(_))
        ));
        assert!(matches!(
            validate(&[Queue::new("a"), Queue::new("a")]),
            Err(AmqpError::InvalidQueueDefinition(_))
        ));
    }
}
