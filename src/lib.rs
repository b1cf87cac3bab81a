// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Queue provisioning, consumption and publishing over a single shared AMQP
//! connection, with paired dead-letter queues and tracing propagation.

mod otel;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod service;
pub mod topology;
