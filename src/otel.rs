// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in AMQP message headers. The publisher injects the
//! current context into outgoing headers and deliveries expose the extracted
//! context so consumers can continue the trace.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Returns `headers` extended with the propagation fields of `ctx`. Existing
/// headers are kept.
pub(crate) fn inject_context(ctx: &Context, headers: Option<&FieldTable>) -> FieldTable {
    let mut btree = headers.map(|h| h.inner().clone()).unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector { headers: &mut btree })
    });

    FieldTable::from(btree)
}

pub(crate) fn extract_context(props: &BasicProperties) -> Context {
    let headers = props.headers().clone().unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor {
            headers: headers.inner(),
        })
    })
}
