// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! The `ConnectionManager` owns the single broker connection shared by every
//! channel of the service. The connection is opened lazily, reused while it is
//! alive and reopened when it is observed dead.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Connector},
    channel::ChannelRole,
    errors::AmqpError,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        ConnectionManager {
            connector,
            connection: Mutex::new(None),
        }
    }

    /// Returns a live connection, opening one if absent or no longer connected.
    ///
    /// The validity check and the reopen happen under the same lock so two
    /// callers never open two parallel connections.
    pub async fn get_connection(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.is_connected() {
                return Ok(conn.clone());
            }
            warn!("amqp connection is no longer connected, reopening");
            *guard = None;
        }

        debug!("creating amqp connection...");
        let conn = match self.connector.connect().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drops `stale` so the next `get_connection` reopens. A connection that
    /// already replaced it is left untouched.
    pub async fn invalidate(&self, stale: &Arc<dyn BrokerConnection>) {
        let mut guard = self.connection.lock().await;

        if guard.as_ref().is_some_and(|current| same(current, stale)) {
            debug!("dropping amqp connection");
            *guard = None;
        }
    }

    /// Opens a fresh channel for `role`.
    ///
    /// A failed open is attempted exactly once more before the error surfaces.
    /// The retry reuses the connection while it is still connected, so the
    /// channels of other roles are never stranded on a forgotten connection.
    pub async fn open_channel(&self, role: ChannelRole) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.try_open_channel(role).await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                warn!(role = %role, error = err.to_string(), "failure to open channel, retrying once");
                self.try_open_channel(role).await
            }
        }
    }

    async fn try_open_channel(&self, role: ChannelRole) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let conn = self
            .get_connection()
            .await
            .map_err(|err| AmqpError::ChannelError {
                role,
                reason: err.to_string(),
            })?;

        debug!(role = %role, "creating amqp channel...");
        match conn.open_channel().await {
            Ok(channel) => {
                debug!(role = %role, "channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(role = %role, error = err.to_string(), "error to create the channel");
                if !conn.is_connected() {
                    self.invalidate(&conn).await;
                }
                Err(AmqpError::ChannelError {
                    role,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Closes the current connection, if any.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let conn = self.connection.lock().await.take();

        match conn {
            Some(conn) => conn.close().await.map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError(err.to_string())
            }),
            None => Ok(()),
        }
    }
}

fn same(a: &Arc<dyn BrokerConnection>, b: &Arc<dyn BrokerConnection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
