// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Each `ChannelManager` owns one long-lived channel for a single role
//! (publish or consume) behind its own lock, so a blocked or failed channel of
//! one role never stalls the other. Channels are opened lazily from the shared
//! `ConnectionManager` and reopened transparently once they are observed closed.

use crate::{broker::BrokerChannel, connection::ConnectionManager, errors::AmqpError};
use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// What a channel is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Publish,
    Consume,
    /// Short-lived channel used by `declare_queues`
    Declare,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Publish => write!(f, "publish"),
            ChannelRole::Consume => write!(f, "consume"),
            ChannelRole::Declare => write!(f, "declare"),
        }
    }
}

pub struct ChannelManager {
    role: ChannelRole,
    connection: Arc<ConnectionManager>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    prefetch_count: Arc<AtomicU16>,
}

/// Exclusive access to a role's channel. The role lock is held until the
/// guard is dropped.
pub struct ChannelGuard<'a> {
    role: ChannelRole,
    slot: MutexGuard<'a, Option<Arc<dyn BrokerChannel>>>,
    channel: Arc<dyn BrokerChannel>,
}

impl ChannelGuard<'_> {
    /// Forgets the channel so the next acquisition opens a new one.
    pub fn invalidate(&mut self) {
        warn!(role = %self.role, "discarding amqp channel");
        *self.slot = None;
    }
}

impl Deref for ChannelGuard<'_> {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl ChannelManager {
    /// `prefetch_count` is shared with the service; it is read each time a
    /// consume channel is opened and ignored for other roles. Zero keeps the
    /// broker default.
    pub fn new(
        role: ChannelRole,
        connection: Arc<ConnectionManager>,
        prefetch_count: Arc<AtomicU16>,
    ) -> Self {
        ChannelManager {
            role,
            connection,
            channel: Mutex::new(None),
            prefetch_count,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Locks the role's channel, opening a new one when absent or closed.
    pub async fn acquire(&self) -> Result<ChannelGuard<'_>, AmqpError> {
        let mut slot = self.channel.lock().await;

        let channel = match slot.as_ref() {
            Some(channel) if channel.is_open() => channel.clone(),
            _ => {
                let channel = self.open().await?;
                *slot = Some(channel.clone());
                channel
            }
        };

        Ok(ChannelGuard {
            role: self.role,
            slot,
            channel,
        })
    }

    /// Returns a live channel without keeping the role locked.
    pub async fn get_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let guard = self.acquire().await?;
        Ok(guard.channel.clone())
    }

    /// Drops `stale` if it is still the role's current channel.
    pub async fn invalidate(&self, stale: &Arc<dyn BrokerChannel>) {
        let mut slot = self.channel.lock().await;

        if slot.as_ref().is_some_and(|current| {
            std::ptr::eq(
                Arc::as_ptr(current) as *const (),
                Arc::as_ptr(stale) as *const (),
            )
        }) {
            warn!(role = %self.role, "discarding amqp channel");
            *slot = None;
        }
    }

    /// Closes the role's channel, if open.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let channel = self.channel.lock().await.take();

        match channel {
            Some(channel) if channel.is_open() => channel.close().await.map_err(|err| {
                error!(role = %self.role, error = err.to_string(), "failure to close the channel");
                AmqpError::ChannelError {
                    role: self.role,
                    reason: err.to_string(),
                }
            }),
            _ => Ok(()),
        }
    }

    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.connection.open_channel(self.role).await?;

        if self.role == ChannelRole::Publish {
            debug!("enabling publisher confirms");
            if let Err(err) = channel.confirm_select().await {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "failure to close the channel");
                }
                return Err(AmqpError::ChannelError {
                    role: self.role,
                    reason: err.to_string(),
                });
            }
        }

        if self.role == ChannelRole::Consume {
            let prefetch = self.prefetch_count.load(Ordering::SeqCst);
            if prefetch > 0 {
                debug!(prefetch, "configuring consume qos");
                if let Err(err) = channel.basic_qos(prefetch).await {
                    error!(error = err.to_string(), "failure to configure qos");
                    if let Err(err) = channel.close().await {
                        debug!(error = err.to_string(), "failure to close the channel");
                    }
                    return Err(AmqpError::QoSDeclarationError(err.to_string()));
                }
            }
        }

        Ok(channel)
    }
}
