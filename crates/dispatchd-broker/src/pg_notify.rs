//! LISTEN/NOTIFY transport on Postgres.
//!
//! Each subscribed channel becomes a LISTEN registration on a dedicated
//! [`sqlx::postgres::PgListener`] connection; publishing runs
//! `SELECT pg_notify($1, $2)` on a small connection pool.  Channel names are
//! validated before anything reaches the server, payload text rides through
//! bind parameters.
//!
//! Delivery semantics are whatever pg_notify provides: at-most-once per
//! listening connection, no persistence.  The dispatcher layers no stronger
//! guarantee on top.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::channel::validate_channel_name;
use crate::error::{BrokerError, Result};
use crate::Broker;

/// A [`Broker`] over Postgres notify channels.
pub struct PgBroker {
    dsn: String,
    pool: Mutex<Option<PgPool>>,
    listener: Mutex<Option<PgListener>>,
}

impl PgBroker {
    /// Create a broker for the given connection string.  No connection is
    /// made until [`Broker::connect`] or [`Broker::subscribe`].
    #[must_use]
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            pool: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    async fn pool(&self) -> Result<PgPool> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&self.dsn)
            .await?;
        tracing::debug!("pg_notify publish pool connected");
        *guard = Some(pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn connect(&self) -> Result<()> {
        self.pool().await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        for name in channels {
            validate_channel_name(name)?;
        }
        let mut listener = PgListener::connect(&self.dsn).await?;
        listener
            .listen_all(channels.iter().map(String::as_str))
            .await?;
        for name in channels {
            tracing::info!(channel = %name, "listening on pg_notify channel");
        }
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn recv(&self) -> Result<(String, String)> {
        let mut guard = self.listener.lock().await;
        let listener = guard.as_mut().ok_or(BrokerError::NotConnected)?;
        let notification = listener.recv().await?;
        tracing::trace!(channel = %notification.channel(), "pg_notify notification received");
        Ok((
            notification.channel().to_string(),
            notification.payload().to_string(),
        ))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        validate_channel_name(channel)?;
        let pool = self.pool().await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&pool)
            .await?;
        tracing::trace!(channel = %channel, "pg_notify message sent");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.listener.lock().await = None;
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
        Ok(())
    }
}
