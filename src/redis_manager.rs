//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Job queue operations (BLPOP)
//! - Job result storage and publishing
//! - Sweep result publishing

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{info, warn};

use crate::jobs::{JobResult, WorkerJob};
use crate::reaper::SweepResult;

/// Redis key constants
pub mod keys {
    /// Lifecycle job queue key
    pub const JOB_QUEUE: &str = "sandbox:queue";

    /// Job result key prefix (for polling)
    pub const JOB_RESULT_PREFIX: &str = "sandbox:result:";

    /// Job result channel (for pub/sub)
    pub const JOB_RESULT_CHANNEL: &str = "sandbox:results";

    /// Sweep result channel (for pub/sub)
    pub const SWEEP_RESULT_CHANNEL: &str = "sandbox:sweeps";
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

/// Owner of the queue connection
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self { client, conn })
    }

    /// Create a new RedisManager using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    /// Publisher sharing this manager's client, for use from spawned job tasks
    pub fn publisher(&self) -> ResultPublisher {
        ResultPublisher {
            client: self.client.clone(),
            conn: self.conn.clone(),
        }
    }

    /// Block and wait for the next job from the queue.
    ///
    /// Malformed jobs are logged and skipped. Automatically reconnects on
    /// connection failure.
    pub async fn pop_job(&mut self) -> Result<WorkerJob> {
        loop {
            let result: Option<(String, String)> =
                match self.conn.blpop(keys::JOB_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.conn = get_connection_with_retry(&self.client).await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<WorkerJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }
}

/// Cloneable handle for storing and publishing results
#[derive(Clone)]
pub struct ResultPublisher {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl ResultPublisher {
    /// Store a job result for polling and publish it to subscribers
    pub async fn store_job_result(&mut self, result: &JobResult) -> Result<()> {
        self.store_result(
            &result_key(&result.request_id),
            Some(keys::JOB_RESULT_CHANNEL),
            result,
        )
        .await
    }

    /// Publish a sweep result; sweeps are not stored
    pub async fn publish_sweep(&mut self, result: &SweepResult) -> Result<()> {
        let json = serde_json::to_string(result)?;
        if let Err(e) = self
            .conn
            .publish::<_, _, ()>(keys::SWEEP_RESULT_CHANNEL, &json)
            .await
        {
            warn!("Failed to publish sweep result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .publish::<_, _, ()>(keys::SWEEP_RESULT_CHANNEL, &json)
                .await?;
        }
        Ok(())
    }

    /// Internal helper to store and publish a result
    async fn store_result<T: Serialize>(
        &mut self,
        key: &str,
        channel: Option<&str>,
        result: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(result)?;

        // Try to store, reconnect on failure
        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish to channel (ignore errors as there may be no subscribers)
        if let Some(chan) = channel {
            let _ = self.conn.publish::<_, _, ()>(chan, &json).await;
        }

        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

fn result_key(request_id: &str) -> String {
    format!("{}{}", keys::JOB_RESULT_PREFIX, request_id)
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
