//! Broker on Redis Streams.
//!
//! One stream and consumer group per job kind. Delayed publications wait in
//! a sorted set and are moved onto the stream by whichever consumer sees
//! them due first.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use redis::RedisError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vidforge_core::domain::{JobId, JobKind};
use vidforge_core::port::{Broker, BrokerError, Delivery, TimeProvider};

use crate::config::RedisBrokerConfig;

/// Due delayed entries moved per consume call
const PROMOTE_BATCH: usize = 100;

fn map_redis_error(err: RedisError) -> BrokerError {
    if err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_io_error()
    {
        BrokerError::Unavailable(err.to_string())
    } else {
        BrokerError::Protocol(err.to_string())
    }
}

pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    /// One connection per consumer for blocking reads
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
    config: RedisBrokerConfig,
    time_provider: Arc<dyn TimeProvider>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Open the client and one shared connection. Readiness (group creation)
    /// is left to `ready`.
    pub async fn connect(
        config: RedisBrokerConfig,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BrokerError::Unavailable(format!("invalid broker url: {}", e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;

        info!(key_prefix = %config.key_prefix, "Connected to redis broker");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(HashMap::new()),
            config,
            time_provider,
            closed: AtomicBool::new(false),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(self.conn.clone())
    }

    /// The consumer's blocking-read connection, opened on first use
    async fn blocking_connection(&self, consumer: &str) -> Result<MultiplexedConnection, BrokerError> {
        let mut conns = self.blocking.lock().await;
        if let Some(conn) = conns.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        debug!(consumer = %consumer, "Opened blocking connection");
        conns.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    async fn xadd(&self, kind: JobKind, job_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let message_id: String = redis::cmd("XADD")
            .arg(self.config.stream_key(kind))
            .arg("*")
            .arg("job_id")
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        debug!(job_id = %job_id, kind = %kind, message_id = %message_id, "Published job");
        Ok(())
    }

    /// Move due delayed ids onto the stream. ZREM decides which consumer
    /// performs the move when several race for the same entry.
    async fn promote_due(&self, kind: JobKind) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let delayed_key = self.config.delayed_key(kind);
        let now = self.time_provider.now_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed_key)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        for job_id in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&delayed_key)
                .arg(&job_id)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            if removed == 1 {
                self.xadd(kind, &job_id).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ready(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if pong != "PONG" {
            return Err(BrokerError::Protocol(format!("unexpected PING reply {}", pong)));
        }

        for kind in JobKind::ALL {
            let stream = self.config.stream_key(kind);
            // Create consumer group (ignore error if already exists)
            let result: Result<(), RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(&self.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match result {
                Ok(()) => info!(stream = %stream, "Created consumer group"),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(stream = %stream, "Consumer group already exists");
                }
                Err(e) => return Err(map_redis_error(e)),
            }
        }
        Ok(())
    }

    async fn next_job_id(&self) -> Result<JobId, BrokerError> {
        let mut conn = self.connection()?;
        let id: u64 = redis::cmd("INCR")
            .arg(self.config.id_counter_key())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(id.to_string())
    }

    async fn publish(&self, kind: JobKind, job_id: &str) -> Result<(), BrokerError> {
        self.xadd(kind, job_id).await
    }

    async fn publish_delayed(
        &self,
        kind: JobKind,
        job_id: &str,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        if delay.is_zero() {
            return self.xadd(kind, job_id).await;
        }
        let mut conn = self.connection()?;
        let due_at = self.time_provider.now_millis() + delay.as_millis() as i64;
        redis::cmd("ZADD")
            .arg(self.config.delayed_key(kind))
            .arg(due_at)
            .arg(job_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)?;
        debug!(job_id = %job_id, kind = %kind, delay_ms = %delay.as_millis(), "Published delayed job");
        Ok(())
    }

    async fn consume(
        &self,
        kind: JobKind,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        self.promote_due(kind).await?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        // Blocking reads get their own connection so they never hold up the shared one
        let mut conn = self.blocking_connection(consumer).await?;
        let read: Result<Option<StreamReadReply>, RedisError> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(wait.as_millis() as u64)
            .arg("STREAMS")
            .arg(self.config.stream_key(kind))
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await;
        let reply = match read {
            Ok(reply) => reply,
            Err(e) => {
                // Reconnect on the next call
                self.blocking.lock().await.remove(consumer);
                return Err(map_redis_error(e));
            }
        };

        let Some(reply) = reply else {
            return Ok(None);
        };
        for stream in reply.keys {
            for entry in stream.ids {
                match entry.get::<String>("job_id") {
                    Some(job_id) => {
                        return Ok(Some(Delivery {
                            message_id: entry.id,
                            job_id,
                        }))
                    }
                    None => {
                        warn!(message_id = %entry.id, kind = %kind, "Dropping message without job_id");
                        self.ack(
                            kind,
                            &Delivery {
                                message_id: entry.id.clone(),
                                job_id: String::new(),
                            },
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, kind: JobKind, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let stream = self.config.stream_key(kind);

        redis::cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)?;

        // Delete the message from the stream
        redis::cmd("XDEL")
            .arg(&stream)
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn close(&self) {
        self.blocking.lock().await.clear();
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Redis broker closed");
        }
    }
}
