//! Redis-backed dispatch store (durable, at-least-once delivery).
//!
//! Layout on the server:
//! - **Payload records**: one hash per job under `{job_key_prefix}{job_id}`
//! - **Scheduled index**: a sorted set scored by due time (epoch seconds)
//! - **Delivery stream**: an append-only stream read through a consumer
//!   group; entries stay in the group's pending list until XACK'd
//!
//! The promote move (XADD + ZREM) runs in a `MULTI`/`EXEC` pipeline so it
//! is all-or-nothing: a crash can surface a job twice, never lose it.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, RedisError, Value};
use tracing::{debug, info, warn};

use relayq_core::{EntryId, JobId, JobPayload};
use relayq_queue::store::{
    BackendConnector, DeliveryStream, Disconnect, PendingEntry, QueueEntry, SchedulerStore,
    StoreError, StoreResult,
};
use relayq_queue::envelope::{JobEnvelope, WIRE_FIELD};

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    stream_key: String,
    zset_key: String,
    job_key_prefix: String,
    group: String,
    consumer: String,
}

impl RedisBackend {
    /// Connect and verify connectivity (PING).
    pub async fn connect(cfg: &Config) -> StoreResult<Self> {
        let client = redis::Client::open(cfg.redis_url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(format!("PING failed: {e}")))?;
        if pong != "PONG" {
            warn!(reply = %pong, "Redis PING returned unexpected reply");
        } else {
            info!("connected to Redis");
        }

        Ok(Self {
            conn,
            stream_key: cfg.stream_outgoing.clone(),
            zset_key: cfg.zset_scheduled.clone(),
            job_key_prefix: cfg.job_key_prefix.clone(),
            group: cfg.consumer_group.clone(),
            consumer: cfg.consumer_name.clone(),
        })
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}{}", self.job_key_prefix, job_id)
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn command_err(op: &str, e: RedisError) -> StoreError {
    StoreError::Command(format!("{op} failed: {e}"))
}

fn is_busygroup(e: &RedisError) -> bool {
    e.to_string().contains("BUSYGROUP")
}

/// Parse one stream entry: `[entry_id, [field, value, ...]]`.
fn parse_entry(entry: Value) -> StoreResult<QueueEntry> {
    let Value::Bulk(parts) = entry else {
        return Err(StoreError::Deserialization(
            "invalid stream entry format".to_string(),
        ));
    };
    if parts.len() < 2 {
        return Err(StoreError::Deserialization(
            "stream entry too short".to_string(),
        ));
    }

    let id = match &parts[0] {
        Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => {
            return Err(StoreError::Deserialization(
                "invalid stream entry id".to_string(),
            ));
        }
    };

    let Value::Bulk(raw_fields) = &parts[1] else {
        return Err(StoreError::Deserialization(
            "invalid stream entry fields".to_string(),
        ));
    };

    let mut fields = BTreeMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [Value::Data(key), Value::Data(value)] = chunk {
            fields.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }

    Ok(QueueEntry {
        id: EntryId::new(id),
        fields,
    })
}

#[async_trait]
impl SchedulerStore for RedisBackend {
    async fn put_job(&self, job_id: &JobId, payload: &JobPayload) -> StoreResult<()> {
        if payload.is_empty() {
            // HSET requires at least one field; an empty record has nothing
            // to persist.
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.job_key(job_id));
        for (k, v) in payload.iter() {
            cmd.arg(k).arg(v);
        }
        let _: u64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| command_err("HSET", e))?;
        Ok(())
    }

    async fn job(&self, job_id: &JobId) -> StoreResult<Option<JobPayload>> {
        let mut conn = self.conn();
        let map: BTreeMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(job_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_err("HGETALL", e))?;
        // An empty hash and a missing key are indistinguishable; both mean
        // "no payload record" to the promoter.
        if map.is_empty() {
            Ok(None)
        } else {
            Ok(Some(JobPayload::from(map)))
        }
    }

    async fn schedule(
        &self,
        job_id: &JobId,
        payload: &JobPayload,
        due_time: i64,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !payload.is_empty() {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(self.job_key(job_id));
            for (k, v) in payload.iter() {
                cmd.arg(k).arg(v);
            }
            pipe.add_command(cmd).ignore();
        }
        // ZADD updates the score of an existing member in place, so the
        // index never holds a job twice.
        pipe.cmd("ZADD")
            .arg(&self.zset_key)
            .arg(due_time)
            .arg(job_id.as_str())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| command_err("schedule pipeline", e))?;
        Ok(())
    }

    async fn due_jobs(&self, now: i64, limit: usize) -> StoreResult<Vec<(JobId, i64)>> {
        let mut conn = self.conn();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.zset_key)
            .arg("-inf")
            .arg(now)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_err("ZRANGEBYSCORE", e))?;
        Ok(entries
            .into_iter()
            .map(|(id, score)| (JobId::new(id), score as i64))
            .collect())
    }

    async fn remove_scheduled(&self, job_id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("ZREM")
            .arg(&self.zset_key)
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_err("ZREM", e))?;
        Ok(removed > 0)
    }

    async fn promote(&self, envelope: &JobEnvelope) -> StoreResult<()> {
        let encoded = envelope
            .encode()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(WIRE_FIELD)
            .arg(&encoded)
            .ignore()
            .cmd("ZREM")
            .arg(&self.zset_key)
            .arg(envelope.job_id.as_str())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| command_err("promote pipeline", e))?;
        debug!(job_id = %envelope.job_id, stream = %self.stream_key, "job promoted");
        Ok(())
    }
}

#[async_trait]
impl DeliveryStream for RedisBackend {
    async fn ensure_group(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        // Create the group at the END of the stream so only new entries are
        // consumed; MKSTREAM creates the stream itself if absent.
        let created: Result<String, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => {
                info!(group = %self.group, stream = %self.stream_key, "created consumer group");
                Ok(())
            }
            Err(e) if is_busygroup(&e) => {
                debug!(group = %self.group, stream = %self.stream_key, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(command_err("XGROUP CREATE", e)),
        }
    }

    async fn read_new(&self, count: usize, block: Duration) -> StoreResult<Vec<QueueEntry>> {
        let mut conn = self.conn();
        let reply: Option<HashMap<String, Vec<Value>>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_err("XREADGROUP", e))?;

        let Some(streams) = reply else {
            // Block elapsed with nothing new.
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for raw in streams.get(&self.stream_key).cloned().unwrap_or_default() {
            match parse_entry(raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "skipping unparseable stream entry"),
            }
        }
        Ok(entries)
    }

    async fn acknowledge(&self, entry_id: &EntryId) -> StoreResult<bool> {
        let mut conn = self.conn();
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_err("XACK", e))?;
        Ok(acked > 0)
    }

    async fn pending(&self, count: usize) -> StoreResult<Vec<PendingEntry>> {
        let mut conn = self.conn();
        let rows: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_err("XPENDING", e))?;
        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, deliveries)| PendingEntry {
                id: EntryId::new(id),
                consumer,
                idle_ms,
                deliveries,
            })
            .collect())
    }
}

#[async_trait]
impl Disconnect for RedisBackend {
    async fn close(&self) {
        // The multiplexed connection tears down when the last clone drops;
        // nothing to flush.
        debug!("redis backend connection closed");
    }
}

/// Connector opening one independent connection per call.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    cfg: Config,
}

impl RedisConnector {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl BackendConnector for RedisConnector {
    type Backend = RedisBackend;

    async fn connect(&self) -> StoreResult<RedisBackend> {
        RedisBackend::connect(&self.cfg).await
    }
}
