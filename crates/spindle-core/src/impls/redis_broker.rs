//! Redis broker.
//!
//! Each lifecycle operation is a Lua script, so the existence check, the
//! sorted-set move and the hash update happen in one round trip and no other
//! client can observe a half-applied transition.
//!
//! Key layout (the queue name sits in a hash tag so all of a queue's keys
//! land in one cluster slot):
//! - `spindle:{<queue>}:task:<id>`: hash with the task record (retention in ms)
//! - `spindle:{<queue>}:pending`: sorted set scored by enqueue time (µs)
//! - `spindle:{<queue>}:active`: sorted set scored by dequeue time (µs)

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::domain::{BrokerError, TaskId, TaskMessage, TaskState};
use crate::observability::QueueCounts;
use crate::ports::broker::ensure_terminal;
use crate::ports::{Broker, Clock, SystemClock};

const KEY_PREFIX: &str = "spindle";

/// Hash fields, in the order the dequeue script returns them.
const FIELDS: [&str; 6] = ["id", "type", "payload", "queue", "retention", "state"];

static ENQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return -1
end
redis.call("HSET", KEYS[1],
           "id", ARGV[1],
           "type", ARGV[2],
           "payload", ARGV[3],
           "queue", ARGV[4],
           "retention", ARGV[5],
           "state", "queued")
redis.call("ZADD", KEYS[2], ARGV[6], ARGV[1])
return 0
"#,
    )
});

static DEQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local popped = redis.call("ZPOPMIN", KEYS[1])
if #popped == 0 then
    return nil
end
local id = popped[1]
local key = ARGV[2] .. id
if redis.call("EXISTS", key) == 0 then
    return {id}
end
redis.call("ZADD", KEYS[2], ARGV[1], id)
redis.call("HSET", key, "state", "running")
return redis.call("HMGET", key, "id", "type", "payload", "queue", "retention", "state")
"#,
    )
});

static COMPLETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call("ZSCORE", KEYS[1], ARGV[1]) == false then
    return -1
end
redis.call("ZREM", KEYS[1], ARGV[1])
if redis.call("EXISTS", KEYS[2]) == 1 then
    redis.call("HSET", KEYS[2], "state", ARGV[2])
    redis.call("PEXPIREAT", KEYS[2], ARGV[3])
end
return 0
"#,
    )
});

fn task_key_prefix(queue: &str) -> String {
    format!("{KEY_PREFIX}:{{{queue}}}:task:")
}

fn task_key(queue: &str, id: &TaskId) -> String {
    format!("{}{id}", task_key_prefix(queue))
}

fn pending_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:{{{queue}}}:pending")
}

fn active_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:{{{queue}}}:active")
}

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisBroker {
    /// Connect using a `redis://host:port/db` URL.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("connected to redis");
        Ok(Self::with_connection(conn, Arc::new(SystemClock)))
    }

    pub fn with_connection(conn: ConnectionManager, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }

    async fn dequeue_one(&self, queue: &str) -> Result<Option<TaskMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let values: Option<Vec<Option<Vec<u8>>>> = DEQUEUE
            .key(pending_key(queue))
            .key(active_key(queue))
            .arg(self.clock.now().timestamp_micros())
            .arg(task_key_prefix(queue))
            .invoke_async(&mut conn)
            .await?;

        values.map(decode_record).transpose()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, msg: &TaskMessage) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let result: i64 = ENQUEUE
            .key(task_key(&msg.queue, &msg.id))
            .key(pending_key(&msg.queue))
            .arg(msg.id.as_str())
            .arg(msg.task_type.as_str())
            .arg(msg.payload.as_slice())
            .arg(msg.queue.as_str())
            .arg(retention_millis(msg.retention))
            .arg(self.clock.now().timestamp_micros())
            .invoke_async(&mut conn)
            .await?;

        if result == -1 {
            return Err(BrokerError::AlreadyExists {
                queue: msg.queue.clone(),
                id: msg.id.clone(),
            });
        }
        debug!(task_id = %msg.id, queue = %msg.queue, "enqueued");
        Ok(())
    }

    async fn dequeue(&self, queues: &[String]) -> Result<TaskMessage, BrokerError> {
        for queue in queues {
            if let Some(msg) = self.dequeue_one(queue).await? {
                return Ok(msg);
            }
        }
        Err(BrokerError::EmptyQueue)
    }

    async fn complete(
        &self,
        queue: &str,
        id: &TaskId,
        outcome: TaskState,
        expire_at: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        ensure_terminal(outcome)?;

        let mut conn = self.conn.clone();
        let result: i64 = COMPLETE
            .key(active_key(queue))
            .key(task_key(queue, id))
            .arg(id.as_str())
            .arg(outcome.as_str())
            .arg(expire_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if result == -1 {
            return Err(BrokerError::NotFound {
                queue: queue.to_string(),
                id: id.clone(),
            });
        }
        Ok(())
    }

    async fn lookup(&self, queue: &str, id: &TaskId) -> Result<Option<TaskMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut fields: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(task_key(queue, id))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        let values = FIELDS.iter().map(|name| fields.remove(*name)).collect();
        decode_record(values).map(Some)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError> {
        let mut conn = self.conn.clone();
        let pending: usize = redis::cmd("ZCARD")
            .arg(pending_key(queue))
            .query_async(&mut conn)
            .await?;
        let active: usize = redis::cmd("ZCARD")
            .arg(active_key(queue))
            .query_async(&mut conn)
            .await?;
        Ok(QueueCounts { pending, active })
    }
}

fn retention_millis(retention: Duration) -> u64 {
    u64::try_from(retention.as_millis()).unwrap_or(u64::MAX)
}

/// Decode hash values given in `FIELDS` order.
///
/// A one-element reply is the dequeue script reporting a popped ID whose
/// record is gone; the ID has already been dropped from the pending set.
fn decode_record(values: Vec<Option<Vec<u8>>>) -> Result<TaskMessage, BrokerError> {
    if let [Some(id)] = values.as_slice() {
        return Err(BrokerError::Decode(format!(
            "record for task {} is missing",
            String::from_utf8_lossy(id)
        )));
    }

    let [id, task_type, payload, queue, retention, state]: [Option<Vec<u8>>; 6] =
        values.try_into().map_err(|v: Vec<_>| {
            BrokerError::Decode(format!("expected {} fields, got {}", FIELDS.len(), v.len()))
        })?;

    let retention = text("retention", retention)?;
    let retention = retention
        .parse::<u64>()
        .map_err(|e| BrokerError::Decode(format!("field retention={retention:?}: {e}")))?;
    let state = text("state", state)?
        .parse::<TaskState>()
        .map_err(BrokerError::Decode)?;

    Ok(TaskMessage {
        id: TaskId::new(text("id", id)?),
        task_type: text("type", task_type)?,
        payload: field("payload", payload)?,
        queue: text("queue", queue)?,
        retention: Duration::from_millis(retention),
        state,
    })
}

fn field(name: &str, value: Option<Vec<u8>>) -> Result<Vec<u8>, BrokerError> {
    value.ok_or_else(|| BrokerError::Decode(format!("missing field {name}")))
}

fn text(name: &str, value: Option<Vec<u8>>) -> Result<String, BrokerError> {
    String::from_utf8(field(name, value)?)
        .map_err(|e| BrokerError::Decode(format!("field {name} is not utf-8: {e}")))
}
