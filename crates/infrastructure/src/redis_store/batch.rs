//! Translation between store batches and Redis pipelines.

use std::collections::HashMap;

use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, Pipeline, Value};

use taskproc_core::{TaskProcError, TaskProcResult};
use taskproc_domain::{StoreBatch, StoreOp, StoreReply};

/// Run a batch in one round trip. `atomic` wraps it in MULTI/EXEC for
/// all-or-nothing apply; otherwise the commands are independent.
pub(crate) async fn run_pipeline(
    conn: &mut MultiplexedConnection,
    batch: StoreBatch,
    atomic: bool,
) -> TaskProcResult<Vec<StoreReply>> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }

    let ops = batch.into_ops();
    let mut pipe = Pipeline::with_capacity(ops.len());
    if atomic {
        pipe.atomic();
    }
    for op in &ops {
        add_op(&mut pipe, op);
    }

    let context = if atomic { "MULTI/EXEC" } else { "pipeline" };
    let values: Vec<Value> = pipe
        .query_async(conn)
        .await
        .map_err(|e| TaskProcError::store(context, e))?;

    ops.iter()
        .zip(values)
        .map(|(op, value)| convert_reply(op, value))
        .collect()
}

fn add_op(pipe: &mut Pipeline, op: &StoreOp) {
    match op {
        StoreOp::Set { key, value } => {
            pipe.cmd("SET").arg(key).arg(value);
        }
        StoreOp::Delete { key } => {
            pipe.cmd("DEL").arg(key);
        }
        StoreOp::SetIfAbsent { key, value } => {
            pipe.cmd("SETNX").arg(key).arg(value);
        }
        StoreOp::ExpireIn { key, ttl } => {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as i64);
        }
        StoreOp::HashGetAll { key } => {
            pipe.cmd("HGETALL").arg(key);
        }
        StoreOp::HashSetMany { key, entries } => {
            let mut cmd = pipe.cmd("HSET").arg(key);
            for (field, value) in entries {
                cmd = cmd.arg(field).arg(value);
            }
        }
        StoreOp::HashDeleteFields { key, fields } => {
            let mut cmd = pipe.cmd("HDEL").arg(key);
            for field in fields {
                cmd = cmd.arg(field);
            }
        }
        StoreOp::ListAppend { key, value } => {
            pipe.cmd("RPUSH").arg(key).arg(value);
        }
        StoreOp::ListPopFirst { key } => {
            pipe.cmd("LPOP").arg(key);
        }
        StoreOp::ListRemove { key, value } => {
            pipe.cmd("LREM").arg(key).arg(0).arg(value);
        }
        StoreOp::SetAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member);
        }
        StoreOp::SetRemove { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member);
        }
    }
}

fn convert_reply(op: &StoreOp, value: Value) -> TaskProcResult<StoreReply> {
    let reply = match op {
        StoreOp::Set { .. } => StoreReply::Unit,
        StoreOp::Delete { .. }
        | StoreOp::HashSetMany { .. }
        | StoreOp::HashDeleteFields { .. }
        | StoreOp::ListAppend { .. }
        | StoreOp::ListRemove { .. }
        | StoreOp::SetAdd { .. }
        | StoreOp::SetRemove { .. } => StoreReply::Int(from_value(&value)?),
        StoreOp::SetIfAbsent { .. } | StoreOp::ExpireIn { .. } => {
            StoreReply::Bool(from_value(&value)?)
        }
        StoreOp::HashGetAll { .. } => {
            let map: HashMap<String, String> = from_value(&value)?;
            StoreReply::Map(map)
        }
        StoreOp::ListPopFirst { .. } => {
            let popped: Option<String> = from_value(&value)?;
            StoreReply::Value(popped)
        }
    };
    Ok(reply)
}

fn from_value<T: FromRedisValue>(value: &Value) -> TaskProcResult<T> {
    T::from_redis_value(value).map_err(|e| TaskProcError::store("decode pipeline reply", e))
}
