//! Redis connections and command execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::errors::{AppError, AppResult};
use common::models::CmdKind;
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::conn_cache::LiveConnection;

const DEFAULT_PORT: u16 = 6379;

/// Resolved connection parameters of one Redis db. Password is decrypted.
#[derive(Clone)]
pub struct RedisInfo {
    pub id: u64,
    pub name: String,
    /// `host:port`
    pub host: String,
    pub password: Option<String>,
    pub db: u32,
    pub tag_path: Vec<String>,
    pub flow_procdef_key: Option<String>,
}

impl RedisInfo {
    pub fn log_desc(&self) -> String {
        format!(
            "redis[id={}, tag={:?}, name={}, ip={}, db={}]",
            self.id, self.tag_path, self.name, self.host, self.db
        )
    }

    fn addr(&self) -> AppResult<(String, u16)> {
        match self.host.rsplit_once(':') {
            Some((host, port)) => port
                .parse()
                .map(|port| (host.to_string(), port))
                .map_err(|_| AppError::Validation(format!("redis地址端口无效: {}", self.host))),
            None => Ok((self.host.clone(), DEFAULT_PORT)),
        }
    }
}

/// Sends raw commands to a server.
#[async_trait]
pub trait CmdRunner: Send + Sync {
    /// `args[0]` is the command name.
    async fn execute(&self, args: Vec<Vec<u8>>) -> AppResult<redis::Value>;
}

struct ManagerRunner {
    manager: ConnectionManager,
}

#[async_trait]
impl CmdRunner for ManagerRunner {
    async fn execute(&self, args: Vec<Vec<u8>>) -> AppResult<redis::Value> {
        let mut cmd = redis::Cmd::new();
        for arg in &args {
            cmd.arg(arg.as_slice());
        }
        let mut conn = self.manager.clone();
        cmd.query_async::<redis::Value>(&mut conn)
            .await
            .map_err(|e| AppError::RedisOperation(e.to_string()))
    }
}

/// A live connection to one Redis db.
pub struct RedisConn {
    pub info: RedisInfo,
    runner: RwLock<Option<Arc<dyn CmdRunner>>>,
    closed: AtomicBool,
}

impl RedisConn {
    pub fn new(info: RedisInfo, runner: Arc<dyn CmdRunner>) -> Self {
        Self {
            info,
            runner: RwLock::new(Some(runner)),
            closed: AtomicBool::new(false),
        }
    }

    async fn runner(&self) -> AppResult<Arc<dyn CmdRunner>> {
        self.runner
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::ConnectionFailed("redis连接已关闭".into()))
    }

    /// Runs `cmd` (name followed by arguments). A nil reply is `None`.
    pub async fn run_cmd(&self, cmd: &[JsonValue]) -> AppResult<Option<JsonValue>> {
        cmd_name(cmd)?;
        let args = cmd.iter().map(json_to_arg).collect();
        let reply = self.runner().await?.execute(args).await?;
        Ok(reply_to_json(reply))
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.runner()
            .await?
            .execute(vec![b"PING".to_vec()])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl LiveConnection for RedisConn {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.runner.write().await.take();
        tracing::info!(redis = %self.info.log_desc(), "redis连接已关闭");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Opens connections from resolved parameters.
#[async_trait]
pub trait RedisConnector: Send + Sync {
    async fn connect(&self, info: RedisInfo) -> AppResult<RedisConn>;
}

/// Connector backed by `redis::aio::ConnectionManager`.
#[derive(Default)]
pub struct ManagerConnector;

#[async_trait]
impl RedisConnector for ManagerConnector {
    async fn connect(&self, info: RedisInfo) -> AppResult<RedisConn> {
        let (host, port) = info.addr()?;
        let client = redis::Client::open(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: i64::from(info.db),
                password: info.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        })
        .map_err(|e| AppError::ConnectionFailed(e.to_string()))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::ConnectionFailed(e.to_string()))?;

        tracing::info!(redis = %info.log_desc(), "连接redis");
        Ok(RedisConn::new(info, Arc::new(ManagerRunner { manager })))
    }
}

fn json_to_arg(value: &JsonValue) -> Vec<u8> {
    match value {
        JsonValue::String(s) => s.clone().into_bytes(),
        JsonValue::Number(n) => n.to_string().into_bytes(),
        JsonValue::Bool(b) => if *b { b"1".to_vec() } else { b"0".to_vec() },
        JsonValue::Null => Vec::new(),
        other => other.to_string().into_bytes(),
    }
}

fn bytes_to_json(bytes: Vec<u8>) -> JsonValue {
    match String::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s),
        Err(e) => JsonValue::String(String::from_utf8_lossy(e.as_bytes()).into_owned()),
    }
}

/// Converts a reply to JSON. `Nil` becomes `None`; nested nils become `null`.
pub fn reply_to_json(value: redis::Value) -> Option<JsonValue> {
    use redis::Value;

    let json = match value {
        Value::Nil => return None,
        Value::Int(i) => JsonValue::from(i),
        Value::BulkString(bytes) => bytes_to_json(bytes),
        Value::SimpleString(s) => JsonValue::String(s),
        Value::Okay => JsonValue::String("OK".into()),
        Value::Double(f) => JsonValue::from(f),
        Value::Boolean(b) => JsonValue::Bool(b),
        Value::VerbatimString { text, .. } => JsonValue::String(text),
        Value::Array(items) | Value::Set(items) => JsonValue::Array(
            items
                .into_iter()
                .map(|v| reply_to_json(v).unwrap_or(JsonValue::Null))
                .collect(),
        ),
        Value::Map(pairs) => JsonValue::Array(
            pairs
                .into_iter()
                .flat_map(|(k, v)| [k, v])
                .map(|v| reply_to_json(v).unwrap_or(JsonValue::Null))
                .collect(),
        ),
        other => JsonValue::String(format!("{:?}", other)),
    };
    Some(json)
}

/// Commands that change the state of the connection itself. The connection
/// is shared per `(id, db)`, so these would leak into every later caller.
const SESSION_CMDS: &[&str] = &[
    "select", "swapdb", "auth", "hello", "quit", "reset", "multi", "exec", "discard", "watch",
    "unwatch", "subscribe", "psubscribe", "ssubscribe", "monitor", "readonly", "readwrite",
];

pub fn is_session_cmd(name: &str) -> bool {
    SESSION_CMDS.contains(&name.to_ascii_lowercase().as_str())
}

/// Name of `cmd` (its first element), rejecting empty and session commands.
pub fn cmd_name(cmd: &[JsonValue]) -> AppResult<String> {
    let name = match cmd.first() {
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => return Err(AppError::Validation("命令不能为空".into())),
    };
    if is_session_cmd(&name) {
        return Err(AppError::Validation(format!("不支持执行连接状态命令: {}", name)));
    }
    Ok(name)
}

/// Read/write classification of a command name (case-insensitive).
///
/// Unknown commands are writes.
pub fn classify_cmd(name: &str) -> CmdKind {
    match name.to_ascii_lowercase().as_str() {
        // keys
        "exists" | "type" | "ttl" | "pttl" | "expiretime" | "pexpiretime" | "keys" | "scan"
        | "randomkey" | "dump" | "object" | "memory" | "dbsize" | "touch"
        // strings
        | "get" | "mget" | "strlen" | "getrange" | "substr" | "getbit" | "bitcount"
        | "bitpos" | "lcs"
        // hashes
        | "hget" | "hmget" | "hgetall" | "hkeys" | "hvals" | "hlen" | "hexists" | "hstrlen"
        | "hscan" | "hrandfield"
        // lists
        | "lrange" | "llen" | "lindex" | "lpos"
        // sets
        | "smembers" | "scard" | "sismember" | "smismember" | "srandmember" | "sscan"
        | "sinter" | "sintercard" | "sunion" | "sdiff"
        // sorted sets
        | "zrange" | "zrangebyscore" | "zrangebylex" | "zrevrange" | "zrevrangebyscore"
        | "zrevrangebylex" | "zscore" | "zmscore" | "zcard" | "zcount" | "zlexcount"
        | "zrank" | "zrevrank" | "zscan" | "zrandmember" | "zinter" | "zunion" | "zdiff"
        // streams, hyperloglog, geo
        | "xrange" | "xrevrange" | "xlen" | "xinfo" | "xread" | "xpending" | "pfcount"
        | "geopos" | "geodist" | "geohash" | "georadius_ro" | "georadiusbymember_ro"
        | "geosearch"
        // server
        | "ping" | "echo" | "info" | "time" | "lastsave" | "role" => CmdKind::Read,

        // keys
        "del" | "unlink" | "expire" | "pexpire" | "expireat" | "pexpireat" | "persist"
        | "rename" | "renamenx" | "move" | "copy" | "restore" | "sort"
        // strings
        | "set" | "setex" | "psetex" | "setnx" | "setrange" | "getset" | "getdel" | "getex"
        | "append" | "incr" | "incrby" | "incrbyfloat" | "decr" | "decrby" | "mset"
        | "msetnx" | "setbit" | "bitop" | "bitfield"
        // hashes
        | "hset" | "hsetnx" | "hmset" | "hdel" | "hincrby" | "hincrbyfloat"
        // lists
        | "lpush" | "rpush" | "lpushx" | "rpushx" | "lpop" | "rpop" | "lset" | "lrem"
        | "ltrim" | "linsert" | "lmove" | "blmove" | "rpoplpush" | "brpoplpush" | "blpop"
        | "brpop" | "lmpop" | "blmpop"
        // sets
        | "sadd" | "srem" | "spop" | "smove" | "sinterstore" | "sunionstore" | "sdiffstore"
        // sorted sets
        | "zadd" | "zrem" | "zincrby" | "zpopmin" | "zpopmax" | "bzpopmin" | "bzpopmax"
        | "zmpop" | "zremrangebyrank" | "zremrangebyscore" | "zremrangebylex"
        | "zunionstore" | "zinterstore" | "zdiffstore" | "zrangestore"
        // streams, hyperloglog, geo
        | "xadd" | "xdel" | "xtrim" | "xgroup" | "xack" | "xclaim" | "xautoclaim"
        | "pfadd" | "pfmerge" | "geoadd" | "georadius" | "georadiusbymember"
        | "geosearchstore"
        // scripting, pub/sub, server
        | "eval" | "evalsha" | "eval_ro" | "evalsha_ro" | "fcall" | "script" | "function"
        | "publish" | "flushdb" | "flushall" | "config" | "client"
        | "save" | "bgsave" | "bgrewriteaof" | "shutdown" | "debug" => CmdKind::Write,

        other => {
            tracing::debug!(cmd = %other, "未登记的命令，按写命令处理");
            CmdKind::Write
        }
    }
}
