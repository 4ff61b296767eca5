//! Job queue: wire format and the Redis-backed list the worker pops from.
//!
//! # Keys
//!
//! - `hooks.worker.<queue>`: list of JSON jobs `{"command": ..., "args": {...}}`
//! - `hooks.worker.version`: integer bumped to retire running workers

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::DaemonConfig;
use crate::error::{Error, Result};

pub const KEY_PREFIX: &str = "hooks.worker";
pub const VERSION_KEY: &str = "hooks.worker.version";

pub fn queue_key(queue: &str) -> String {
    format!("{}.{}", KEY_PREFIX, queue)
}

/// Pipeline a job is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Install,
    Clean,
}

impl JobKind {
    /// Unknown commands run as installs.
    pub fn route(command: &str) -> Self {
        match command {
            "clean" => JobKind::Clean,
            _ => JobKind::Install,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub command: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawJob {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: BTreeMap<String, Value>,
}

impl Job {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> JobKind {
        JobKind::route(&self.command)
    }

    /// Parse a queue payload. Scalar arg values are stringified (`true`,
    /// `12`); `null` becomes an empty string.
    pub fn decode(payload: &str) -> Result<Self> {
        let raw: RawJob = serde_json::from_str(payload)
            .map_err(|e| Error::validation_invalid_json(e, Some("decode job".to_string())))?;

        let mut args = BTreeMap::new();
        for (key, value) in raw.args {
            let value = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(Error::validation_invalid_argument(
                        key,
                        format!("job argument must be a scalar, got {}", other),
                        None,
                        None,
                    ))
                }
            };
            args.insert(key, value);
        }

        Ok(Self {
            command: raw.command,
            args,
        })
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::internal_json(e.to_string(), Some("encode job".to_string())))
    }

    /// `key=value` pairs for log lines.
    pub fn summary(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{} {}", self.command, args.join(" ")).trim().to_string()
    }
}

/// The operations the worker needs from a queue backend.
pub trait JobQueue {
    /// Block up to `timeout` for the next payload.
    fn pop(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Current shared worker version, if one was ever set.
    fn version(&mut self) -> Result<Option<i64>>;

    fn push(&mut self, payload: &str) -> Result<()>;

    /// Bump the shared worker version and return the new value.
    fn incr_version(&mut self) -> Result<i64>;
}

pub struct RedisQueue {
    connection: redis::Connection,
    key: String,
}

impl RedisQueue {
    pub fn connect(daemon: &DaemonConfig) -> Result<Self> {
        let url = daemon.redis_url();
        let client = redis::Client::open(url.as_str())
            .map_err(|e| Error::queue_connect_failed(&url, e.to_string()))?;
        let connection = client
            .get_connection_with_timeout(Duration::from_secs(10))
            .map_err(|e| Error::queue_connect_failed(&url, e.to_string()))?;

        Ok(Self {
            connection,
            key: queue_key(&daemon.queue),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

fn command_error(command: &str) -> impl Fn(redis::RedisError) -> Error + '_ {
    move |e| Error::queue_command_failed(command, e.to_string())
}

impl JobQueue for RedisQueue {
    fn pop(&mut self, timeout: Duration) -> Result<Option<String>> {
        let seconds = timeout.as_secs().max(1);
        // Socket timeout must outlive the server-side block.
        self.connection
            .set_read_timeout(Some(Duration::from_secs(seconds + 5)))
            .map_err(command_error("BLPOP"))?;

        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.key)
            .arg(seconds)
            .query(&mut self.connection)
            .map_err(command_error("BLPOP"))?;

        Ok(popped.map(|(_, payload)| payload))
    }

    fn version(&mut self) -> Result<Option<i64>> {
        redis::cmd("GET")
            .arg(VERSION_KEY)
            .query(&mut self.connection)
            .map_err(command_error("GET"))
    }

    fn push(&mut self, payload: &str) -> Result<()> {
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(payload)
            .query(&mut self.connection)
            .map_err(command_error("RPUSH"))?;
        Ok(())
    }

    fn incr_version(&mut self) -> Result<i64> {
        redis::cmd("INCR")
            .arg(VERSION_KEY)
            .query(&mut self.connection)
            .map_err(command_error("INCR"))
    }
}
