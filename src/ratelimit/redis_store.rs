//! Redis-backed shared counter store.
//!
//! Both algorithms run as server-side Lua scripts, so prune, count and
//! conditional insert execute as one indivisible step on the Redis server.
//!
//! - Sliding window: a sorted set per identity; members are unique admission
//!   markers scored by admission time in milliseconds.
//! - Leaky bucket: a hash per identity with `tokens` and `last` fields.
//!
//! The connection is established lazily on first use and re-established by
//! `ConnectionManager` after failures, so configuring a store never blocks on
//! the network and an unreachable server only fails individual calls.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use std::fmt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::backend::{RemoteCheck, RemoteCounterStore};
use super::mode::Algorithm;
use crate::error::{GatekeeperError, Result};

// KEYS[1] = key
// ARGV[1] = cutoff (inclusive), ARGV[2] = limit, ARGV[3] = score,
// ARGV[4] = member, ARGV[5] = expiry ms
const SLIDING_WINDOW_SCRIPT: &str = r#"
    redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
    local current = redis.call("ZCARD", KEYS[1])
    if tonumber(current) < tonumber(ARGV[2]) then
        redis.call("ZADD", KEYS[1], ARGV[3], ARGV[4])
        redis.call("PEXPIRE", KEYS[1], ARGV[5])
        return 1
    end
    return 0
"#;

// KEYS[1] = key
// ARGV[1] = capacity, ARGV[2] = now ms, ARGV[3] = window ms, ARGV[4] = expiry ms
const LEAKY_BUCKET_SCRIPT: &str = r#"
    local capacity = tonumber(ARGV[1])
    local now = tonumber(ARGV[2])
    local window = tonumber(ARGV[3])

    local state = redis.call("HMGET", KEYS[1], "tokens", "last")
    local tokens = tonumber(state[1])
    local last = tonumber(state[2])
    if tokens == nil or last == nil then
        tokens = capacity
        last = now
    end

    local elapsed = now - last
    if elapsed < 0 then
        elapsed = 0
    end
    tokens = math.min(capacity, math.min(tokens, capacity) + elapsed * capacity / window)

    local admitted = 0
    if tokens >= 1 then
        tokens = tokens - 1
        admitted = 1
    end

    redis.call("HSET", KEYS[1], "tokens", tostring(tokens), "last", tostring(now))
    redis.call("PEXPIRE", KEYS[1], ARGV[4])
    return admitted
"#;

/// Connection settings for the shared Redis store.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisTarget {
    /// `host:port`
    pub address: String,
    pub password: Option<String>,
    pub db: i64,
}

impl fmt::Debug for RedisTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTarget")
            .field("address", &self.address)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .finish()
    }
}

impl RedisTarget {
    pub fn new(address: impl Into<String>, password: Option<String>, db: i64) -> Self {
        Self {
            address: address.into(),
            password: password.filter(|p| !p.is_empty()),
            db,
        }
    }

    fn connection_info(&self) -> Result<ConnectionInfo> {
        let (host, port) = split_address(&self.address)?;
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..Default::default()
            },
        })
    }
}

fn split_address(address: &str) -> Result<(String, u16)> {
    let address = address.trim();
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                GatekeeperError::Config(format!("invalid port in remote address '{}'", address))
            })?;
            Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
        }
        Some(_) => Err(GatekeeperError::Config(format!(
            "missing host in remote address '{}'",
            address
        ))),
        None if !address.is_empty() => Ok((address.to_string(), 6379)),
        None => Err(GatekeeperError::Config(
            "remote address must not be empty".to_string(),
        )),
    }
}

/// `ARGV` for the script matching `check.algorithm`, in script order.
fn script_args(check: &RemoteCheck) -> Vec<String> {
    match check.algorithm {
        Algorithm::Sliding => vec![
            (check.now_millis - check.window_millis).to_string(),
            check.limit.to_string(),
            check.now_millis.to_string(),
            check.member.clone(),
            check.expiry_millis.to_string(),
        ],
        Algorithm::Leaky => vec![
            check.limit.to_string(),
            check.now_millis.to_string(),
            check.window_millis.to_string(),
            check.expiry_millis.to_string(),
        ],
    }
}

/// Redis implementation of [`RemoteCounterStore`].
pub struct RedisCounterStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    sliding_script: Script,
    leaky_script: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Prepare a store for `target` without connecting.
    ///
    /// Fails only if the target itself is malformed.
    pub fn new(target: &RedisTarget) -> Result<Self> {
        let client = Client::open(target.connection_info()?)?;
        info!(address = %target.address, db = target.db, "Remote counter store configured");
        Ok(Self::from_client(client))
    }

    /// Prepare a store from a `redis://` URL without connecting.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::from_client(Client::open(url)?))
    }

    fn from_client(client: Client) -> Self {
        Self {
            client,
            connection: OnceCell::new(),
            sliding_script: Script::new(SLIDING_WINDOW_SCRIPT),
            leaky_script: Script::new(LEAKY_BUCKET_SCRIPT),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to remote counter store");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl RemoteCounterStore for RedisCounterStore {
    async fn check_and_increment(&self, check: &RemoteCheck) -> Result<bool> {
        let mut connection = self.connection().await?;

        let script = match check.algorithm {
            Algorithm::Sliding => &self.sliding_script,
            Algorithm::Leaky => &self.leaky_script,
        };
        let mut invocation = script.key(check.key.as_str());
        for arg in script_args(check) {
            invocation.arg(arg);
        }
        let admitted: i64 = invocation.invoke_async(&mut connection).await?;

        Ok(admitted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_check(algorithm: Algorithm) -> RemoteCheck {
        RemoteCheck {
            key: "rate:alice".to_string(),
            algorithm,
            limit: 10,
            now_millis: 5_000,
            window_millis: 1_000,
            expiry_millis: 2_000,
            member: "5000000000-abc".to_string(),
        }
    }

    #[test]
    fn test_sliding_script_args() {
        let args = script_args(&remote_check(Algorithm::Sliding));
        assert_eq!(args, vec!["4000", "10", "5000", "5000000000-abc", "2000"]);

        // Each argument lands where the script reads it.
        assert!(SLIDING_WINDOW_SCRIPT.contains(r#""ZREMRANGEBYSCORE", KEYS[1], "-inf", ARGV[1]"#));
        assert!(SLIDING_WINDOW_SCRIPT.contains("tonumber(current) < tonumber(ARGV[2])"));
        assert!(SLIDING_WINDOW_SCRIPT.contains(r#""ZADD", KEYS[1], ARGV[3], ARGV[4]"#));
        assert!(SLIDING_WINDOW_SCRIPT.contains(r#""PEXPIRE", KEYS[1], ARGV[5]"#));
        assert!(!SLIDING_WINDOW_SCRIPT.contains("ARGV[6]"));
    }

    #[test]
    fn test_leaky_script_args() {
        let args = script_args(&remote_check(Algorithm::Leaky));
        assert_eq!(args, vec!["10", "5000", "1000", "2000"]);

        assert!(LEAKY_BUCKET_SCRIPT.contains("local capacity = tonumber(ARGV[1])"));
        assert!(LEAKY_BUCKET_SCRIPT.contains("local now = tonumber(ARGV[2])"));
        assert!(LEAKY_BUCKET_SCRIPT.contains("local window = tonumber(ARGV[3])"));
        assert!(LEAKY_BUCKET_SCRIPT.contains(r#""PEXPIRE", KEYS[1], ARGV[4]"#));
        assert!(!LEAKY_BUCKET_SCRIPT.contains("ARGV[5]"));
    }

    #[test]
    fn test_split_address() {
        assert_eq!(
            split_address("localhost:6379").unwrap(),
            ("localhost".to_string(), 6379)
        );
        assert_eq!(
            split_address("10.0.0.5:7000").unwrap(),
            ("10.0.0.5".to_string(), 7000)
        );
        assert_eq!(
            split_address("[::1]:6380").unwrap(),
            ("::1".to_string(), 6380)
        );
        assert_eq!(split_address("cache").unwrap(), ("cache".to_string(), 6379));
    }

    #[test]
    fn test_split_address_rejects_garbage() {
        assert!(split_address("").is_err());
        assert!(split_address(":6379").is_err());
        assert!(split_address("localhost:redis").is_err());
    }

    #[test]
    fn test_empty_password_is_none() {
        let target = RedisTarget::new("localhost:6379", Some(String::new()), 0);
        assert_eq!(target.password, None);
    }

    #[test]
    fn test_debug_redacts_password() {
        let target = RedisTarget::new("localhost:6379", Some("hunter2".to_string()), 1);
        let rendered = format!("{:?}", target);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_new_store_does_not_connect() {
        // Nothing listens on port 1; construction must still succeed.
        let target = RedisTarget::new("127.0.0.1:1", None, 0);
        let store = RedisCounterStore::new(&target).unwrap();
        assert!(!store.connection.initialized());
    }
}
