use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;
use bytes::Bytes;

/// A command ready to be routed to a cluster node.
///
/// Besides its arguments, a command remembers which argument positions hold
/// keys. The router hashes exactly those positions, so keyless commands route
/// anywhere and multi-key commands are checked for slot agreement before they
/// leave the client.
///
/// # Example
///
/// ```
/// use slotwise::Cmd;
///
/// let cmd = Cmd::new("RENAME").key("{user}:old").key("{user}:new");
/// assert_eq!(cmd.keys().count(), 2);
///
/// let ping = Cmd::new("PING");
/// assert_eq!(ping.keys().count(), 0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Cmd {
    args: Vec<Bytes>,
    key_positions: Vec<usize>,
}

impl Cmd {
    /// Creates a new command with the given name.
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
            key_positions: Vec::new(),
        }
    }

    /// Builds a command from a name, its arguments and the indexes (into
    /// `args`, zero-based) of the arguments that are keys.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a key position is out of range.
    pub fn with_key_positions(
        name: impl Into<Bytes>,
        args: Vec<Bytes>,
        key_positions: &[usize],
    ) -> Result<Self> {
        if let Some(bad) = key_positions.iter().find(|&&p| p >= args.len()) {
            return Err(Error::InvalidArgument {
                message: format!("key position {} out of range for {} arguments", bad, args.len()),
            });
        }
        let mut cmd = Self::new(name);
        cmd.args.extend(args);
        cmd.key_positions = key_positions.iter().map(|p| p + 1).collect();
        Ok(cmd)
    }

    /// Appends a non-key argument.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends an argument that is a key.
    #[inline]
    pub fn key<T: Into<Bytes>>(mut self, key: T) -> Self {
        self.key_positions.push(self.args.len());
        self.args.push(key.into());
        self
    }

    /// Returns the command name as sent.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// Returns all arguments including the command name.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Iterates over the key arguments.
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.key_positions.iter().map(move |&i| &self.args[i])
    }

    /// Returns true if the command never writes and may be served by a replica.
    pub fn is_read_only(&self) -> bool {
        is_read_only_command(self.name())
    }

    /// Encodes the command as a RESP array without consuming it.
    ///
    /// Retries replay the same command, so the router keeps it around.
    pub fn to_frame(&self) -> Frame {
        Frame::Array(
            self.args
                .iter()
                .map(|b| Frame::BulkString(Some(b.clone())))
                .collect(),
        )
    }

    /// Converts the command to a RESP array frame.
    #[inline]
    pub fn into_frame(self) -> Frame {
        Frame::Array(
            self.args
                .into_iter()
                .map(|b| Frame::BulkString(Some(b)))
                .collect(),
        )
    }
}

/// Commands that can be served by a replica after `READONLY`.
pub fn is_read_only_command(name: &[u8]) -> bool {
    const READ_ONLY: &[&str] = &[
        "GET", "MGET", "STRLEN", "GETRANGE", "EXISTS", "TYPE", "TTL", "PTTL", "OBJECT",
        "TOUCH", "SCAN", "HGET", "HMGET", "HGETALL", "HKEYS", "HVALS", "HLEN", "HEXISTS",
        "HSCAN", "LRANGE", "LLEN", "LINDEX", "SMEMBERS", "SCARD", "SISMEMBER", "SSCAN",
        "ZRANGE", "ZCARD", "ZSCORE", "ZRANK", "ZSCAN", "RANDOMKEY", "DBSIZE",
    ];
    READ_ONLY.iter().any(|c| c.as_bytes().eq_ignore_ascii_case(name))
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").key(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").key(key).arg(value)
}

fn multi_key(name: &'static str, keys: impl IntoIterator<Item = impl Into<Bytes>>) -> Cmd {
    keys.into_iter().fold(Cmd::new(name), |cmd, key| cmd.key(key))
}

/// Creates a DEL command over one or more keys.
#[inline]
pub fn del(keys: impl IntoIterator<Item = impl Into<Bytes>>) -> Cmd {
    multi_key("DEL", keys)
}

/// Creates an UNLINK command over one or more keys.
#[inline]
pub fn unlink(keys: impl IntoIterator<Item = impl Into<Bytes>>) -> Cmd {
    multi_key("UNLINK", keys)
}

/// Creates a TOUCH command over one or more keys.
#[inline]
pub fn touch(keys: impl IntoIterator<Item = impl Into<Bytes>>) -> Cmd {
    multi_key("TOUCH", keys)
}

/// Creates an EXISTS command over one or more keys.
#[inline]
pub fn exists(keys: impl IntoIterator<Item = impl Into<Bytes>>) -> Cmd {
    multi_key("EXISTS", keys)
}

/// Creates an MGET command.
#[inline]
pub fn mget(keys: impl IntoIterator<Item = impl Into<Bytes>>) -> Cmd {
    multi_key("MGET", keys)
}

/// Creates an MSET command.
#[inline]
pub fn mset<K: Into<Bytes>, V: Into<Bytes>>(pairs: impl IntoIterator<Item = (K, V)>) -> Cmd {
    pairs
        .into_iter()
        .fold(Cmd::new("MSET"), |cmd, (key, value)| cmd.key(key).arg(value))
}

/// Creates a RENAME command.
#[inline]
pub fn rename(key: impl Into<Bytes>, newkey: impl Into<Bytes>) -> Cmd {
    Cmd::new("RENAME").key(key).key(newkey)
}

/// Creates a RENAMENX command.
#[inline]
pub fn renamenx(key: impl Into<Bytes>, newkey: impl Into<Bytes>) -> Cmd {
    Cmd::new("RENAMENX").key(key).key(newkey)
}

/// Creates a DBSIZE command. It counts the keys of one node.
#[inline]
pub fn dbsize() -> Cmd {
    Cmd::new("DBSIZE")
}

/// Creates a KEYS command. It lists the matching keys of one node.
#[inline]
pub fn keys(pattern: impl Into<Bytes>) -> Cmd {
    Cmd::new("KEYS").arg(pattern)
}

/// Creates a WAIT command. It blocks until `numreplicas` replicas of one
/// primary acknowledged its writes, or `timeout_ms` passed.
#[inline]
pub fn wait(numreplicas: u64, timeout_ms: u64) -> Cmd {
    Cmd::new("WAIT")
        .arg(numreplicas.to_string())
        .arg(timeout_ms.to_string())
}

/// Creates a SCAN command for one node.
pub fn scan(cursor: u64, pattern: Option<&Bytes>, count: Option<usize>) -> Cmd {
    let mut cmd = Cmd::new("SCAN").arg(cursor.to_string());
    if let Some(pattern) = pattern {
        cmd = cmd.arg("MATCH").arg(pattern.clone());
    }
    if let Some(count) = count {
        cmd = cmd.arg("COUNT").arg(count.to_string());
    }
    cmd
}

/// Converts a SCAN reply into `(next_cursor, keys)`.
pub fn frame_to_scan_response(frame: Frame) -> Result<(u64, Vec<Bytes>)> {
    let mut parts = match frame {
        Frame::Array(arr) if arr.len() == 2 => arr.into_iter(),
        Frame::Error(e) => {
            return Err(Error::Server {
                message: String::from_utf8_lossy(&e).into_owned(),
            })
        }
        _ => return Err(Error::protocol("SCAN response must be a 2-element array")),
    };

    let cursor = parts
        .next()
        .and_then(|f| f.as_integer())
        .and_then(|c| u64::try_from(c).ok())
        .ok_or_else(|| Error::protocol("invalid cursor value"))?;

    let keys = match parts.next() {
        Some(Frame::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Frame::BulkString(Some(b)) => Ok(b),
                Frame::SimpleString(s) => Ok(Bytes::from(s)),
                _ => Err(Error::protocol("SCAN keys must be bulk strings")),
            })
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(Error::protocol("SCAN keys must be an array")),
    };

    Ok((cursor, keys))
}
