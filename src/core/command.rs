use crate::proto::frame::Frame;
use bytes::Bytes;

/// A command ready to be sent to Redis.
///
/// Commands are built using the builder pattern. Arguments added with
/// [`key`](Cmd::key) are remembered as keys so the command can be routed to
/// the cluster slot that owns them.
///
/// # Example
///
/// ```
/// use muxplex::command::{Cmd, get, set};
///
/// let cmd = Cmd::new("SET").key("key").arg("value");
/// assert_eq!(cmd.name(), "SET");
/// assert_eq!(cmd.keys().count(), 1);
///
/// let get_cmd = get("key");
/// let set_cmd = set("key", "new_value");
/// assert!(set_cmd.is_master_only());
/// assert!(!get_cmd.is_master_only());
/// ```
#[derive(Debug, Clone)]
pub struct Cmd {
    args: Vec<Bytes>,
    keys: Vec<usize>,
}

impl Cmd {
    /// Creates a new command with the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - The command name (e.g., "GET", "SET", "DEL")
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
            keys: Vec::new(),
        }
    }

    /// Appends an argument to the command.
    ///
    /// # Arguments
    ///
    /// * `arg` - The argument value
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a key argument. Keys decide the routing slot.
    ///
    /// # Arguments
    ///
    /// * `key` - The key
    #[inline]
    pub fn key<T: Into<Bytes>>(mut self, key: T) -> Self {
        self.keys.push(self.args.len());
        self.args.push(key.into());
        self
    }

    /// Returns the command verb in upper case.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    /// Returns true if the verb is `verb` (ASCII case-insensitive).
    #[inline]
    pub fn is(&self, verb: &str) -> bool {
        self.args[0].eq_ignore_ascii_case(verb.as_bytes())
    }

    /// Iterates over the key arguments.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.keys.iter().map(move |&i| self.args[i].as_ref())
    }

    /// Returns the raw arguments, verb first.
    #[inline]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns true for the pub/sub verbs that belong on a subscription
    /// connection.
    pub fn is_subscription(&self) -> bool {
        ["SUBSCRIBE", "UNSUBSCRIBE", "PSUBSCRIBE", "PUNSUBSCRIBE"]
            .iter()
            .any(|verb| self.is(verb))
    }

    /// Returns true if the command may write and therefore must run on a
    /// master.
    pub fn is_master_only(&self) -> bool {
        let name = self.name();
        !is_readonly_cmd(name.as_bytes()) && !is_connection_cmd(name.as_bytes())
    }

    /// Builds the RESP Array frame for this command without consuming it.
    pub fn to_frame(&self) -> Frame {
        Frame::Array(
            self.args
                .iter()
                .map(|b| Frame::BulkString(Some(b.clone())))
                .collect(),
        )
    }

    /// Converts the command to a RESP Array frame.
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

fn is_readonly_cmd(cmd: &[u8]) -> bool {
    matches!(
        cmd,
        b"BITCOUNT"
            | b"BITPOS"
            | b"DBSIZE"
            | b"DUMP"
            | b"EVALSHA_RO"
            | b"EVAL_RO"
            | b"EXISTS"
            | b"GET"
            | b"GETBIT"
            | b"GETRANGE"
            | b"HEXISTS"
            | b"HGET"
            | b"HGETALL"
            | b"HKEYS"
            | b"HLEN"
            | b"HMGET"
            | b"HSCAN"
            | b"HSTRLEN"
            | b"HVALS"
            | b"KEYS"
            | b"LINDEX"
            | b"LLEN"
            | b"LRANGE"
            | b"MGET"
            | b"PFCOUNT"
            | b"PTTL"
            | b"RANDOMKEY"
            | b"SCAN"
            | b"SCARD"
            | b"SDIFF"
            | b"SINTER"
            | b"SISMEMBER"
            | b"SMEMBERS"
            | b"SRANDMEMBER"
            | b"SSCAN"
            | b"STRLEN"
            | b"SUNION"
            | b"TTL"
            | b"TYPE"
            | b"XLEN"
            | b"XRANGE"
            | b"XREVRANGE"
            | b"ZCARD"
            | b"ZCOUNT"
            | b"ZRANGE"
            | b"ZRANGEBYSCORE"
            | b"ZRANK"
            | b"ZREVRANGE"
            | b"ZREVRANK"
            | b"ZSCAN"
            | b"ZSCORE"
    )
}

// Connection and control verbs; routable to any role.
fn is_connection_cmd(cmd: &[u8]) -> bool {
    matches!(
        cmd,
        b"PING"
            | b"ECHO"
            | b"AUTH"
            | b"SELECT"
            | b"CLIENT"
            | b"INFO"
            | b"TIME"
            | b"QUIT"
            | b"ASKING"
            | b"READONLY"
            | b"READWRITE"
            | b"CLUSTER"
            | b"WATCH"
            | b"UNWATCH"
            | b"MULTI"
            | b"EXEC"
            | b"DISCARD"
            | b"SUBSCRIBE"
            | b"UNSUBSCRIBE"
            | b"PSUBSCRIBE"
            | b"PUNSUBSCRIBE"
    )
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
}

/// Creates an ECHO command.
#[inline]
pub fn echo(msg: impl Into<Bytes>) -> Cmd {
    Cmd::new("ECHO").arg(msg)
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

/// Creates a DEL command.
#[inline]
pub fn del(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("DEL").key(key)
}

/// Creates an EXISTS command for a single key.
#[inline]
pub fn exists(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("EXISTS").key(key)
}

/// Creates an INCR command.
#[inline]
pub fn incr(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("INCR").key(key)
}

/// Creates a MGET command.
#[inline]
pub fn mget<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("MGET"), |cmd, key| cmd.key(key))
}

/// Creates an HSET command.
#[inline]
pub fn hset(key: impl Into<Bytes>, field: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("HSET").key(key).arg(field).arg(value)
}

/// Creates an HGET command.
#[inline]
pub fn hget(key: impl Into<Bytes>, field: impl Into<Bytes>) -> Cmd {
    Cmd::new("HGET").key(key).arg(field)
}

/// Creates an HEXISTS command.
#[inline]
pub fn hexists(key: impl Into<Bytes>, field: impl Into<Bytes>) -> Cmd {
    Cmd::new("HEXISTS").key(key).arg(field)
}

/// Creates an AUTH command with password only.
#[inline]
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(password)
}

/// Creates an AUTH command with username and password (ACL style).
#[inline]
pub fn auth_with_username(username: impl Into<Bytes>, password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(username).arg(password)
}

/// Creates a SELECT command.
#[inline]
pub fn select(db: i64) -> Cmd {
    Cmd::new("SELECT").arg(db.to_string())
}

/// Creates a CLIENT SETNAME command.
#[inline]
pub fn client_setname(name: impl Into<Bytes>) -> Cmd {
    Cmd::new("CLIENT").arg("SETNAME").arg(name)
}

/// Creates a WATCH command.
#[inline]
pub fn watch(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("WATCH").key(key)
}

/// Creates an UNWATCH command.
#[inline]
pub fn unwatch() -> Cmd {
    Cmd::new("UNWATCH")
}

/// Creates a MULTI command.
#[inline]
pub fn multi() -> Cmd {
    Cmd::new("MULTI")
}

/// Creates an EXEC command.
#[inline]
pub fn exec() -> Cmd {
    Cmd::new("EXEC")
}

/// Creates a DISCARD command.
#[inline]
pub fn discard() -> Cmd {
    Cmd::new("DISCARD")
}

/// Creates an ASKING command.
#[inline]
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}

/// Creates a READONLY command.
#[inline]
pub fn readonly() -> Cmd {
    Cmd::new("READONLY")
}

/// Creates a READWRITE command.
#[inline]
pub fn readwrite() -> Cmd {
    Cmd::new("READWRITE")
}

/// Creates an EVAL command.
///
/// # Arguments
///
/// * `script` - Lua source
/// * `keys` - Keys the script touches
/// * `args` - Additional arguments
pub fn eval<K: Into<Bytes>, A: Into<Bytes>>(
    script: impl Into<Bytes>,
    keys: impl IntoIterator<Item = K>,
    args: impl IntoIterator<Item = A>,
) -> Cmd {
    script_cmd(Cmd::new("EVAL").arg(script), keys, args)
}

/// Creates an EVALSHA command.
pub fn evalsha<K: Into<Bytes>, A: Into<Bytes>>(
    sha: impl Into<Bytes>,
    keys: impl IntoIterator<Item = K>,
    args: impl IntoIterator<Item = A>,
) -> Cmd {
    script_cmd(Cmd::new("EVALSHA").arg(sha), keys, args)
}

fn script_cmd<K: Into<Bytes>, A: Into<Bytes>>(
    cmd: Cmd,
    keys: impl IntoIterator<Item = K>,
    args: impl IntoIterator<Item = A>,
) -> Cmd {
    let keys: Vec<Bytes> = keys.into_iter().map(Into::into).collect();
    let cmd = keys
        .into_iter()
        .fold(cmd.arg(0usize.to_string()), |cmd, key| cmd.key(key));
    let numkeys = cmd.keys.len();
    let mut cmd = args.into_iter().fold(cmd, |cmd, arg| cmd.arg(arg));
    cmd.args[2] = Bytes::from(numkeys.to_string());
    cmd
}

/// Creates an UNSUBSCRIBE command for one channel.
#[inline]
pub fn unsubscribe(channel: impl Into<Bytes>) -> Cmd {
    Cmd::new("UNSUBSCRIBE").arg(channel)
}

/// Creates a CLUSTER SLOTS command.
#[inline]
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Converts a frame to bytes.
#[inline]
pub fn frame_to_bytes(frame: Frame) -> Result<Option<Bytes>, crate::Error> {
    match frame {
        Frame::BulkString(b) => Ok(b),
        Frame::SimpleString(s) => Ok(Some(Bytes::from(s))),
        Frame::Null => Ok(None),
        Frame::Error(e) => Err(crate::Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        _ => Err(crate::Error::Protocol {
            message: "unexpected frame type".to_string(),
        }),
    }
}

/// Converts a frame to an integer.
#[inline]
pub fn frame_to_int(frame: Frame) -> Result<i64, crate::Error> {
    match frame {
        Frame::Integer(i) => Ok(i),
        Frame::BulkString(Some(b)) => std::str::from_utf8(&b)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| crate::Error::Protocol {
                message: "invalid integer".to_string(),
            }),
        Frame::Error(e) => Err(crate::Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        _ => Err(crate::Error::Protocol {
            message: "unexpected frame type".to_string(),
        }),
    }
}

/// Converts a frame to a boolean.
#[inline]
pub fn frame_to_bool(frame: Frame) -> Result<bool, crate::Error> {
    match frame {
        Frame::Integer(i) => Ok(i != 0),
        Frame::BulkString(b) => Ok(b.map_or(false, |bytes| !bytes.is_empty())),
        Frame::Null => Ok(false),
        Frame::Error(e) => Err(crate::Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        _ => Err(crate::Error::Protocol {
            message: "unexpected frame type".to_string(),
        }),
    }
}

/// Converts a frame to a string.
#[inline]
pub fn frame_to_string(frame: Frame) -> Result<String, crate::Error> {
    match frame {
        Frame::SimpleString(s) => Ok(String::from_utf8_lossy(&s).into_owned()),
        Frame::BulkString(Some(b)) => Ok(String::from_utf8_lossy(&b).into_owned()),
        Frame::BulkString(None) | Frame::Null => Ok(String::new()),
        Frame::Integer(i) => Ok(i.to_string()),
        Frame::Error(e) => Err(crate::Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        _ => Err(crate::Error::Protocol {
            message: "unexpected frame type".to_string(),
        }),
    }
}
