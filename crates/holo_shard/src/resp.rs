//! RESP2 client for RedisRaft-style clusters.
//!
//! A small pool of connections to a cluster's leader, framed with the
//! `redis-protocol` codec. Each request checks out its own connection, so
//! concurrent callers do not queue behind each other and an `ASKING` prefix
//! always shares a connection with the command it covers. A request that
//! fails after it reached the socket is reported as `Indeterminate` and its
//! connection is dropped instead of being returned to the pool.
//!
//! `RAFT.SHARDGROUP GET` only reports the cluster's own entry, so
//! [`RespCluster::shard_groups`] returns a one-entry table. Routing views
//! merge the entries of every cluster they know.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;

use crate::error::{Redirect, RedirectKind, ShardError, ShardResult};
use crate::slot::Slot;
use crate::store::{ClusterInfo, ClusterStore, ScanPage};
use crate::table::{ClusterId, ReplicaEndpoint, ShardGroupEntry, ShardGroupTable, SlotOwnership, SlotRange};

#[derive(Clone, Debug)]
pub struct RespClusterConfig {
    /// Per send/receive timeout.
    pub op_timeout: Duration,
    /// Idle connections kept for reuse. Extra ones are closed on release.
    pub max_idle: usize,
}

impl Default for RespClusterConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(2),
            max_idle: 16,
        }
    }
}

type Connection = Framed<TcpStream, Resp2>;

/// Cluster reached over RESP2.
pub struct RespCluster {
    address: String,
    cluster_id: ClusterId,
    config: RespClusterConfig,
    idle: Mutex<Vec<Connection>>,
}

impl RespCluster {
    /// Connect to `address` and learn the cluster id from `INFO raft`.
    pub async fn connect(address: impl Into<String>, config: RespClusterConfig) -> ShardResult<Self> {
        let mut cluster = Self {
            address: address.into(),
            cluster_id: ClusterId::new(""),
            config,
            idle: Mutex::new(Vec::new()),
        };
        let info = cluster.fetch_info().await?;
        tracing::info!(
            address = %cluster.address,
            cluster_id = %info.cluster_id,
            "connected to cluster"
        );
        cluster.cluster_id = info.cluster_id;
        Ok(cluster)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn open(&self) -> ShardResult<Connection> {
        let socket = time::timeout(self.config.op_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                ShardError::TransientUnavailable(format!("connect to {} timed out", self.address))
            })?
            .map_err(|err| {
                ShardError::TransientUnavailable(format!("connect to {}: {err}", self.address))
            })?;
        socket.set_nodelay(true).ok();
        Ok(Framed::new(socket, Resp2::default()))
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push(conn);
        }
    }

    /// Send `frames` in order on one connection and return the last reply.
    /// Error replies to earlier frames abort the request.
    async fn request(&self, frames: Vec<BytesFrame>) -> ShardResult<BytesFrame> {
        let pooled = self.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.open().await?,
        };
        let total = frames.len();
        let mut last = None;
        for (idx, frame) in frames.into_iter().enumerate() {
            match time::timeout(self.config.op_timeout, conn.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    return Err(ShardError::Indeterminate(format!(
                        "send to {}: {err}",
                        self.address
                    )))
                }
                Err(_) => {
                    return Err(ShardError::Indeterminate(format!(
                        "send to {} timed out",
                        self.address
                    )))
                }
            }
            let reply = match time::timeout(self.config.op_timeout, conn.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(err))) => {
                    return Err(ShardError::Indeterminate(format!(
                        "recv from {}: {err}",
                        self.address
                    )))
                }
                Ok(None) => {
                    return Err(ShardError::Indeterminate(format!(
                        "connection to {} closed",
                        self.address
                    )))
                }
                Err(_) => {
                    return Err(ShardError::Indeterminate(format!(
                        "recv from {} timed out",
                        self.address
                    )))
                }
            };
            if idx + 1 < total {
                if let BytesFrame::Error(err) = &reply {
                    self.release(conn);
                    return Err(parse_error_reply(&err.to_string()));
                }
            }
            last = Some(reply);
        }
        self.release(conn);
        last.ok_or_else(|| ShardError::ProtocolMisuse("empty request".to_string()))
    }

    async fn key_request(&self, cmd: BytesFrame, asking: bool) -> ShardResult<BytesFrame> {
        let frames = if asking {
            vec![command([Bytes::from_static(b"ASKING")]), cmd]
        } else {
            vec![cmd]
        };
        self.request(frames).await
    }

    async fn fetch_info(&self) -> ShardResult<ClusterInfo> {
        let reply = self
            .request(vec![command([
                Bytes::from_static(b"INFO"),
                Bytes::from_static(b"raft"),
            ])])
            .await?;
        match reply {
            BytesFrame::BulkString(text) | BytesFrame::SimpleString(text) => {
                parse_info(&String::from_utf8_lossy(&text))
            }
            other => Err(unexpected("INFO", &other)),
        }
    }
}

#[async_trait]
impl ClusterStore for RespCluster {
    fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    async fn info(&self) -> ShardResult<ClusterInfo> {
        self.fetch_info().await
    }

    async fn shard_groups(&self) -> ShardResult<ShardGroupTable> {
        let reply = self
            .request(vec![command([
                Bytes::from_static(b"RAFT.SHARDGROUP"),
                Bytes::from_static(b"GET"),
            ])])
            .await?;
        let entry = parse_shard_group(error_or(reply)?)?;
        Ok(ShardGroupTable::from_entries([entry]))
    }

    async fn configure_shard_groups(&self, table: &ShardGroupTable) -> ShardResult<()> {
        table.validate()?;
        let reply = self.request(vec![encode_replace(table)]).await?;
        match reply {
            BytesFrame::Error(err) => Err(parse_replace_error(&err.to_string(), table)),
            other => expect_ok("RAFT.SHARDGROUP REPLACE", other),
        }
    }

    async fn scan_slot(&self, cursor: u64, slot: Slot, count: usize) -> ShardResult<ScanPage> {
        let reply = self
            .request(vec![command([
                Bytes::from_static(b"RAFT.SCAN"),
                Bytes::from(cursor.to_string()),
                Bytes::from(slot.to_string()),
                Bytes::from_static(b"COUNT"),
                Bytes::from(count.to_string()),
            ])])
            .await?;
        parse_scan(error_or(reply)?)
    }

    async fn relocate_keys(&self, destination: &ClusterId, keys: &[Bytes]) -> ShardResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        // The server resolves the destination from its own table.
        tracing::debug!(
            source = %self.cluster_id,
            destination = %destination,
            keys = keys.len(),
            "MIGRATE batch"
        );
        let mut parts = vec![Bytes::from_static(b"MIGRATE")];
        parts.extend(std::iter::repeat(Bytes::new()).take(5));
        parts.push(Bytes::from_static(b"KEYS"));
        parts.extend(keys.iter().cloned());
        match error_or(self.request(vec![command(parts)]).await?)? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"NOKEY" => Ok(0),
            other => expect_ok("MIGRATE", other).map(|()| keys.len()),
        }
    }

    async fn get(&self, key: &[u8], asking: bool) -> ShardResult<Option<Bytes>> {
        let cmd = command([Bytes::from_static(b"GET"), Bytes::copy_from_slice(key)]);
        match error_or(self.key_request(cmd, asking).await?)? {
            BytesFrame::Null => Ok(None),
            BytesFrame::BulkString(value) | BytesFrame::SimpleString(value) => Ok(Some(value)),
            other => Err(unexpected("GET", &other)),
        }
    }

    async fn set(&self, key: &[u8], value: Bytes, asking: bool) -> ShardResult<()> {
        let cmd = command([Bytes::from_static(b"SET"), Bytes::copy_from_slice(key), value]);
        expect_ok("SET", error_or(self.key_request(cmd, asking).await?)?)
    }

    async fn append(&self, key: &[u8], value: Bytes, asking: bool) -> ShardResult<u64> {
        let cmd = command([Bytes::from_static(b"RPUSH"), Bytes::copy_from_slice(key), value]);
        let reply = error_or(self.key_request(cmd, asking).await?)?;
        frame_u64(&reply).ok_or_else(|| unexpected("RPUSH", &reply))
    }

    async fn read_list(&self, key: &[u8], asking: bool) -> ShardResult<Vec<Bytes>> {
        let cmd = command([
            Bytes::from_static(b"LRANGE"),
            Bytes::copy_from_slice(key),
            Bytes::from_static(b"0"),
            Bytes::from_static(b"-1"),
        ]);
        match error_or(self.key_request(cmd, asking).await?)? {
            BytesFrame::Null => Ok(Vec::new()),
            BytesFrame::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    BytesFrame::BulkString(v) | BytesFrame::SimpleString(v) => Ok(v),
                    other => Err(unexpected("LRANGE item", &other)),
                })
                .collect(),
            other => Err(unexpected("LRANGE", &other)),
        }
    }
}

/// Build a command frame from its parts.
pub fn command(parts: impl IntoIterator<Item = Bytes>) -> BytesFrame {
    BytesFrame::Array(parts.into_iter().map(BytesFrame::BulkString).collect())
}

/// Encode `RAFT.SHARDGROUP REPLACE` for a full table.
///
/// Layout: group count, then per group `dbid num_ranges num_nodes`, each range
/// as `start end type term`, each node as `node_id address`. Weights are not
/// carried on the wire.
pub fn encode_replace(table: &ShardGroupTable) -> BytesFrame {
    let mut parts = vec![
        Bytes::from_static(b"RAFT.SHARDGROUP"),
        Bytes::from_static(b"REPLACE"),
        Bytes::from(table.groups.len().to_string()),
    ];
    for entry in table.groups.values() {
        parts.push(Bytes::from(entry.cluster_id.to_string()));
        parts.push(Bytes::from(entry.slot_ranges.len().to_string()));
        parts.push(Bytes::from(entry.replica_endpoints.len().to_string()));
        for range in &entry.slot_ranges {
            parts.push(Bytes::from(range.start.to_string()));
            parts.push(Bytes::from(range.end.to_string()));
            parts.push(Bytes::from(range.ownership.code().to_string()));
            parts.push(Bytes::from(range.term.to_string()));
        }
        for node in &entry.replica_endpoints {
            parts.push(Bytes::from(node.node_id.clone()));
            parts.push(Bytes::from(node.address.clone()));
        }
    }
    command(parts)
}

/// Parse a `RAFT.SHARDGROUP GET` reply:
/// `[dbid, [[start, end, type, term], ...], [[node_id, address], ...]]`.
pub fn parse_shard_group(frame: BytesFrame) -> ShardResult<ShardGroupEntry> {
    let BytesFrame::Array(mut parts) = frame else {
        return Err(unexpected("RAFT.SHARDGROUP GET", &frame));
    };
    if parts.len() != 3 {
        return Err(ShardError::ProtocolMisuse(format!(
            "RAFT.SHARDGROUP GET reply has {} elements, expected 3",
            parts.len()
        )));
    }
    let nodes = parts.pop();
    let ranges = parts.pop();
    let dbid = parts.pop();
    let cluster_id = dbid
        .as_ref()
        .and_then(frame_string)
        .ok_or_else(|| ShardError::ProtocolMisuse("shard group without dbid".to_string()))?;

    let mut entry = ShardGroupEntry::new(ClusterId::new(cluster_id));
    for range in frame_items(ranges)? {
        let fields = frame_items(Some(range))?;
        let [start, end, code, term] = fields.as_slice() else {
            return Err(ShardError::ProtocolMisuse(
                "slot range needs start, end, type and term".to_string(),
            ));
        };
        let (Some(start), Some(end), Some(code), Some(term)) =
            (frame_u64(start), frame_u64(end), frame_u64(code), frame_u64(term))
        else {
            return Err(ShardError::ProtocolMisuse("non-numeric slot range field".to_string()));
        };
        let ownership = u8::try_from(code)
            .ok()
            .and_then(SlotOwnership::from_code)
            .ok_or_else(|| ShardError::ProtocolMisuse(format!("unknown slot range type {code}")))?;
        let (Ok(start), Ok(end)) = (Slot::try_from(start), Slot::try_from(end)) else {
            return Err(ShardError::ProtocolMisuse("slot out of range".to_string()));
        };
        entry = entry.with_range(SlotRange::new(start, end, ownership, term));
    }
    for node in frame_items(nodes)? {
        let fields = frame_items(Some(node))?;
        let [node_id, address] = fields.as_slice() else {
            return Err(ShardError::ProtocolMisuse(
                "replica endpoint needs node id and address".to_string(),
            ));
        };
        let (Some(node_id), Some(address)) = (frame_string(node_id), frame_string(address)) else {
            return Err(ShardError::ProtocolMisuse("non-string replica endpoint".to_string()));
        };
        entry.replica_endpoints.push(ReplicaEndpoint { node_id, address });
    }
    Ok(entry)
}

/// Parse a `RAFT.SCAN` reply: `[cursor, [key | [key, type], ...]]`.
pub fn parse_scan(frame: BytesFrame) -> ShardResult<ScanPage> {
    let BytesFrame::Array(mut parts) = frame else {
        return Err(unexpected("RAFT.SCAN", &frame));
    };
    if parts.len() != 2 {
        return Err(ShardError::ProtocolMisuse(format!(
            "RAFT.SCAN reply has {} elements, expected 2",
            parts.len()
        )));
    }
    let keys = parts.pop();
    let next_cursor = parts
        .pop()
        .as_ref()
        .and_then(frame_u64)
        .ok_or_else(|| ShardError::ProtocolMisuse("RAFT.SCAN cursor is not a number".to_string()))?;
    let keys = frame_items(keys)?
        .into_iter()
        .map(|item| match item {
            BytesFrame::BulkString(key) | BytesFrame::SimpleString(key) => Ok(key),
            BytesFrame::Array(mut pair) if !pair.is_empty() => match pair.swap_remove(0) {
                BytesFrame::BulkString(key) | BytesFrame::SimpleString(key) => Ok(key),
                other => Err(unexpected("RAFT.SCAN key", &other)),
            },
            other => Err(unexpected("RAFT.SCAN key", &other)),
        })
        .collect::<ShardResult<Vec<_>>>()?;
    Ok(ScanPage { next_cursor, keys })
}

/// Extract cluster identity from `INFO raft` text.
pub fn parse_info(text: &str) -> ShardResult<ClusterInfo> {
    let mut cluster_id = None;
    let mut node_ids = Vec::new();
    let mut log_index = 0;
    let mut keys = 0;
    for line in text.lines() {
        let Some((name, value)) = line.trim().split_once(':') else {
            continue;
        };
        match name {
            "raft_dbid" => cluster_id = Some(ClusterId::new(value)),
            "raft_node_id" => node_ids.push(value.to_string()),
            "raft_commit_index" => log_index = value.parse().unwrap_or(0),
            "db0" => {
                keys = value
                    .split(',')
                    .find_map(|kv| kv.strip_prefix("keys="))
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0)
            }
            _ => {}
        }
    }
    let cluster_id = cluster_id
        .filter(|id| !id.as_str().is_empty())
        .ok_or_else(|| ShardError::ProtocolMisuse("INFO raft has no raft_dbid".to_string()))?;
    Ok(ClusterInfo {
        cluster_id,
        node_ids,
        log_index,
        keys,
    })
}

/// Map a RESP error reply onto the error taxonomy.
pub fn parse_error_reply(message: &str) -> ShardError {
    let mut words = message.split_whitespace();
    let kind = words.next().unwrap_or_default();
    let redirect = match kind {
        "MOVED" => Some(RedirectKind::Moved),
        "ASK" => Some(RedirectKind::Ask),
        _ => None,
    };
    if let Some(kind) = redirect {
        let slot = words.next().and_then(|s| s.parse::<Slot>().ok());
        let location = words.next();
        if let (Some(slot), Some(location)) = (slot, location) {
            return ShardError::Redirect(Redirect {
                kind,
                slot,
                location: location.to_string(),
            });
        }
    }
    match kind {
        "TRYAGAIN" | "CLUSTERDOWN" | "NOLEADER" | "LOADING" => {
            ShardError::TransientUnavailable(message.to_string())
        }
        _ => ShardError::ProtocolMisuse(message.to_string()),
    }
}

fn parse_replace_error(message: &str, table: &ShardGroupTable) -> ShardError {
    if !message.contains("term") {
        return parse_error_reply(message);
    }
    // Best effort: the server names the cluster whose term is stale.
    let entry = table
        .groups
        .values()
        .find(|entry| message.contains(entry.cluster_id.as_str()))
        .or_else(|| table.groups.values().next());
    match entry {
        Some(entry) => ShardError::ConfigConflict {
            cluster_id: entry.cluster_id.clone(),
            // 0 when the reply does not carry a term above the offered one.
            stored_term: stored_term_in(message)
                .filter(|term| *term > entry.term())
                .unwrap_or(0),
            offered_term: entry.term(),
        },
        None => ShardError::ProtocolMisuse(message.to_string()),
    }
}

/// Largest number following a `term` token, e.g. `stored term 7` or `term=7`.
fn stored_term_in(message: &str) -> Option<u64> {
    let tokens: Vec<&str> = message
        .split(|c: char| c.is_whitespace() || matches!(c, ':' | '=' | ','))
        .filter(|token| !token.is_empty())
        .collect();
    tokens
        .windows(2)
        .filter(|pair| pair[0].eq_ignore_ascii_case("term"))
        .filter_map(|pair| pair[1].parse().ok())
        .max()
}

fn error_or(frame: BytesFrame) -> ShardResult<BytesFrame> {
    match frame {
        BytesFrame::Error(err) => Err(parse_error_reply(&err.to_string())),
        other => Ok(other),
    }
}

fn expect_ok(what: &str, frame: BytesFrame) -> ShardResult<()> {
    match frame {
        BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
        other => Err(unexpected(what, &other)),
    }
}

fn unexpected(what: &str, frame: &BytesFrame) -> ShardError {
    ShardError::ProtocolMisuse(format!("unexpected {what} response: {frame:?}"))
}

fn frame_items(frame: Option<BytesFrame>) -> ShardResult<Vec<BytesFrame>> {
    match frame {
        Some(BytesFrame::Array(items)) => Ok(items),
        Some(BytesFrame::Null) | None => Ok(Vec::new()),
        Some(other) => Err(unexpected("array", &other)),
    }
}

fn frame_string(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
            Some(String::from_utf8_lossy(b).into_owned())
        }
        BytesFrame::Integer(n) => Some(n.to_string()),
        _ => None,
    }
}

fn frame_u64(frame: &BytesFrame) -> Option<u64> {
    match frame {
        BytesFrame::Integer(n) => u64::try_from(*n).ok(),
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
            std::str::from_utf8(b).ok()?.parse().ok()
        }
        _ => None,
    }
}
